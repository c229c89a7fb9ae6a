use std::sync::Arc;

use af_core::types::{AgentRole, Task};
use async_trait::async_trait;

use crate::link::{LinkError, TaskRequest};
use crate::supervisor::AgentSupervisor;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0} worker is unavailable")]
    Unavailable(AgentRole),

    #[error(transparent)]
    Link(#[from] LinkError),

    /// The worker ran the task and reported failure.
    #[error("{0}")]
    Failed(String),
}

/// The opaque "run this task for this role" call. Duration and success are
/// all the core observes.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Whether `role` can take a task right now. Runners do not claim work
    /// from the queue while this is false.
    async fn is_ready(&self, role: AgentRole) -> bool;

    async fn execute(&self, role: AgentRole, task: &Task) -> Result<Option<serde_json::Value>, ExecutionError>;
}

/// Executes tasks on the supervised worker for the role.
pub struct LinkExecutor {
    supervisor: Arc<AgentSupervisor>,
}

impl LinkExecutor {
    pub fn new(supervisor: Arc<AgentSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl AgentExecutor for LinkExecutor {
    async fn is_ready(&self, role: AgentRole) -> bool {
        self.supervisor.link(role).await.is_some_and(|link| !link.is_closed())
    }

    async fn execute(&self, role: AgentRole, task: &Task) -> Result<Option<serde_json::Value>, ExecutionError> {
        let link = self
            .supervisor
            .link(role)
            .await
            .ok_or(ExecutionError::Unavailable(role))?;
        let reply = link.call(TaskRequest::from(task)).await?;
        if reply.ok {
            Ok(reply.output)
        } else {
            Err(ExecutionError::Failed(
                reply.error.unwrap_or_else(|| "worker reported failure".to_string()),
            ))
        }
    }
}
