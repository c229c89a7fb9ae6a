//! Request/reply channel between the daemon and one worker.
//!
//! Worker processes speak newline-delimited JSON on their stdio:
//!
//! ```text
//! daemon → worker  {"type":"task","task_id":"…","task_type":"produce-artifact","work_item_id":"12","payload":{…}}
//! worker → daemon  {"type":"heartbeat"}
//! worker → daemon  {"type":"result","task_id":"…","ok":true,"output":…,"error":null}
//! ```
//!
//! Any line from the worker counts as a heartbeat. When the worker's
//! stdout closes, every call still waiting for a reply fails.

use std::collections::HashMap;

use af_core::types::{AgentRole, Task, TaskId, TaskType};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::heartbeat::HeartbeatBoard;

/// Outstanding calls buffered per worker before `call` waits.
const CALL_BUFFER: usize = 16;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub work_item_id: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl From<&Task> for TaskRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type,
            work_item_id: task.work_item_id.clone(),
            payload: task.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    pub task_id: TaskId,
    pub ok: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskReply {
    pub fn success(task_id: TaskId, output: Option<serde_json::Value>) -> Self {
        Self {
            task_id,
            ok: true,
            output,
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            ok: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Task(TaskRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Heartbeat,
    Result(TaskReply),
}

// ---------------------------------------------------------------------------
// WorkerLink
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{0} worker is not accepting calls")]
    Closed(AgentRole),
    #[error("{0} worker went away before replying")]
    Dropped(AgentRole),
}

/// A call waiting for the worker's reply.
#[derive(Debug)]
pub struct PendingCall {
    pub request: TaskRequest,
    pub reply: oneshot::Sender<TaskReply>,
}

/// Cloneable handle used by runners to send tasks to a worker.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    role: AgentRole,
    tx: mpsc::Sender<PendingCall>,
}

impl WorkerLink {
    /// A link plus the receiving end the worker side serves.
    pub fn channel(role: AgentRole) -> (Self, mpsc::Receiver<PendingCall>) {
        let (tx, rx) = mpsc::channel(CALL_BUFFER);
        (Self { role, tx }, rx)
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send one task and wait for its reply.
    pub async fn call(&self, request: TaskRequest) -> Result<TaskReply, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingCall {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::Closed(self.role))?;
        reply_rx.await.map_err(|_| LinkError::Dropped(self.role))
    }
}

// ---------------------------------------------------------------------------
// Stdio bridge
// ---------------------------------------------------------------------------

/// Serve a [`WorkerLink`] over a JSON-lines byte stream pair.
///
/// The bridge task ends when the worker closes its output or every link
/// clone is dropped.
pub fn spawn_stdio_bridge<W, R>(
    role: AgentRole,
    mut writer: W,
    reader: R,
    heartbeats: HeartbeatBoard,
) -> WorkerLink
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let (link, mut calls) = WorkerLink::channel(role);

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut waiting: HashMap<TaskId, oneshot::Sender<TaskReply>> = HashMap::new();

        loop {
            tokio::select! {
                call = calls.recv() => {
                    let Some(call) = call else { break };
                    let task_id = call.request.task_id;
                    let mut line = match serde_json::to_string(&DaemonMessage::Task(call.request)) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!(role = %role, task_id = %task_id, error = %e, "could not encode task");
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(role = %role, task_id = %task_id, error = %e, "worker stdin closed");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        warn!(role = %role, task_id = %task_id, error = %e, "worker stdin flush failed");
                        break;
                    }
                    waiting.insert(task_id, call.reply);
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!(role = %role, "worker stdout closed");
                            break;
                        }
                        Err(e) => {
                            warn!(role = %role, error = %e, "worker stdout read failed");
                            break;
                        }
                    };
                    heartbeats.beat(role);
                    match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Heartbeat) => {}
                        Ok(WorkerMessage::Result(reply)) => match waiting.remove(&reply.task_id) {
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => warn!(role = %role, task_id = %reply.task_id, "reply for unknown task"),
                        },
                        Err(_) => debug!(role = %role, line = %line, "ignoring non-protocol worker output"),
                    }
                }
            }
        }

        if !waiting.is_empty() {
            warn!(role = %role, pending = waiting.len(), "failing calls left without a reply");
        }
    });

    link
}
