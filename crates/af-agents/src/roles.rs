use std::collections::BTreeMap;
use std::path::PathBuf;

use af_core::config::{expand_home, AgentsConfig};
use af_core::types::AgentRole;

/// How to start the worker process for a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Everything the daemon needs to run one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub role: AgentRole,
    /// `None` when the role runs in-process.
    pub command: Option<WorkerCommand>,
    /// Parallel runner loops pulling this role's tasks.
    pub concurrency: usize,
}

impl RoleSpec {
    pub fn in_process(role: AgentRole) -> Self {
        Self {
            role,
            command: None,
            concurrency: 1,
        }
    }
}

/// Fixed table from worker role to its spec, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    specs: BTreeMap<AgentRole, RoleSpec>,
}

impl RoleRegistry {
    /// One in-process spec per worker role.
    pub fn in_process() -> Self {
        let specs = AgentRole::workers()
            .into_iter()
            .map(|role| (role, RoleSpec::in_process(role)))
            .collect();
        Self { specs }
    }

    pub fn from_config(agents: &AgentsConfig) -> Self {
        let specs = AgentRole::workers()
            .into_iter()
            .map(|role| {
                let spec = match agents.worker(role) {
                    Some(worker) => RoleSpec {
                        role,
                        command: Some(WorkerCommand {
                            program: worker.command.clone(),
                            args: worker.args.clone(),
                            env: worker.env.clone(),
                            working_dir: worker.working_dir.as_deref().map(expand_home),
                        }),
                        concurrency: worker.concurrency.max(1),
                    },
                    None => RoleSpec::in_process(role),
                };
                (role, spec)
            })
            .collect();
        Self { specs }
    }

    pub fn from_specs(specs: impl IntoIterator<Item = RoleSpec>) -> Self {
        let specs = specs
            .into_iter()
            .filter(|spec| spec.role != AgentRole::Coordinator)
            .map(|spec| (spec.role, spec))
            .collect();
        Self { specs }
    }

    pub fn get(&self, role: AgentRole) -> Option<&RoleSpec> {
        self.specs.get(&role)
    }

    pub fn roles(&self) -> impl Iterator<Item = AgentRole> + '_ {
        self.specs.keys().copied()
    }

    pub fn specs(&self) -> impl Iterator<Item = &RoleSpec> {
        self.specs.values()
    }

    /// Worker roles with no command configured.
    pub fn missing_commands(&self) -> Vec<AgentRole> {
        self.specs
            .values()
            .filter(|spec| spec.command.is_none())
            .map(|spec| spec.role)
            .collect()
    }

    pub fn with_concurrency(mut self, role: AgentRole, concurrency: usize) -> Self {
        if let Some(spec) = self.specs.get_mut(&role) {
            spec.concurrency = concurrency.max(1);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::config::WorkerConfig;

    #[test]
    fn from_config_fills_unconfigured_roles_in_process() {
        let agents = AgentsConfig {
            designer: Some(WorkerConfig {
                command: "design-agent".into(),
                args: vec!["--stdio".into()],
                env: BTreeMap::new(),
                working_dir: Some("/srv/work".into()),
                concurrency: 2,
            }),
            implementer: None,
        };
        let registry = RoleRegistry::from_config(&agents);

        let designer = registry.get(AgentRole::Designer).unwrap();
        assert_eq!(designer.concurrency, 2);
        let command = designer.command.as_ref().unwrap();
        assert_eq!(command.program, "design-agent");
        assert_eq!(command.working_dir.as_deref(), Some(std::path::Path::new("/srv/work")));

        assert_eq!(registry.missing_commands(), vec![AgentRole::Implementer]);
        assert!(registry.get(AgentRole::Coordinator).is_none());
        assert_eq!(registry.roles().count(), 2);
    }
}
