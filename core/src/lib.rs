//! Core DAG execution engine: step model, expression environment, the
//! executor registry, and the concrete executors themselves (command, http,
//! jq, ssh, docker, git-checkout, mail, plus the child-DAG and parallel
//! Step adapters).
pub mod child_dag;
pub mod config;
pub mod environment;
pub mod errors;
pub mod executors;
pub mod model;
pub mod ports;
pub mod registry;
pub mod tail_writer;

pub use child_dag::ChildDagExecutor;
pub use config::{load_config, RuntimeConfig, BRAND, EXECUTABLE_ENV_VAR};
pub use environment::{DagContext, Environment, StepInfo};
pub use errors::{
    ChildDagError, ChildDagResult, EnvironmentError, EnvironmentResult, ExecutorError,
    ExecutorResult, ParallelError, ParallelResult, RegistryError, RegistryResult, ValidationError,
    ValidationResult,
};
pub use model::{
    ChildDagRef, ContainerDefaults, Dag, ExecutorConfig, NodeStatus, ParallelItem, ParallelItems,
    ParallelSpec, RunParams, RunStatus, SmtpDefaults, SshDefaults, Status, Step,
};
pub use ports::{CoordinatorClient, CoordinatorClientFactory, Database};
pub use registry::{Executor, Registry, RunContext, Signal};
pub use tail_writer::TailWriter;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
