//! The executor Port and the process-wide registry that maps an
//! executor-type string to a constructor.
//!
//! Per the redesign flag in the design notes, the registry here is an
//! explicit value built by the caller (the `cli` binary, or a test), not a
//! mutable global populated at crate init.
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use crate::environment::Environment;
use crate::errors::{ExecutorResult, RegistryError, RegistryResult};
use crate::model::{NodeStatus, Step};

#[cfg(unix)]
pub type Signal = nix::sys::signal::Signal;
#[cfg(not(unix))]
pub type Signal = i32;

/// Carries everything an executor's `run` needs beyond its own
/// configuration: the resolved environment and a cooperative-cancellation
/// token.
pub struct RunContext {
    pub env: Environment,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl RunContext {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub fn child_token(&self) -> tokio_util::sync::CancellationToken {
        self.cancel.child_token()
    }
}

/// Every executor exposes this closed capability set, plus the optional
/// sub-capabilities below.
#[async_trait]
pub trait Executor: Send + Sync {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>);
    fn attach_stderr(&mut self, writer: Box<dyn Write + Send>);
    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()>;
    async fn kill(&mut self, sig: Signal) -> ExecutorResult<()>;

    /// Cached exit code, when the executor wraps a process.
    fn exit_code(&self) -> Option<i32> {
        None
    }

    /// Classify a completed run for the scheduler. Executors that don't
    /// model partial success (most of them) default to Success/Error based
    /// on exit code.
    fn node_status(&self) -> NodeStatus {
        match self.exit_code() {
            Some(0) | None => NodeStatus::Success,
            Some(_) => NodeStatus::Error,
        }
    }
}

/// Optional per-executor-type validation hook, invoked by the scheduler
/// before `Run` to reject steps that are structurally wrong for the chosen
/// executor (e.g. SSH + `script`).
pub type Validator = Arc<dyn Fn(&Step) -> RegistryResult<()> + Send + Sync>;

type Constructor = Arc<dyn Fn(&Step) -> RegistryResult<Box<dyn Executor>> + Send + Sync>;

struct Registration {
    constructor: Constructor,
    validator: Option<Validator>,
}

/// Process-wide (well: caller-owned) mapping from executor-type string to
/// constructor. Read-only after construction; lookup takes a read lock on
/// a plain `HashMap`, no global mutable state.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Arc<Registration>>,
    aliases: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        executor_type: impl Into<String>,
        constructor: impl Fn(&Step) -> RegistryResult<Box<dyn Executor>> + Send + Sync + 'static,
        validator: Option<Validator>,
    ) {
        self.entries.insert(
            executor_type.into(),
            Arc::new(Registration {
                constructor: Arc::new(constructor),
                validator,
            }),
        );
    }

    /// Register `alias` as another name resolving to `canonical`'s
    /// constructor (e.g. a legacy name for `"dag"`).
    pub fn register_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    fn resolve<'a>(&'a self, executor_type: &'a str) -> Option<&'a str> {
        if self.entries.contains_key(executor_type) {
            Some(executor_type)
        } else {
            self.aliases.get(executor_type).map(|s| s.as_str())
        }
    }

    /// Validate `step` against its declared executor type's hook, if any.
    pub fn validate_step(&self, executor_type: &str, step: &Step) -> RegistryResult<()> {
        let canonical = self
            .resolve(executor_type)
            .ok_or_else(|| RegistryError::InvalidExecutor(executor_type.to_string()))?;
        if let Some(validator) = self.entries[canonical].validator.as_ref() {
            validator(step)?;
        }
        Ok(())
    }

    /// Construct an executor for `step`, whose executor type is either
    /// `step.executor.type` (when non-empty) or inferred as `"command"`
    /// when the step has a plain command/script with no executor block.
    pub fn new_executor(&self, step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let executor_type = step
            .executor
            .as_ref()
            .map(|e| e.executor_type.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or("");
        let canonical = self
            .resolve(executor_type)
            .ok_or_else(|| RegistryError::InvalidExecutor(executor_type.to_string()))?;
        self.validate_step(executor_type, step)?;
        (self.entries[canonical].constructor)(step)
    }
}
