//! Error types for the workflow execution core.
//!
//! One enum per subsystem boundary, matching the error-kind taxonomy
//! (Configuration, Environment, Execution, Lifecycle, Child-DAG, Validation).
//! Each pairs with an `XResult<T>` alias.
use thiserror::Error;

/// Errors raised while resolving or evaluating the per-step execution environment.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("working directory does not exist: {0}")]
    DirNotExist(String),

    #[error("root run reference is unset")]
    RootRunRefUnset,

    #[error("run id is empty")]
    RunIdEmpty,

    #[error("unknown variable or step reference: {0}")]
    UnknownReference(String),

    #[error("cannot coerce value to bool: {0}")]
    BoolCoercion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

/// Errors raised constructing or looking up executors in the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown executor type: {0}")]
    InvalidExecutor(String),

    #[error("executor config decode failed for type '{0}': {1}")]
    ConfigDecode(String, String),

    #[error("working directory does not exist: {0}")]
    WorkingDirNotExist(String),

    #[error("step failed validation for executor '{0}': {1}")]
    Validation(String, String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while a step's executor is running.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("working directory does not exist: {0}")]
    DirNotExist(String),

    #[error("process failed to start: {0}")]
    StartFailed(String),

    #[error("process exited with status {code}{tail}")]
    NonZeroExit { code: i32, tail: String },

    #[error("http request failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ssh session error: {0}")]
    Ssh(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("jq query error: {0}")]
    Jq(String),

    #[error("git checkout error: {0}")]
    Git(String),

    #[error("mail send error: {0}")]
    Mail(String),

    #[error("cancelled")]
    Cancelled,

    #[error("kill failed: {0}")]
    KillFailed(String),

    #[error("step violates executor constraints: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors specific to the child-DAG executor.
#[derive(Error, Debug)]
pub enum ChildDagError {
    #[error("dag not found: {0}")]
    DagNotFound(String),

    #[error("child run status not found for run {0}")]
    StatusNotFound(String),

    #[error("distributed dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("distributed execution cancelled")]
    DistributedCancelled,

    #[error("child dag execution cancelled")]
    LocalCancelled,

    #[error("child run {run_id} did not succeed: status={status}")]
    NonSuccess { run_id: String, status: String },

    #[error("run id is empty")]
    RunIdEmpty,

    #[error("root run reference is unset")]
    RootRunRefUnset,

    #[error("working directory does not exist: {0}")]
    WorkingDirNotExist(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

pub type ChildDagResult<T> = Result<T, ChildDagError>;

/// Errors specific to the parallel fan-out executor.
#[derive(Error, Debug)]
pub enum ParallelError {
    #[error("parallel spec has an empty params list")]
    EmptyParams,

    #[error("{count} errors: 1 shown: {first}")]
    Aggregate { count: usize, first: String },

    #[error("child dag error: {0}")]
    ChildDag(#[from] ChildDagError),
}

pub type ParallelResult<T> = Result<T, ParallelError>;

/// Errors raised validating DAG/Step data model invariants.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("duplicate step name: {0}")]
    DuplicateStepName(String),

    #[error("step name too long (max 40 chars): {0}")]
    StepNameTooLong(String),

    #[error("step id '{0}' does not match ^[a-zA-Z][a-zA-Z0-9_-]*$")]
    InvalidStepId(String),

    #[error("step id '{0}' collides with a reserved word")]
    ReservedStepId(String),

    #[error("step '{0}' must declare an executor type, command, script, or child-dag reference")]
    StepUnderspecified(String),

    #[error("parallel spec on step '{0}' requires a child-dag reference")]
    ParallelRequiresChildDag(String),

    #[error("parallel spec on step '{0}' must have a positive max-concurrent")]
    ParallelMaxConcurrentNotPositive(String),

    #[error("parallel spec on step '{0}' must carry a static items list or a variable reference")]
    ParallelMissingItems(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;
