//! Collaborator ports the core depends on but does not implement: the
//! persistent DAG/run-history store and the coordinator RPC client used for
//! distributed child-DAG dispatch. Concrete implementations (sqlite-backed
//! store, gRPC/HTTP coordinator wire protocol) live outside this subsystem;
//! tests in this crate use in-memory fakes.
use async_trait::async_trait;
use std::collections::HashMap;

use crate::model::{Dag, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("dag not found: {0}")]
    DagNotFound(String),
    #[error("run status not found for run {0}")]
    StatusNotFound(String),
    #[error("database error: {0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// The persistent DAG/run-history store, consumed as a port.
#[async_trait]
pub trait Database: Send + Sync {
    async fn get_dag(&self, name: &str) -> DatabaseResult<Dag>;
    async fn get_child_dag_run_status(&self, run_id: &str, root_ref: &str) -> DatabaseResult<RunStatus>;
    async fn is_child_dag_run_completed(&self, run_id: &str, root_ref: &str) -> DatabaseResult<bool>;
    async fn request_child_cancel(&self, run_id: &str, root_ref: &str) -> DatabaseResult<()>;
    /// Read-only suspend flag for a DAG; core never mutates it.
    async fn is_suspended(&self, _name: &str) -> DatabaseResult<bool> {
        Ok(false)
    }
}

/// Dispatch operation carried by a coordinator `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
}

/// A unit of work dispatched to the coordinator for distributed execution.
#[derive(Debug, Clone)]
pub struct Task {
    pub operation: Operation,
    pub root_ref: String,
    pub parent_ref: String,
    pub run_id: String,
    pub target_location: String,
    pub params: String,
    pub worker_selector: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("build failed: {0}")]
    BuildFailed(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// A single coordinator session; dispatches one or more tasks.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn dispatch(&self, task: Task) -> CoordinatorResult<()>;
    /// Releases any held resources. Implementations should make this safe
    /// to call more than once.
    async fn close(&self) {}
}

/// Builds `CoordinatorClient` sessions on demand, so the child-DAG and
/// parallel executors don't hold a long-lived connection between runs.
#[async_trait]
pub trait CoordinatorClientFactory: Send + Sync {
    async fn build(&self) -> CoordinatorResult<Box<dyn CoordinatorClient>>;
}
