//! DAG Executor step-adapter (§4.13): wraps one invocation of the
//! Child-DAG Executor (`crate::child_dag::ChildDagExecutor`) behind the
//! ordinary `Executor` port, so a `child-dag` step looks like any other
//! step to the scheduler.
//!
//! Constructed from a `Step` alone via `from_step` (for registry
//! uniformity), but a usable instance additionally needs the run's shared
//! `ChildDagExecutor` and parent `Dag` wired in by the caller — the same
//! post-construction-builder idiom `mail.rs` uses for DAG-level SMTP
//! defaults, since the registry's constructor signature has no room to
//! thread ambient run state through.
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use crate::child_dag::ChildDagExecutor;
use crate::errors::{ExecutorError, ExecutorResult, RegistryError, RegistryResult};
use crate::model::{ChildDagRef, Dag, NodeStatus, RunParams, RunStatus, Status, Step};
use crate::registry::{Executor, RunContext, Signal};

pub struct DagStepExecutor {
    child_ref: ChildDagRef,
    run_id: String,
    params: String,
    parent_dag: Option<Arc<Dag>>,
    child_dag_executor: Option<Arc<ChildDagExecutor>>,
    stdout: Option<Box<dyn Write + Send>>,
    last_status: Option<RunStatus>,
}

impl DagStepExecutor {
    pub fn new(child_ref: ChildDagRef) -> Self {
        Self {
            child_ref,
            run_id: String::new(),
            params: String::new(),
            parent_dag: None,
            child_dag_executor: None,
            stdout: None,
            last_status: None,
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let child_ref = step
            .child_dag
            .clone()
            .ok_or_else(|| RegistryError::Validation("dag".into(), "step has no child-dag reference".into()))?;
        Ok(Box::new(Self::new(child_ref)))
    }

    /// Scheduler-assigned run id and parameter string for this invocation.
    pub fn set_params(&mut self, run_id: impl Into<String>, params: impl Into<String>) {
        self.run_id = run_id.into();
        self.params = params.into();
    }

    pub fn with_child_dag_executor(mut self, executor: Arc<ChildDagExecutor>) -> Self {
        self.child_dag_executor = Some(executor);
        self
    }

    pub fn with_parent_dag(mut self, dag: Arc<Dag>) -> Self {
        self.parent_dag = Some(dag);
        self
    }
}

#[async_trait]
impl Executor for DagStepExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, _writer: Box<dyn Write + Send>) {}

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let child_dag_executor = self
            .child_dag_executor
            .clone()
            .ok_or_else(|| ExecutorError::Validation("dag step executor has no child-dag engine wired".into()))?;
        let parent_dag = self
            .parent_dag
            .clone()
            .ok_or_else(|| ExecutorError::Validation("dag step executor has no parent dag wired".into()))?;

        let root_ref = ctx.env.context.root_run_ref.clone().unwrap_or_default();
        let parent_ref = format!(
            "{}:{}",
            ctx.env.context.dag_name,
            ctx.env.context.run_id.clone().unwrap_or_default()
        );
        let run_params = RunParams {
            run_id: self.run_id.clone(),
            params: self.params.clone(),
        };

        let result = child_dag_executor
            .execute_one(&ctx.cancel, &parent_dag, &self.child_ref, &root_ref, &parent_ref, &run_params, &ctx.env)
            .await;

        let (status, err) = match result {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e)),
        };
        if let Some(status) = &status {
            self.last_status = Some(status.clone());
            if let Some(out) = self.stdout.as_mut() {
                let body = serde_json::to_string_pretty(status)?;
                let _ = writeln!(out, "{}", body);
            }
        }
        match err {
            Some(e) => Err(ExecutorError::Validation(format!("child dag run failed: {}", e))),
            None => Ok(()),
        }
    }

    async fn kill(&mut self, sig: Signal) -> ExecutorResult<()> {
        if let Some(executor) = &self.child_dag_executor {
            executor
                .kill(sig)
                .await
                .map_err(|e| ExecutorError::KillFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.last_status.as_ref().map(|s| if s.status.map(|x| x.is_success()).unwrap_or(false) { 0 } else { 1 })
    }

    fn node_status(&self) -> NodeStatus {
        match &self.last_status {
            Some(status) => match status.status {
                Some(Status::Success) => NodeStatus::Success,
                Some(Status::PartialSuccess) => NodeStatus::PartialSuccess,
                _ => NodeStatus::Error,
            },
            None => NodeStatus::Error,
        }
    }
}
