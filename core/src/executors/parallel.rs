//! Parallel Executor (§4.14): fans a single `child-dag` step out over a
//! list of parameter sets, running up to `max-concurrent` invocations
//! concurrently through the shared `ChildDagExecutor`, and aggregates the
//! per-item results into one JSON summary written to stdout.
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::child_dag::ChildDagExecutor;
use crate::errors::{ExecutorError, ExecutorResult, RegistryError, RegistryResult};
use crate::model::{ChildDagRef, Dag, NodeStatus, ParallelItems, ParallelSpec, RunParams, RunStatus, Status, Step};
use crate::registry::{Executor, RunContext, Signal};

#[derive(Debug, Serialize, Default)]
struct ParallelSummary {
    total: usize,
    succeeded: usize,
    failed: usize,
    errors: Vec<String>,
}

#[derive(Debug, Serialize, Default)]
struct ParallelResult {
    summary: ParallelSummary,
    results: Vec<RunStatus>,
    outputs: Vec<HashMap<String, serde_json::Value>>,
}

pub struct ParallelExecutor {
    child_ref: ChildDagRef,
    spec: ParallelSpec,
    /// Overrides the parameter-string list derived from `spec.items`, set
    /// by the scheduler once a `Variable` items reference has been resolved.
    params_list: Option<Vec<String>>,
    parent_dag: Option<Arc<Dag>>,
    child_dag_executor: Option<Arc<ChildDagExecutor>>,
    stdout: Option<Box<dyn Write + Send>>,
    last_result: Option<ParallelResult>,
}

impl ParallelExecutor {
    pub fn new(child_ref: ChildDagRef, spec: ParallelSpec) -> Self {
        Self {
            child_ref,
            spec,
            params_list: None,
            parent_dag: None,
            child_dag_executor: None,
            stdout: None,
            last_result: None,
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let child_ref = step
            .child_dag
            .clone()
            .ok_or_else(|| RegistryError::Validation("parallel".into(), "step has no child-dag reference".into()))?;
        let spec = step
            .parallel
            .clone()
            .ok_or_else(|| RegistryError::Validation("parallel".into(), "step has no parallel spec".into()))?;
        Ok(Box::new(Self::new(child_ref, spec)))
    }

    /// Explicit parameter-string list, overriding whatever `spec.items`
    /// would otherwise resolve to (used once a `Variable` reference has
    /// been evaluated against the run's environment).
    pub fn set_params_list(&mut self, params: Vec<String>) {
        self.params_list = Some(params);
    }

    pub fn with_child_dag_executor(mut self, executor: Arc<ChildDagExecutor>) -> Self {
        self.child_dag_executor = Some(executor);
        self
    }

    pub fn with_parent_dag(mut self, dag: Arc<Dag>) -> Self {
        self.parent_dag = Some(dag);
        self
    }

    fn resolve_params_list(&self, ctx: &RunContext) -> ExecutorResult<Vec<String>> {
        if let Some(list) = &self.params_list {
            return Ok(list.clone());
        }
        match &self.spec.items {
            ParallelItems::Static(items) => Ok(items.iter().map(|i| i.to_params_string()).collect()),
            ParallelItems::Variable(var_ref) => {
                let raw = ctx.env.eval_string(var_ref, &Default::default())?;
                let items: Vec<crate::model::ParallelItem> = serde_json::from_str(&raw)?;
                Ok(items.iter().map(|i| i.to_params_string()).collect())
            }
        }
    }
}

#[async_trait]
impl Executor for ParallelExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, _writer: Box<dyn Write + Send>) {}

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let child_dag_executor = self
            .child_dag_executor
            .clone()
            .ok_or_else(|| ExecutorError::Validation("parallel executor has no child-dag engine wired".into()))?;
        let parent_dag = self
            .parent_dag
            .clone()
            .ok_or_else(|| ExecutorError::Validation("parallel executor has no parent dag wired".into()))?;

        let params_list = self.resolve_params_list(ctx)?;
        let max_concurrent = self.spec.max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        let root_ref = ctx.env.context.root_run_ref.clone().unwrap_or_default();
        let parent_ref = format!(
            "{}:{}",
            ctx.env.context.dag_name,
            ctx.env.context.run_id.clone().unwrap_or_default()
        );

        let mut handles = Vec::with_capacity(params_list.len());
        for (idx, params) in params_list.into_iter().enumerate() {
            let permit_factory = semaphore.clone();
            let child_dag_executor = child_dag_executor.clone();
            let parent_dag = parent_dag.clone();
            let child_ref = self.child_ref.clone();
            let root_ref = root_ref.clone();
            let parent_ref = parent_ref.clone();
            let env = ctx.env.clone();
            let cancel = ctx.cancel.clone();
            let run_id = format!("{}-{}-{}", ctx.env.context.run_id.clone().unwrap_or_default(), idx, uuid::Uuid::new_v4());

            handles.push(tokio::spawn(async move {
                let _permit = permit_factory.acquire_owned().await.expect("semaphore is never closed");
                let run_params = RunParams { run_id: run_id.clone(), params: params.clone() };
                let result = child_dag_executor
                    .execute_one(&cancel, &parent_dag, &child_ref, &root_ref, &parent_ref, &run_params, &env)
                    .await;
                match result {
                    Ok(status) => status,
                    Err(e) => RunStatus {
                        run_id,
                        params,
                        status: Some(Status::Failed),
                        outputs: Default::default(),
                        error: Some(e.to_string()),
                        exit_code: None,
                    },
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(status) => results.push(status),
                Err(e) => results.push(RunStatus {
                    run_id: String::new(),
                    params: String::new(),
                    status: Some(Status::Failed),
                    outputs: Default::default(),
                    error: Some(format!("task panicked: {}", e)),
                    exit_code: None,
                }),
            }
        }

        let total = results.len();
        let succeeded = results
            .iter()
            .filter(|r| r.status.map(|s| s.is_success()).unwrap_or(false) || matches!(r.status, Some(Status::PartialSuccess)))
            .count();
        let failed = total - succeeded;
        let errors = results.iter().filter_map(|r| r.error.clone()).collect();
        let outputs = results
            .iter()
            .filter(|r| r.status.map(|s| s.is_success()).unwrap_or(false) || matches!(r.status, Some(Status::PartialSuccess)))
            .map(|r| r.outputs.clone())
            .collect();

        let aggregate = ParallelResult {
            summary: ParallelSummary { total, succeeded, failed, errors },
            results,
            outputs,
        };

        if let Some(out) = self.stdout.as_mut() {
            let body = serde_json::to_string_pretty(&aggregate)?;
            let _ = writeln!(out, "{}", body);
        }
        let first_error = aggregate.summary.errors.first().cloned();
        let total = aggregate.summary.total;
        self.last_result = Some(aggregate);

        if let Some(first) = first_error {
            let agg = crate::errors::ParallelError::Aggregate { count: total, first };
            return Err(ExecutorError::Validation(agg.to_string()));
        }
        Ok(())
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
        self.last_result.as_ref().map(|r| if r.summary.failed == 0 { 0 } else { 1 })
    }

    fn node_status(&self) -> NodeStatus {
        match &self.last_result {
            Some(r) if r.summary.failed == 0 => NodeStatus::Success,
            Some(r) if r.summary.succeeded > 0 => NodeStatus::PartialSuccess,
            _ => NodeStatus::Error,
        }
    }
}
