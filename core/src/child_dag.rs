//! Child-DAG Executor (§4.12) — the core of the core. Resolves a child DAG
//! (local inline or store-backed), materializes inline DAGs to temp files,
//! builds the sub-invocation command that spawns the same binary with
//! `start ...`, dispatches either locally (fork/exec) or remotely
//! (coordinator task + polling), and retrieves the final `RunStatus`.
//!
//! One instance is shared by every run-id it is asked to execute: the
//! step-level DAG adapter (§4.13) drives it for a single run, the parallel
//! executor (§4.14) drives it for N concurrent runs, and `kill` broadcasts
//! to whatever subset is in flight at the time.
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::{local_dags_temp_dir, EXECUTABLE_ENV_VAR};
use crate::environment::Environment;
use crate::errors::{ChildDagError, ChildDagResult};
use crate::model::{ChildDagRef, Dag, RunParams, RunStatus};
use crate::ports::{CoordinatorClientFactory, Database, Operation, Task};
use crate::registry::Signal;

/// One resolved child DAG, plus the temp file to clean up if it was
/// materialized from an inline local DAG.
struct Resolved {
    dag: Dag,
    temp_file: Option<PathBuf>,
}

/// A locally spawned sub-process. The pid is kept alongside the process
/// handle so `kill` never has to hold the handle's lock across an await.
struct LocalProc {
    pid: u32,
    child: Arc<AsyncMutex<Child>>,
}

/// Shared engine behind both the single-run DAG adapter and the parallel
/// fan-out executor.
pub struct ChildDagExecutor {
    db: Arc<dyn Database>,
    coordinator_factory: Option<Arc<dyn CoordinatorClientFactory>>,
    /// local run-id -> spawned sub-process, for group-kill broadcast.
    local_processes: DashMap<String, LocalProc>,
    /// run-id -> root run reference, for runs currently dispatched to the coordinator.
    distributed_run_ids: DashMap<String, String>,
    /// temp files created while resolving inline local DAGs, removed on cleanup.
    temp_files: DashMap<String, PathBuf>,
}

impl ChildDagExecutor {
    pub fn new(db: Arc<dyn Database>, coordinator_factory: Option<Arc<dyn CoordinatorClientFactory>>) -> Self {
        Self {
            db,
            coordinator_factory,
            local_processes: DashMap::new(),
            distributed_run_ids: DashMap::new(),
            temp_files: DashMap::new(),
        }
    }

    /// Resolve `child_name` against the parent's inline local DAGs first,
    /// falling back to the `Database` port (§4.12 Resolution).
    async fn resolve(&self, parent: &Dag, child_name: &str, run_id: &str) -> ChildDagResult<Resolved> {
        if let Some(inline) = parent.local_dags.get(child_name) {
            let dir = local_dags_temp_dir();
            tokio::fs::create_dir_all(&dir).await?;
            let file_name = format!("{}-{}.yaml", child_name, uuid::Uuid::new_v4());
            let path = dir.join(file_name);
            let body = serde_yaml::to_string(inline)?;
            tokio::fs::write(&path, &body).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await;
            }
            self.temp_files.insert(run_id.to_string(), path.clone());
            let mut dag = inline.clone();
            dag.location = Some(path.display().to_string());
            return Ok(Resolved { dag, temp_file: Some(path) });
        }
        let dag = self
            .db
            .get_dag(child_name)
            .await
            .map_err(|_| ChildDagError::DagNotFound(child_name.to_string()))?;
        Ok(Resolved { dag, temp_file: None })
    }

    /// Remove a resolution's temp file, if any. Idempotent: missing-file
    /// errors are tolerated, and a second call for the same run-id is a
    /// no-op because the entry is removed from the map on first cleanup.
    pub async fn cleanup(&self, run_id: &str) {
        if let Some((_, path)) = self.temp_files.remove(run_id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) | Err(_) => {}
            }
        }
    }

    /// Resolve the binary to spawn for a sub-invocation: an explicit
    /// override env var wins, then a PATH lookup of argv[0] (covers the
    /// common case where the binary was invoked by bare name), falling back
    /// to the OS's own-executable resolution.
    fn resolve_executable() -> ChildDagResult<PathBuf> {
        if let Ok(exe) = std::env::var(EXECUTABLE_ENV_VAR) {
            return Ok(PathBuf::from(exe));
        }
        if let Some(argv0) = std::env::args().next() {
            if let Ok(path) = which::which(&argv0) {
                return Ok(path);
            }
        }
        std::env::current_exe().map_err(ChildDagError::Io)
    }

    /// Build the sub-invocation command (§6.2), reused verbatim by the
    /// parallel executor for each of its N concurrent launches.
    fn build_command(
        child: &Dag,
        root_ref: &str,
        parent_ref: &str,
        run_id: &str,
        run_params: &RunParams,
        env: &Environment,
    ) -> ChildDagResult<TokioCommand> {
        if run_id.is_empty() {
            return Err(ChildDagError::RunIdEmpty);
        }
        if root_ref.is_empty() {
            return Err(ChildDagError::RootRunRefUnset);
        }
        let exe = Self::resolve_executable()?;
        let location = child
            .location
            .as_deref()
            .ok_or_else(|| ChildDagError::DagNotFound(child.name.clone()))?;

        let mut cmd = TokioCommand::new(&exe);
        cmd.arg("start")
            .arg(format!("--root={}", root_ref))
            .arg(format!("--parent={}", parent_ref))
            .arg(format!("--run-id={}", run_id))
            .arg("--no-queue")
            .arg(location);
        if !run_params.params.is_empty() {
            cmd.arg("--").arg(&run_params.params);
        }

        crate::environment::assert_dir_exists(&env.working_dir)
            .map_err(|_| ChildDagError::WorkingDirNotExist(env.working_dir.display().to_string()))?;
        cmd.current_dir(&env.working_dir);
        cmd.envs(env.all_envs().iter().filter_map(|kv| kv.split_once('=')));
        for key in ["TRACEPARENT", "TRACESTATE"] {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
                });
            }
        }
        Ok(cmd)
    }

    /// Local mode (§4.12): start the sub-process, wait, then fetch the
    /// final status regardless of whether the wait itself errored.
    async fn run_local(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        child: &Dag,
        root_ref: &str,
        parent_ref: &str,
        run_params: &RunParams,
        env: &Environment,
    ) -> ChildDagResult<RunStatus> {
        let mut cmd = Self::build_command(child, root_ref, parent_ref, &run_params.run_id, run_params, env)?;
        debug!(run_id = %run_params.run_id, "spawning local child-dag sub-invocation");
        let child_proc = cmd.spawn().map_err(ChildDagError::Io)?;
        let pid = child_proc.id().unwrap_or(0);
        let handle = Arc::new(AsyncMutex::new(child_proc));
        self.local_processes.insert(
            run_params.run_id.clone(),
            LocalProc { pid, child: handle.clone() },
        );

        let wait_result = tokio::select! {
            r = async { handle.lock().await.wait().await } => Some(r),
            _ = cancel.cancelled() => None,
        };
        self.local_processes.remove(&run_params.run_id);

        let status = self.db.get_child_dag_run_status(&run_params.run_id, root_ref).await;

        if wait_result.is_none() {
            return Err(ChildDagError::LocalCancelled);
        }
        let wait_result = wait_result.unwrap().map_err(ChildDagError::Io);

        match (wait_result, status) {
            (Err(e), Ok(status)) => {
                warn!(error = %e, run_id = %run_params.run_id, "child-dag wait failed, returning fetched status anyway");
                let _ = status;
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
            (Ok(_), Ok(status)) => {
                if status.status.map(|s| s.is_success()).unwrap_or(false)
                    || matches!(status.status, Some(crate::model::Status::PartialSuccess))
                {
                    Ok(status)
                } else {
                    Err(ChildDagError::NonSuccess {
                        run_id: run_params.run_id.clone(),
                        status: status.status.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
                    })
                }
            }
            (Ok(_), Err(_)) => Err(ChildDagError::StatusNotFound(run_params.run_id.clone())),
        }
    }

    /// Distributed mode (§4.12): dispatch a coordinator task, poll for
    /// completion on a 1s tick, then fetch and return the final status.
    async fn run_distributed(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        child: &Dag,
        root_ref: &str,
        parent_ref: &str,
        run_params: &RunParams,
    ) -> ChildDagResult<RunStatus> {
        let factory = self
            .coordinator_factory
            .as_ref()
            .ok_or_else(|| ChildDagError::DispatchFailed("no coordinator client factory configured".into()))?;
        let location = child.location.clone().unwrap_or_default();
        let task = Task {
            operation: Operation::Start,
            root_ref: root_ref.to_string(),
            parent_ref: parent_ref.to_string(),
            run_id: run_params.run_id.clone(),
            target_location: location,
            params: run_params.params.clone(),
            worker_selector: child.worker_selector.clone(),
        };

        let client = factory
            .build()
            .await
            .map_err(|e| ChildDagError::DispatchFailed(e.to_string()))?;
        client
            .dispatch(task)
            .await
            .map_err(|e| ChildDagError::DispatchFailed(e.to_string()))?;
        self.distributed_run_ids
            .insert(run_params.run_id.clone(), root_ref.to_string());

        let mut ticker = interval(Duration::from_secs(1));
        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.db.is_child_dag_run_completed(&run_params.run_id, root_ref).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => continue,
                        Err(e) => break Err(ChildDagError::DispatchFailed(e.to_string())),
                    }
                }
                _ = cancel.cancelled() => break Err(ChildDagError::DistributedCancelled),
            }
        };
        self.distributed_run_ids.remove(&run_params.run_id);
        client.close().await;
        outcome?;

        let status = self
            .db
            .get_child_dag_run_status(&run_params.run_id, root_ref)
            .await
            .map_err(|_| ChildDagError::StatusNotFound(run_params.run_id.clone()))?;
        if status.status.map(|s| s.is_success()).unwrap_or(false)
            || matches!(status.status, Some(crate::model::Status::PartialSuccess))
        {
            Ok(status)
        } else {
            Err(ChildDagError::NonSuccess {
                run_id: run_params.run_id.clone(),
                status: status.status.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
            })
        }
    }

    /// Execute one child-DAG invocation end to end: resolve, select local
    /// vs. distributed per `should_use_distributed_execution`, run, clean
    /// up the resolution's temp file (if any).
    pub async fn execute_one(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        parent: &Dag,
        child_ref: &ChildDagRef,
        root_ref: &str,
        parent_ref: &str,
        run_params: &RunParams,
        env: &Environment,
    ) -> ChildDagResult<RunStatus> {
        if run_params.run_id.is_empty() {
            return Err(ChildDagError::RunIdEmpty);
        }
        if root_ref.is_empty() {
            return Err(ChildDagError::RootRunRefUnset);
        }
        let resolved = self.resolve(parent, &child_ref.name, &run_params.run_id).await?;
        let distributed = resolved.dag.should_use_distributed_execution();
        info!(run_id = %run_params.run_id, child = %child_ref.name, distributed, "executing child dag");

        let result = if distributed {
            self.run_distributed(cancel, &resolved.dag, root_ref, parent_ref, run_params).await
        } else {
            self.run_local(cancel, &resolved.dag, root_ref, parent_ref, run_params, env).await
        };

        if resolved.temp_file.is_some() {
            self.cleanup(&run_params.run_id).await;
        }
        result
    }

    /// Broadcast `sig` to every currently tracked local sub-process group,
    /// and request cancellation for every in-flight distributed run.
    pub async fn kill(&self, sig: Signal) -> ChildDagResult<()> {
        let mut last_err = None;
        let distributed: Vec<(String, String)> = self
            .distributed_run_ids
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (run_id, root_ref) in distributed {
            if let Err(e) = self.db.request_child_cancel(&run_id, &root_ref).await {
                last_err = Some(e.to_string());
            }
        }

        let pids: Vec<u32> = self.local_processes.iter().map(|e| e.value().pid).filter(|&p| p != 0).collect();
        for pid in pids {
            #[cfg(unix)]
            {
                if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), sig) {
                    last_err = Some(e.to_string());
                }
            }
            #[cfg(not(unix))]
            {
                let _ = (pid, sig);
            }
        }
        if let Some(e) = last_err {
            return Err(ChildDagError::DispatchFailed(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DagContext;
    use crate::model::{ParallelItem, Status};
    use crate::ports::fakes::{InMemoryDatabase, RecordingCoordinatorFactory};

    fn test_env() -> Environment {
        let dag = Dag::new("parent");
        let step = crate::model::Step { name: "s".into(), ..Default::default() };
        Environment::new(
            DagContext::default(),
            &dag,
            &step,
            Arc::new(DashMap::new()),
            Arc::new(DashMap::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_inline_dag_is_materialized_and_cleaned_up() {
        let db = InMemoryDatabase::new();
        let executor = ChildDagExecutor::new(db.clone(), None);
        let mut parent = Dag::new("parent");
        let mut child = Dag::new("child");
        child.location = Some("ignored-until-materialized".into());
        parent.local_dags.insert("child".to_string(), child);

        let resolved = executor.resolve(&parent, "child", "run-1").await.unwrap();
        let path = resolved.temp_file.clone().unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".yaml"));
        executor.cleanup("run-1").await;
        assert!(!path.exists());
        // idempotent second cleanup
        executor.cleanup("run-1").await;
    }

    #[tokio::test]
    async fn empty_run_id_is_rejected() {
        let db = InMemoryDatabase::new();
        let executor = ChildDagExecutor::new(db, None);
        let parent = Dag::new("parent");
        let env = test_env();
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = executor
            .execute_one(
                &cancel,
                &parent,
                &ChildDagRef { name: "child".into(), params: String::new() },
                "root:r1",
                "parent:p1",
                &RunParams { run_id: String::new(), params: String::new() },
                &env,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildDagError::RunIdEmpty));
    }

    #[tokio::test]
    async fn missing_root_ref_is_rejected() {
        let db = InMemoryDatabase::new();
        let executor = ChildDagExecutor::new(db, None);
        let parent = Dag::new("parent");
        let env = test_env();
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = executor
            .execute_one(
                &cancel,
                &parent,
                &ChildDagRef { name: "child".into(), params: String::new() },
                "",
                "parent:p1",
                &RunParams { run_id: "r1".into(), params: String::new() },
                &env,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildDagError::RootRunRefUnset));
    }

    #[tokio::test]
    async fn dag_not_found_surfaces_as_typed_error() {
        let db = InMemoryDatabase::new();
        let executor = ChildDagExecutor::new(db, None);
        let parent = Dag::new("parent");
        let env = test_env();
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = executor
            .execute_one(
                &cancel,
                &parent,
                &ChildDagRef { name: "nope".into(), params: String::new() },
                "root:r1",
                "parent:p1",
                &RunParams { run_id: "r1".into(), params: String::new() },
                &env,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChildDagError::DagNotFound(_)));
    }

    #[test]
    fn parallel_item_flattens_object_to_sorted_key_value_string() {
        let mut map = HashMap::new();
        map.insert("B".to_string(), "2".to_string());
        map.insert("A".to_string(), "1".to_string());
        let item = ParallelItem::Object(map);
        assert_eq!(item.to_params_string(), "A=1 B=2");
    }

    #[test]
    fn status_success_and_partial_success_are_the_only_success_states() {
        assert!(Status::Success.is_success());
        assert!(!Status::PartialSuccess.is_success());
    }

    #[test]
    fn build_command_produces_the_documented_sub_invocation_argv() {
        std::env::set_var(EXECUTABLE_ENV_VAR, "/bin/true");
        let mut child = Dag::new("child");
        child.location = Some("/dags/child.yaml".into());
        let env = test_env();
        let run_params = RunParams { run_id: "r1".into(), params: "K=V".into() };

        let cmd = ChildDagExecutor::build_command(&child, "root:root1", "parent:p1", "r1", &run_params, &env).unwrap();
        let std_cmd = cmd.as_std();
        let args: Vec<&str> = std_cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        std::env::remove_var(EXECUTABLE_ENV_VAR);

        assert_eq!(
            args,
            vec!["start", "--root=root:root1", "--parent=parent:p1", "--run-id=r1", "--no-queue", "/dags/child.yaml", "--", "K=V"]
        );
    }

    #[tokio::test]
    async fn distributed_dispatch_and_kill_requests_cancel_exactly_once() {
        let db = InMemoryDatabase::new();
        let factory = Arc::new(RecordingCoordinatorFactory::new());
        let dispatched = factory.dispatched.clone();
        let executor = Arc::new(ChildDagExecutor::new(db.clone(), Some(factory.clone())));

        let mut parent = Dag::new("parent");
        let mut child = Dag::new("child");
        child.location = Some("/dags/child.yaml".into());
        child.worker_selector.insert("type".into(), "gpu".into());
        parent.local_dags.insert("child".to_string(), child);

        let cancel = tokio_util::sync::CancellationToken::new();
        let env = test_env();
        let run_params = RunParams { run_id: "r1".into(), params: String::new() };

        let run_executor = executor.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_executor
                .execute_one(
                    &run_cancel,
                    &parent,
                    &ChildDagRef { name: "child".into(), params: String::new() },
                    "root:root1",
                    "parent:p1",
                    &run_params,
                    &env,
                )
                .await
        });

        // Give the dispatch + poll loop a moment to start and register
        // this run as in-flight before requesting a kill.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dispatched_tasks = dispatched.lock().clone();
        assert_eq!(dispatched_tasks.len(), 1);
        assert_eq!(dispatched_tasks[0].operation, Operation::Start);
        assert_eq!(dispatched_tasks[0].worker_selector.get("type"), Some(&"gpu".to_string()));
        assert_eq!(dispatched_tasks[0].run_id, "r1");

        executor.kill(Signal::SIGINT).await.unwrap();
        assert_eq!(db.cancel_requests.lock().clone(), vec!["r1".to_string()]);

        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ChildDagError::DistributedCancelled)));
    }
}
