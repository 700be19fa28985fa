//! The `Database` port implementation backing the standalone `start`
//! sub-invocation: named child DAGs resolve as `<dags-dir>/<name>.yaml`
//! files, and a completed run's status is persisted to a JSON file so a
//! waiting parent process (the `start` invocation that spawned this one)
//! can read back what this process wrote. The persistent DAG/run-history
//! store and the coordinator wire protocol are explicitly out of scope for
//! the core subsystem; this is the minimal concrete adapter a standalone
//! binary needs to make local-mode child-DAG dispatch actually round-trip
//! across the process boundary, namespaced under the same brand-prefixed
//! temp-dir convention (§6.3) `descartes-core::config` already uses.
use std::path::PathBuf;

use async_trait::async_trait;
use descartes_core::ports::{Database, DatabaseError, DatabaseResult};
use descartes_core::{Dag, RunStatus, BRAND};

fn run_status_dir() -> PathBuf {
    std::env::temp_dir().join(BRAND).join("run-status")
}

fn run_status_path(run_id: &str) -> PathBuf {
    run_status_dir().join(format!("{}.json", run_id))
}

/// Persist `status` where a parent process's `FileDatabase` can find it.
pub fn write_run_status(status: &RunStatus) -> anyhow::Result<()> {
    std::fs::create_dir_all(run_status_dir())?;
    let body = serde_json::to_vec_pretty(status)?;
    std::fs::write(run_status_path(&status.run_id), body)?;
    Ok(())
}

pub struct FileDatabase {
    dags_dir: PathBuf,
}

impl FileDatabase {
    pub fn new(dags_dir: PathBuf) -> Self {
        Self { dags_dir }
    }
}

#[async_trait]
impl Database for FileDatabase {
    async fn get_dag(&self, name: &str) -> DatabaseResult<Dag> {
        let path = self.dags_dir.join(format!("{}.yaml", name));
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| DatabaseError::DagNotFound(name.to_string()))?;
        let mut dag: Dag =
            serde_yaml::from_str(&body).map_err(|e| DatabaseError::Other(e.to_string()))?;
        if dag.location.is_none() {
            dag.location = Some(path.display().to_string());
        }
        Ok(dag)
    }

    async fn get_child_dag_run_status(&self, run_id: &str, _root_ref: &str) -> DatabaseResult<RunStatus> {
        let body = tokio::fs::read(run_status_path(run_id))
            .await
            .map_err(|_| DatabaseError::StatusNotFound(run_id.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| DatabaseError::Other(e.to_string()))
    }

    async fn is_child_dag_run_completed(&self, run_id: &str, _root_ref: &str) -> DatabaseResult<bool> {
        Ok(run_status_path(run_id).exists())
    }

    async fn request_child_cancel(&self, run_id: &str, _root_ref: &str) -> DatabaseResult<()> {
        tracing::warn!(run_id = %run_id, "distributed cancel requested but no coordinator is wired for the standalone CLI");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use descartes_core::Status;

    #[tokio::test]
    async fn named_dag_resolves_relative_to_dags_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("child.yaml"), "name: child\nsteps: []\n").unwrap();
        let db = FileDatabase::new(dir.path().to_path_buf());
        let dag = db.get_dag("child").await.unwrap();
        assert_eq!(dag.name, "child");
        assert!(dag.location.is_some());
    }

    #[tokio::test]
    async fn unknown_dag_name_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = FileDatabase::new(dir.path().to_path_buf());
        assert!(matches!(
            db.get_dag("nope").await.unwrap_err(),
            DatabaseError::DagNotFound(_)
        ));
    }

    #[tokio::test]
    async fn run_status_round_trips_through_the_file_store() {
        let run_id = format!("test-{}", uuid::Uuid::new_v4());
        let status = RunStatus {
            run_id: run_id.clone(),
            params: "K=V".into(),
            status: Some(Status::Success),
            outputs: Default::default(),
            error: None,
            exit_code: Some(0),
        };
        write_run_status(&status).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let db = FileDatabase::new(dir.path().to_path_buf());
        assert!(db.is_child_dag_run_completed(&run_id, "root").await.unwrap());
        let fetched = db.get_child_dag_run_status(&run_id, "root").await.unwrap();
        assert_eq!(fetched, status);
    }
}
