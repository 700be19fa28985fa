//! Data model for DAGs, steps, and the values that flow between a step and
//! its executor. Parsing/loading from YAML is a collaborator's job (the
//! loader is explicitly out of scope); this module only defines the parsed
//! shape core consumes and the invariants core itself must check.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ValidationError, ValidationResult};

static STEP_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap());

const RESERVED_STEP_IDS: &[&str] = &[
    "env", "params", "args", "stdout", "stderr", "output", "outputs",
];

/// What kind of DAG this is, which determines whether implicit `depends`
/// edges get synthesized by `DAG::apply_chain_defaults`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DagType {
    #[default]
    Graph,
    Chain,
    Agent,
}

/// SMTP defaults a DAG can provide; steps inherit what they don't override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpDefaults {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// SSH defaults a DAG can provide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshDefaults {
    pub user: Option<String>,
    pub key: Option<String>,
    pub port: Option<u16>,
}

/// Container defaults a DAG can provide (e.g. a shared image/pull policy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDefaults {
    pub image: Option<String>,
    pub pull: Option<String>,
}

/// A single `KEY=VALUE` environment entry. Kept as an ordered list (not a
/// map) because later entries are allowed to reference earlier ones during
/// substitution, matching shell semantics.
pub type EnvList = Vec<(String, String)>;

/// Free-form executor configuration: a type tag plus an arbitrary map,
/// decoded by whichever executor constructor claims the type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(rename = "type", default)]
    pub executor_type: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

/// Reference to a child DAG plus the shell-escaped `key=value` parameter
/// string passed to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildDagRef {
    pub name: String,
    #[serde(default)]
    pub params: String,
}

/// One static parallel fan-out item: a bare scalar or an object flattened
/// to a key->string map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelItem {
    Scalar(String),
    Object(HashMap<String, String>),
}

impl ParallelItem {
    /// Render this item as the `key=value` parameter string a child-DAG
    /// invocation expects.
    pub fn to_params_string(&self) -> String {
        match self {
            ParallelItem::Scalar(s) => s.clone(),
            ParallelItem::Object(map) => {
                let mut pairs: Vec<_> = map.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                pairs
                    .into_iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
    }
}

/// Source of the parallel fan-out item list: either given inline, or a
/// `${VAR}` reference resolved at runtime to a JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParallelItems {
    Static(Vec<ParallelItem>),
    Variable(String),
}

/// `parallel:` block on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub items: ParallelItems,
    #[serde(rename = "max-concurrent", default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

/// One executable unit within a DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(rename = "shell-packages", default)]
    pub shell_packages: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(rename = "explicitly-no-deps", default)]
    pub explicitly_no_deps: bool,
    #[serde(rename = "signal-on-stop", default)]
    pub signal_on_stop: Option<String>,
    #[serde(default)]
    pub env: EnvList,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(rename = "child-dag", default)]
    pub child_dag: Option<ChildDagRef>,
    #[serde(default)]
    pub parallel: Option<ParallelSpec>,
}

impl Step {
    /// A step must declare an executor type, a non-empty command, a script,
    /// or a child-DAG reference.
    fn declares_workload(&self) -> bool {
        self.executor.as_ref().is_some_and(|e| !e.executor_type.is_empty())
            || self.command.as_deref().is_some_and(|c| !c.is_empty())
            || self.script.is_some()
            || self.child_dag.is_some()
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.name.len() > 40 {
            return Err(ValidationError::StepNameTooLong(self.name.clone()));
        }
        if let Some(id) = &self.id {
            if !STEP_ID_RE.is_match(id) {
                return Err(ValidationError::InvalidStepId(id.clone()));
            }
            if RESERVED_STEP_IDS.contains(&id.as_str()) {
                return Err(ValidationError::ReservedStepId(id.clone()));
            }
        }
        if !self.declares_workload() {
            return Err(ValidationError::StepUnderspecified(self.name.clone()));
        }
        if let Some(parallel) = &self.parallel {
            if self.child_dag.is_none() {
                return Err(ValidationError::ParallelRequiresChildDag(self.name.clone()));
            }
            if parallel.max_concurrent == 0 {
                return Err(ValidationError::ParallelMaxConcurrentNotPositive(
                    self.name.clone(),
                ));
            }
            if let ParallelItems::Static(items) = &parallel.items {
                if items.is_empty() {
                    return Err(ValidationError::ParallelMissingItems(self.name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// The workflow definition itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(rename = "local-dags", default)]
    pub local_dags: HashMap<String, Dag>,
    #[serde(rename = "working-dir", default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: EnvList,
    #[serde(default)]
    pub smtp: Option<SmtpDefaults>,
    #[serde(default)]
    pub ssh: Option<SshDefaults>,
    #[serde(default)]
    pub container: Option<ContainerDefaults>,
    #[serde(rename = "worker-selector", default)]
    pub worker_selector: HashMap<String, String>,
    #[serde(rename = "type", default)]
    pub dag_type: DagType,
}

impl Dag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A child DAG is eligible for distributed dispatch iff it declares a
    /// non-empty worker selector.
    pub fn should_use_distributed_execution(&self) -> bool {
        !self.worker_selector.is_empty()
    }

    /// For `chain`-type DAGs, give each step without an explicit `depends`
    /// and without `explicitly-no-deps` an implicit dependency on its
    /// immediate predecessor. Idempotent: steps that already carry an
    /// implicit edge are left untouched if re-run.
    pub fn apply_chain_defaults(&mut self) {
        if self.dag_type != DagType::Chain {
            return;
        }
        for i in 1..self.steps.len() {
            let prev_name = self.steps[i - 1].name.clone();
            let step = &mut self.steps[i];
            if step.depends.is_empty() && !step.explicitly_no_deps {
                step.depends.push(prev_name);
            }
        }
    }

    /// Validates DAG-level invariants: unique step names, and each step's
    /// own invariants. Cyclic dependency detection among *steps* is the
    /// scheduler's responsibility; this only checks what core itself relies
    /// on before dispatching an executor.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStepName(step.name.clone()));
            }
            step.validate()?;
        }
        Ok(())
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Status of a single DAG/child-DAG run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    PartialSuccess,
    Failed,
    Cancelled,
    Running,
    Queued,
    None,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::PartialSuccess => "partial-success",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Running => "running",
            Status::Queued => "queued",
            Status::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Identifies one invocation of a child DAG: a run id the scheduler
/// generated, plus the parameter string to pass down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunParams {
    pub run_id: String,
    pub params: String,
}

/// The result of a completed (or still-running) child-DAG invocation, as
/// retrieved from the `Database` port.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStatus {
    pub run_id: String,
    pub params: String,
    #[serde(default = "default_status")]
    pub status: Option<Status>,
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

fn default_status() -> Option<Status> {
    Some(Status::None)
}

/// Outcome of a node once its step executor has run, as determined by the
/// DAG Executor adapter (§4.13) from a `RunStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    PartialSuccess,
    Error,
}

pub fn determine_node_status(run_id: &str, status: &RunStatus) -> Result<NodeStatus, ChildDagNodeError> {
    match status.status {
        Some(Status::Success) => Ok(NodeStatus::Success),
        Some(Status::PartialSuccess) => Ok(NodeStatus::PartialSuccess),
        other => Err(ChildDagNodeError {
            run_id: run_id.to_string(),
            status: other
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("child run {run_id} did not succeed: status={status}")]
pub struct ChildDagNodeError {
    pub run_id: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_id_pattern_and_reserved_words() {
        let mut step = Step {
            name: "build".into(),
            command: Some("echo hi".into()),
            ..Default::default()
        };
        step.id = Some("1bad".into());
        assert!(matches!(step.validate(), Err(ValidationError::InvalidStepId(_))));

        step.id = Some("stdout".into());
        assert!(matches!(step.validate(), Err(ValidationError::ReservedStepId(_))));

        step.id = Some("good_id-1".into());
        assert!(step.validate().is_ok());
    }

    #[test]
    fn step_must_declare_a_workload() {
        let step = Step {
            name: "noop".into(),
            ..Default::default()
        };
        assert!(matches!(
            step.validate(),
            Err(ValidationError::StepUnderspecified(_))
        ));
    }

    #[test]
    fn chain_dag_synthesizes_implicit_dependencies() {
        let mut dag = Dag::new("chain-example");
        dag.dag_type = DagType::Chain;
        dag.steps = vec![
            Step {
                name: "a".into(),
                command: Some("echo a".into()),
                ..Default::default()
            },
            Step {
                name: "b".into(),
                command: Some("echo b".into()),
                ..Default::default()
            },
            Step {
                name: "c".into(),
                command: Some("echo c".into()),
                explicitly_no_deps: true,
                ..Default::default()
            },
        ];
        dag.apply_chain_defaults();
        assert_eq!(dag.steps[1].depends, vec!["a".to_string()]);
        assert!(dag.steps[2].depends.is_empty());
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let mut dag = Dag::new("dupes");
        dag.steps = vec![
            Step {
                name: "a".into(),
                command: Some("echo".into()),
                ..Default::default()
            },
            Step {
                name: "a".into(),
                command: Some("echo".into()),
                ..Default::default()
            },
        ];
        assert!(matches!(
            dag.validate(),
            Err(ValidationError::DuplicateStepName(_))
        ));
    }

    #[test]
    fn distributed_execution_requires_worker_selector() {
        let mut dag = Dag::new("d");
        assert!(!dag.should_use_distributed_execution());
        dag.worker_selector.insert("type".into(), "gpu".into());
        assert!(dag.should_use_distributed_execution());
    }

    #[test]
    fn run_status_round_trips_through_json() {
        let status = RunStatus {
            run_id: "r1".into(),
            params: "K=V".into(),
            status: Some(Status::Success),
            outputs: HashMap::new(),
            error: None,
            exit_code: Some(0),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }

    #[test]
    fn node_status_maps_from_child_status() {
        let success = RunStatus {
            status: Some(Status::Success),
            ..Default::default()
        };
        assert_eq!(
            determine_node_status("r1", &success).unwrap(),
            NodeStatus::Success
        );

        let failed = RunStatus {
            status: Some(Status::Failed),
            ..Default::default()
        };
        assert!(determine_node_status("r1", &failed).is_err());
    }
}
