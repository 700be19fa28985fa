//! Per-step execution environment: variable resolution, `${...}` expression
//! evaluation, working-directory resolution, and process-env-vector
//! assembly for whatever executor ends up running the step.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{EnvironmentError, EnvironmentResult};
use crate::model::{Dag, Step};

/// stdout/stderr/exit-code captured for one completed step, keyed by step
/// id so later steps can reference `${stepID.stdout}` etc.
#[derive(Debug, Clone, Default)]
pub struct StepInfo {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Ambient context shared by every step in one DAG run.
#[derive(Debug, Clone, Default)]
pub struct DagContext {
    pub dag_name: String,
    pub root_run_ref: Option<String>,
    pub run_id: Option<String>,
}

/// Per-step, non-persistent execution environment. Created at the start of
/// a step's `Run`, discarded at step completion.
#[derive(Clone)]
pub struct Environment {
    pub context: DagContext,
    /// Published outputs of prior steps: `NAME -> "NAME=value"`.
    variables: Arc<DashMap<String, String>>,
    /// PWD, DAG_RUN_STEP_NAME, and anything set via `with_env`.
    step_env: Arc<DashMap<String, String>>,
    /// DAG-level environment, lowest precedence.
    dag_env: Vec<(String, String)>,
    /// Step-info map keyed by step id.
    step_info: Arc<DashMap<String, StepInfo>>,
    pub working_dir: PathBuf,
}

static VAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

impl Environment {
    /// Build a fresh environment for `step` within `dag`, resolving the
    /// working directory per §4.2: step `dir` > DAG working dir > process
    /// cwd, with `~`/`$HOME`/relative forms expanded to an absolute path.
    pub fn new(
        context: DagContext,
        dag: &Dag,
        step: &Step,
        variables: Arc<DashMap<String, String>>,
        step_info: Arc<DashMap<String, StepInfo>>,
    ) -> EnvironmentResult<Self> {
        let working_dir = resolve_working_dir(step.dir.as_deref(), dag.working_dir.as_deref())?;

        let step_env = Arc::new(DashMap::new());
        step_env.insert("PWD".to_string(), working_dir.display().to_string());
        step_env.insert("DAG_RUN_STEP_NAME".to_string(), step.name.clone());
        for (k, v) in &step.env {
            step_env.insert(k.clone(), v.clone());
        }

        Ok(Self {
            context,
            variables,
            step_env,
            dag_env: dag.env.clone(),
            step_info,
            working_dir,
        })
    }

    /// Insert an additional step-level env var (e.g. from `WithEnv`).
    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.step_env.insert(key.into(), value.into());
    }

    /// Resolve a single `${...}` body against, in precedence order: step
    /// env, published variables, DAG env, then ad-hoc options.
    fn lookup(&self, name: &str, options: &HashMap<String, String>) -> Option<String> {
        if let Some(step_id_field) = name.split_once('.') {
            let (step_id, field) = step_id_field;
            if let Some(info) = self.step_info.get(step_id) {
                return match field {
                    "stdout" => Some(info.stdout.clone()),
                    "stderr" => Some(info.stderr.clone()),
                    "exitCode" => Some(info.exit_code.map(|c| c.to_string()).unwrap_or_default()),
                    _ => None,
                };
            }
            return None;
        }

        if let Some(v) = self.step_env.get(name) {
            return Some(v.clone());
        }
        if let Some(kv) = self.variables.get(name) {
            // stored as "NAME=value"
            if let Some((_, v)) = kv.split_once('=') {
                return Some(v.to_string());
            }
        }
        if let Some((_, v)) = self.dag_env.iter().find(|(k, _)| k == name) {
            return Some(v.clone());
        }
        options.get(name).cloned()
    }

    /// Substitute every `${NAME}` / `${stepID.stdout|stderr|exitCode}` token
    /// in `input`.
    pub fn eval_string(&self, input: &str, options: &HashMap<String, String>) -> EnvironmentResult<String> {
        let mut err = None;
        let out = VAR_RE.replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            match self.lookup(name, options) {
                Some(v) => v,
                None => {
                    if err.is_none() {
                        err = Some(EnvironmentError::UnknownReference(name.to_string()));
                    }
                    String::new()
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        Ok(out.into_owned())
    }

    /// Evaluate `input` as a string, then parse the boolean forms
    /// `true/false/1/0/t/f/yes/no` (case-insensitive).
    pub fn eval_bool(&self, input: &str, options: &HashMap<String, String>) -> EnvironmentResult<bool> {
        let resolved = self.eval_string(input, options)?;
        match resolved.to_ascii_lowercase().as_str() {
            "true" | "1" | "t" | "yes" => Ok(true),
            "false" | "0" | "f" | "no" => Ok(false),
            other => Err(EnvironmentError::BoolCoercion(other.to_string())),
        }
    }

    /// Recursively expand every string leaf of a JSON value.
    pub fn eval_object(
        &self,
        value: &serde_json::Value,
        options: &HashMap<String, String>,
    ) -> EnvironmentResult<serde_json::Value> {
        Ok(match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.eval_string(s, options)?),
            serde_json::Value::Array(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for v in arr {
                    out.push(self.eval_object(v, options)?);
                }
                serde_json::Value::Array(out)
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.eval_object(v, options)?);
                }
                serde_json::Value::Object(out)
            }
            other => other.clone(),
        })
    }

    /// The process environment vector for a child: ambient DAG env, then
    /// step envs, then every published variable (already `"KEY=VALUE"`).
    pub fn all_envs(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (k, v) in &self.dag_env {
            out.push(format!("{}={}", k, v));
        }
        for entry in self.step_env.iter() {
            out.push(format!("{}={}", entry.key(), entry.value()));
        }
        for entry in self.variables.iter() {
            out.push(entry.value().clone());
        }
        out
    }

    /// Publish a step's declared output (`output: NAME`, leading `$`
    /// stripped by the caller) into the variables map. `force=false` skips
    /// keys already present; `force=true` overwrites.
    pub fn publish_output(&self, name: &str, value: &str, force: bool) {
        if !force && self.variables.contains_key(name) {
            return;
        }
        self.variables
            .insert(name.to_string(), format!("{}={}", name, value));
    }

    /// Record a completed step's stdout/stderr/exit code for later
    /// `${stepID.field}` lookups by downstream steps.
    pub fn record_step_info(&self, step_id: &str, info: StepInfo) {
        self.step_info.insert(step_id.to_string(), info);
    }
}

/// Resolve a step's working directory per §4.2. `step_dir` wins; else the
/// DAG working dir; else the process cwd. `~` and `$HOME` are expanded,
/// relative paths are joined against the current directory.
pub fn resolve_working_dir(step_dir: Option<&str>, dag_dir: Option<&str>) -> EnvironmentResult<PathBuf> {
    let raw = step_dir.or(dag_dir);
    let path = match raw {
        Some(raw) => {
            let expanded = shellexpand::full(raw)
                .map_err(|e| EnvironmentError::DirNotExist(e.to_string()))?
                .into_owned();
            let p = PathBuf::from(expanded);
            if p.is_absolute() {
                p
            } else {
                std::env::current_dir()
                    .map_err(EnvironmentError::Io)?
                    .join(p)
            }
        }
        None => std::env::current_dir().map_err(EnvironmentError::Io)?,
    };
    Ok(path)
}

/// Assert the resolved directory actually exists, as required at `Run` time.
pub fn assert_dir_exists(dir: &Path) -> EnvironmentResult<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(EnvironmentError::DirNotExist(dir.display().to_string()))
    }
}
