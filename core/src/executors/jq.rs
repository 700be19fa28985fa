//! The `jq` executor: parses the step's script as a JSON literal and
//! queries it with a small embedded subset of jq syntax (`.field`,
//! `.[n]`, `.[]`, pipes `|`, identity `.`). The teacher stack has no jq
//! binding, and shelling out to a system `jq` binary would make every run
//! depend on what's installed on the host, so this evaluates
//! `serde_json::Value` paths directly, keeping the executor hermetic.
use std::io::Write;

use async_trait::async_trait;
use thiserror::Error;

use crate::errors::{ExecutorError, ExecutorResult, RegistryResult};
use crate::model::{NodeStatus, Step};
use crate::registry::{Executor, RunContext, Signal};

#[derive(Debug, Error)]
pub enum JqError {
    #[error("invalid json input: {0}")]
    InvalidInput(String),
    #[error("query error: {0}")]
    Query(String),
}

/// One parsed pipeline stage, applied left-to-right.
#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Identity,
    Field(String),
    Index(usize),
    Iterate,
}

fn parse_query(query: &str) -> Result<Vec<Vec<Stage>>, JqError> {
    query
        .split('|')
        .map(|segment| parse_segment(segment.trim()))
        .collect()
}

fn parse_segment(segment: &str) -> Result<Vec<Stage>, JqError> {
    if segment.is_empty() || segment == "." {
        return Ok(vec![Stage::Identity]);
    }
    if !segment.starts_with('.') {
        return Err(JqError::Query(format!("expected segment to start with '.': {segment}")));
    }
    let mut stages = Vec::new();
    let mut rest = &segment[1..];
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after
                .find(']')
                .ok_or_else(|| JqError::Query(format!("unterminated '[' in: {segment}")))?;
            let inner = &after[..close];
            if inner.is_empty() {
                stages.push(Stage::Iterate);
            } else {
                let idx: usize = inner
                    .parse()
                    .map_err(|_| JqError::Query(format!("invalid index '{inner}' in: {segment}")))?;
                stages.push(Stage::Index(idx));
            }
            rest = &after[close + 1..];
        } else {
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            let (field, remainder) = rest.split_at(end);
            stages.push(Stage::Field(field.to_string()));
            rest = remainder;
        }
        rest = rest.strip_prefix('.').unwrap_or(rest);
    }
    Ok(stages)
}

fn apply_stage(value: &serde_json::Value, stage: &Stage) -> Result<Vec<serde_json::Value>, JqError> {
    Ok(match stage {
        Stage::Identity => vec![value.clone()],
        Stage::Field(name) => match value {
            serde_json::Value::Object(map) => {
                vec![map.get(name).cloned().unwrap_or(serde_json::Value::Null)]
            }
            serde_json::Value::Null => vec![serde_json::Value::Null],
            other => return Err(JqError::Query(format!("cannot index {other} with \"{name}\""))),
        },
        Stage::Index(idx) => match value {
            serde_json::Value::Array(arr) => {
                vec![arr.get(*idx).cloned().unwrap_or(serde_json::Value::Null)]
            }
            other => return Err(JqError::Query(format!("cannot index {other} with {idx}"))),
        },
        Stage::Iterate => match value {
            serde_json::Value::Array(arr) => arr.clone(),
            serde_json::Value::Object(map) => map.values().cloned().collect(),
            other => return Err(JqError::Query(format!("cannot iterate over {other}"))),
        },
    })
}

/// Evaluate `query` against `input`, producing the stream of values the
/// pipeline yields. An error on one value does not abort the whole query;
/// it's surfaced in the returned `Vec<Result<..>>` so the caller can print
/// it to stderr and continue, matching the spec's "query errors continue
/// the iteration" rule.
fn run_query(input: &serde_json::Value, query: &str) -> Result<Vec<Result<serde_json::Value, JqError>>, JqError> {
    let pipeline = parse_query(query)?;
    let mut current: Vec<Result<serde_json::Value, JqError>> = vec![Ok(input.clone())];
    for segment in pipeline {
        let mut next = Vec::new();
        for item in current {
            match item {
                Err(e) => next.push(Err(e)),
                Ok(value) => {
                    let mut values = vec![value];
                    for stage in &segment {
                        let mut stage_out = Vec::new();
                        for v in &values {
                            match apply_stage(v, stage) {
                                Ok(vs) => stage_out.extend(vs),
                                Err(e) => {
                                    next.push(Err(e));
                                    stage_out.clear();
                                    break;
                                }
                            }
                        }
                        values = stage_out;
                    }
                    next.extend(values.into_iter().map(Ok));
                }
            }
        }
        current = next;
    }
    Ok(current)
}

#[derive(Debug, Clone, Default)]
pub struct JqConfig {
    pub raw: bool,
}

pub struct JqExecutor {
    input: Option<serde_json::Value>,
    query: String,
    config: JqConfig,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    exit_code: Option<i32>,
}

impl JqExecutor {
    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let input = match &step.script {
            Some(body) => serde_json::from_str(body).ok(),
            None => None,
        };
        let mut query_parts = Vec::new();
        if let Some(cmd) = &step.command {
            query_parts.push(cmd.clone());
        }
        query_parts.extend(step.args.iter().cloned());
        let query = if query_parts.is_empty() {
            ".".to_string()
        } else {
            query_parts.join(" ")
        };
        let raw = step
            .executor
            .as_ref()
            .and_then(|e| e.config.get("raw"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Box::new(Self {
            input,
            query,
            config: JqConfig { raw },
            stdout: None,
            stderr: None,
            exit_code: None,
        }))
    }
}

fn render(value: &serde_json::Value, raw: bool, out: &mut dyn Write) -> std::io::Result<()> {
    if raw {
        match value {
            serde_json::Value::String(s) => writeln!(out, "{}", s),
            other => {
                let s = serde_json::to_string(other).unwrap_or_default();
                writeln!(out, "{}", s)
            }
        }
    } else {
        let s = serde_json::to_string_pretty(value).unwrap_or_default();
        writeln!(out, "{}", s)
    }
}

#[async_trait]
impl Executor for JqExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, writer: Box<dyn Write + Send>) {
        self.stderr = Some(writer);
    }

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let query = ctx.env.eval_string(&self.query, &Default::default())?;
        let input = self
            .input
            .clone()
            .ok_or_else(|| ExecutorError::Jq("script did not contain valid JSON input".to_string()))?;

        let results = run_query(&input, &query).map_err(|e| ExecutorError::Jq(e.to_string()))?;
        let mut any_error = false;
        for result in results {
            match result {
                Ok(value) => {
                    if let Some(out) = self.stdout.as_mut() {
                        let _ = render(&value, self.config.raw, out);
                    }
                }
                Err(e) => {
                    any_error = true;
                    if let Some(err) = self.stderr.as_mut() {
                        let _ = writeln!(err, "jq: error: {}", e);
                    }
                }
            }
        }
        self.exit_code = Some(if any_error { 1 } else { 0 });
        Ok(())
    }

    async fn kill(&mut self, _sig: Signal) -> ExecutorResult<()> {
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn node_status(&self) -> NodeStatus {
        NodeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{DagContext, Environment};
    use crate::model::Dag;
    use dashmap::DashMap;
    use std::sync::Arc;

    fn test_ctx() -> RunContext {
        let dag = Dag::new("d");
        let step = Step {
            name: "s".into(),
            ..Default::default()
        };
        let env = Environment::new(
            DagContext::default(),
            &dag,
            &step,
            Arc::new(DashMap::new()),
            Arc::new(DashMap::new()),
        )
        .unwrap();
        RunContext::new(env)
    }

    #[test]
    fn identity_returns_the_whole_value() {
        let v = serde_json::json!({"a": 1});
        let out = run_query(&v, ".").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), &v);
    }

    #[test]
    fn field_access() {
        let v = serde_json::json!({"a": {"b": 42}});
        let out = run_query(&v, ".a.b").unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &serde_json::json!(42));
    }

    #[test]
    fn array_iteration_yields_each_element() {
        let v = serde_json::json!([1, 2, 3]);
        let out = run_query(&v, ".[]").unwrap();
        let values: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)]);
    }

    #[test]
    fn index_access() {
        let v = serde_json::json!(["a", "b", "c"]);
        let out = run_query(&v, ".[1]").unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &serde_json::json!("b"));
    }

    #[test]
    fn pipe_combines_iterate_and_field() {
        let v = serde_json::json!([{"x": 1}, {"x": 2}]);
        let out = run_query(&v, ".[] | .x").unwrap();
        let values: Vec<_> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn query_error_on_one_branch_does_not_abort_others() {
        let v = serde_json::json!([1, {"x": 2}]);
        let out = run_query(&v, ".[] | .x").unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1].as_ref().unwrap(), &serde_json::json!(2));
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn raw_mode_emits_strings_without_quotes() {
        let step = Step {
            name: "s".into(),
            script: Some("{\"name\": \"hi\"}".into()),
            command: Some(".name".into()),
            executor: Some(crate::model::ExecutorConfig {
                executor_type: "jq".into(),
                config: [("raw".to_string(), serde_json::json!(true))].into_iter().collect(),
            }),
            ..Default::default()
        };
        let mut exec = JqExecutor::from_step(&step).unwrap();
        let buf = SharedBuf::default();
        exec.attach_stdout(Box::new(buf.clone()));
        exec.run(&test_ctx()).await.unwrap();
        let captured = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(captured.trim(), "hi");
    }
}
