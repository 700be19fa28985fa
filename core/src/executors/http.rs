//! HTTP executor: the step command is the HTTP method, `args[0]` is the URL.
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{ExecutorError, ExecutorResult, RegistryResult};
use crate::model::{NodeStatus, Step};
use crate::registry::{Executor, RunContext, Signal};

use super::command::decode_config;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub query: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub json: bool,
    #[serde(rename = "skipTLSVerify", default)]
    pub skip_tls_verify: bool,
}

pub struct HttpExecutor {
    method: String,
    url: String,
    config: HttpConfig,
    stdout: Option<Box<dyn Write + Send>>,
    exit_code: Option<i32>,
}

impl HttpExecutor {
    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let config = step
            .executor
            .as_ref()
            .map(|e| {
                decode_config::<HttpConfig>(
                    "http",
                    e,
                )
            })
            .transpose()?
            .unwrap_or_default();
        let method = step.command.clone().unwrap_or_else(|| "GET".to_string());
        let url = step.args.first().cloned().unwrap_or_default();
        Ok(Box::new(Self {
            method,
            url,
            config,
            stdout: None,
            exit_code: None,
        }))
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, _writer: Box<dyn Write + Send>) {}

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let url = ctx.env.eval_string(&self.url, &Default::default())?;
        let body = match &self.config.body {
            Some(b) => Some(ctx.env.eval_string(b, &Default::default())?),
            None => None,
        };

        let client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.config.skip_tls_verify)
            .timeout(Duration::from_secs(self.config.timeout.unwrap_or(30)));
        let client = client_builder.build()?;

        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut req = client.request(method, &url).query(&self.config.query);
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), ctx.env.eval_string(v, &Default::default())?);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = tokio::select! {
            r = req.send() => r?,
            _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
        };

        let status = resp.status();
        self.exit_code = Some(if status.is_success() { 0 } else { 1 });

        let headers: std::collections::HashMap<String, Vec<String>> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), vec![String::from_utf8_lossy(v.as_bytes()).into_owned()]))
            .fold(std::collections::HashMap::new(), |mut acc, (k, v)| {
                acc.entry(k).or_insert_with(Vec::new).extend(v);
                acc
            });
        let status_code = status.as_u16();
        let body_text = resp.text().await?;

        if let Some(out) = self.stdout.as_mut() {
            if self.config.json {
                let payload = serde_json::json!({
                    "status_code": status_code,
                    "headers": headers,
                    "body": body_text,
                });
                let _ = writeln!(out, "{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            } else {
                if !self.config.silent {
                    let _ = writeln!(out, "HTTP {}", status_code);
                    for (k, vs) in &headers {
                        for v in vs {
                            let _ = writeln!(out, "{}: {}", k, v);
                        }
                    }
                }
                let _ = write!(out, "{}", body_text);
            }
        }

        if !status.is_success() {
            return Err(ExecutorError::HttpStatus {
                status: status_code,
                body: body_text,
            });
        }
        Ok(())
    }

    async fn kill(&mut self, _sig: Signal) -> ExecutorResult<()> {
        // in-flight requests are cancelled via ctx.cancel; nothing else to do here
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn node_status(&self) -> NodeStatus {
        match self.exit_code {
            Some(0) | None => NodeStatus::Success,
            Some(_) => NodeStatus::Error,
        }
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
    fn config_decodes_from_executor_map() {
        let mut map = std::collections::HashMap::new();
        map.insert("timeout".to_string(), serde_json::json!(5));
        map.insert("json".to_string(), serde_json::json!(true));
        let step = Step {
            name: "s".into(),
            command: Some("GET".into()),
            args: vec!["https://example.com".into()],
            executor: Some(crate::model::ExecutorConfig {
                executor_type: "http".into(),
                config: map,
            }),
            ..Default::default()
        };
        let exec = HttpExecutor::from_step(&step).unwrap();
        // constructed successfully with decoded config; behavior verified via run() in integration tests
        drop(exec);
    }

    #[tokio::test]
    async fn defaults_to_get_and_first_arg_as_url() {
        let step = Step {
            name: "s".into(),
            args: vec!["not-a-real-host.invalid".into()],
            ..Default::default()
        };
        let mut exec = HttpExecutor::from_step(&step).unwrap();
        let ctx = test_ctx();
        // unreachable host: exercises the error path without a network dependency succeeding
        let _ = exec.run(&ctx).await;
    }
}
