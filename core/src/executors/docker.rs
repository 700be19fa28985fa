//! Docker executor (§4.9): attach to an existing container, or create a new
//! one. The teacher stack has no Docker Engine API client crate, so this
//! shells out to the `docker` CLI via `tokio::process::Command`, the same
//! idiom the teacher already uses for `git` (`flow_git.rs`) and other
//! external tools (`tools/executors.rs`). The CLI invocation itself is
//! behind `DockerBackend` so the create/start/wait/remove sequencing is
//! unit-testable without a Docker daemon.
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{ExecutorError, ExecutorResult, RegistryError, RegistryResult};
use crate::model::{NodeStatus, Step};
use crate::registry::{Executor, RunContext, Signal};

use super::command::decode_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    Missing,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DockerConfig {
    #[serde(rename = "containerName", default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(rename = "autoRemove", default)]
    pub auto_remove: bool,
    #[serde(default)]
    pub pull: PullPolicy,
}

/// Abstracts the `docker` CLI invocations so the executor's sequencing
/// (inspect -> pull? -> create -> start -> wait -> remove) is testable
/// without a real daemon.
#[async_trait]
pub trait DockerBackend: Send + Sync {
    /// Run a `docker` subcommand to completion, capturing output.
    async fn invoke(&self, args: &[String]) -> ExecutorResult<std::process::Output>;
    /// Run a `docker` subcommand streaming stdout/stderr to the given
    /// sinks as it executes (used for `exec` and `start -a`).
    async fn invoke_streaming(
        &self,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> ExecutorResult<i32>;
}

pub struct ProcessDockerBackend;

#[async_trait]
impl DockerBackend for ProcessDockerBackend {
    async fn invoke(&self, args: &[String]) -> ExecutorResult<std::process::Output> {
        TokioCommand::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| ExecutorError::Container(format!("docker {}: {}", args.join(" "), e)))
    }

    async fn invoke_streaming(
        &self,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> ExecutorResult<i32> {
        let mut child = TokioCommand::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Container(format!("spawn failed: {}", e)))?;
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        if let Some(mut o) = child.stdout.take() {
            let _ = o.read_to_end(&mut out_buf).await;
        }
        if let Some(mut e) = child.stderr.take() {
            let _ = e.read_to_end(&mut err_buf).await;
        }
        let _ = stdout.write_all(&out_buf);
        let _ = stderr.write_all(&err_buf);
        let status = child
            .wait()
            .await
            .map_err(|e| ExecutorError::Container(format!("wait failed: {}", e)))?;
        Ok(status.code().unwrap_or(1))
    }
}

fn ok_output(out: &std::process::Output) -> ExecutorResult<()> {
    if out.status.success() {
        Ok(())
    } else {
        Err(ExecutorError::Container(
            String::from_utf8_lossy(&out.stderr).into_owned(),
        ))
    }
}

pub struct DockerExecutor {
    config: DockerConfig,
    command_line: Vec<String>,
    backend: Arc<dyn DockerBackend>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    exit_code: Option<i32>,
    /// Container id created in "new container" mode; guards idempotent removal.
    created_id: AsyncMutex<Option<String>>,
    removed: std::sync::atomic::AtomicBool,
}

impl DockerExecutor {
    pub fn new(config: DockerConfig, command_line: Vec<String>, backend: Arc<dyn DockerBackend>) -> Self {
        Self {
            config,
            command_line,
            backend,
            stdout: None,
            stderr: None,
            exit_code: None,
            created_id: AsyncMutex::new(None),
            removed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let config = step
            .executor
            .as_ref()
            .map(|e| decode_config::<DockerConfig>("docker", e))
            .transpose()?
            .unwrap_or_default();
        if config.container_name.is_none() && config.image.is_none() {
            return Err(RegistryError::ConfigDecode(
                "docker".into(),
                "must set either containerName or image".into(),
            ));
        }
        let mut command_line = vec![step.command.clone().unwrap_or_default()];
        command_line.extend(step.args.iter().cloned());
        Ok(Box::new(Self::new(
            config,
            command_line,
            Arc::new(ProcessDockerBackend),
        )))
    }

    async fn ensure_removed(&self) {
        if self.removed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.created_id.lock().await.take() {
            let _ = self.backend.invoke(&["rm".into(), "-f".into(), id]).await;
        }
    }

    async fn run_attach(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let name = self.config.container_name.clone().unwrap();
        let name = ctx.env.eval_string(&name, &Default::default())?;
        let out = self
            .backend
            .invoke(&[
                "inspect".into(),
                "--format".into(),
                "{{.State.Running}}".into(),
                name.clone(),
            ])
            .await?;
        ok_output(&out)?;
        if String::from_utf8_lossy(&out.stdout).trim() != "true" {
            return Err(ExecutorError::Container(format!("container {} is not running", name)));
        }
        let mut argv = vec!["exec".into(), name];
        argv.extend(self.command_line.clone());
        let mut stdout = self.stdout.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let mut stderr = self.stderr.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let code = self
            .backend
            .invoke_streaming(&argv, stdout.as_mut(), stderr.as_mut())
            .await?;
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.exit_code = Some(code);
        if code != 0 {
            return Err(ExecutorError::Container(format!("exec exited with status {}", code)));
        }
        Ok(())
    }

    async fn run_create(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let image = self.config.image.clone().unwrap();
        let image = ctx.env.eval_string(&image, &Default::default())?;

        let should_pull = match self.config.pull {
            PullPolicy::Always => true,
            PullPolicy::Never => false,
            PullPolicy::Missing => {
                let mut inspect_args = vec!["image".into(), "inspect".into(), image.clone()];
                if let Some(platform) = &self.config.platform {
                    inspect_args.push("--platform".into());
                    inspect_args.push(platform.clone());
                }
                let out = self.backend.invoke(&inspect_args).await?;
                !out.status.success()
            }
        };
        if should_pull {
            let mut pull_args = vec!["pull".into(), image.clone()];
            if let Some(platform) = &self.config.platform {
                pull_args.push("--platform".into());
                pull_args.push(platform.clone());
            }
            ok_output(&self.backend.invoke(&pull_args).await?)?;
        }

        let mut create_args = vec!["create".into()];
        if let Some(platform) = &self.config.platform {
            create_args.push("--platform".into());
            create_args.push(platform.clone());
        }
        create_args.push(image);
        create_args.extend(self.command_line.clone());
        let out = self.backend.invoke(&create_args).await?;
        ok_output(&out)?;
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        *self.created_id.lock().await = Some(id.clone());

        let mut stdout = self.stdout.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let mut stderr = self.stderr.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let run_result = self
            .backend
            .invoke_streaming(&["start".into(), "-a".into(), id.clone()], stdout.as_mut(), stderr.as_mut())
            .await;
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);

        let code = match run_result {
            Ok(code) => code,
            Err(e) => {
                if self.config.auto_remove {
                    self.ensure_removed().await;
                }
                return Err(e);
            }
        };
        self.exit_code = Some(code);
        if self.config.auto_remove {
            self.ensure_removed().await;
        }
        if code != 0 {
            return Err(ExecutorError::Container(format!("container exited with status {}", code)));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, writer: Box<dyn Write + Send>) {
        self.stderr = Some(writer);
    }

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let result = tokio::select! {
            r = async {
                if self.config.container_name.is_some() {
                    self.run_attach(ctx).await
                } else {
                    self.run_create(ctx).await
                }
            } => r,
            _ = ctx.cancel.cancelled() => {
                self.ensure_removed().await;
                Err(ExecutorError::Cancelled)
            }
        };
        // guaranteed removal on every exit path, including non-auto-remove
        // containers created by this run (idempotent: a no-op if already
        // removed above).
        if self.config.container_name.is_none() {
            self.ensure_removed().await;
        }
        result
    }

    async fn kill(&mut self, _sig: Signal) -> ExecutorResult<()> {
        self.ensure_removed().await;
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        invocations: AsyncMutex<Vec<Vec<String>>>,
        running: bool,
        image_exists: bool,
        exit_code: i32,
        rm_count: AtomicUsize,
    }

    #[async_trait]
    impl DockerBackend for FakeBackend {
        async fn invoke(&self, args: &[String]) -> ExecutorResult<std::process::Output> {
            self.invocations.lock().await.push(args.to_vec());
            if args.first().map(String::as_str) == Some("rm") {
                self.rm_count.fetch_add(1, Ordering::SeqCst);
            }
            let (code, stdout) = if args.first().map(String::as_str) == Some("inspect")
                && args.contains(&"{{.State.Running}}".to_string())
            {
                (0, if self.running { "true" } else { "false" })
            } else if args.first().map(String::as_str) == Some("image") {
                (if self.image_exists { 0 } else { 1 }, "")
            } else if args.first().map(String::as_str) == Some("create") {
                (0, "container123")
            } else {
                (0, "")
            };
            Ok(std::process::Output {
                status: fake_exit_status(code),
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
            })
        }

        async fn invoke_streaming(
            &self,
            args: &[String],
            _stdout: &mut (dyn Write + Send),
            _stderr: &mut (dyn Write + Send),
        ) -> ExecutorResult<i32> {
            self.invocations.lock().await.push(args.to_vec());
            Ok(self.exit_code)
        }
    }

    #[cfg(unix)]
    fn fake_exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    fn test_ctx() -> RunContext {
        let dag = Dag::new("d");
        let step = Step { name: "s".into(), ..Default::default() };
        let env = Environment::new(
            DagContext::default(),
            &dag,
            &step,
            std::sync::Arc::new(DashMap::new()),
            std::sync::Arc::new(DashMap::new()),
        )
        .unwrap();
        RunContext::new(env)
    }

    #[tokio::test]
    async fn attach_mode_fails_when_container_not_running() {
        let backend = Arc::new(FakeBackend {
            invocations: AsyncMutex::new(Vec::new()),
            running: false,
            image_exists: true,
            exit_code: 0,
            rm_count: AtomicUsize::new(0),
        });
        let mut exec = DockerExecutor::new(
            DockerConfig { container_name: Some("web".into()), ..Default::default() },
            vec!["echo".into(), "hi".into()],
            backend,
        );
        assert!(exec.run(&test_ctx()).await.is_err());
    }

    #[tokio::test]
    async fn attach_mode_execs_into_running_container() {
        let backend = Arc::new(FakeBackend {
            invocations: AsyncMutex::new(Vec::new()),
            running: true,
            image_exists: true,
            exit_code: 0,
            rm_count: AtomicUsize::new(0),
        });
        let mut exec = DockerExecutor::new(
            DockerConfig { container_name: Some("web".into()), ..Default::default() },
            vec!["echo".into(), "hi".into()],
            backend,
        );
        assert!(exec.run(&test_ctx()).await.is_ok());
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn create_mode_skips_pull_when_image_already_present() {
        let backend = Arc::new(FakeBackend {
            invocations: AsyncMutex::new(Vec::new()),
            running: false,
            image_exists: true,
            exit_code: 0,
            rm_count: AtomicUsize::new(0),
        });
        let mut exec = DockerExecutor::new(
            DockerConfig { image: Some("alpine".into()), ..Default::default() },
            vec!["echo".into(), "hi".into()],
            backend.clone(),
        );
        assert!(exec.run(&test_ctx()).await.is_ok());
        let invocations = backend.invocations.lock().await;
        assert!(!invocations.iter().any(|a| a.first().map(String::as_str) == Some("pull")));
    }

    #[tokio::test]
    async fn create_mode_pulls_when_image_missing() {
        let backend = Arc::new(FakeBackend {
            invocations: AsyncMutex::new(Vec::new()),
            running: false,
            image_exists: false,
            exit_code: 0,
            rm_count: AtomicUsize::new(0),
        });
        let mut exec = DockerExecutor::new(
            DockerConfig { image: Some("alpine".into()), ..Default::default() },
            vec!["echo".into(), "hi".into()],
            backend.clone(),
        );
        assert!(exec.run(&test_ctx()).await.is_ok());
        let invocations = backend.invocations.lock().await;
        assert!(invocations.iter().any(|a| a.first().map(String::as_str) == Some("pull")));
    }

    #[tokio::test]
    async fn created_container_is_removed_exactly_once() {
        let backend = Arc::new(FakeBackend {
            invocations: AsyncMutex::new(Vec::new()),
            running: false,
            image_exists: true,
            exit_code: 1,
            rm_count: AtomicUsize::new(0),
        });
        let mut exec = DockerExecutor::new(
            DockerConfig { image: Some("alpine".into()), ..Default::default() },
            vec!["false".into()],
            backend.clone(),
        );
        assert!(exec.run(&test_ctx()).await.is_err());
        exec.kill(Signal::SIGTERM).await.unwrap();
        assert_eq!(backend.rm_count.load(Ordering::SeqCst), 1);
    }
}
