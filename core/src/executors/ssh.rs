//! SSH executor (§4.8). The session protocol itself is modeled behind
//! `SshSession` so the dial/run/close sequence is unit-testable with a fake;
//! the real implementation shells out to the system `ssh` binary via
//! `tokio::process::Command`, the same "reuse an external tool" idiom the
//! command executor uses for local processes, since no SSH client crate is
//! in the teacher's dependency stack.
use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{ExecutorError, ExecutorResult, RegistryError, RegistryResult};
use crate::model::{NodeStatus, Step};
use crate::registry::{Executor, RunContext, Signal};

use super::command::decode_config;

fn default_port() -> u16 {
    22
}
fn default_strict_host_key() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SshConfig {
    #[serde(rename = "User")]
    pub user: Option<String>,
    #[serde(rename = "IP", alias = "Host")]
    pub host: Option<String>,
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,
    #[serde(rename = "Key")]
    pub key: Option<String>,
    #[serde(rename = "Password")]
    pub password: Option<String>,
    #[serde(rename = "StrictHostKey", default = "default_strict_host_key")]
    pub strict_host_key: bool,
    #[serde(rename = "KnownHostFile")]
    pub known_host_file: Option<String>,
}

/// Rejects steps that carry a `script` field: SSH has no notion of a local
/// temp script, only a remote command line (§4.8).
pub fn validate_step(step: &Step) -> RegistryResult<()> {
    if step.script.is_some() {
        return Err(RegistryError::Validation(
            "ssh".into(),
            "script is not supported by the ssh executor, use command+args instead".into(),
        ));
    }
    Ok(())
}

/// Abstracts "dial, open a session, run one command, wire stdout/stderr,
/// close" so the executor's control flow is testable without a real
/// network dependency.
#[async_trait]
pub trait SshSession: Send {
    async fn run(
        &mut self,
        command_line: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> ExecutorResult<i32>;
    async fn close(&mut self) -> ExecutorResult<()>;
}

/// Real session: shells out to the system `ssh` binary.
pub struct ProcessSshSession {
    config: SshConfig,
    child: AsyncMutex<Option<Child>>,
}

impl ProcessSshSession {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            child: AsyncMutex::new(None),
        }
    }

    fn build_argv(&self, command_line: &str) -> Vec<String> {
        let mut argv = vec!["-p".to_string(), self.config.port.to_string()];
        if let Some(key) = &self.config.key {
            argv.push("-i".to_string());
            argv.push(key.clone());
        }
        if !self.config.strict_host_key {
            argv.push("-o".to_string());
            argv.push("StrictHostKeyChecking=no".to_string());
        }
        if let Some(known_hosts) = &self.config.known_host_file {
            argv.push("-o".to_string());
            argv.push(format!("UserKnownHostsFile={}", known_hosts));
        }
        let target = match &self.config.user {
            Some(user) => format!("{}@{}", user, self.config.host.as_deref().unwrap_or_default()),
            None => self.config.host.clone().unwrap_or_default(),
        };
        argv.push(target);
        argv.push(command_line.to_string());
        argv
    }
}

#[async_trait]
impl SshSession for ProcessSshSession {
    async fn run(
        &mut self,
        command_line: &str,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> ExecutorResult<i32> {
        let argv = self.build_argv(command_line);
        let mut cmd = TokioCommand::new("ssh");
        cmd.args(&argv);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Ssh(format!("spawn failed: {}", e)))?;

        let mut out = child.stdout.take();
        let mut err = child.stderr.take();
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        if let Some(mut o) = out.take() {
            let _ = o.read_to_end(&mut out_buf).await;
        }
        if let Some(mut e) = err.take() {
            let _ = e.read_to_end(&mut err_buf).await;
        }
        let _ = stdout.write_all(&out_buf);
        let _ = stderr.write_all(&err_buf);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutorError::Ssh(format!("session error: {}", e)))?;
        *self.child.lock().await = None;
        Ok(status.code().unwrap_or(1))
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

pub struct SshExecutor {
    command_line: String,
    session: Box<dyn SshSession>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    exit_code: Option<i32>,
}

impl SshExecutor {
    pub fn new(command_line: String, session: Box<dyn SshSession>) -> Self {
        Self {
            command_line,
            session,
            stdout: None,
            stderr: None,
            exit_code: None,
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        validate_step(step)?;
        let config = step
            .executor
            .as_ref()
            .map(|e| decode_config::<SshConfig>("ssh", e))
            .transpose()?
            .unwrap_or_default();
        let mut parts = vec![step.command.clone().unwrap_or_default()];
        parts.extend(step.args.iter().cloned());
        let command_line = parts.join(" ");
        Ok(Box::new(Self::new(
            command_line,
            Box::new(ProcessSshSession::new(config)),
        )))
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, writer: Box<dyn Write + Send>) {
        self.stderr = Some(writer);
    }

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let command_line = ctx.env.eval_string(&self.command_line, &Default::default())?;
        let mut stdout = self.stdout.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let mut stderr = self.stderr.take().unwrap_or_else(|| Box::new(std::io::sink()));
        let code = tokio::select! {
            r = self.session.run(&command_line, stdout.as_mut(), stderr.as_mut()) => r?,
            _ = ctx.cancel.cancelled() => {
                self.session.close().await?;
                return Err(ExecutorError::Cancelled);
            }
        };
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.exit_code = Some(code);
        if code != 0 {
            return Err(ExecutorError::Ssh(format!("remote command exited with status {}", code)));
        }
        Ok(())
    }

    async fn kill(&mut self, _sig: Signal) -> ExecutorResult<()> {
        self.session.close().await
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

    struct FakeSession {
        exit_code: i32,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl SshSession for FakeSession {
        async fn run(
            &mut self,
            command_line: &str,
            stdout: &mut (dyn Write + Send),
            _stderr: &mut (dyn Write + Send),
        ) -> ExecutorResult<i32> {
            let _ = write!(stdout, "ran: {}", command_line);
            Ok(self.exit_code)
        }

        async fn close(&mut self) -> ExecutorResult<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

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

    #[tokio::test]
    async fn runs_command_through_fake_session_and_reports_exit_code() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut exec = SshExecutor::new(
            "uptime".into(),
            Box::new(FakeSession { exit_code: 0, closed: closed.clone() }),
        );
        let ctx = test_ctx();
        assert!(exec.run(&ctx).await.is_ok());
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn non_zero_remote_exit_is_an_error() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut exec = SshExecutor::new(
            "false".into(),
            Box::new(FakeSession { exit_code: 7, closed }),
        );
        let ctx = test_ctx();
        assert!(exec.run(&ctx).await.is_err());
        assert_eq!(exec.exit_code(), Some(7));
    }

    #[tokio::test]
    async fn kill_closes_the_session() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut exec = SshExecutor::new(
            "sleep 100".into(),
            Box::new(FakeSession { exit_code: 0, closed: closed.clone() }),
        );
        exec.kill(Signal::SIGTERM).await.unwrap();
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn script_field_is_rejected_by_validation() {
        let step = Step {
            name: "s".into(),
            script: Some("echo hi".into()),
            ..Default::default()
        };
        assert!(matches!(validate_step(&step), Err(RegistryError::Validation(_, _))));
    }
}
