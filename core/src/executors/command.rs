//! Runs one local process per step: direct exec, through a shell, or via a
//! materialized script file. Owns at most one OS child process.
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::environment::{assert_dir_exists, StepInfo};
use crate::errors::{ExecutorError, ExecutorResult, RegistryError, RegistryResult};
use crate::model::{ExecutorConfig, NodeStatus, Step};
use crate::registry::{Executor, RunContext, Signal};
use crate::tail_writer::TailWriter;

use super::shell_builder::{build_argv, errexit_capable, Payload};

const SCRIPT_FILE_PREFIX: &str = "descartes_script-";

/// Static configuration for one step, decoded from the `Step` at
/// registration time; nothing here depends on the resolved environment.
#[derive(Debug, Clone, Default)]
pub struct CommandConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub script: Option<String>,
    pub shell: Option<String>,
    pub shell_command_args: Option<String>,
    pub shell_packages: Vec<String>,
    pub user_specified_shell: bool,
}

impl CommandConfig {
    pub fn from_step(step: &Step) -> Self {
        let user_specified_shell = step.shell.is_some();
        Self {
            command: step.command.clone(),
            args: step.args.clone(),
            script: step.script.clone(),
            shell: step.shell.clone(),
            shell_command_args: step.command.clone(),
            shell_packages: step.shell_packages.clone(),
            user_specified_shell,
        }
    }
}

pub struct CommandExecutor {
    config: CommandConfig,
    stdout: Option<Box<dyn Write + Send>>,
    stderr_tail: Option<TailWriter>,
    child: Arc<AsyncMutex<Option<Child>>>,
    exit_code: Arc<AsyncMutex<Option<i32>>>,
    script_file: Arc<AsyncMutex<Option<PathBuf>>>,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            config,
            stdout: None,
            stderr_tail: None,
            child: Arc::new(AsyncMutex::new(None)),
            exit_code: Arc::new(AsyncMutex::new(None)),
            script_file: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        Ok(Box::new(Self::new(CommandConfig::from_step(step))))
    }

    async fn materialize_script(&self, dir: &std::path::Path, body: &str) -> ExecutorResult<PathBuf> {
        let file_name = format!("{}{}", SCRIPT_FILE_PREFIX, uuid::Uuid::new_v4());
        let path = dir.join(file_name);
        tokio::fs::write(&path, body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o750);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        Ok(path)
    }

    fn build_effective_argv(&self, script_file: Option<&std::path::Path>) -> ExecutorResult<Vec<String>> {
        let shell = self.config.shell.clone();
        let packages = &self.config.shell_packages;
        let has_args = !self.config.args.is_empty();

        match (&self.config.command, script_file) {
            // direct form: Command arg1 .. argN [scriptFile] — only for a
            // structured command+args pair, or a bare single-token command
            // that needs no shell to interpret it.
            (Some(command), sf) if shell.is_none() && (has_args || !needs_shell(command)) => {
                let mut argv = vec![command.clone()];
                argv.extend(self.config.args.iter().cloned());
                if let Some(sf) = sf {
                    argv.push(sf.display().to_string());
                }
                Ok(argv)
            }
            _ => {
                let shell = shell.unwrap_or_else(|| "sh".to_string());
                let force_errexit = !self.config.user_specified_shell && errexit_capable(&shell);
                let payload = match (&self.config.command, script_file) {
                    // bare command string, no structured args, no script: let
                    // the shell interpret it verbatim.
                    (Some(command), None) if !has_args => Payload::ShellArgs {
                        shell_command_args: command,
                    },
                    (Some(command), sf) => Payload::CommandArgs {
                        command,
                        args: &self.config.args,
                        script_file: sf,
                    },
                    (None, _) => Payload::ShellArgs {
                        shell_command_args: self
                            .config
                            .shell_command_args
                            .as_deref()
                            .unwrap_or_default(),
                    },
                };
                Ok(build_argv(&shell, packages, &payload, force_errexit))
            }
        }
    }
}

/// Whether a bare command string needs shell interpretation rather than a
/// direct exec: anything beyond a single token (whitespace) or shell
/// metacharacters.
fn needs_shell(command: &str) -> bool {
    command.split_whitespace().count() > 1
        || command
            .chars()
            .any(|c| matches!(c, '|' | '&' | ';' | '<' | '>' | '$' | '`' | '*' | '?' | '~' | '('))
}

fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            return code;
        }
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
        1
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, writer: Box<dyn Write + Send>) {
        self.stderr_tail = Some(TailWriter::new(Some(writer), 0));
    }

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let result = self.run_inner(ctx).await;
        if let Some(path) = self.script_file.lock().await.take() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        result
    }

    async fn kill(&mut self, sig: Signal) -> ExecutorResult<()> {
        let guard = self.child.lock().await;
        let Some(child) = guard.as_ref() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), sig)
                .map_err(|e| ExecutorError::KillFailed(e.to_string()))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, sig);
            warn!("process-group kill not supported on this platform");
        }
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.try_lock().ok().and_then(|g| *g)
    }

    fn node_status(&self) -> NodeStatus {
        match self.exit_code() {
            Some(0) | None => NodeStatus::Success,
            Some(_) => NodeStatus::Error,
        }
    }
}

impl CommandExecutor {
    /// Deferred cleanup of any materialized script file happens in `run`,
    /// around this; everything below is the actual process lifecycle.
    async fn run_inner(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let dir = ctx.env.working_dir.clone();
        assert_dir_exists(&dir)?;

        let mut script_path = None;
        if let Some(body) = &self.config.script {
            let path = self.materialize_script(&dir, body).await?;
            *self.script_file.lock().await = Some(path.clone());
            script_path = Some(path);
        }

        let argv = self.build_effective_argv(script_path.as_deref())?;
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| ExecutorError::StartFailed("empty argv".to_string()))?;

        let mut cmd = TokioCommand::new(program);
        cmd.args(rest);
        cmd.current_dir(&dir);
        cmd.envs(ctx.env.all_envs().iter().filter_map(|kv| kv.split_once('=')));
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
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

        debug!(argv = ?argv, dir = %dir.display(), "spawning command");

        let spawn_result = cmd.spawn();
        let mut child = match spawn_result {
            Ok(c) => c,
            Err(e) => {
                *self.exit_code.lock().await = Some(1);
                let tail = self
                    .stderr_tail
                    .as_ref()
                    .map(|t| format!("\n--- stderr tail ---\n{}", t.tail_string()))
                    .unwrap_or_default();
                return Err(ExecutorError::StartFailed(format!("{}{}", e, tail)));
            }
        };

        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();

        // copy stdout/stderr concurrently while we wait
        let stdout_sink = self.stdout.take();
        let stderr_tail = self.stderr_tail.clone();
        let cancel = ctx.cancel.clone();

        let stdout_task = tokio::spawn(async move {
            let mut sink = stdout_sink;
            if let Some(mut out) = child_stdout.take() {
                let mut buf = [0u8; 8192];
                loop {
                    match out.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Some(sink) = sink.as_mut() {
                                let _ = sink.write_all(&buf[..n]);
                            }
                        }
                    }
                }
            }
            sink
        });

        let stderr_task = tokio::spawn(async move {
            if let Some(mut err) = child_stderr.take() {
                let mut tail = stderr_tail;
                let mut buf = [0u8; 8192];
                loop {
                    match err.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Some(tail) = tail.as_mut() {
                                let _ = tail.write_all(&buf[..n]);
                            }
                        }
                    }
                }
            }
        });

        *self.child.lock().await = Some(child);

        let wait_result = tokio::select! {
            status = async {
                let mut guard = self.child.lock().await;
                guard.as_mut().unwrap().wait().await
            } => status,
            _ = cancel.cancelled() => {
                let mut guard = self.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    let _ = child.kill().await;
                }
                return Err(ExecutorError::Cancelled);
            }
        };

        self.stdout = stdout_task.await.unwrap_or(None);
        let _ = stderr_task.await;

        match wait_result {
            Ok(status) => {
                let code = exit_code_from_status(status);
                *self.exit_code.lock().await = Some(code);
                if code != 0 {
                    let tail = self
                        .stderr_tail
                        .as_ref()
                        .map(|t| format!("\n--- stderr tail ---\n{}", t.tail_string()))
                        .unwrap_or_default();
                    return Err(ExecutorError::NonZeroExit { code, tail });
                }
                info!(code, "command completed");
                Ok(())
            }
            Err(e) => {
                *self.exit_code.lock().await = Some(1);
                let tail = self
                    .stderr_tail
                    .as_ref()
                    .map(|t| format!("\n--- stderr tail ---\n{}", t.tail_string()))
                    .unwrap_or_default();
                Err(ExecutorError::StartFailed(format!("wait failed: {}{}", e, tail)))
            }
        }
    }
}

/// Registry constructor: validates `dir`-at-run-time is the executor's own
/// job, so this constructor only decodes static step config.
pub fn constructor(step: &Step) -> RegistryResult<Box<dyn Executor>> {
    CommandExecutor::from_step(step)
}

/// Decode an `executor.config` map that the registry handed to a
/// specialized executor constructor, surfacing a typed decode error on
/// malformed input rather than silently defaulting.
pub fn decode_config<T: serde::de::DeserializeOwned>(
    executor_type: &str,
    config: &ExecutorConfig,
) -> RegistryResult<T> {
    serde_json::from_value(serde_json::Value::Object(
        config.config.clone().into_iter().collect(),
    ))
    .map_err(|e| RegistryError::ConfigDecode(executor_type.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{DagContext, Environment};
    use crate::model::Dag;
    use dashmap::DashMap;
    use std::sync::Arc as StdArc;
    use tempfile::TempDir;

    fn test_context(tmp: &TempDir) -> RunContext {
        let dag = Dag {
            working_dir: Some(tmp.path().display().to_string()),
            ..Dag::new("d")
        };
        let step = Step {
            name: "s".into(),
            ..Default::default()
        };
        let env = Environment::new(
            DagContext::default(),
            &dag,
            &step,
            StdArc::new(DashMap::new()),
            StdArc::new(DashMap::new()),
        )
        .unwrap();
        RunContext::new(env)
    }

    #[derive(Clone, Default)]
    struct SharedBuf(StdArc<std::sync::Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn errexit_default_aborts_on_false() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let mut exec = CommandExecutor::new(CommandConfig {
            shell_command_args: Some("false; echo X".into()),
            ..Default::default()
        });
        let buf = SharedBuf::default();
        exec.attach_stdout(Box::new(buf.clone()));
        let result = exec.run(&ctx).await;
        assert!(result.is_err());
        assert_eq!(exec.exit_code(), Some(1));
        let captured = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(!captured.contains('X'), "echo should never run under errexit: {captured:?}");
    }

    #[tokio::test]
    async fn user_specified_shell_preserves_layout() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let mut exec = CommandExecutor::new(CommandConfig {
            shell: Some("bash".into()),
            shell_command_args: Some("false; echo X".into()),
            user_specified_shell: true,
            ..Default::default()
        });
        let result = exec.run(&ctx).await;
        assert!(result.is_ok());
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn script_is_materialized_chmod_0750_before_cleanup() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let mut exec = CommandExecutor::new(CommandConfig {
            script: Some("#!/bin/sh\necho hi".into()),
            shell: Some("sh".into()),
            user_specified_shell: false,
            ..Default::default()
        });
        let result = exec.run_inner(&ctx).await;
        assert!(result.is_ok(), "{:?}", result.err());
        let script_file = exec.script_file.lock().await.clone().unwrap();
        assert!(script_file.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&script_file).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o750);
        }
    }

    #[tokio::test]
    async fn script_file_is_removed_after_run_completes() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let mut exec = CommandExecutor::new(CommandConfig {
            script: Some("#!/bin/sh\necho hi".into()),
            shell: Some("sh".into()),
            user_specified_shell: false,
            ..Default::default()
        });
        let result = exec.run(&ctx).await;
        assert!(result.is_ok(), "{:?}", result.err());
        assert!(exec.script_file.lock().await.is_none());
    }

    #[tokio::test]
    async fn kill_with_no_running_process_is_a_noop() {
        let mut exec = CommandExecutor::new(CommandConfig::default());
        assert!(exec.kill(Signal::SIGTERM).await.is_ok());
    }

    #[tokio::test]
    async fn a_no_shell_multiword_command_runs_through_the_default_shell() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let step = Step {
            name: "s".into(),
            command: Some("echo hello".into()),
            ..Default::default()
        };
        let mut exec = CommandExecutor::new(CommandConfig::from_step(&step));
        let buf = SharedBuf::default();
        exec.attach_stdout(Box::new(buf.clone()));
        let result = exec.run(&ctx).await;
        assert!(result.is_ok(), "{:?}", result.err());
        let captured = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(captured.trim(), "hello");
    }

    #[tokio::test]
    async fn a_no_shell_single_token_command_still_execs_directly() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let step = Step {
            name: "s".into(),
            command: Some("true".into()),
            ..Default::default()
        };
        let mut exec = CommandExecutor::new(CommandConfig::from_step(&step));
        let result = exec.run(&ctx).await;
        assert!(result.is_ok(), "{:?}", result.err());
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn structured_command_and_args_still_exec_directly() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_context(&tmp);
        let step = Step {
            name: "s".into(),
            command: Some("echo".into()),
            args: vec!["hello".into()],
            ..Default::default()
        };
        let mut exec = CommandExecutor::new(CommandConfig::from_step(&step));
        let buf = SharedBuf::default();
        exec.attach_stdout(Box::new(buf.clone()));
        let result = exec.run(&ctx).await;
        assert!(result.is_ok(), "{:?}", result.err());
        let captured = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(captured.trim(), "hello");
    }
}
