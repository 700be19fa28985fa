//! Mail executor (§4.11). Sends one message using the DAG's SMTP defaults
//! merged beneath the step's own `mail` config. Delivery itself goes
//! through `SmtpSender`, a small port: credentials are consumed as opaque
//! configuration (per the spec's non-goal on an auth store) and no SMTP
//! crate is in the teacher's dependency stack, so the real implementation
//! speaks the minimal textual subset of RFC 5321 directly over
//! `tokio::net::TcpStream` (HELO/MAIL FROM/RCPT TO/DATA/QUIT, no
//! STARTTLS/AUTH) rather than fabricating a vendored client.
use std::io::Write;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use crate::errors::{ExecutorError, ExecutorResult, RegistryResult};
use crate::model::{NodeStatus, SmtpDefaults, Step};
use crate::registry::{Executor, RunContext, Signal};

use super::command::decode_config;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailConfig {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComposedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message: String,
}

/// Delivery port; the mail executor never speaks SMTP directly.
#[async_trait]
pub trait SmtpSender: Send + Sync {
    async fn send(&self, smtp: &SmtpDefaults, msg: &ComposedMessage) -> ExecutorResult<()>;
}

/// Minimal textual SMTP client: one connection per message, no retry, no
/// TLS/AUTH. Sufficient for local relays / test SMTP servers; production
/// setups that need STARTTLS or auth should sit behind their own relay.
pub struct TcpSmtpSender;

#[async_trait]
impl SmtpSender for TcpSmtpSender {
    async fn send(&self, smtp: &SmtpDefaults, msg: &ComposedMessage) -> ExecutorResult<()> {
        let host = smtp.host.as_deref().unwrap_or("localhost");
        let port = smtp.port.unwrap_or(25);
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ExecutorError::Mail(format!("connect to {}:{} failed: {}", host, port, e)))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        reader
            .read_line(&mut greeting)
            .await
            .map_err(|e| ExecutorError::Mail(e.to_string()))?;

        let commands = [
            "HELO localhost\r\n".to_string(),
            format!("MAIL FROM:<{}>\r\n", msg.from),
            format!("RCPT TO:<{}>\r\n", msg.to),
            "DATA\r\n".to_string(),
        ];
        for cmd in &commands {
            write_half
                .write_all(cmd.as_bytes())
                .await
                .map_err(|e| ExecutorError::Mail(e.to_string()))?;
            let mut line = String::new();
            reader.read_line(&mut line).await.map_err(|e| ExecutorError::Mail(e.to_string()))?;
        }

        let body = format!(
            "Subject: {}\r\nFrom: {}\r\nTo: {}\r\n\r\n{}\r\n.\r\n",
            msg.subject, msg.from, msg.to, msg.message
        );
        write_half
            .write_all(body.as_bytes())
            .await
            .map_err(|e| ExecutorError::Mail(e.to_string()))?;
        let mut line = String::new();
        reader.read_line(&mut line).await.map_err(|e| ExecutorError::Mail(e.to_string()))?;

        write_half
            .write_all(b"QUIT\r\n")
            .await
            .map_err(|e| ExecutorError::Mail(e.to_string()))?;
        Ok(())
    }
}

pub struct MailExecutor {
    config: MailConfig,
    dag_smtp: SmtpDefaults,
    sender: std::sync::Arc<dyn SmtpSender>,
    stdout: Option<Box<dyn Write + Send>>,
    exit_code: Option<i32>,
}

impl MailExecutor {
    pub fn new(config: MailConfig, dag_smtp: SmtpDefaults, sender: std::sync::Arc<dyn SmtpSender>) -> Self {
        Self {
            config,
            dag_smtp,
            sender,
            stdout: None,
            exit_code: None,
        }
    }

    pub fn from_step(step: &Step) -> RegistryResult<Box<dyn Executor>> {
        let config = step
            .executor
            .as_ref()
            .map(|e| decode_config::<MailConfig>("mail", e))
            .transpose()?
            .unwrap_or_default();
        Ok(Box::new(Self::new(config, SmtpDefaults::default(), std::sync::Arc::new(TcpSmtpSender))))
    }

    /// Attach DAG-level SMTP defaults (the executor is constructed from the
    /// step alone; the caller supplies the owning DAG's defaults once known).
    pub fn with_dag_smtp(mut self, smtp: SmtpDefaults) -> Self {
        self.dag_smtp = smtp;
        self
    }
}

#[async_trait]
impl Executor for MailExecutor {
    fn attach_stdout(&mut self, writer: Box<dyn Write + Send>) {
        self.stdout = Some(writer);
    }

    fn attach_stderr(&mut self, _writer: Box<dyn Write + Send>) {}

    async fn run(&mut self, ctx: &RunContext) -> ExecutorResult<()> {
        let opts = Default::default();
        let msg = ComposedMessage {
            from: ctx.env.eval_string(self.config.from.as_deref().unwrap_or_default(), &opts)?,
            to: ctx.env.eval_string(self.config.to.as_deref().unwrap_or_default(), &opts)?,
            subject: ctx.env.eval_string(self.config.subject.as_deref().unwrap_or_default(), &opts)?,
            message: ctx.env.eval_string(self.config.message.as_deref().unwrap_or_default(), &opts)?,
        };

        if let Some(out) = self.stdout.as_mut() {
            let _ = writeln!(
                out,
                "sending mail: from={} to={} subject={}",
                msg.from, msg.to, msg.subject
            );
        }
        info!(from = %msg.from, to = %msg.to, "sending mail");

        let result = tokio::select! {
            r = self.sender.send(&self.dag_smtp, &msg) => r,
            _ = ctx.cancel.cancelled() => Err(ExecutorError::Cancelled),
        };

        self.exit_code = Some(if result.is_ok() { 0 } else { 1 });
        if let Some(out) = self.stdout.as_mut() {
            match &result {
                Ok(()) => {
                    let _ = writeln!(out, "mail sent successfully");
                }
                Err(e) => {
                    let _ = writeln!(out, "mail send failed: {}", e);
                }
            }
        }
        result
    }

    async fn kill(&mut self, _sig: Signal) -> ExecutorResult<()> {
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
