//! Standalone binary (§6). Implements just enough of the `start`
//! sub-invocation surface (§6.2) to be spawnable by the child-DAG executor
//! in local mode: parse a DAG file and an optional parameter string, run
//! its steps through `descartes_core`'s registry/environment, and report a
//! `RunStatus` back through the `Database` port so a waiting parent
//! process can read it back.
mod database;

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use dashmap::DashMap;
use descartes_core::executors::build_default_registry;
use descartes_core::executors::command::decode_config;
use descartes_core::executors::dag::DagStepExecutor;
use descartes_core::executors::mail::{MailConfig, MailExecutor, TcpSmtpSender};
use descartes_core::executors::parallel::ParallelExecutor;
use descartes_core::{
    ChildDagExecutor, Dag, DagContext, Environment, Executor, Registry, RunContext, RunStatus,
    Status, Step, StepInfo,
};
use tracing_subscriber::EnvFilter;

use database::FileDatabase;

#[derive(Parser)]
#[command(name = "descartes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a DAG file, either as a top-level invocation or as a
    /// sub-invocation spawned by a parent's child-DAG step (§6.2).
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Opaque `dagName:runID` reference to the root of the run tree.
    #[arg(long)]
    root: String,
    /// Opaque `dagName:runID` reference to the immediate parent.
    #[arg(long)]
    parent: String,
    /// Run id assigned to this invocation by its caller.
    #[arg(long = "run-id")]
    run_id: String,
    /// Accepted for CLI-surface compatibility with a queued dispatch mode;
    /// this binary only ever runs locally.
    #[arg(long = "no-queue")]
    _no_queue: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    dag_file: PathBuf,
    /// `key=value key2=value2` parameter string, passed as a single argv
    /// element after `--` by the spawning parent.
    #[arg(last = true)]
    params: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    let config = descartes_core::load_config(args.config.as_deref())?;

    let body = tokio::fs::read_to_string(&args.dag_file).await?;
    let mut dag: Dag = serde_yaml::from_str(&body)?;
    if dag.location.is_none() {
        dag.location = Some(args.dag_file.display().to_string());
    }
    dag.apply_chain_defaults();
    dag.validate()?;

    let dags_dir = args
        .dag_file
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let db: Arc<dyn descartes_core::Database> = Arc::new(FileDatabase::new(dags_dir));
    let child_dag_executor = Arc::new(ChildDagExecutor::new(db, None));
    let registry = build_default_registry();
    let dag = Arc::new(dag);
    let params = args.params.unwrap_or_default();

    let status = execute_dag(
        &dag,
        &args.root,
        &args.run_id,
        &params,
        &registry,
        &child_dag_executor,
        &config.smtp,
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    database::write_run_status(&status)?;

    let succeeded =
        status.status.map(|s| s.is_success()).unwrap_or(false) || matches!(status.status, Some(Status::PartialSuccess));
    if succeeded {
        Ok(())
    } else {
        std::process::exit(status.exit_code.unwrap_or(1));
    }
}

/// Minimal dependency-respecting sequential walk over `dag.steps`: repeatedly
/// pick any step whose `depends` are already satisfied and run it, stopping
/// at the first error. Not a concurrent topological scheduler -- that's
/// explicitly out of scope; this is enough to drive a child DAG end to end.
async fn execute_dag(
    dag: &Arc<Dag>,
    root_ref: &str,
    run_id: &str,
    params: &str,
    registry: &Registry,
    child_dag_executor: &Arc<ChildDagExecutor>,
    config_smtp: &descartes_core::SmtpDefaults,
) -> RunStatus {
    let variables = Arc::new(DashMap::new());
    let step_info = Arc::new(DashMap::new());
    for pair in params.split_whitespace() {
        if let Some((k, v)) = pair.split_once('=') {
            variables.insert(k.to_string(), format!("{}={}", k, v));
        }
    }

    let mut outputs: HashMap<String, serde_json::Value> = HashMap::new();
    let mut completed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<&Step> = dag.steps.iter().collect();

    while !remaining.is_empty() {
        let idx = remaining
            .iter()
            .position(|s| s.depends.iter().all(|d| completed.contains(d)));
        let Some(idx) = idx else {
            return failed_status(run_id, params, "dependency cycle or missing dependency among steps".into());
        };
        let step = remaining.remove(idx);

        let context = DagContext {
            dag_name: dag.name.clone(),
            root_run_ref: Some(root_ref.to_string()),
            run_id: Some(run_id.to_string()),
        };
        let env = match Environment::new(context, dag, step, variables.clone(), step_info.clone()) {
            Ok(env) => env,
            Err(e) => return failed_status(run_id, params, e.to_string()),
        };

        match run_step(step, env, dag, registry, child_dag_executor, config_smtp).await {
            Ok((_, stdout)) => {
                completed.insert(step.name.clone());
                if let Some(name) = &step.output {
                    outputs.insert(name.clone(), serde_json::Value::String(stdout.trim().to_string()));
                }
            }
            Err(e) => {
                return RunStatus {
                    run_id: run_id.to_string(),
                    params: params.to_string(),
                    status: Some(Status::Failed),
                    outputs,
                    error: Some(e),
                    exit_code: Some(1),
                };
            }
        }
    }

    RunStatus {
        run_id: run_id.to_string(),
        params: params.to_string(),
        status: Some(Status::Success),
        outputs,
        error: None,
        exit_code: Some(0),
    }
}

/// Three-level SMTP precedence (§7 AMBIENT): process-config defaults as the
/// base, overridden field-by-field by any `Some(...)` set at the DAG level.
fn merge_smtp(
    config_smtp: &descartes_core::SmtpDefaults,
    dag_smtp: Option<&descartes_core::SmtpDefaults>,
) -> descartes_core::SmtpDefaults {
    let mut merged = config_smtp.clone();
    if let Some(dag_smtp) = dag_smtp {
        if dag_smtp.host.is_some() {
            merged.host = dag_smtp.host.clone();
        }
        if dag_smtp.port.is_some() {
            merged.port = dag_smtp.port;
        }
        if dag_smtp.username.is_some() {
            merged.username = dag_smtp.username.clone();
        }
        if dag_smtp.password.is_some() {
            merged.password = dag_smtp.password.clone();
        }
    }
    merged
}

fn failed_status(run_id: &str, params: &str, error: String) -> RunStatus {
    RunStatus {
        run_id: run_id.to_string(),
        params: params.to_string(),
        status: Some(Status::Failed),
        outputs: Default::default(),
        error: Some(error),
        exit_code: Some(1),
    }
}

/// Captures everything written to it while also relaying it to `passthrough`
/// live, so a step's stdout/stderr is both available for `${stepID.field}`
/// lookups / `output:` publication and visible in this process's own
/// stdout/stderr (harmless for nested sub-invocations: the parent already
/// sets `Stdio::null()` on those, per `ChildDagExecutor::build_command`).
struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
    passthrough: Box<dyn Write + Send>,
}

impl Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        self.passthrough.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.passthrough.flush()
    }
}

/// Construct and run one step's executor. `dag`/`parallel`-shaped steps and
/// `mail` steps need ambient ports the registry's `Constructor` signature
/// has no room for (a shared `ChildDagExecutor`, the parent `Dag`, the DAG's
/// SMTP defaults), so those are special-cased and wired in directly via
/// each executor's own builder methods; everything else goes through the
/// registry.
async fn run_step(
    step: &Step,
    env: Environment,
    dag: &Arc<Dag>,
    registry: &Registry,
    child_dag_executor: &Arc<ChildDagExecutor>,
    config_smtp: &descartes_core::SmtpDefaults,
) -> Result<(Option<i32>, String), String> {
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));

    let mut executor: Box<dyn Executor> = if step.child_dag.is_some() && step.parallel.is_some() {
        let child_ref = step.child_dag.clone().unwrap();
        let spec = step.parallel.clone().unwrap();
        Box::new(
            ParallelExecutor::new(child_ref, spec)
                .with_child_dag_executor(child_dag_executor.clone())
                .with_parent_dag(dag.clone()),
        ) as Box<dyn Executor>
    } else if let Some(child_ref) = step.child_dag.clone() {
        let params = env
            .eval_string(&child_ref.params, &Default::default())
            .map_err(|e| e.to_string())?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut exec = DagStepExecutor::new(child_ref)
            .with_child_dag_executor(child_dag_executor.clone())
            .with_parent_dag(dag.clone());
        exec.set_params(run_id, params);
        Box::new(exec) as Box<dyn Executor>
    } else if step.executor.as_ref().map(|e| e.executor_type == "mail").unwrap_or(false) {
        let cfg: MailConfig = step
            .executor
            .as_ref()
            .map(|e| decode_config::<MailConfig>("mail", e))
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();
        let smtp = merge_smtp(config_smtp, dag.smtp.as_ref());
        Box::new(MailExecutor::new(cfg, smtp, Arc::new(TcpSmtpSender))) as Box<dyn Executor>
    } else {
        registry.new_executor(step).map_err(|e| e.to_string())?
    };

    executor.attach_stdout(Box::new(CaptureWriter {
        buf: stdout_buf.clone(),
        passthrough: Box::new(io::stdout()),
    }));
    executor.attach_stderr(Box::new(CaptureWriter {
        buf: stderr_buf.clone(),
        passthrough: Box::new(io::stderr()),
    }));

    let ctx = RunContext::new(env);
    let run_result = executor.run(&ctx).await;

    let stdout_text = String::from_utf8_lossy(&stdout_buf.lock().unwrap()).into_owned();
    let stderr_text = String::from_utf8_lossy(&stderr_buf.lock().unwrap()).into_owned();
    let exit_code = executor.exit_code();

    ctx.env.record_step_info(
        step.id.as_deref().unwrap_or(&step.name),
        StepInfo {
            stdout: stdout_text.clone(),
            stderr: stderr_text,
            exit_code,
        },
    );

    match run_result {
        Ok(()) => Ok((exit_code, stdout_text)),
        Err(e) => Err(format!("step '{}' failed: {}", step.name, e)),
    }
}
