//! shardrun - fan git updates and sharded benchmark launches out to a VM
//! fleet over SSH.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardrun_core::{plan_tasks, RunMode, RunSpec, Task};
use shardrun_dispatch::{CancellationToken, DispatchPolicy, Dispatcher, SshSessionRunner};

mod config;
mod output;

use config::Config;
use output::{EventStream, JsonEvent, OutputFormat};

/// Exit status for problems found before anything is dispatched.
const CONFIG_ERROR_EXIT: u8 = 2;

/// Fan commands out to a fleet of benchmark VMs
#[derive(Parser, Debug)]
#[command(name = "shardrun")]
#[command(about = "Run git updates or sharded executor launches on a VM fleet", long_about = None)]
struct Cli {
    /// Fleet config file
    #[arg(
        short,
        long,
        global = true,
        env = "SHARDRUN_CONFIG",
        default_value = "shardrun.toml"
    )]
    config: PathBuf,

    /// Log output format (logs go to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dispatch the commands and wait for every host
    Run(RunArgs),

    /// Print the command each host would run, without dispatching
    Plan(SpecArgs),

    /// List the hosts in the fleet config
    Hosts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Pull and check out a branch in the repository checkout
    Update,
    /// Launch one executor shard per host
    Execute,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Update => RunMode::GitUpdate,
            ModeArg::Execute => RunMode::Execute,
        }
    }
}

#[derive(Args, Debug)]
struct SpecArgs {
    /// Run mode
    #[arg(short, long, value_enum)]
    mode: ModeArg,

    /// Number of shards; the first N configured hosts are used
    #[arg(short, long)]
    shards: usize,

    /// Branch to check out
    #[arg(short, long)]
    branch: String,

    /// Coordinator address (overrides coordinator_address in the config)
    #[arg(long)]
    coordinator: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    spec: SpecArgs,

    /// Maximum number of hosts worked on at once (default: all)
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Bound on each attempt, in seconds
    #[arg(long, default_value_t = 300)]
    timeout_seconds: u64,

    /// Extra attempts after a failed or timed-out attempt
    #[arg(long, default_value_t = 0)]
    retry: u32,

    /// Pause between attempts, in seconds
    #[arg(long, default_value_t = 1)]
    retry_delay_seconds: u64,

    /// Stop the run after the first failed host
    #[arg(long)]
    fail_fast: bool,

    /// SSH user (overrides ssh.user)
    #[arg(long)]
    user: Option<String>,

    /// SSH private key (overrides ssh.identity_file)
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Report format on stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Also write the JSON report to this file
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Bytes of stdout/stderr tail kept per host in JSON output
    #[arg(long, default_value_t = 4096)]
    output_limit: usize,

    /// Stream dispatch events as JSON lines (stdout with text output,
    /// stderr otherwise)
    #[arg(long)]
    events: bool,
}

impl RunArgs {
    fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            max_parallel: self.max_parallel.filter(|&n| n > 0),
            task_timeout: Duration::from_secs(self.timeout_seconds),
            retry_count: self.retry,
            retry_delay: Duration::from_secs(self.retry_delay_seconds),
            fail_fast: self.fail_fast,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("failed to initialize logging: {}", e);
    }

    let result = match cli.command {
        Commands::Run(args) => run(&cli.config, args).await,
        Commands::Plan(args) => plan(&cli.config, &args).map(|_| ExitCode::SUCCESS),
        Commands::Hosts => hosts(&cli.config).map(|_| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Aborting before dispatch");
            eprintln!("error: {}", e);
            ExitCode::from(CONFIG_ERROR_EXIT)
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

/// Load the config and turn the run arguments into a task list.
fn prepare(
    path: &Path,
    args: &SpecArgs,
) -> Result<(Config, RunSpec, Vec<Task>), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    let coordinator = args
        .coordinator
        .clone()
        .or_else(|| config.coordinator_address.clone())
        .unwrap_or_default();

    let spec = RunSpec::new(args.mode.into(), args.shards, &args.branch, &coordinator)?;
    let directory = config.directory()?;
    let tasks = plan_tasks(&directory, &spec, &config.command)?;
    Ok((config, spec, tasks))
}

async fn run(path: &Path, args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let (config, spec, tasks) = prepare(path, &args.spec)?;
    let credentials = config.credentials(args.user.clone(), args.identity_file.clone())?;
    let resolver = config.build_resolver(&config.directory()?)?;
    let runner = Arc::new(SshSessionRunner::new(config.ssh_options()));

    info!(
        mode = %spec.mode(),
        shards = spec.shard_count(),
        branch = %spec.branch_name(),
        user = %credentials.user,
        "Starting run"
    );

    let mut dispatcher = Dispatcher::new(resolver, runner, credentials).with_policy(args.policy());

    let printer = if args.events {
        let (tx, mut rx) = mpsc::channel(256);
        let stream = EventStream::for_output(args.output);
        dispatcher = dispatcher.with_events(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                JsonEvent::from(&event).emit(stream);
            }
        }))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let report = dispatcher.dispatch(tasks, cancel).await.with_mode(spec.mode());

    // The printer ends once the dispatcher's sender is gone.
    drop(dispatcher);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if let Some(report_file) = &args.report_file {
        match output::write_report_file(&report, report_file, args.output_limit) {
            Ok(()) => info!(path = %report_file.display(), "Wrote report file"),
            Err(e) => error!(path = %report_file.display(), error = %e, "Failed to write report file"),
        }
    }

    if let Err(e) = output::print_report(&report, args.output, args.output_limit) {
        error!(error = %e, "Failed to print report");
    }

    let summary = report.summary();
    if summary.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!(
            "{} of {} tasks did not succeed",
            summary.unsuccessful(),
            summary.total
        );
        Ok(ExitCode::FAILURE)
    }
}

fn plan(path: &Path, args: &SpecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (_, spec, tasks) = prepare(path, args)?;

    println!("Plan ({}, {} shards):", spec.mode(), spec.shard_count());
    for task in &tasks {
        println!("[{}] {}", task.index, task.host.id);
        println!("    {}", task.command);
    }
    Ok(())
}

fn hosts(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    let directory = config.directory()?;

    println!("Hosts ({}):", directory.len());
    println!(
        "{:<28}  {:<16}  {:<16}  {}",
        "ID", "ADDRESS", "PRIVATE", "LOCATION"
    );
    println!("{}", "-".repeat(80));

    for host in directory.hosts() {
        let location = if host.project.is_empty() {
            "-".to_string()
        } else {
            format!("{}/{}/{}", host.project, host.zone, host.instance_name)
        };
        println!(
            "{:<28}  {:<16}  {:<16}  {}",
            host.id.as_str(),
            host.address.as_deref().unwrap_or("-"),
            host.private_address.as_deref().unwrap_or("-"),
            location
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "shardrun",
            "--config",
            "fleet.toml",
            "run",
            "--mode",
            "execute",
            "--shards",
            "3",
            "--branch",
            "multi_machine_sharding",
            "--max-parallel",
            "2",
            "--retry",
            "1",
            "--fail-fast",
            "--output",
            "json-lines",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("fleet.toml"));
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.spec.mode, ModeArg::Execute);
        assert_eq!(args.spec.shards, 3);
        assert_eq!(args.output, OutputFormat::JsonLines);

        let policy = args.policy();
        assert_eq!(policy.max_parallel, Some(2));
        assert_eq!(policy.retry_count, 1);
        assert_eq!(policy.task_timeout, Duration::from_secs(300));
        assert!(policy.fail_fast);
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from([
            "shardrun", "run", "--mode", "update", "--shards", "2", "--branch", "main",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        assert_eq!(RunMode::from(args.spec.mode), RunMode::GitUpdate);
        assert_eq!(args.output, OutputFormat::Text);
        assert_eq!(args.output_limit, 4096);
        assert!(!args.events);
        assert_eq!(args.policy(), DispatchPolicy::default());
    }

    #[test]
    fn test_zero_max_parallel_means_unbounded() {
        let cli = Cli::try_parse_from([
            "shardrun", "run", "-m", "update", "-s", "2", "-b", "main", "--max-parallel", "0",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.policy().max_parallel, None);
    }

    #[test]
    fn test_run_requires_mode() {
        assert!(Cli::try_parse_from(["shardrun", "run", "--shards", "2", "--branch", "main"]).is_err());
        assert!(Cli::try_parse_from([
            "shardrun", "run", "--mode", "deploy", "--shards", "2", "--branch", "main",
        ])
        .is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["shardrun", "hosts", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Hosts));
    }

    #[test]
    fn test_prepare_reports_missing_config() {
        let args = SpecArgs {
            mode: ModeArg::Update,
            shards: 1,
            branch: "main".to_string(),
            coordinator: None,
        };
        assert!(prepare(Path::new("/nonexistent/shardrun.toml"), &args).is_err());
    }

    #[test]
    fn test_prepare_builds_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardrun.toml");
        std::fs::write(
            &path,
            r#"
[[hosts]]
id = "vm-1"
private_address = "10.0.0.1"

[[hosts]]
id = "vm-2"
private_address = "10.0.0.2"
"#,
        )
        .unwrap();

        let args = SpecArgs {
            mode: ModeArg::Execute,
            shards: 2,
            branch: "main".to_string(),
            coordinator: Some("10.0.0.9".to_string()),
        };
        let (_, spec, tasks) = prepare(&path, &args).unwrap();

        assert_eq!(spec.coordinator_address(), "10.0.0.9");
        assert_eq!(tasks.len(), 2);
        assert!(tasks[1].command.contains("--shard-id 1 --num-shards 2"));
        assert!(tasks[1].command.contains("10.0.0.1:52202 10.0.0.2:52203"));
    }
}
