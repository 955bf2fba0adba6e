//! FuzzyFlow: declarative validation pipelines for a host machine.
//!
//! A test case is an ordered list of steps. Each step runs a shell command and
//! inspects its output, gates on an exit code, or samples a live metric and
//! classifies it into linguistic labels (`LOW`/`MED`/`HIGH`) with adaptive
//! trapezoidal membership functions. Step verdicts fold into one global
//! verdict under an optional `min_passed` policy.
//!
//! # Examples
//!
//! ```bash
//! # Write an example test case
//! fuzzyflow example --output testcases/example.json
//!
//! # Inspect steps without executing them
//! fuzzyflow run --testcase testcases/example.json --dry-run
//!
//! # Run it, sampling fuzzy metrics every 0.5s
//! fuzzyflow run --testcase testcases/example.json --interval 0.5
//!
//! # Register a shell-backed metric for later test cases
//! fuzzyflow metrics add gpu_temp "nvidia-smi --query-gpu=temperature.gpu --format=csv,noheader"
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: data model, errors, configuration, execution, sinks
//! - [`plugins`]: metrics, fuzzy classification, dispatch, pipeline, reports

pub mod core;
pub mod plugins;

use crate::core::clock::SystemClock;
use crate::core::config::{FuzzyflowConfig, resolve_config_path};
use crate::core::error::FuzzyflowError;
use crate::core::exec::{CommandRunner, ShellRunner};
use crate::core::output::Console;
use crate::core::sink::FileSink;
use crate::core::testcase::{TestCase, example_testcase};
use crate::core::time;
use plugins::metrics::MetricRegistry;
use plugins::pipeline::PipelineRunner;
use plugins::report;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Exit status for a run whose global verdict failed.
pub const EXIT_PIPELINE_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[clap(
    name = "fuzzyflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Industrial fuzzy test pipeline runner"
)]
struct Cli {
    /// Config file (defaults to $FUZZYFLOW_CONFIG, then ./fuzzyflow.toml).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RunCli {
    /// Path to the test case JSON document.
    #[clap(long)]
    testcase: PathBuf,
    /// Log directory (overrides config).
    #[clap(long)]
    logdir: Option<PathBuf>,
    /// Seconds between fuzzy samples (overrides config).
    #[clap(long)]
    interval: Option<f64>,
    /// Run only step N (1-based).
    #[clap(long)]
    step: Option<usize>,
    /// Show pipeline steps without executing.
    #[clap(long)]
    dry_run: bool,
    /// Skip CSV/HTML report generation.
    #[clap(long)]
    no_report: bool,
    /// Seed for the experimental neuro-fuzzy classifier.
    #[clap(long)]
    seed: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct MetricsCli {
    #[clap(subcommand)]
    command: MetricsCommand,
}

#[derive(Subcommand, Debug)]
enum MetricsCommand {
    /// List built-in and registered metrics
    List,
    /// Register a shell-backed metric: NAME COMMAND
    Add { name: String, command: String },
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a test case
    Run(RunCli),
    /// Inspect or register metrics
    Metrics(MetricsCli),
    /// Generate an example test case
    Example {
        /// Output file (defaults to testcases/example_<os>.json).
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Print version
    Version,
}

/// Built-ins plus the `[[metric]]` entries of the config.
pub fn build_registry(config: &FuzzyflowConfig, runner: Arc<dyn CommandRunner>) -> MetricRegistry {
    let mut registry = MetricRegistry::with_builtins();
    for metric in &config.metrics {
        registry.register_shell(&metric.name, &metric.command, Arc::clone(&runner));
    }
    registry
}

pub fn default_example_path() -> PathBuf {
    PathBuf::from("testcases").join(format!("example_{}.json", std::env::consts::OS))
}

/// Write the example test case as pretty JSON, creating parent directories.
pub fn write_example(path: &Path) -> Result<(), FuzzyflowError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(&example_testcase())?;
    fs::write(path, body + "\n")?;
    Ok(())
}

fn interval_from_secs(secs: f64) -> Result<Duration, FuzzyflowError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        FuzzyflowError::ValidationError(format!(
            "interval must be a non-negative number of seconds, got {}",
            secs
        ))
    })
}

fn print_dry_run(testcase: &TestCase) {
    println!("\n{}", "[DRY-RUN] Steps to execute:".bright_white().bold());
    for step in &testcase.steps {
        println!("[{}] {} (type: {})", step.index, step.description, step.type_name());
    }
}

fn run_testcase(args: RunCli, config: FuzzyflowConfig) -> Result<ExitCode, FuzzyflowError> {
    let mut testcase = TestCase::load(&args.testcase)?;

    if args.dry_run {
        print_dry_run(&testcase);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(n) = args.step {
        testcase.select_step(n)?;
    }

    let interval = interval_from_secs(args.interval.unwrap_or(config.interval))?;
    let logdir = args.logdir.unwrap_or_else(|| config.logdir.clone());
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let registry = build_registry(&config, Arc::clone(&runner));
    let clock = SystemClock;
    let console = Console::default();

    let pipeline = PipelineRunner::new(runner, &registry, &clock)
        .with_safety(config.safety.clone())
        .with_console(console)
        .with_seed(args.seed);

    let plan = pipeline.plan(&testcase)?;
    let mut sink = FileSink::create(&logdir, &time::run_stamp())?;
    let summary = pipeline.execute_plan(&testcase, &plan, interval, &mut sink)?;

    console.banner("=== PIPELINE FINISHED ===");
    let verdict = if summary.global_pass {
        "PASSED".bright_green().bold()
    } else {
        "FAILED".bright_red().bold()
    };
    println!("[PIPELINE] {}", verdict);

    if !args.no_report {
        match report::export_reports(sink.log_path(), sink.run_dir()) {
            Ok((csv, html)) => {
                println!("Reports generated: {} and {}", csv.display(), html.display())
            }
            Err(e) => {
                tracing::warn!(error = %e, "report export failed");
                console.warn(&format!("Report export failed: {}", e));
            }
        }
    }

    if summary.global_pass {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PIPELINE_FAILED))
    }
}

pub fn run() -> Result<ExitCode, FuzzyflowError> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Example { output } => {
            let path = output.unwrap_or_else(default_example_path);
            write_example(&path)?;
            Console::default().info(&format!("Example testcase saved to {}", path.display()));
            Ok(ExitCode::SUCCESS)
        }
        Command::Metrics(metrics) => {
            let mut config = FuzzyflowConfig::load(&config_path)?;
            match metrics.command {
                MetricsCommand::List => {
                    let registry = build_registry(&config, Arc::new(ShellRunner));
                    println!("Available metrics (built-in and custom):");
                    for name in registry.names() {
                        println!("  - {}", name);
                    }
                    println!("  - custom_shell (per-step custom_command)");
                }
                MetricsCommand::Add { name, command } => {
                    config.register_metric(&name, &command)?;
                    config.save(&config_path)?;
                    Console::default().info(&format!(
                        "Custom metric '{}' registered in {}.",
                        name,
                        config_path.display()
                    ));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let config = FuzzyflowConfig::load(&config_path)?;
            run_testcase(args, config)
        }
    }
}
