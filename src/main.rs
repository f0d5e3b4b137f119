//! devtest-rs CLI: claims a testbed, runs a list of registered test cases,
//! scenarios, or suites against it, and reports the result.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use devtest::config::{self, Config};
use devtest::coprocess::{self, CoprocessTask};
use devtest::registry;
use devtest::report;
use devtest::runner::{InMemoryTestbedStore, TestRunner, TestbedStore};
use devtest::signals::Bus;

#[derive(Parser)]
#[command(name = "devtest-rs")]
#[command(about = "Hardware-in-the-loop test orchestration framework", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true, default_value = "devtest.toml")]
    config: PathBuf,

    /// Entered by the process itself to become a coprocess worker; not part
    /// of the user-facing surface.
    #[arg(long, hide = true)]
    coprocess_worker: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more registered test cases, scenarios, or suites.
    Run {
        /// 0..3; at 2 prerequisite-skipping stops, at 3 auto-insertion stops too.
        #[arg(long)]
        debug: Option<u8>,
        /// 0..N; gates the default report's info-level verbosity.
        #[arg(long)]
        verbose: Option<u8>,
        /// Number of times to repeat the object list.
        #[arg(long)]
        repeat: Option<u32>,
        /// Name of the testbed to claim from the inventory.
        #[arg(long)]
        testbed: Option<String>,
        /// Comma-separated report names: default, null, database, jupyter.
        #[arg(long)]
        report: Option<String>,
        /// Implementation paths of the test cases, scenarios, or modules to run.
        runnable: Vec<String>,
    },

    /// List every registered test case.
    ListTests,

    /// List every testbed name known to the (in-memory) inventory.
    ListTestbeds,

    /// List the report sinks this crate ships with.
    ListReports,

    /// Print the resolved configuration tree.
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(kind) = &cli.coprocess_worker {
        return run_coprocess_worker(kind).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let Some(command) = cli.command else {
        eprintln!("no subcommand given; run with --help for usage");
        std::process::exit(2);
    };

    match command {
        Commands::Run {
            debug,
            verbose,
            repeat,
            testbed,
            report,
            runnable,
        } => run_tests(&cli.config, debug, verbose, repeat, testbed, report, runnable).await,
        Commands::ListTests => list_tests(),
        Commands::ListTestbeds => list_testbeds(&cli.config),
        Commands::ListReports => list_reports(),
        Commands::ShowConfig => show_config(&cli.config),
    }
}

async fn run_coprocess_worker(kind: &str) -> Result<()> {
    let task = CoprocessTask::parse(kind)
        .with_context(|| format!("unknown coprocess worker kind {kind:?}"))?;
    coprocess::run_worker(task, coprocess::sample)
        .await
        .context("coprocess worker failed")?;
    Ok(())
}

fn load_and_override(
    config_path: &PathBuf,
    debug: Option<u8>,
    verbose: Option<u8>,
    repeat: Option<u32>,
    testbed: Option<String>,
    report: Option<String>,
) -> Result<Config> {
    let mut cfg = if config_path.exists() {
        config::load_config(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(debug) = debug {
        cfg.flags.debug = debug;
    }
    if let Some(verbose) = verbose {
        cfg.flags.verbose = verbose;
    }
    if let Some(repeat) = repeat {
        cfg.flags.repeat = repeat;
    }
    if let Some(testbed) = testbed {
        cfg.testbed = Some(testbed);
    }
    if let Some(report) = report {
        cfg.reportname = report;
    }
    Ok(cfg)
}

async fn run_tests(
    config_path: &PathBuf,
    debug: Option<u8>,
    verbose: Option<u8>,
    repeat: Option<u32>,
    testbed: Option<String>,
    report: Option<String>,
    runnable_paths: Vec<String>,
) -> Result<()> {
    let config = Arc::new(load_and_override(
        config_path,
        debug,
        verbose,
        repeat,
        testbed.clone(),
        report,
    )?);

    let bus = Arc::new(Bus::new());

    let report = match report::resolve_reports(&config.report_names()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("report error: {e}");
            std::process::exit(70);
        }
    };

    let testbed_names = testbed
        .or_else(|| config.testbed.clone())
        .map(|n| vec![n])
        .unwrap_or_else(|| vec!["default".to_string()]);
    let store: Arc<dyn TestbedStore> = Arc::new(InMemoryTestbedStore::new(testbed_names));

    let mut runner = TestRunner::new(config, bus, store, report);

    let mut had_errors = false;
    let objects = devtest::runner::resolve_runnables(&runnable_paths, |e| {
        eprintln!("{e}");
        had_errors = true;
    });
    if had_errors {
        std::process::exit(2);
    }

    let disposition = runner.runall(objects).await;
    std::process::exit(disposition.exit_code());
}

fn list_tests() -> Result<()> {
    for reg in registry::scan_testcases("") {
        println!("{}", reg.implementation);
    }
    for reg in registry::scan_scenarios("") {
        println!("{} (scenario)", reg.implementation);
    }
    for reg in registry::scan_modules("") {
        println!("{} (module)", reg.implementation);
    }
    Ok(())
}

fn list_testbeds(config_path: &PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        config::load_config(config_path)?
    } else {
        Config::default()
    };
    let names = config
        .testbed
        .map(|n| vec![n])
        .unwrap_or_else(|| vec!["default".to_string()]);
    let store = InMemoryTestbedStore::new(names);
    for name in store.list_names() {
        println!("{name}");
    }
    Ok(())
}

fn list_reports() -> Result<()> {
    for name in report::available_report_names() {
        println!("{name}");
    }
    Ok(())
}

fn show_config(config_path: &PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        config::load_config(config_path)?
    } else {
        Config::default()
    };
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
