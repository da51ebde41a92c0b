//! # envflow CLI
//!
//! Runs workflow files, previews their execution plan, tails container logs and
//! removes containers left behind by earlier runs.

use anyhow::Context;
use clap::{Parser, Subcommand};
use envflow::cleanup::CleanupCoordinator;
use envflow::config::{EngineConfig, PredicateRegistry, WorkflowLoader};
use envflow::container::{ContainerApi, DockerCli, LogOptions};
use envflow::error::EngineError;
use envflow::logging;
use envflow::logs::{LogLine, LogStreamTranscoder};
use envflow::runner::TaskRunner;
use envflow::scheduler::WorkflowScheduler;
use envflow::signals::{self, ShutdownListener, Supervised, DEFAULT_DRAIN_TIMEOUT};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "envflow")]
#[command(about = "Bring up local development and test environments from workflow files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Engine configuration file (default: ./envflow.{toml,yaml,json} if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a workflow and hold the environment until interrupted
    Run {
        /// Workflow file (YAML)
        file: PathBuf,

        /// Log what would happen without touching processes or containers
        #[arg(long)]
        dry_run: bool,

        /// Exit after the workflow succeeds, leaving its resources running
        #[arg(long)]
        detach: bool,
    },

    /// Check a workflow file for structural problems and deadlocks
    Validate { file: PathBuf },

    /// Print the waves a workflow would run in
    Plan {
        file: PathBuf,

        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove every container created by envflow
    Clean,

    /// Print a container's logs
    Logs {
        /// Container name or id
        container: String,

        /// Only show lines containing this text
        #[arg(long)]
        filter: Option<String>,

        /// Split and show the timestamp of each line
        #[arg(long)]
        timestamps: bool,

        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,

        /// Only show the last N lines
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        EngineConfig::load(cli.config.as_deref()).context("failed to load engine configuration")?;
    if cli.verbose > 0 {
        let level = match cli.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        config.logging.level = Some(level.to_string());
    }
    logging::init_tracing(&config.logging);

    let code = match cli.command {
        Commands::Run {
            file,
            dry_run,
            detach,
        } => run_workflow(&config, &file, dry_run, detach).await?,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Plan { file, json } => plan_workflow(&file, json)?,
        Commands::Clean => clean(&config).await?,
        Commands::Logs {
            container,
            filter,
            timestamps,
            follow,
            tail,
        } => {
            let options = LogOptions {
                follow,
                timestamps,
                tail,
            };
            show_logs(&config, &container, filter, options).await?
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn report_error(err: &EngineError) {
    eprintln!("❌ {err}");
    if let EngineError::WaveFailed { causes, .. } = err {
        for cause in causes {
            eprintln!("   - {cause}");
        }
    }
    for suggestion in err.suggestions() {
        eprintln!("   💡 {suggestion}");
    }
}

fn loader() -> WorkflowLoader {
    WorkflowLoader::new(PredicateRegistry::new())
}

async fn run_workflow(
    config: &EngineConfig,
    file: &Path,
    dry_run: bool,
    detach: bool,
) -> anyhow::Result<i32> {
    let loaded = match loader().load_file(file) {
        Ok(loaded) => loaded,
        Err(err) => {
            report_error(&err);
            return Ok(err.exit_code());
        }
    };

    let mut listener = ShutdownListener::install().context("failed to install signal handlers")?;
    let containers: Arc<dyn ContainerApi> = Arc::new(DockerCli::new(&config.container.binary));
    let cleanup = Arc::new(CleanupCoordinator::with_system_processes(containers.clone()));

    let runner = TaskRunner::from_config(config, containers, cleanup.clone());
    let scheduler = WorkflowScheduler::new(Arc::new(runner));
    let ctx = loaded.context.clone().with_dry_run(dry_run);

    let result = match signals::supervise(
        scheduler.run(&loaded.workflow, &ctx),
        listener.recv(),
        &cleanup,
        DEFAULT_DRAIN_TIMEOUT,
    )
    .await
    {
        Supervised::Completed(result) => result,
        Supervised::Interrupted { signal, report, .. } => {
            if !report.is_clean() {
                eprintln!("⚠️  {} resources could not be released", report.failures.len());
            }
            return Ok(signal.exit_code());
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            report_error(&err);
            cleanup.trigger("error").await;
            return Ok(err.exit_code());
        }
    };

    println!(
        "✅ Workflow '{}' completed in {:.1}s ({} waves, {} tasks)",
        report.workflow,
        report.elapsed.as_secs_f64(),
        report.waves.len(),
        report.task_durations.len()
    );

    if dry_run || detach || cleanup.live_count() == 0 {
        if detach {
            info!(resources = cleanup.live_count(), "Detached; resources left running");
        }
        return Ok(0);
    }

    println!("🟢 Environment is up. Press Ctrl+C to tear it down.");
    let (received, _) = signals::cleanup_on_signal(listener, &cleanup).await;
    Ok(received.exit_code())
}

fn validate_workflow(file: &Path) -> i32 {
    match loader().load_file(file).and_then(|loaded| loaded.plan()) {
        Ok(plan) => {
            println!(
                "✅ Workflow '{}' is valid: {} tasks in {} waves",
                plan.workflow,
                plan.task_count(),
                plan.waves.len()
            );
            0
        }
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    }
}

fn plan_workflow(file: &Path, json: bool) -> anyhow::Result<i32> {
    let plan = match loader().load_file(file).and_then(|loaded| loaded.plan()) {
        Ok(plan) => plan,
        Err(err) => {
            report_error(&err);
            return Ok(err.exit_code());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("Workflow '{}'", plan.workflow);
        for (index, wave) in plan.waves.iter().enumerate() {
            println!("  wave {}: {}", index + 1, wave.join(", "));
        }
    }
    Ok(0)
}

async fn clean(config: &EngineConfig) -> anyhow::Result<i32> {
    let containers: Arc<dyn ContainerApi> = Arc::new(DockerCli::new(&config.container.binary));
    let cleanup = CleanupCoordinator::with_system_processes(containers);
    let adopted = cleanup
        .adopt_managed(&config.container.managed_label)
        .await
        .context("failed to list managed containers")?;

    if adopted == 0 {
        println!("No managed containers found");
        return Ok(0);
    }

    let report = cleanup.trigger("clean").await;
    for handle in &report.released {
        println!("🧹 {} ({})", handle.name, handle.id);
    }
    for failure in &report.failures {
        eprintln!(
            "❌ {} ({}): {} failed: {}",
            failure.resource_name, failure.resource_id, failure.step, failure.error
        );
    }
    Ok(if report.is_clean() { 0 } else { 1 })
}

async fn show_logs(
    config: &EngineConfig,
    container: &str,
    filter: Option<String>,
    options: LogOptions,
) -> anyhow::Result<i32> {
    let docker = DockerCli::new(&config.container.binary);
    let upstream = match docker.logs(container, &options).await {
        Ok(upstream) => upstream,
        Err(err) if err.is_not_found() => {
            eprintln!("❌ Container '{container}' not found");
            return Ok(1);
        }
        Err(err) => return Err(err.into()),
    };

    let mut lines = LogStreamTranscoder::new(upstream).with_timestamps(options.timestamps);
    if let Some(filter) = filter {
        lines = lines.with_filter(filter);
    }

    let mut listener = ShutdownListener::install().context("failed to install signal handlers")?;
    loop {
        tokio::select! {
            next = lines.next() => match next {
                Some(Ok(line)) => print_line(&line),
                Some(Err(err)) => return Err(err.into()),
                None => break,
            },
            _ = listener.recv() => {
                lines.stop();
                break;
            }
        }
    }
    Ok(0)
}

fn print_line(line: &LogLine) {
    let text = match &line.timestamp {
        Some(ts) => format!("{ts} {}", line.message),
        None => line.message.clone(),
    };
    if line.is_error {
        eprintln!("{text}");
    } else {
        println!("{text}");
    }
}
