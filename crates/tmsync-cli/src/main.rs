use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tmsync_reconcile::{report_runs_markdown, ReconcileConfig, ReconcilePipeline};
use tracing::debug;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tmsync")]
#[command(about = "Reconcile task and milestone dates between System-A and System-B")]
struct Cli {
    /// Workspace root; defaults to TMSYNC_WORKSPACE or the current directory.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Classify mappings on a rayon pool.
    #[arg(long, global = true)]
    parallel: bool,
    /// Log at debug level, on top of any TMSYNC_LOG directives.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify the current snapshots and write update batches.
    Reconcile,
    /// Summarize recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut config = match &cli.workspace {
        Some(root) => ReconcileConfig::from_env_in(root),
        None => ReconcileConfig::from_env(),
    };
    if cli.parallel {
        config.parallel = true;
    }
    debug!(?config, "resolved configuration");

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let summary = ReconcilePipeline::new(config)?.run_once().await?;
            println!(
                "reconcile complete: run_id={} mappings={} unmatched={} system_a_writes={} system_b_writes={} run_dir={}",
                summary.run_id,
                summary.mappings,
                summary.unmatched_mappings,
                summary.system_a_writes,
                summary.system_b_writes,
                summary.run_dir
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, &config.output_dir)?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = log_filter(std::env::var("TMSYNC_LOG").ok().as_deref(), verbose);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

/// `TMSYNC_LOG` directives (default `info`), lowered to debug by `--verbose`.
fn log_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
    let filter = directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    if verbose {
        filter.add_directive(LevelFilter::DEBUG.into())
    } else {
        filter
    }
}
