use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use qrpull::orchestrator::BatchReport;
use qrpull::{logging, Config, Workflow};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "qrpull",
    about = "Query a DICOM archive, retrieve matching studies and hand them off"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Configuration file
    #[arg(short, long, default_value = "qrpull.toml")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check that the archive answers C-ECHO
    Echo {
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Search the archive and save the study list
    Find {
        #[command(flatten)]
        config: ConfigArg,
        #[arg(short, long, default_value = "StudyList.csv")]
        output: PathBuf,
    },
    /// Search, then retrieve the matches into the output directory
    Pull {
        #[command(flatten)]
        config: ConfigArg,
        /// Also save the study list
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Retrieve and ingest every configured route
    Transfer {
        #[command(flatten)]
        config: ConfigArg,
    },
}

impl Cmd {
    fn config_path(&self) -> &PathBuf {
        match self {
            Cmd::Echo { config }
            | Cmd::Find { config, .. }
            | Cmd::Pull { config, .. }
            | Cmd::Transfer { config } => &config.config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(cli.cmd.config_path())?;
    logging::init(&config.logging)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current transfer");
            on_signal.cancel();
        }
    });

    let destination = config.local.local_aet.clone();
    let workflow = Workflow::new(config).with_cancellation(cancel);

    match cli.cmd {
        Cmd::Echo { .. } => workflow.echo().await,
        Cmd::Find { output, .. } => {
            let ledger = workflow.find(Some(&output)).await?;
            info!("Found {} record(s)", ledger.matches().count());
            Ok(())
        }
        Cmd::Pull { output, .. } => {
            let report = workflow.pull(output.as_deref()).await?;
            check_batch(&report.batch, &destination)
        }
        Cmd::Transfer { .. } => {
            let report = workflow.transfer().await?;
            for route in &report.routes {
                info!(
                    "{}: {} match(es), {} retrieved, {} failed, {} file(s), ingest {}",
                    route.route,
                    route.ledger.matches().count(),
                    route.batch.succeeded(),
                    route.batch.failed(),
                    route.files,
                    match (&route.ingest, &route.ingest_error) {
                        (Some(ingest), _) if ingest.success => "ok",
                        (None, None) => "skipped",
                        _ => "FAILED",
                    }
                );
            }
            if !report.skipped_routes.is_empty() {
                warn!("Routes not run: {}", report.skipped_routes.join(", "));
            }
            for route in &report.routes {
                check_batch(&route.batch, &destination)?;
            }
            if report.routes.iter().any(|r| r.ingest_failed()) {
                anyhow::bail!("ingestion failed");
            }
            Ok(())
        }
    }
}

/// Unknown destination is an operator problem: surface it as the exit status
fn check_batch(batch: &BatchReport, destination: &str) -> anyhow::Result<()> {
    if let Some(err) = batch.destination_error(destination) {
        return Err(err.into());
    }
    if batch.cancelled {
        anyhow::bail!("cancelled with {} target(s) not attempted", batch.not_attempted.len());
    }
    Ok(())
}
