//! nwp-fetch: forecast cycle downloader.
//!
//! Validates that a model cycle has been fully published, mirrors its files
//! with a bounded pool of retrying workers and optionally uploads processed
//! outputs afterwards. An unpublished cycle exits with code 75 so an external
//! scheduler can try again later.

mod config;
mod workflow;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nwp_common::{Locator, NwpError};
use storage::{ObjectStorage, ObjectStoreHandle};

use config::{UploadSection, WorkflowConfig};
use workflow::{upload_outputs, RunOptions, Workflow};

/// `EX_TEMPFAIL` from sysexits.h.
const EXIT_NOT_READY: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "nwp-fetch")]
#[command(about = "Validate and mirror numerical weather prediction cycles")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Which cycle to work on.
#[derive(clap::Args, Debug)]
struct CycleArgs {
    /// Workflow YAML file
    #[arg(short, long, env = "NWP_CONFIG")]
    config: PathBuf,

    /// Cycle time (ISO 8601); falls back to $CYCLE, then the config file
    #[arg(long)]
    cycle: Option<String>,

    /// Override download.max_lead_time
    #[arg(long)]
    max_lead_time: Option<u32>,

    /// Override transfer.concurrency
    #[arg(long)]
    max_workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that every file of the cycle has been published
    Validate(CycleArgs),

    /// Download the cycle
    Download {
        #[command(flatten)]
        target: CycleArgs,

        /// Replace files already at the destination
        #[arg(long)]
        overwrite: bool,

        /// Show what would be downloaded without transferring anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the file manifest as JSON
    Manifest(CycleArgs),

    /// Upload a local output directory
    Upload {
        /// Workflow YAML file providing the upload section
        #[arg(short, long, env = "NWP_CONFIG")]
        config: Option<PathBuf>,

        /// Directory to upload
        #[arg(long)]
        local_dir: Option<PathBuf>,

        /// Destination prefix, e.g. gs://bucket/outputs
        #[arg(long)]
        destination: Option<Locator>,

        /// Parallel uploads
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Validate, download, index and upload in one go
    Run {
        #[command(flatten)]
        target: CycleArgs,

        /// Use files already at the destination
        #[arg(long)]
        skip_download: bool,

        /// Do not run the upload section
        #[arg(long)]
        skip_upload: bool,

        /// Write the valid-time index as JSON to this file
        #[arg(long)]
        time_index: Option<PathBuf>,
    },

    /// Write a sample workflow file
    InitConfig {
        #[arg(long, default_value = "gfs")]
        product: String,

        #[arg(long, default_value = "0p25")]
        resolution: String,

        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level, args.log_format) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    if let Some(addr) = args.metrics_addr {
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            error!(error = %e, "Failed to install Prometheus exporter");
            return ExitCode::FAILURE;
        }
        info!(addr = %addr, "Serving metrics");
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, finishing in-flight transfers");
            shutdown.cancel();
        }
    });

    match execute(args.command, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(exit_status(&e)),
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
}

/// Log the failure and pick the process exit status.
fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<NwpError>() {
        Some(nwp) if nwp.is_deferrable() => {
            warn!(error = %nwp, "Cycle not ready, try again later");
            EXIT_NOT_READY
        }
        _ => {
            error!(error = format!("{:#}", err), "Command failed");
            1
        }
    }
}

fn load(target: &CycleArgs) -> Result<WorkflowConfig> {
    let mut config = WorkflowConfig::load(&target.config)?;
    if let Some(max_lead_time) = target.max_lead_time {
        config.download.max_lead_time = max_lead_time;
    }
    if let Some(workers) = target.max_workers {
        config.transfer.concurrency = workers.max(1);
    }
    Ok(config)
}

fn workflow(config: WorkflowConfig, cancel: CancellationToken) -> Workflow {
    let store: Arc<dyn ObjectStoreHandle> = Arc::new(ObjectStorage::new(config.storage.clone()));
    Workflow::new(config, store, cancel)
}

fn resolve_cycle(
    config: &WorkflowConfig,
    target: &CycleArgs,
) -> Result<chrono::DateTime<chrono::Utc>> {
    let env = std::env::var("CYCLE").ok();
    Ok(config.resolve_cycle(target.cycle.as_deref(), env.as_deref())?)
}

async fn execute(command: Command, cancel: CancellationToken) -> Result<()> {
    match command {
        Command::Validate(target) => {
            let config = load(&target)?;
            let cycle = resolve_cycle(&config, &target)?;
            let report = workflow(config, cancel).validate(cycle).await?;

            let summary = serde_json::json!({
                "cycle": cycle,
                "requested": report.requested.len(),
                "missing_offsets": report.missing_offsets(),
                "validation_file_missing": report.validation_file_missing(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            report.into_result()?;
        }

        Command::Download {
            target,
            overwrite,
            dry_run,
        } => {
            let mut config = load(&target)?;
            config.download.overwrite |= overwrite;
            let cycle = resolve_cycle(&config, &target)?;
            let workflow = workflow(config, cancel);

            if dry_run {
                let manifest = workflow.manifest(cycle)?;
                println!("Would download {} files:", manifest.len());
                for file in manifest.iter().take(10) {
                    println!("  {} -> {}", file.source(), file.destination());
                }
                if manifest.len() > 10 {
                    println!("  ... and {} more", manifest.len() - 10);
                }
                return Ok(());
            }

            workflow.download(cycle).await?;
        }

        Command::Manifest(target) => {
            let config = load(&target)?;
            let cycle = resolve_cycle(&config, &target)?;
            let manifest = workflow(config, cancel).manifest(cycle)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }

        Command::Upload {
            config,
            local_dir,
            destination,
            max_workers,
        } => {
            let workflow_config = match &config {
                Some(path) => Some(WorkflowConfig::load(path)?),
                None => None,
            };
            let section = upload_section(
                workflow_config.as_ref().and_then(|c| c.upload.clone()),
                local_dir,
                destination,
                max_workers,
            )?;
            let storage = workflow_config
                .as_ref()
                .map(|c| c.storage.clone())
                .unwrap_or_default();

            let store: Arc<dyn ObjectStoreHandle> = Arc::new(ObjectStorage::new(storage));
            let uploaded = upload_outputs(store, &section, &cancel).await?;
            info!(files = uploaded, "Upload complete");
        }

        Command::Run {
            target,
            skip_download,
            skip_upload,
            time_index,
        } => {
            let config = load(&target)?;
            let cycle = resolve_cycle(&config, &target)?;
            let options = RunOptions {
                skip_download,
                skip_upload,
                time_index,
            };
            let summary = workflow(config, cancel).run(cycle, &options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::InitConfig {
            product,
            resolution,
            output,
            force,
        } => {
            if output.exists() && !force {
                bail!("{:?} already exists, pass --force to replace it", output);
            }
            let yaml = WorkflowConfig::sample(&product, &resolution).to_yaml()?;
            std::fs::write(&output, yaml)
                .with_context(|| format!("Failed to write {:?}", output))?;
            info!(path = %output.display(), "Wrote sample config");
        }
    }

    Ok(())
}

/// Merge CLI flags over the config file's upload section.
fn upload_section(
    from_config: Option<UploadSection>,
    local_dir: Option<PathBuf>,
    destination: Option<Locator>,
    max_workers: Option<usize>,
) -> Result<UploadSection> {
    let mut section = match (from_config, local_dir, destination) {
        (Some(mut section), dir, dest) => {
            if let Some(dir) = dir {
                section.local_dir = dir;
            }
            if let Some(dest) = dest {
                section.destination = dest;
            }
            section
        }
        (None, Some(dir), Some(dest)) => UploadSection::new(dir, dest),
        (None, _, _) => bail!("upload needs --local-dir and --destination, or a config upload section"),
    };
    if let Some(workers) = max_workers {
        section.concurrency = workers.max(1);
    }
    Ok(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let args = Args::try_parse_from([
            "nwp-fetch",
            "--log-format",
            "pretty",
            "run",
            "--config",
            "workflow.yaml",
            "--cycle",
            "2024-01-15T06:00:00Z",
            "--skip-upload",
            "--time-index",
            "index.json",
        ])
        .unwrap();

        assert!(matches!(args.log_format, LogFormat::Pretty));
        match args.command {
            Command::Run {
                target,
                skip_download,
                skip_upload,
                time_index,
            } => {
                assert_eq!(target.cycle.as_deref(), Some("2024-01-15T06:00:00Z"));
                assert!(!skip_download);
                assert!(skip_upload);
                assert_eq!(time_index, Some(PathBuf::from("index.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_upload_destination() {
        let args = Args::try_parse_from([
            "nwp-fetch",
            "upload",
            "--local-dir",
            "/tmp/out",
            "--destination",
            "gs://outputs/zarr",
        ])
        .unwrap();

        match args.command {
            Command::Upload { destination, .. } => {
                assert_eq!(destination.map(|d| d.to_string()), Some("gs://outputs/zarr".into()));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_not_ready_exit_status() {
        let not_ready = anyhow::Error::new(NwpError::CycleNotReady {
            missing_offsets: vec![6],
            validation_file_missing: true,
        })
        .context("validating cycle");
        assert_eq!(exit_status(&not_ready), EXIT_NOT_READY);

        let other = anyhow::Error::new(NwpError::InvalidConfig("bad".into()));
        assert_eq!(exit_status(&other), 1);
    }

    #[test]
    fn test_upload_section_merge() {
        let section = upload_section(
            None,
            Some(PathBuf::from("/tmp/out")),
            Some("gs://b/p".parse().unwrap()),
            Some(4),
        )
        .unwrap();
        assert_eq!(section.concurrency, 4);
        assert!(upload_section(None, Some(PathBuf::from("/tmp/out")), None, None).is_err());

        let base = UploadSection::new(PathBuf::from("/a"), "gs://b/p".parse().unwrap());
        let merged = upload_section(Some(base), Some(PathBuf::from("/b")), None, None).unwrap();
        assert_eq!(merged.local_dir, PathBuf::from("/b"));
        assert_eq!(merged.destination.to_string(), "gs://b/p");
    }
}
