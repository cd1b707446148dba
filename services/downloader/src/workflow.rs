//! Runs the configured workflow: validate, download, index, upload, clean up.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cycle_fetch::{
    find_payload_files, CycleFetcher, CycleLocators, FileSpec, TimeSample, TransferEvent,
    TransferObserver, Uploader, ValidationReport,
};
use nwp_common::Locator;
use storage::ObjectStoreHandle;

use crate::config::{UploadSection, WorkflowConfig};

const PROGRESS_EVERY: usize = 25;

/// Logs transfer progress as the pool resolves tasks.
#[derive(Default)]
struct ProgressLog {
    done: AtomicUsize,
}

impl TransferObserver for ProgressLog {
    fn on_event(&self, event: &TransferEvent<'_>) {
        match event {
            TransferEvent::Succeeded(transfer) => {
                let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    destination = %transfer.spec.destination(),
                    bytes = transfer.bytes,
                    skipped = transfer.skipped,
                    "Transfer complete"
                );
                if done % PROGRESS_EVERY == 0 {
                    info!(completed = done, "Transfer progress");
                }
            }
            TransferEvent::Retrying {
                spec,
                attempt,
                delay,
                error,
            } => {
                warn!(
                    source = %spec.source(),
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transfer failed, will retry"
                );
            }
            TransferEvent::Failed(failed) => {
                error!(
                    source = %failed.spec.source(),
                    attempts = failed.attempts,
                    error = %failed.error,
                    "Transfer failed"
                );
            }
        }
    }
}

/// Options for a full `run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_download: bool,
    pub skip_upload: bool,
    pub time_index: Option<PathBuf>,
}

/// What a `run` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub files: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub time_steps: usize,
    pub uploaded: usize,
    pub cleaned: usize,
}

#[derive(Serialize)]
struct TimeIndex<'a> {
    product: &'a str,
    cycle: DateTime<Utc>,
    samples: Vec<TimeSample<Locator>>,
}

/// The configured workflow bound to a store and a cancel signal.
pub struct Workflow {
    config: WorkflowConfig,
    store: Arc<dyn ObjectStoreHandle>,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn new(
        config: WorkflowConfig,
        store: Arc<dyn ObjectStoreHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            cancel,
        }
    }

    fn max_lead_time(&self) -> u32 {
        self.config.download.max_lead_time
    }

    pub fn fetcher(&self, cycle: DateTime<Utc>) -> Result<CycleFetcher> {
        let download = &self.config.download;
        let locators = CycleLocators::new(
            self.config.model()?,
            cycle,
            &download.resolution,
            &download.source_bucket,
            self.config.destination_root(),
        )
        .with_context(|| format!("Cannot build locators for {} {}", download.product, cycle))?;

        Ok(CycleFetcher::for_cycle(self.store.clone(), locators)
            .with_pool_config(self.config.pool_config())
            .with_wait_policy(self.config.wait_policy())
            .with_probe_concurrency(self.config.transfer.probe_concurrency)
            .with_validation(download.validate_before_download)
            .with_observer(Arc::new(ProgressLog::default())))
    }

    pub fn manifest(&self, cycle: DateTime<Utc>) -> Result<Vec<FileSpec>> {
        Ok(self.fetcher(cycle)?.manifest(self.max_lead_time())?)
    }

    pub async fn validate(&self, cycle: DateTime<Utc>) -> Result<ValidationReport> {
        let report = self
            .fetcher(cycle)?
            .validate(self.max_lead_time(), &self.cancel)
            .await?;
        info!(
            requested = report.requested.len(),
            present = report.present.len(),
            missing = report.missing.len(),
            validation_file_missing = report.validation_file_missing(),
            "Validation finished"
        );
        Ok(report)
    }

    /// Download the cycle, failing if any file could not be transferred.
    pub async fn download(&self, cycle: DateTime<Utc>) -> Result<RunSummary> {
        let fetcher = self.fetcher(cycle)?;
        let batch = fetcher.download(self.max_lead_time(), &self.cancel).await?;

        let summary = RunSummary {
            files: batch.succeeded.len(),
            skipped: batch.skipped(),
            bytes: batch.bytes_transferred(),
            ..Default::default()
        };
        info!(
            succeeded = batch.succeeded.len(),
            failed = batch.failed.len(),
            skipped = summary.skipped,
            bytes = summary.bytes,
            "Download finished"
        );
        batch.into_result()?;
        Ok(summary)
    }

    pub async fn upload(&self, section: &UploadSection) -> Result<usize> {
        upload_outputs(self.store.clone(), section, &self.cancel).await
    }

    /// The whole workflow for one cycle.
    pub async fn run(&self, cycle: DateTime<Utc>, options: &RunOptions) -> Result<RunSummary> {
        let fetcher = self.fetcher(cycle)?;
        let mut summary = RunSummary::default();

        let files = if options.skip_download {
            info!("Skipping download, indexing files already at the destination");
            self.existing_files(&fetcher).await?
        } else {
            let batch = fetcher.download(self.max_lead_time(), &self.cancel).await?;
            summary.skipped = batch.skipped();
            summary.bytes = batch.bytes_transferred();
            batch
                .into_result()?
                .into_iter()
                .map(|done| done.spec)
                .collect()
        };
        summary.files = files.len();

        if let Some(path) = &options.time_index {
            let samples = fetcher.time_index(&files)?;
            summary.time_steps = samples.len();
            let index = TimeIndex {
                product: &self.config.download.product,
                cycle,
                samples,
            };
            let json = serde_json::to_vec_pretty(&index)?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write time index: {:?}", path))?;
            info!(path = %path.display(), steps = summary.time_steps, "Wrote time index");
        }

        match (&self.config.upload, options.skip_upload) {
            (Some(section), false) => summary.uploaded = self.upload(section).await?,
            (Some(_), true) => info!("Skipping upload"),
            (None, _) => {}
        }

        if self.config.cleanup_downloads {
            summary.cleaned = self.cleanup(&files).await;
        }

        info!(
            cycle = %cycle,
            files = summary.files,
            skipped = summary.skipped,
            bytes = summary.bytes,
            uploaded = summary.uploaded,
            cleaned = summary.cleaned,
            "Workflow complete"
        );
        Ok(summary)
    }

    /// Manifest entries whose destination already holds a payload file.
    async fn existing_files(&self, fetcher: &CycleFetcher) -> Result<Vec<FileSpec>> {
        let manifest = fetcher.manifest(self.max_lead_time())?;
        let Some(dir) = manifest.first().and_then(|f| f.destination().parent()) else {
            return Ok(Vec::new());
        };

        let found: HashSet<Locator> = find_payload_files(self.store.as_ref(), &dir)
            .await
            .with_context(|| format!("No downloaded files under {}", dir))?
            .into_iter()
            .collect();

        let files: Vec<FileSpec> = manifest
            .into_iter()
            .filter(|f| found.contains(f.destination()))
            .collect();
        info!(found = files.len(), dir = %dir, "Found existing files");
        Ok(files)
    }

    /// Remove local downloads. Failures are logged and skipped.
    async fn cleanup(&self, files: &[FileSpec]) -> usize {
        let mut removed = 0;
        for file in files.iter().filter(|f| f.destination().is_local()) {
            match self.store.delete(file.destination()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %file.destination(), error = %e, "Failed to remove download"),
            }
        }
        info!(removed = removed, "Cleaned up downloads");
        removed
    }
}

/// Upload a local output directory, failing if any file did not arrive.
pub async fn upload_outputs(
    store: Arc<dyn ObjectStoreHandle>,
    section: &UploadSection,
    cancel: &CancellationToken,
) -> Result<usize> {
    let uploader =
        Uploader::new(store, section.pool_config()).with_observer(Arc::new(ProgressLog::default()));
    let batch = uploader
        .upload_dir(&section.local_dir, &section.destination, cancel)
        .await
        .with_context(|| format!("Upload of {:?} failed", section.local_dir))?;

    info!(
        succeeded = batch.succeeded.len(),
        failed = batch.failed.len(),
        bytes = batch.bytes_transferred(),
        destination = %section.destination,
        "Upload finished"
    );
    Ok(batch.into_result()?.len())
}
