//! Per-cycle operations: validate, download, upload, verify and merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use nwp_common::{Locator, NwpError, NwpResult, ValidTime};
use storage::ObjectStoreHandle;

use crate::availability::{AvailabilityValidator, ValidationReport, WaitPolicy};
use crate::files::{FileSpec, LocatorBuilder};
use crate::pool::{BatchResult, PoolConfig, TransferObserver, TransferWorkerPool};
use crate::product::CycleLocators;
use crate::reconcile::{reconcile, PayloadTimes, TimeSample};
use crate::schedule::{LeadTimeSchedule, ScheduleRule};

const DEFAULT_PROBE_CONCURRENCY: usize = 32;

/// Fetches the files of one model cycle.
pub struct CycleFetcher {
    store: Arc<dyn ObjectStoreHandle>,
    rule: ScheduleRule,
    locators: Arc<dyn LocatorBuilder>,
    cycle: DateTime<Utc>,
    validator: AvailabilityValidator,
    pool_config: PoolConfig,
    wait: WaitPolicy,
    validate_before_download: bool,
    observer: Option<Arc<dyn TransferObserver>>,
}

impl CycleFetcher {
    pub fn new(
        store: Arc<dyn ObjectStoreHandle>,
        rule: ScheduleRule,
        locators: Arc<dyn LocatorBuilder>,
        cycle: DateTime<Utc>,
    ) -> Self {
        Self {
            validator: AvailabilityValidator::new(store.clone(), DEFAULT_PROBE_CONCURRENCY),
            store,
            rule,
            locators,
            cycle,
            pool_config: PoolConfig::default(),
            wait: WaitPolicy::default(),
            validate_before_download: true,
            observer: None,
        }
    }

    /// Fetcher for a product cycle, using the model's schedule.
    pub fn for_cycle(store: Arc<dyn ObjectStoreHandle>, locators: CycleLocators) -> Self {
        let rule = locators.model().schedule.clone();
        let cycle = locators.cycle();
        Self::new(store, rule, Arc::new(locators), cycle)
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_probe_concurrency(mut self, probes: usize) -> Self {
        self.validator = AvailabilityValidator::new(self.store.clone(), probes);
        self
    }

    pub fn with_validation(mut self, validate_before_download: bool) -> Self {
        self.validate_before_download = validate_before_download;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cycle(&self) -> DateTime<Utc> {
        self.cycle
    }

    pub fn schedule(&self, max_offset: u32) -> NwpResult<LeadTimeSchedule> {
        self.rule.schedule(max_offset)
    }

    /// The files `download` would transfer, without touching the store.
    pub fn manifest(&self, max_offset: u32) -> NwpResult<Vec<FileSpec>> {
        self.rule
            .required_offsets(max_offset)?
            .into_iter()
            .map(|offset| self.locators.file_spec(offset, true))
            .collect()
    }

    pub async fn validate(&self, max_offset: u32, cancel: &CancellationToken) -> NwpResult<ValidationReport> {
        let schedule = self.schedule(max_offset)?;
        self.validator
            .validate(&schedule, self.locators.as_ref(), self.wait, cancel)
            .await
    }

    /// Download every file up to `max_offset`.
    ///
    /// With validation enabled, an incomplete cycle fails with
    /// `CycleNotReady` before anything is transferred. Per-file failures
    /// are returned in the batch, not as an error.
    #[instrument(skip(self, cancel), fields(cycle = %self.cycle))]
    pub async fn download(&self, max_offset: u32, cancel: &CancellationToken) -> NwpResult<BatchResult> {
        let specs = if self.validate_before_download {
            let report = self.validate(max_offset, cancel).await?.into_result()?;
            report.required_files().cloned().collect()
        } else {
            warn!("Skipping availability validation");
            self.manifest(max_offset)?
        };

        info!(files = specs.len(), "Downloading cycle");
        Ok(self.pool("download").run_batch(specs, cancel).await)
    }

    /// Order downloaded files by valid time.
    pub fn time_index<'a>(
        &self,
        files: impl IntoIterator<Item = &'a FileSpec>,
    ) -> NwpResult<Vec<TimeSample<Locator>>> {
        let payloads = files
            .into_iter()
            .map(|spec| PayloadTimes {
                reference_time: self.cycle,
                lead_time: spec.lead_time().map(|h| ValidTime::new(self.cycle, h).lead_time()),
                valid_time: spec.valid_time(),
                payload: spec.destination().clone(),
            })
            .collect();
        reconcile(payloads)
    }

    /// Merge decoded payloads onto one time axis.
    pub fn merge<P>(&self, payloads: Vec<PayloadTimes<P>>) -> NwpResult<Vec<TimeSample<P>>> {
        let foreign = payloads
            .iter()
            .filter(|p| p.reference_time != self.cycle)
            .count();
        if foreign > 0 {
            warn!(count = foreign, cycle = %self.cycle, "Merging payloads from other cycles");
        }
        reconcile(payloads)
    }

    fn pool(&self, label: &str) -> TransferWorkerPool {
        let pool = TransferWorkerPool::new(self.store.clone(), self.pool_config.clone()).with_label(label);
        match &self.observer {
            Some(observer) => pool.with_observer(observer.clone()),
            None => pool,
        }
    }
}

/// Pushes local output files to a destination prefix.
pub struct Uploader {
    store: Arc<dyn ObjectStoreHandle>,
    pool: TransferWorkerPool,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStoreHandle>, config: PoolConfig) -> Self {
        Self {
            pool: TransferWorkerPool::new(store.clone(), config).with_label("upload"),
            store,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.pool = self.pool.with_observer(observer);
        self
    }

    /// Upload files, each to `destination/<file name>`.
    #[instrument(skip_all, fields(files = local_paths.len(), destination = %destination))]
    pub async fn upload(
        &self,
        local_paths: &[PathBuf],
        destination: &Locator,
        cancel: &CancellationToken,
    ) -> NwpResult<BatchResult> {
        let specs = local_paths
            .iter()
            .map(|path| -> NwpResult<FileSpec> {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| NwpError::InvalidLocator(format!("no file name in {}", path.display())))?;
                Ok(FileSpec::copy(Locator::local(path), destination.join(name)))
            })
            .collect::<NwpResult<Vec<_>>>()?;

        Ok(self.pool.run_batch(specs, cancel).await)
    }

    /// Upload a directory tree, keeping paths relative to `local_dir`.
    #[instrument(skip_all, fields(dir = %local_dir.display(), destination = %destination))]
    pub async fn upload_dir(
        &self,
        local_dir: &Path,
        destination: &Locator,
        cancel: &CancellationToken,
    ) -> NwpResult<BatchResult> {
        let files = self.store.list(&Locator::local(local_dir)).await?;
        if files.is_empty() {
            return Err(NwpError::NotFound(format!("no files under {}", local_dir.display())));
        }

        let specs = files
            .into_iter()
            .filter_map(|file| {
                let rel = file
                    .as_local_path()?
                    .strip_prefix(local_dir)
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                Some(FileSpec::copy(file, destination.join(&rel)))
            })
            .collect::<Vec<_>>();

        info!(files = specs.len(), "Uploading directory");
        Ok(self.pool.run_batch(specs, cancel).await)
    }
}

/// Result of a standalone existence check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub present: Vec<Locator>,
    pub missing: Vec<Locator>,
}

impl VerificationSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Check that every locator exists.
pub async fn verify(
    store: Arc<dyn ObjectStoreHandle>,
    locators: Vec<Locator>,
    concurrency: usize,
) -> VerificationSummary {
    let present = AvailabilityValidator::new(store, concurrency).probe(&locators).await;

    let mut summary = VerificationSummary {
        total: locators.len(),
        ..Default::default()
    };
    for (locator, found) in locators.into_iter().zip(present) {
        if found {
            summary.present.push(locator);
        } else {
            summary.missing.push(locator);
        }
    }

    info!(
        total = summary.total,
        present = summary.present.len(),
        missing = summary.missing.len(),
        "Verified files"
    );
    summary
}

/// Forecast files under a prefix, or the prefix itself if it names one file.
///
/// Picks up `*.grib*`/`*.grb*` and extension-less `gfs.*`/`ecmwf.*` names,
/// skipping index files and partial downloads.
pub async fn find_payload_files(store: &dyn ObjectStoreHandle, prefix: &Locator) -> NwpResult<Vec<Locator>> {
    let listed = store.list(prefix).await?;
    if listed.is_empty() {
        return if store.exists(prefix).await? {
            Ok(vec![prefix.clone()])
        } else {
            Err(NwpError::NotFound(format!("no payload files at {}", prefix)))
        };
    }

    Ok(listed
        .into_iter()
        .filter(|l| l.file_name().is_some_and(is_payload_name))
        .collect())
}

fn is_payload_name(name: &str) -> bool {
    if name.ends_with(".idx") || name.ends_with(".partial") {
        return false;
    }
    name.contains(".grib") || name.contains(".grb") || name.starts_with("gfs.") || name.starts_with("ecmwf.")
}
