//! Cycle availability checks.
//!
//! Upstream archives do not publish a cycle atomically: a file can be listed
//! while it is still being written. Before downloading up to some horizon we
//! therefore also require the *next* scheduled file to exist. If the model
//! has already moved past the horizon, every file up to it is complete.
//!
//! This assumes the producer publishes lead times in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use metrics::gauge;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use nwp_common::{Locator, NwpError, NwpResult};
use storage::ObjectStoreHandle;

use crate::files::{FileSpec, LocatorBuilder};
use crate::schedule::LeadTimeSchedule;

/// What to do when files are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Report immediately.
    #[default]
    FailFast,
    /// Re-probe the missing files every `poll_interval` until they all
    /// appear or `max_wait` has passed.
    Poll {
        max_wait: Duration,
        poll_interval: Duration,
    },
}

/// Outcome of one validation call.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Required files plus the validation file, in schedule order.
    pub requested: Vec<FileSpec>,
    pub present: Vec<FileSpec>,
    pub missing: Vec<FileSpec>,
    pub validation_file: Option<FileSpec>,
    pub validation_satisfied: bool,
}

impl ValidationReport {
    fn new(requested: Vec<FileSpec>, missing: Vec<FileSpec>, validation_file: Option<FileSpec>) -> Self {
        let absent: HashSet<&FileSpec> = missing.iter().collect();
        let present = requested
            .iter()
            .filter(|spec| !absent.contains(spec))
            .cloned()
            .collect();
        let validation_satisfied = missing.is_empty();

        Self {
            requested,
            present,
            missing,
            validation_file,
            validation_satisfied,
        }
    }

    /// Required (downloadable) files, excluding the validation file.
    pub fn required_files(&self) -> impl Iterator<Item = &FileSpec> {
        self.requested.iter().filter(|spec| spec.required())
    }

    pub fn missing_offsets(&self) -> Vec<u32> {
        self.missing.iter().filter_map(FileSpec::lead_time).collect()
    }

    pub fn validation_file_missing(&self) -> bool {
        self.missing.iter().any(|spec| !spec.required())
    }

    /// Turn an unsatisfied report into `CycleNotReady`.
    pub fn into_result(self) -> NwpResult<Self> {
        if self.validation_satisfied {
            Ok(self)
        } else {
            Err(NwpError::CycleNotReady {
                missing_offsets: self.missing_offsets(),
                validation_file_missing: self.validation_file_missing(),
            })
        }
    }
}

/// Probes a store for the files of a schedule.
pub struct AvailabilityValidator {
    store: Arc<dyn ObjectStoreHandle>,
    probe_concurrency: usize,
}

impl AvailabilityValidator {
    pub fn new(store: Arc<dyn ObjectStoreHandle>, probe_concurrency: usize) -> Self {
        Self {
            store,
            probe_concurrency: probe_concurrency.max(1),
        }
    }

    /// Check that every scheduled file and the validation file exist at
    /// their sources.
    ///
    /// Never fails because files are missing; inspect
    /// [`ValidationReport::validation_satisfied`] or call
    /// [`ValidationReport::into_result`]. Returns `Cancelled` if `cancel`
    /// fires while waiting.
    #[instrument(skip_all, fields(max_offset = schedule.max_offset, files = schedule.offsets.len()))]
    pub async fn validate(
        &self,
        schedule: &LeadTimeSchedule,
        locators: &dyn LocatorBuilder,
        policy: WaitPolicy,
        cancel: &CancellationToken,
    ) -> NwpResult<ValidationReport> {
        let mut requested = schedule
            .offsets
            .iter()
            .map(|&offset| locators.file_spec(offset, true))
            .collect::<NwpResult<Vec<_>>>()?;
        let validation_file = schedule
            .next
            .map(|offset| locators.file_spec(offset, false))
            .transpose()?;
        requested.extend(validation_file.iter().cloned());

        let started = Instant::now();
        let mut missing = self.probe_missing(&requested).await;

        while !missing.is_empty() {
            let WaitPolicy::Poll {
                max_wait,
                poll_interval,
            } = policy
            else {
                break;
            };

            let elapsed = started.elapsed();
            gauge!("nwp_validation_missing_files").set(missing.len() as f64);
            info!(
                missing = missing.len(),
                elapsed_secs = elapsed.as_secs(),
                max_wait_secs = max_wait.as_secs(),
                "Waiting for forecast files"
            );

            if elapsed >= max_wait {
                break;
            }
            if cancel.is_cancelled() {
                return Err(NwpError::Cancelled);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(NwpError::Cancelled),
                _ = tokio::time::sleep(poll_interval.min(max_wait - elapsed)) => {}
            }

            missing = self.probe_missing(&missing).await;
        }

        gauge!("nwp_validation_missing_files").set(missing.len() as f64);
        let report = ValidationReport::new(requested, missing, validation_file);

        if report.validation_satisfied {
            info!(files = report.requested.len(), "Cycle is available");
        } else {
            warn!(
                missing = report.missing.len(),
                offsets = ?report.missing_offsets(),
                validation_file_missing = report.validation_file_missing(),
                "Cycle is not ready"
            );
        }

        Ok(report)
    }

    /// Existence of each locator, in input order.
    ///
    /// A probe that errors counts as absent.
    pub async fn probe(&self, locators: &[Locator]) -> Vec<bool> {
        stream::iter(locators)
            .map(|locator| async move {
                match self.store.exists(locator).await {
                    Ok(present) => present,
                    Err(e) => {
                        warn!(locator = %locator, error = %e, "Existence probe failed");
                        false
                    }
                }
            })
            .buffered(self.probe_concurrency)
            .collect()
            .await
    }

    async fn probe_missing(&self, specs: &[FileSpec]) -> Vec<FileSpec> {
        let sources: Vec<Locator> = specs.iter().map(|s| s.source().clone()).collect();
        let present = self.probe(&sources).await;

        let missing: Vec<FileSpec> = specs
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(spec, _)| spec.clone())
            .collect();
        debug!(probed = specs.len(), missing = missing.len(), "Probed sources");
        missing
    }
}
