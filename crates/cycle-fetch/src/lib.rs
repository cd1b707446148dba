//! Forecast cycle retrieval.
//!
//! Works out which lead-time files a horizon needs, decides whether the
//! upstream archive has finished publishing them, moves them with a bounded
//! pool of retrying workers and orders the results by valid time.

pub mod availability;
pub mod fetcher;
pub mod files;
pub mod pool;
pub mod product;
pub mod reconcile;
pub mod schedule;

pub use availability::{AvailabilityValidator, ValidationReport, WaitPolicy};
pub use fetcher::{find_payload_files, verify, CycleFetcher, Uploader, VerificationSummary};
pub use files::{FileSpec, LocatorBuilder};
pub use pool::{
    BatchResult, CompletedTransfer, FailedTransfer, PoolConfig, TaskState, TransferEvent,
    TransferObserver, TransferTask, TransferWorkerPool,
};
pub use product::{CycleLocators, ModelDefinition};
pub use reconcile::{reconcile, time_axis, PayloadTimes, TimeSample};
pub use schedule::{LeadTimeSchedule, ScheduleInterval, ScheduleRule};
