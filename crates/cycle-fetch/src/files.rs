//! File specifications and the offset-to-locator seam.

use chrono::{DateTime, Utc};
use serde::Serialize;

use nwp_common::{Locator, NwpResult};

/// One file to probe or move: where it comes from and where it goes.
///
/// `required == false` marks the validation file, which is probed but never
/// transferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileSpec {
    lead_time: Option<u32>,
    source: Locator,
    destination: Locator,
    required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    valid_time: Option<DateTime<Utc>>,
}

impl FileSpec {
    /// A forecast file at a lead-time offset.
    pub fn for_offset(lead_time: u32, source: Locator, destination: Locator, required: bool) -> Self {
        Self {
            lead_time: Some(lead_time),
            source,
            destination,
            required,
            valid_time: None,
        }
    }

    /// A plain copy with no lead time, e.g. an output file being uploaded.
    pub fn copy(source: Locator, destination: Locator) -> Self {
        Self {
            lead_time: None,
            source,
            destination,
            required: true,
            valid_time: None,
        }
    }

    pub fn with_valid_time(mut self, valid_time: DateTime<Utc>) -> Self {
        self.valid_time = Some(valid_time);
        self
    }

    pub fn lead_time(&self) -> Option<u32> {
        self.lead_time
    }

    pub fn source(&self) -> &Locator {
        &self.source
    }

    pub fn destination(&self) -> &Locator {
        &self.destination
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn valid_time(&self) -> Option<DateTime<Utc>> {
        self.valid_time
    }
}

/// Maps lead-time offsets to concrete locations for one cycle.
pub trait LocatorBuilder: Send + Sync {
    fn source(&self, offset: u32) -> NwpResult<Locator>;

    fn destination(&self, offset: u32) -> NwpResult<Locator>;

    /// Valid time of the file at `offset`, when the builder knows the cycle.
    fn valid_time(&self, _offset: u32) -> Option<DateTime<Utc>> {
        None
    }

    fn file_spec(&self, offset: u32, required: bool) -> NwpResult<FileSpec> {
        let spec = FileSpec::for_offset(
            offset,
            self.source(offset)?,
            self.destination(offset)?,
            required,
        );
        Ok(match self.valid_time(offset) {
            Some(t) => spec.with_valid_time(t),
            None => spec,
        })
    }
}
