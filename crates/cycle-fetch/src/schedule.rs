//! Lead-time schedules.
//!
//! A model publishes files at a variable interval: hourly for the first few
//! days, then every three hours, and so on. A [`ScheduleRule`] captures that
//! as a table of `(start, end, step)` intervals and turns a requested horizon
//! into the exact list of lead-time offsets that must exist.

use serde::{Deserialize, Serialize};

use nwp_common::{NwpError, NwpResult};

/// One piece of a schedule: offsets in `[start, end]` spaced by `step` hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInterval {
    pub start: u32,
    pub end: u32,
    pub step: u32,
}

impl ScheduleInterval {
    pub const fn new(start: u32, end: u32, step: u32) -> Self {
        Self { start, end, step }
    }
}

/// Ordered, contiguous intervals covering `[0, max_horizon]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ScheduleInterval>", into = "Vec<ScheduleInterval>")]
pub struct ScheduleRule {
    intervals: Vec<ScheduleInterval>,
}

/// The offsets to fetch for one request, plus the validation offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadTimeSchedule {
    pub max_offset: u32,
    pub offsets: Vec<u32>,
    /// First scheduled offset past `max_offset`; `None` at the model horizon.
    pub next: Option<u32>,
}

impl ScheduleRule {
    /// Build a rule, rejecting gaps, overlaps and zero steps.
    pub fn new(intervals: Vec<ScheduleInterval>) -> NwpResult<Self> {
        let first = intervals
            .first()
            .ok_or_else(|| NwpError::InvalidSchedule("no intervals".to_string()))?;
        if first.start != 0 {
            return Err(NwpError::InvalidSchedule(format!(
                "first interval must start at 0, starts at {}",
                first.start
            )));
        }

        for (i, iv) in intervals.iter().enumerate() {
            if iv.step == 0 {
                return Err(NwpError::InvalidSchedule(format!(
                    "interval {} has a zero step",
                    i
                )));
            }
            if iv.start >= iv.end {
                return Err(NwpError::InvalidSchedule(format!(
                    "interval {} is empty: {}..{}",
                    i, iv.start, iv.end
                )));
            }
            if i > 0 && intervals[i - 1].end != iv.start {
                return Err(NwpError::InvalidSchedule(format!(
                    "interval {} starts at {} but the previous one ends at {}",
                    i,
                    iv.start,
                    intervals[i - 1].end
                )));
            }
        }

        Ok(Self { intervals })
    }

    pub fn intervals(&self) -> &[ScheduleInterval] {
        &self.intervals
    }

    /// Longest horizon the model publishes, in hours.
    pub fn max_horizon(&self) -> u32 {
        self.intervals.last().map(|iv| iv.end).unwrap_or(0)
    }

    /// Every offset the model publishes, up to its full horizon.
    pub fn generate_schedule(&self) -> Vec<u32> {
        self.walk(self.max_horizon())
    }

    /// Offsets that must exist for a request up to `max_offset` hours.
    pub fn required_offsets(&self, max_offset: u32) -> NwpResult<Vec<u32>> {
        self.check_horizon(max_offset)?;
        Ok(self.walk(max_offset))
    }

    /// The first scheduled offset after `max_offset`, used as the validation file.
    ///
    /// An unaligned `max_offset` rounds up to the next published offset.
    pub fn next_offset(&self, max_offset: u32) -> NwpResult<Option<u32>> {
        self.check_horizon(max_offset)?;
        if max_offset == self.max_horizon() {
            return Ok(None);
        }
        Ok(self
            .generate_schedule()
            .into_iter()
            .find(|&offset| offset > max_offset))
    }

    pub fn schedule(&self, max_offset: u32) -> NwpResult<LeadTimeSchedule> {
        Ok(LeadTimeSchedule {
            max_offset,
            offsets: self.required_offsets(max_offset)?,
            next: self.next_offset(max_offset)?,
        })
    }

    fn check_horizon(&self, max_offset: u32) -> NwpResult<()> {
        let model_max = self.max_horizon();
        if max_offset == 0 || max_offset > model_max {
            return Err(NwpError::InvalidHorizon {
                requested: max_offset,
                model_max,
            });
        }
        Ok(())
    }

    // Offsets continue across interval boundaries: the first offset of a new
    // interval is the next multiple of its step past the last one emitted.
    fn walk(&self, limit: u32) -> Vec<u32> {
        let mut offsets: Vec<u32> = Vec::new();

        for iv in &self.intervals {
            if iv.start > limit {
                break;
            }

            let lower = match offsets.last() {
                Some(&last) => iv.start.max(last + 1),
                None => iv.start,
            };
            let upper = iv.end.min(limit);

            let mut offset = lower.div_ceil(iv.step) * iv.step;
            while offset <= upper {
                offsets.push(offset);
                offset += iv.step;
            }
        }

        offsets
    }
}

impl TryFrom<Vec<ScheduleInterval>> for ScheduleRule {
    type Error = NwpError;

    fn try_from(intervals: Vec<ScheduleInterval>) -> NwpResult<Self> {
        Self::new(intervals)
    }
}

impl From<ScheduleRule> for Vec<ScheduleInterval> {
    fn from(rule: ScheduleRule) -> Self {
        rule.intervals
    }
}
