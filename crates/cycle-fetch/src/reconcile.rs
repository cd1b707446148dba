//! Merging per-lead-time payloads onto one time axis.
//!
//! Each decoded file carries the cycle's reference time, which is identical
//! across the cycle, and usually a lead time. Some also carry a "valid" time.
//! The output axis is the realized time, reference + lead, computed here
//! rather than read from the payload.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use nwp_common::{NwpError, NwpResult};

/// Time metadata as decoded from one payload.
#[derive(Debug, Clone)]
pub struct PayloadTimes<P> {
    pub reference_time: DateTime<Utc>,
    pub lead_time: Option<Duration>,
    pub valid_time: Option<DateTime<Utc>>,
    pub payload: P,
}

impl<P> PayloadTimes<P> {
    pub fn new(reference_time: DateTime<Utc>, lead_hours: i64, payload: P) -> Self {
        Self {
            reference_time,
            lead_time: Some(Duration::hours(lead_hours)),
            valid_time: None,
            payload,
        }
    }

    pub fn with_valid_time(mut self, valid_time: DateTime<Utc>) -> Self {
        self.valid_time = Some(valid_time);
        self
    }
}

/// One entry of the reconciled series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSample<P> {
    /// Reference time of the source cycle, kept as provenance.
    pub nominal_time: DateTime<Utc>,
    pub realized_time: DateTime<Utc>,
    /// The payload's own valid time disagreed and was replaced.
    pub valid_time_corrected: bool,
    pub payload: P,
}

/// Order payloads by realized time, one sample per time.
///
/// Fails with `DuplicateTimeConflict` when two inputs land on the same time
/// (indices refer to input positions) and with `InvalidTime` when a payload
/// has a negative lead or no usable time at all.
pub fn reconcile<P>(inputs: Vec<PayloadTimes<P>>) -> NwpResult<Vec<TimeSample<P>>> {
    let mut indexed = inputs
        .into_iter()
        .enumerate()
        .map(|(index, times)| realize(times).map(|sample| (index, sample)))
        .collect::<NwpResult<Vec<_>>>()?;

    indexed.sort_by_key(|(index, sample)| (sample.realized_time, *index));

    for pair in indexed.windows(2) {
        let (first, a) = &pair[0];
        let (second, b) = &pair[1];
        if a.realized_time == b.realized_time {
            return Err(NwpError::DuplicateTimeConflict {
                realized_time: a.realized_time,
                first: *first,
                second: *second,
            });
        }
    }

    debug!(samples = indexed.len(), "Reconciled time axis");
    Ok(indexed.into_iter().map(|(_, sample)| sample).collect())
}

/// The realized times of a reconciled series.
pub fn time_axis<P>(samples: &[TimeSample<P>]) -> Vec<DateTime<Utc>> {
    samples.iter().map(|s| s.realized_time).collect()
}

fn realize<P>(times: PayloadTimes<P>) -> NwpResult<TimeSample<P>> {
    let PayloadTimes {
        reference_time,
        lead_time,
        valid_time,
        payload,
    } = times;

    let (realized_time, valid_time_corrected) = match (lead_time, valid_time) {
        (Some(lead), _) if lead < Duration::zero() => {
            return Err(NwpError::InvalidTime(format!(
                "negative lead time {}h from {}",
                lead.num_hours(),
                reference_time
            )));
        }
        (Some(lead), given) => {
            let computed = reference_time + lead;
            let corrected = matches!(given, Some(v) if v != computed);
            if let Some(v) = given.filter(|_| corrected) {
                warn!(
                    reference_time = %reference_time,
                    lead_hours = lead.num_hours(),
                    given = %v,
                    computed = %computed,
                    "Payload valid time disagrees with reference + lead, using computed"
                );
            }
            (computed, corrected)
        }
        (None, Some(v)) => {
            if v < reference_time {
                return Err(NwpError::InvalidTime(format!(
                    "valid time {} precedes reference time {}",
                    v, reference_time
                )));
            }
            (v, false)
        }
        (None, None) => {
            return Err(NwpError::InvalidTime(format!(
                "payload from {} has neither lead time nor valid time",
                reference_time
            )));
        }
    };

    Ok(TimeSample {
        nominal_time: reference_time,
        realized_time,
        valid_time_corrected,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{assert_strictly_increasing, cycle_at};

    #[test]
    fn test_sorts_by_realized_time() {
        let cycle = cycle_at(0);
        let inputs = vec![
            PayloadTimes::new(cycle, 6, "f006"),
            PayloadTimes::new(cycle, 0, "f000"),
            PayloadTimes::new(cycle, 3, "f003"),
        ];

        let samples = reconcile(inputs).unwrap();
        let payloads: Vec<_> = samples.iter().map(|s| s.payload).collect();
        assert_eq!(payloads, vec!["f000", "f003", "f006"]);
        assert_strictly_increasing!(time_axis(&samples));
        assert!(samples.iter().all(|s| s.nominal_time == cycle));
    }

    #[test]
    fn test_duplicate_realized_time() {
        let inputs = vec![
            PayloadTimes::new(cycle_at(0), 12, 'a'),
            PayloadTimes::new(cycle_at(0), 1, 'b'),
            PayloadTimes::new(cycle_at(6), 6, 'c'),
        ];

        match reconcile(inputs) {
            Err(NwpError::DuplicateTimeConflict {
                realized_time,
                first,
                second,
            }) => {
                assert_eq!(realized_time, cycle_at(12));
                assert_eq!((first, second), (0, 2));
            }
            other => panic!("expected DuplicateTimeConflict, got {:?}", other),
        }
    }

    #[test]
    fn test_computed_time_overrides_given_valid_time() {
        let cycle = cycle_at(0);
        let inputs = vec![
            // the embedded valid time repeats the reference time
            PayloadTimes::new(cycle, 3, 3).with_valid_time(cycle),
            PayloadTimes::new(cycle, 1, 1).with_valid_time(cycle + Duration::hours(1)),
        ];

        let samples = reconcile(inputs).unwrap();
        assert_eq!(samples[0].realized_time, cycle + Duration::hours(1));
        assert!(!samples[0].valid_time_corrected);
        assert_eq!(samples[1].realized_time, cycle + Duration::hours(3));
        assert!(samples[1].valid_time_corrected);
    }

    #[test]
    fn test_valid_time_alone_is_used() {
        let cycle = cycle_at(0);
        let mut times = PayloadTimes::new(cycle, 0, ()).with_valid_time(cycle + Duration::hours(9));
        times.lead_time = None;

        let samples = reconcile(vec![times]).unwrap();
        assert_eq!(samples[0].realized_time, cycle + Duration::hours(9));
    }

    #[test]
    fn test_invalid_times_rejected() {
        let cycle = cycle_at(0);
        assert!(matches!(
            reconcile(vec![PayloadTimes::new(cycle, -3, ())]),
            Err(NwpError::InvalidTime(_))
        ));

        let mut bare = PayloadTimes::new(cycle, 0, ());
        bare.lead_time = None;
        assert!(matches!(reconcile(vec![bare]), Err(NwpError::InvalidTime(_))));
    }

    #[test]
    fn test_empty_input() {
        let samples: Vec<TimeSample<()>> = reconcile(Vec::new()).unwrap();
        assert!(samples.is_empty());
    }
}
