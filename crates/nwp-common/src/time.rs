//! Time handling utilities for forecast cycles.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NwpError, NwpResult};

/// Represents a valid time for meteorological data.
///
/// Combines reference time (model run time) and forecast offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidTime {
    /// Model run/reference time
    pub reference_time: DateTime<Utc>,
    /// Forecast hour offset from reference time
    pub forecast_hour: u32,
}

impl ValidTime {
    pub fn new(reference_time: DateTime<Utc>, forecast_hour: u32) -> Self {
        Self {
            reference_time,
            forecast_hour,
        }
    }

    /// Forecast offset as a duration.
    pub fn lead_time(&self) -> Duration {
        Duration::hours(i64::from(self.forecast_hour))
    }

    /// Calculate the actual valid time (reference + forecast offset)
    pub fn valid_datetime(&self) -> DateTime<Utc> {
        self.reference_time + self.lead_time()
    }
}

/// Parse an ISO 8601 cycle/reference time.
///
/// Accepts RFC 3339 (`2024-01-15T12:00:00Z`), a naive datetime assumed UTC
/// (`2024-01-15T12:00:00`), or a bare date (`2024-01-15`, 00Z).
pub fn parse_cycle(s: &str) -> NwpResult<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(&format!("{}T00:00:00", s), "%Y-%m-%dT%H:%M:%S")
    {
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(NwpError::InvalidTime(s.to_string()))
}

/// A cycle must start on the hour.
pub fn check_on_the_hour(cycle: &DateTime<Utc>) -> NwpResult<()> {
    if cycle.minute() != 0 || cycle.second() != 0 || cycle.nanosecond() != 0 {
        return Err(NwpError::InvalidCycle(format!(
            "cycle must start on the hour, got {}",
            cycle.to_rfc3339()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_cycle("2024-01-15T12:00:00Z").unwrap();
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 15);
        assert_eq!(dt.hour(), 12);
    }

    #[test]
    fn test_parse_naive_and_date_only() {
        let dt = parse_cycle("2024-01-01T06:00:00").unwrap();
        assert_eq!(dt.hour(), 6);

        let dt = parse_cycle("2024-03-02").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_cycle("yesterday"), Err(NwpError::InvalidTime(_))));
    }

    #[test]
    fn test_valid_time() {
        let vt = ValidTime::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(), 36);
        assert_eq!(
            vt.valid_datetime(),
            Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap()
        );
        assert_eq!(vt.lead_time(), Duration::hours(36));
    }

    #[test]
    fn test_on_the_hour() {
        assert!(check_on_the_hour(&Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap()).is_ok());
        assert!(check_on_the_hour(&Utc.with_ymd_and_hms(2024, 1, 1, 6, 30, 0).unwrap()).is_err());
    }
}
