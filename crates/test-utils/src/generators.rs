//! Locator and cycle generators.
//!
//! Tests across the workspace use the same naming so that failure output
//! reads the same everywhere: sources live in `memory://archive`, copies
//! land in `memory://mirror`.

use chrono::{DateTime, TimeZone, Utc};
use nwp_common::{Locator, Scheme};

/// Source-side locator for a lead time, e.g. `memory://archive/f003`.
pub fn archive_locator(lead: u32) -> Locator {
    Locator::remote(Scheme::Memory, "archive", format!("f{:03}", lead))
}

/// Destination-side locator for a lead time, e.g. `memory://mirror/f003`.
pub fn mirror_locator(lead: u32) -> Locator {
    Locator::remote(Scheme::Memory, "mirror", format!("f{:03}", lead))
}

/// A cycle at the given UTC hour on 2024-01-15.
pub fn cycle_at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, hour, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid cycle hour {}", hour))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locators_are_zero_padded() {
        assert_eq!(archive_locator(3).to_string(), "memory://archive/f003");
        assert_eq!(mirror_locator(120).to_string(), "memory://mirror/f120");
    }

    #[test]
    fn test_cycle_at() {
        assert_eq!(cycle_at(12).to_rfc3339(), "2024-01-15T12:00:00+00:00");
    }
}
