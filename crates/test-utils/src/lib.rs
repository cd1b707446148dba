//! Shared test utilities for the nwp-fetch workspace.
//!
//! This crate provides common testing infrastructure including:
//! - A scriptable in-process object store (`FakeStore`)
//! - Locator and cycle generators
//! - Ordering assertions
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{FakeStore, archive_locator};
//! ```

pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;

/// Assert that a sequence is strictly increasing (sorted, no duplicates).
///
/// # Usage
///
/// ```
/// use test_utils::assert_strictly_increasing;
///
/// assert_strictly_increasing!(vec![0, 1, 2, 5]);
/// ```
#[macro_export]
macro_rules! assert_strictly_increasing {
    ($seq:expr) => {{
        let seq = &$seq;
        for (i, pair) in seq.windows(2).enumerate() {
            if !(pair[0] < pair[1]) {
                panic!(
                    "assertion failed: sequence not strictly increasing at index {}: {:?} then {:?}",
                    i + 1,
                    pair[0],
                    pair[1]
                );
            }
        }
    }};
}
