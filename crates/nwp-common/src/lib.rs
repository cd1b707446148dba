//! Common types and utilities shared across nwp-fetch crates.

pub mod error;
pub mod locator;
pub mod time;

pub use error::{NwpError, NwpResult};
pub use locator::{Locator, Scheme};
pub use time::{parse_cycle, ValidTime};
