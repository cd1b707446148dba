//! Storage abstractions for nwp-fetch.
//!
//! Provides one interface over:
//! - Google Cloud Storage and S3 buckets via `object_store`
//! - In-memory buckets for tests and dry runs
//! - Local filesystem paths

pub mod handle;
pub mod object_store;

pub use self::object_store::{ObjectStorage, ObjectStorageConfig};
pub use handle::ObjectStoreHandle;
