//! The object-store seam used by validation and transfer code.

use std::path::Path;

use async_trait::async_trait;

use nwp_common::{Locator, NwpResult};

/// Minimal object store operations needed to probe and move forecast files.
///
/// Implementations must be safe to share between concurrent workers.
#[async_trait]
pub trait ObjectStoreHandle: Send + Sync {
    /// Check if an object exists. A missing object is `Ok(false)`, not an error.
    async fn exists(&self, locator: &Locator) -> NwpResult<bool>;

    /// Download an object to a local file, returning bytes transferred.
    async fn get(&self, locator: &Locator, dest: &Path) -> NwpResult<u64>;

    /// Upload a local file to an object, returning bytes transferred.
    async fn put(&self, src: &Path, locator: &Locator) -> NwpResult<u64>;

    /// Copy between any two locators, returning bytes transferred.
    async fn copy(&self, from: &Locator, to: &Locator) -> NwpResult<u64>;

    /// List objects (or files) under a prefix.
    async fn list(&self, prefix: &Locator) -> NwpResult<Vec<Locator>>;

    /// Delete an object.
    async fn delete(&self, locator: &Locator) -> NwpResult<()>;

    /// Move one file from `src` to `dst`, picking get, put or copy by locator kind.
    async fn transfer(&self, src: &Locator, dst: &Locator) -> NwpResult<u64> {
        match (src, dst) {
            (Locator::Remote { .. }, Locator::Local(path)) => self.get(src, path).await,
            (Locator::Local(path), Locator::Remote { .. }) => self.put(path, dst).await,
            _ => self.copy(src, dst).await,
        }
    }
}
