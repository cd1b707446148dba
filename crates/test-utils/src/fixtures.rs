//! A scriptable in-process object store.
//!
//! `FakeStore` records every call and lets a test decide, per source
//! locator, whether a transfer succeeds, fails transiently a fixed number
//! of times, fails forever, or hangs past any timeout.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nwp_common::{Locator, NwpError, NwpResult};
use storage::ObjectStoreHandle;

/// How transfers from a given source should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePlan {
    /// Fail with a retryable error this many more times, then succeed.
    Transient(u32),
    /// Always fail with a retryable error.
    AlwaysTransient,
    /// Always fail with a non-retryable error.
    Permanent,
    /// Never complete within any sensible timeout.
    Hang,
}

#[derive(Default)]
struct State {
    objects: HashMap<Locator, u64>,
    failures: HashMap<Locator, FailurePlan>,
    lost_writes: HashSet<Locator>,
    hidden_probes: HashMap<Locator, u32>,
    transfers: Vec<(Locator, Locator)>,
}

/// In-memory object store with failure injection and call counters.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
    transfer_delay: Option<Duration>,
    exists_delay: Option<Duration>,
    transfer_calls: AtomicUsize,
    exists_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    exists_in_flight: AtomicUsize,
    max_exists_in_flight: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object of the given size.
    pub fn with_object(self, locator: Locator, size: u64) -> Self {
        self.insert(locator, size);
        self
    }

    /// Seed several objects of 1 KiB each.
    pub fn with_objects(self, locators: impl IntoIterator<Item = Locator>) -> Self {
        for locator in locators {
            self.insert(locator, 1024);
        }
        self
    }

    /// Apply a failure plan to transfers reading from `source`.
    pub fn with_failure(self, source: Locator, plan: FailurePlan) -> Self {
        self.lock().failures.insert(source, plan);
        self
    }

    /// Report writes to `destination` as successful without storing them.
    pub fn losing_writes_to(self, destination: Locator) -> Self {
        self.lock().lost_writes.insert(destination);
        self
    }

    /// Make an existing object invisible to the first `probes` existence checks.
    pub fn visible_after(self, locator: Locator, probes: u32) -> Self {
        self.lock().hidden_probes.insert(locator, probes);
        self
    }

    /// Make every transfer take this long.
    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = Some(delay);
        self
    }

    /// Make every existence check take this long.
    pub fn with_exists_delay(mut self, delay: Duration) -> Self {
        self.exists_delay = Some(delay);
        self
    }

    pub fn insert(&self, locator: Locator, size: u64) {
        self.lock().objects.insert(locator, size);
    }

    pub fn contains(&self, locator: &Locator) -> bool {
        self.lock().objects.contains_key(locator)
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    /// Highest number of transfers observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of existence checks observed running at once.
    pub fn max_exists_in_flight(&self) -> usize {
        self.max_exists_in_flight.load(Ordering::SeqCst)
    }

    /// Every (source, destination) transfer attempted, in call order.
    pub fn transfers(&self) -> Vec<(Locator, Locator)> {
        self.lock().transfers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_visible(&self, locator: &Locator) -> bool {
        let mut state = self.lock();
        if let Some(remaining) = state.hidden_probes.get_mut(locator) {
            if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
        }
        state.objects.contains_key(locator)
    }

    async fn do_transfer(&self, src: &Locator, dst: &Locator) -> NwpResult<u64> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.transfer_inner(src, dst).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn transfer_inner(&self, src: &Locator, dst: &Locator) -> NwpResult<u64> {
        let plan = {
            let mut state = self.lock();
            state.transfers.push((src.clone(), dst.clone()));
            match state.failures.get_mut(src) {
                Some(FailurePlan::Transient(0)) => None,
                Some(FailurePlan::Transient(n)) => {
                    *n -= 1;
                    Some(FailurePlan::Transient(*n + 1))
                }
                Some(plan) => Some(*plan),
                None => None,
            }
        };

        if let Some(delay) = self.transfer_delay {
            tokio::time::sleep(delay).await;
        }

        match plan {
            Some(FailurePlan::Transient(_)) | Some(FailurePlan::AlwaysTransient) => {
                return Err(NwpError::StorageError(format!(
                    "connection reset while reading {}",
                    src
                )));
            }
            Some(FailurePlan::Permanent) => {
                return Err(NwpError::NotFound(src.to_string()));
            }
            Some(FailurePlan::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            }
            None => {}
        }

        let mut state = self.lock();
        let size = *state
            .objects
            .get(src)
            .ok_or_else(|| NwpError::NotFound(src.to_string()))?;
        if !state.lost_writes.contains(dst) {
            state.objects.insert(dst.clone(), size);
        }
        Ok(size)
    }
}

#[async_trait]
impl ObjectStoreHandle for FakeStore {
    async fn exists(&self, locator: &Locator) -> NwpResult<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.exists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_exists_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.exists_delay {
            tokio::time::sleep(delay).await;
        }
        let visible = self.is_visible(locator);

        self.exists_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(visible)
    }

    async fn get(&self, locator: &Locator, dest: &Path) -> NwpResult<u64> {
        self.do_transfer(locator, &Locator::local(dest)).await
    }

    async fn put(&self, src: &Path, locator: &Locator) -> NwpResult<u64> {
        self.do_transfer(&Locator::local(src), locator).await
    }

    async fn copy(&self, from: &Locator, to: &Locator) -> NwpResult<u64> {
        self.do_transfer(from, to).await
    }

    async fn list(&self, prefix: &Locator) -> NwpResult<Vec<Locator>> {
        let prefix = prefix.to_string();
        let mut found: Vec<Locator> = self
            .lock()
            .objects
            .keys()
            .filter(|l| l.to_string().starts_with(&prefix))
            .cloned()
            .collect();
        found.sort();
        Ok(found)
    }

    async fn delete(&self, locator: &Locator) -> NwpResult<()> {
        self.lock()
            .objects
            .remove(locator)
            .map(|_| ())
            .ok_or_else(|| NwpError::NotFound(locator.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::{archive_locator, mirror_locator};

    #[tokio::test]
    async fn test_transient_plan_recovers() {
        let src = archive_locator(3);
        let store = FakeStore::new()
            .with_object(src.clone(), 10)
            .with_failure(src.clone(), FailurePlan::Transient(2));

        assert!(store.copy(&src, &mirror_locator(3)).await.is_err());
        assert!(store.copy(&src, &mirror_locator(3)).await.is_err());
        assert_eq!(store.copy(&src, &mirror_locator(3)).await.unwrap(), 10);
        assert_eq!(store.transfer_calls(), 3);
        assert!(store.contains(&mirror_locator(3)));
    }

    #[tokio::test]
    async fn test_visible_after_probes() {
        let loc = archive_locator(6);
        let store = FakeStore::new()
            .with_object(loc.clone(), 1)
            .visible_after(loc.clone(), 2);

        assert!(!store.exists(&loc).await.unwrap());
        assert!(!store.exists(&loc).await.unwrap());
        assert!(store.exists(&loc).await.unwrap());
        assert_eq!(store.exists_calls(), 3);
    }

    #[tokio::test]
    async fn test_exists_delay_tracks_concurrency() {
        let store = FakeStore::new()
            .with_object(archive_locator(0), 1)
            .with_exists_delay(Duration::from_millis(10));

        let loc = archive_locator(0);
        let mirror = mirror_locator(0);
        let (a, b) = tokio::join!(store.exists(&loc), store.exists(&mirror));

        assert!(a.unwrap());
        assert!(!b.unwrap());
        assert_eq!(store.max_exists_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_lost_write_reports_success() {
        let src = archive_locator(0);
        let dst = mirror_locator(0);
        let store = FakeStore::new()
            .with_object(src.clone(), 5)
            .losing_writes_to(dst.clone());

        assert_eq!(store.copy(&src, &dst).await.unwrap(), 5);
        assert!(!store.contains(&dst));
    }
}
