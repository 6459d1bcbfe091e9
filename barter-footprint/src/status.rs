//! Open interest, funding rate and mark price status of derivative instruments.
//!
//! A [`StatusPoller`] periodically fetches status for every derivative instrument that is not
//! already freshly cached, independently of the synchronous footprint update cycle.

use crate::{error::ProviderError, series::SeriesId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

/// Identifier markers of instruments that carry open interest and funding data.
pub const DERIVATIVE_MARKERS: [&str; 3] = ["PERP", "SWAP", "FUTURES"];

/// Determine if `id` names a derivative instrument.
pub fn is_derivative(id: &SeriesId) -> bool {
    let id = id.as_str().to_ascii_uppercase();
    DERIVATIVE_MARKERS.iter().any(|marker| id.contains(marker))
}

/// Latest status snapshot of one derivative instrument.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct InstrumentStatus {
    pub open_interest: f64,
    pub funding_rate: Option<f64>,
    pub mark_price: Option<f64>,
    pub time: DateTime<Utc>,
}

#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn fetch_status(&self, id: &SeriesId) -> Result<InstrumentStatus, ProviderError>;
}

#[derive(Copy, Clone, Debug)]
struct StatusEntry {
    status: InstrumentStatus,
    fetched_at: Instant,
}

/// TTL cache of [`InstrumentStatus`] bounded to `capacity` instruments.
#[derive(Debug)]
pub struct StatusCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<FnvHashMap<SeriesId, StatusEntry>>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 1000)
    }
}

impl StatusCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fresh status of `id`, if any.
    pub fn get(&self, id: &SeriesId) -> Option<InstrumentStatus> {
        self.get_at(id, Instant::now())
    }

    pub fn is_fresh(&self, id: &SeriesId) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&self, id: SeriesId, status: InstrumentStatus) {
        self.insert_at(id, status, Instant::now())
    }

    /// Drop the status of `id`, returning `true` if one was cached.
    pub fn remove(&self, id: &SeriesId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Drop the status of every instrument not in `instruments`, returning how many were dropped.
    pub fn retain_instruments(&self, instruments: &[SeriesId]) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|id, _| instruments.contains(id));
        before - entries.len()
    }

    pub(crate) fn get_at(&self, id: &SeriesId, now: Instant) -> Option<InstrumentStatus> {
        self.entries
            .lock()
            .get(id)
            .filter(|entry| now.saturating_duration_since(entry.fetched_at) < self.ttl)
            .map(|entry| entry.status)
    }

    /// Insert `status`, first evicting expired entries and then the oldest entry if the cache
    /// is still full.
    pub(crate) fn insert_at(&self, id: SeriesId, status: InstrumentStatus, now: Instant) {
        let mut entries = self.entries.lock();

        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, entry| now.saturating_duration_since(entry.fetched_at) < ttl);

            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.fetched_at)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    debug!(series = %oldest, "status cache full, evicting oldest entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            id,
            StatusEntry {
                status,
                fetched_at: now,
            },
        );
    }
}

/// Fetch status for every derivative in `instruments` not already freshly cached.
///
/// Fetches run concurrently. Failures are logged and leave the instrument absent. Returns the
/// number of instruments successfully refreshed.
pub async fn poll_once(
    provider: &dyn StatusProvider,
    cache: &StatusCache,
    instruments: &[SeriesId],
) -> usize {
    let due = instruments
        .iter()
        .filter(|id| is_derivative(id) && !cache.is_fresh(id))
        .collect::<Vec<_>>();

    if due.is_empty() {
        return 0;
    }

    let results = join_all(
        due.into_iter()
            .map(|id| async move { (id, provider.fetch_status(id).await) }),
    )
    .await;

    results
        .into_iter()
        .filter_map(|(id, result)| match result {
            Ok(status) => {
                cache.insert(id.clone(), status);
                Some(())
            }
            Err(error) => {
                warn!(series = %id, %error, transient = error.is_transient(), "status fetch failed");
                None
            }
        })
        .count()
}

/// Spawns the throttled status polling task.
#[derive(Debug)]
pub struct StatusPoller;

impl StatusPoller {
    /// Poll `provider` every `period` for the instruments set on the returned handle.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(
        provider: Arc<dyn StatusProvider>,
        cache: Arc<StatusCache>,
        period: Duration,
    ) -> StatusPollerHandle {
        let (instruments_tx, mut instruments_rx) = watch::channel(Vec::<SeriesId>::new());

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Plain borrow leaves changes unseen for the branch below
                        let instruments = instruments_rx.borrow().clone();
                        let refreshed = poll_once(provider.as_ref(), &cache, &instruments).await;
                        if refreshed > 0 {
                            debug!(refreshed, "refreshed instrument status");
                        }
                    }
                    changed = instruments_rx.changed() => {
                        if changed.is_err() {
                            debug!("status poller shutting down");
                            break;
                        }

                        let dropped = cache.retain_instruments(&instruments_rx.borrow());
                        if dropped > 0 {
                            debug!(dropped, "dropped status of untracked instruments");
                        }
                    }
                }
            }
        });

        StatusPollerHandle {
            instruments: Some(instruments_tx),
            task: Some(task),
        }
    }
}

/// Control handle of a running [`StatusPoller`]. Dropping it aborts the task.
#[derive(Debug)]
pub struct StatusPollerHandle {
    instruments: Option<watch::Sender<Vec<SeriesId>>>,
    task: Option<JoinHandle<()>>,
}

impl StatusPollerHandle {
    /// Replace the set of instruments polled from the next tick onwards.
    ///
    /// Cached status of instruments left out of `instruments` is dropped.
    pub fn set_instruments(&self, instruments: Vec<SeriesId>) {
        if let Some(sender) = &self.instruments {
            sender.send_replace(instruments);
        }
    }

    /// Stop polling once any in flight fetches complete.
    pub async fn shutdown(mut self) {
        // Closing the watch channel ends the polling loop
        self.instruments.take();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "status poller task failed");
            }
        }
    }
}

impl Drop for StatusPollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status(open_interest: f64) -> InstrumentStatus {
        InstrumentStatus {
            open_interest,
            funding_rate: Some(0.0001),
            mark_price: Some(100.0),
            time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[derive(Debug, Default)]
    struct MockProvider {
        calls: Mutex<Vec<SeriesId>>,
    }

    impl MockProvider {
        fn calls(&self) -> Vec<SeriesId> {
            let mut calls = self.calls.lock().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl StatusProvider for MockProvider {
        async fn fetch_status(&self, id: &SeriesId) -> Result<InstrumentStatus, ProviderError> {
            self.calls.lock().push(id.clone());
            if id.as_str().starts_with("DOWN") {
                Err(ProviderError::Unavailable("maintenance".to_string()))
            } else {
                Ok(status(42.0))
            }
        }
    }

    #[test]
    fn test_is_derivative() {
        struct TestCase {
            input: &'static str,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: perpetual
                input: "BTCUSDT-PERP",
                expected: true,
            },
            TestCase {
                // TC1: swap, lowercase
                input: "eth-usd-swap",
                expected: true,
            },
            TestCase {
                // TC2: dated futures
                input: "BTC-FUTURES-250328",
                expected: true,
            },
            TestCase {
                // TC3: spot
                input: "BTC-USDT",
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = is_derivative(&SeriesId::new(test.input));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_status_cache_ttl() {
        let cache = StatusCache::new(Duration::from_secs(30), 10);
        let start = Instant::now();
        let id = SeriesId::new("BTC-PERP");

        cache.insert_at(id.clone(), status(1.0), start);

        assert_eq!(cache.get_at(&id, start + Duration::from_secs(29)), Some(status(1.0)));
        assert_eq!(cache.get_at(&id, start + Duration::from_secs(30)), None);
    }

    #[test]
    fn test_status_cache_evicts_expired_then_oldest() {
        let cache = StatusCache::new(Duration::from_secs(30), 2);
        let start = Instant::now();

        cache.insert_at(SeriesId::new("A-PERP"), status(1.0), start);
        cache.insert_at(SeriesId::new("B-PERP"), status(2.0), start + Duration::from_secs(20));

        // A has expired by now and is evicted first
        let now = start + Duration::from_secs(40);
        cache.insert_at(SeriesId::new("C-PERP"), status(3.0), now);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&SeriesId::new("A-PERP"), now), None);
        assert!(cache.get_at(&SeriesId::new("B-PERP"), now).is_some());

        // Nothing expired, so the oldest (B) goes
        let now = start + Duration::from_secs(41);
        cache.insert_at(SeriesId::new("D-PERP"), status(4.0), now);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at(&SeriesId::new("B-PERP"), now), None);
        assert!(cache.get_at(&SeriesId::new("C-PERP"), now).is_some());
        assert!(cache.get_at(&SeriesId::new("D-PERP"), now).is_some());
    }

    #[test]
    fn test_status_cache_remove_and_retain() {
        let cache = StatusCache::default();
        for id in ["A-PERP", "B-PERP", "C-SWAP"] {
            cache.insert(SeriesId::new(id), status(1.0));
        }

        assert!(cache.remove(&SeriesId::new("A-PERP")));
        assert!(!cache.remove(&SeriesId::new("A-PERP")));

        assert_eq!(cache.retain_instruments(&[SeriesId::new("C-SWAP")]), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_fresh(&SeriesId::new("C-SWAP")));
    }

    #[tokio::test]
    async fn test_poll_once_fetches_due_derivatives_only() {
        let provider = MockProvider::default();
        let cache = StatusCache::default();
        cache.insert(SeriesId::new("FRESH-PERP"), status(7.0));

        let instruments = ["BTC-PERP", "BTC-USDT", "FRESH-PERP", "DOWN-SWAP"]
            .into_iter()
            .map(SeriesId::new)
            .collect::<Vec<_>>();

        let refreshed = poll_once(&provider, &cache, &instruments).await;

        assert_eq!(refreshed, 1);
        assert_eq!(
            provider.calls(),
            vec![SeriesId::new("BTC-PERP"), SeriesId::new("DOWN-SWAP")]
        );
        assert_eq!(cache.get(&SeriesId::new("BTC-PERP")), Some(status(42.0)));
        assert_eq!(cache.get(&SeriesId::new("FRESH-PERP")), Some(status(7.0)));
        assert_eq!(cache.get(&SeriesId::new("DOWN-SWAP")), None);
    }

    #[tokio::test]
    async fn test_poller_refreshes_and_shuts_down() {
        let provider = Arc::new(MockProvider::default());
        let cache = Arc::new(StatusCache::default());
        let handle = StatusPoller::spawn(provider.clone(), cache.clone(), Duration::from_millis(10));

        handle.set_instruments(vec![SeriesId::new("ETH-USD-SWAP"), SeriesId::new("DOWN-PERP")]);

        let refreshed = tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.is_fresh(&SeriesId::new("ETH-USD-SWAP")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();

        // Failing instrument was attempted without stopping the poller
        assert!(provider.calls().contains(&SeriesId::new("DOWN-PERP")));
    }

    #[tokio::test]
    async fn test_poller_drops_status_of_removed_instruments() {
        let provider = Arc::new(MockProvider::default());
        let cache = Arc::new(StatusCache::default());
        let handle = StatusPoller::spawn(provider, cache.clone(), Duration::from_secs(3600));

        cache.insert(SeriesId::new("BTC-PERP"), status(1.0));
        cache.insert(SeriesId::new("ETH-PERP"), status(2.0));
        handle.set_instruments(vec![SeriesId::new("ETH-PERP")]);

        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            while cache.get(&SeriesId::new("BTC-PERP")).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(dropped.is_ok());
        assert!(cache.is_fresh(&SeriesId::new("ETH-PERP")));

        handle.shutdown().await;
    }
}
