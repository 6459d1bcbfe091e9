//! TTL memoization of [`AggregatedBar`] computations.

use crate::{
    aggregator::{AggregatedBar, AggregationModel, AggregationRequest},
    series::{SeriesId, SourceSeries},
};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tracing::debug;

/// Default freshness window of a cached [`AggregatedBar`].
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);

/// Deterministic composite key of one aggregation.
///
/// Active sources are sorted on construction, so selection order never changes the key. Each
/// source carries its [`SourceSeries::revision`], so a grid built from superseded bars is never
/// served for newer data.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CacheKey {
    pub reference_index: usize,
    pub model: AggregationModel,
    pub tick_size: Decimal,
    pub sources: Vec<(SeriesId, u64)>,
    pub reference_series: Option<SeriesId>,
    pub primary_series: SeriesId,
    pub primary_revision: u64,
}

impl CacheKey {
    pub fn new<'a>(
        primary: &SourceSeries,
        request: &AggregationRequest,
        sources: impl IntoIterator<Item = &'a SourceSeries>,
    ) -> Self {
        Self {
            reference_index: request.reference_index,
            model: request.model,
            tick_size: request.tick_size.normalize(),
            sources: sources
                .into_iter()
                .map(|source| (source.id.clone(), source.revision))
                .sorted()
                .dedup()
                .collect(),
            reference_series: request.reference_series.clone(),
            primary_series: primary.id.clone(),
            primary_revision: primary.revision,
        }
    }

    /// True if any component of the key refers to `series`.
    pub fn mentions(&self, series: &SeriesId) -> bool {
        self.primary_series == *series
            || self.reference_series.as_ref() == Some(series)
            || self.sources.iter().any(|(id, _)| id == series)
    }
}

type Slot = Arc<OnceLock<Arc<AggregatedBar>>>;

#[derive(Debug)]
struct CacheEntry {
    slot: Slot,
    written_at: Instant,
}

/// Mutex guarded TTL cache of [`AggregatedBar`]s.
///
/// Every read-check and write-insert of the map happens inside one critical section. Expired
/// entries are evicted by scanning on each write; there is no background sweeper and no entry
/// ceiling. Each entry is a [`OnceLock`] slot so concurrent misses on the same key run the
/// compute closure once, outside the map lock.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<FnvHashMap<CacheKey, CacheEntry>>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_TTL)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Return the cached value for `key`, or run `compute` and cache its output.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Arc<AggregatedBar>
    where
        F: FnOnce() -> AggregatedBar,
    {
        self.get_or_compute_at(key, Instant::now(), compute)
    }

    pub(crate) fn get_or_compute_at<F>(
        &self,
        key: CacheKey,
        now: Instant,
        compute: F,
    ) -> Arc<AggregatedBar>
    where
        F: FnOnce() -> AggregatedBar,
    {
        let slot = {
            let mut entries = self.entries.lock();

            match entries.get(&key) {
                Some(entry) if !self.is_expired(entry, now) => Arc::clone(&entry.slot),
                _ => {
                    let ttl = self.ttl;
                    let before = entries.len();
                    entries.retain(|_, entry| now.saturating_duration_since(entry.written_at) < ttl);
                    let evicted = before - entries.len();
                    if evicted > 0 {
                        debug!(evicted, remaining = entries.len(), "evicted expired footprint cache entries");
                    }

                    let slot = Slot::default();
                    entries.insert(
                        key,
                        CacheEntry {
                            slot: Arc::clone(&slot),
                            written_at: now,
                        },
                    );
                    slot
                }
            }
        };

        Arc::clone(slot.get_or_init(|| Arc::new(compute())))
    }

    /// Remove every entry whose key mentions `series`.
    pub fn purge_series(&self, series: &SeriesId) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.mentions(series));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.written_at) >= self.ttl
    }
}
