//! Registry of asynchronously loaded [`SourceSeries`].
//!
//! Each registered series is loaded by its own tokio task through a [`SeriesProvider`]. The
//! series is excluded from aggregation until that task completes, after which consumers read
//! immutable `Arc<SourceSeries>` snapshots.

use crate::{
    cache::ResultCache,
    error::{FootprintError, ProviderError},
    series::{Bar, SeriesId, SourceSeries},
};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

/// Capacity of the [`SeriesEvent`] broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Source of historical bars with a per-price volume breakdown for one instrument.
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    async fn load_series(&self, id: &SeriesId) -> Result<Vec<Bar>, ProviderError>;
}

/// Lifecycle notification published by the [`SeriesRegistry`].
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub enum SeriesEvent {
    Ready(SeriesId),
    /// Loading failed and the series was dropped. `retryable` failures may succeed if the
    /// series is registered again later.
    Failed {
        id: SeriesId,
        reason: String,
        retryable: bool,
    },
    Updated(SeriesId),
    Removed(SeriesId),
}

#[derive(Debug)]
struct Entry {
    series: Arc<SourceSeries>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    entries: Mutex<FnvHashMap<SeriesId, Entry>>,
    cache: Arc<ResultCache>,
    events: broadcast::Sender<SeriesEvent>,
    next_generation: AtomicU64,
    next_revision: AtomicU64,
}

impl Shared {
    /// Registry wide unique data revision, so a re-registered series never reuses cache keys.
    fn next_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, event: SeriesEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn complete(&self, id: SeriesId, generation: u64, result: Result<Vec<Bar>, ProviderError>) {
        let loaded = result
            .map_err(|source| FootprintError::Provider {
                series: id.clone(),
                source,
            })
            .and_then(|bars| SourceSeries::from_bars(id.clone(), bars));

        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .get_mut(&id)
            .filter(|entry| entry.generation == generation)
        else {
            debug!(series = %id, generation, "discarding stale series load");
            return;
        };

        match loaded {
            Ok(series) => {
                info!(series = %id, bars = series.len(), "source series ready");
                entry.series = Arc::new(series.with_revision(self.next_revision()));
                entry.task = None;
                self.publish(SeriesEvent::Ready(id));
            }
            Err(error) => {
                let retryable = error.is_data_unavailable();
                warn!(series = %id, %error, retryable, "failed to load source series");
                entries.remove(&id);
                self.publish(SeriesEvent::Failed {
                    id,
                    reason: error.to_string(),
                    retryable,
                });
            }
        }
    }
}

/// Owns every registered [`SourceSeries`] and the tasks loading them.
///
/// Dropping the registry aborts all in flight loads.
pub struct SeriesRegistry {
    provider: Arc<dyn SeriesProvider>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SeriesRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesRegistry")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl SeriesRegistry {
    pub fn new(provider: Arc<dyn SeriesProvider>, cache: Arc<ResultCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            provider,
            shared: Arc::new(Shared {
                entries: Mutex::new(FnvHashMap::default()),
                cache,
                events,
                next_generation: AtomicU64::new(0),
                next_revision: AtomicU64::new(1),
            }),
        }
    }

    /// Register `id` as a pending series and spawn its load task.
    ///
    /// Returns `false` if `id` is already registered. Must be called within a tokio runtime.
    pub fn register(&self, id: SeriesId) -> bool {
        let mut entries = self.shared.entries.lock();
        if entries.contains_key(&id) {
            return false;
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn({
            let provider = Arc::clone(&self.provider);
            let shared = Arc::clone(&self.shared);
            let id = id.clone();
            async move {
                let result = provider.load_series(&id).await;
                shared.complete(id, generation, result);
            }
        });

        debug!(series = %id, generation, "registered source series");
        entries.insert(
            id.clone(),
            Entry {
                series: Arc::new(SourceSeries::pending(id)),
                generation,
                task: Some(task),
            },
        );

        true
    }

    /// Abort any in flight load of `id`, drop it and purge every cached result mentioning it.
    pub fn remove(&self, id: &SeriesId) -> bool {
        let mut entries = self.shared.entries.lock();
        let Some(entry) = entries.remove(id) else {
            return false;
        };

        if let Some(task) = entry.task {
            task.abort();
        }
        let purged = self.shared.cache.purge_series(id);
        drop(entries);

        info!(series = %id, purged, "removed source series");
        self.shared.publish(SeriesEvent::Removed(id.clone()));
        true
    }

    /// Apply a live bar to a ready series and drop cached results built from its old bars.
    pub fn push_bar(&self, id: &SeriesId, bar: Bar) -> Result<(), FootprintError> {
        {
            let mut entries = self.shared.entries.lock();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| FootprintError::UnknownSeries(id.clone()))?;

            if !entry.series.is_ready() {
                return Err(FootprintError::SeriesNotReady(id.clone()));
            }

            let series = Arc::make_mut(&mut entry.series);
            series.push_bar(bar)?;
            series.revision = self.shared.next_revision();
            self.shared.cache.purge_series(id);
        }

        self.shared.publish(SeriesEvent::Updated(id.clone()));
        Ok(())
    }

    /// Every registered series, ready or not, sorted by id.
    pub fn snapshot(&self) -> Vec<Arc<SourceSeries>> {
        let mut snapshot = self
            .shared
            .entries
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.series))
            .collect::<Vec<_>>();

        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub fn series(&self, id: &SeriesId) -> Option<Arc<SourceSeries>> {
        self.shared
            .entries
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.series))
    }

    pub fn is_ready(&self, id: &SeriesId) -> bool {
        self.shared
            .entries
            .lock()
            .get(id)
            .is_some_and(|entry| entry.series.is_ready())
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.shared.cache
    }

    pub fn subscribe(&self) -> SeriesSubscription {
        SeriesSubscription {
            receiver: self.shared.events.subscribe(),
        }
    }
}

impl Drop for SeriesRegistry {
    fn drop(&mut self) {
        self.shared
            .entries
            .lock()
            .values_mut()
            .filter_map(|entry| entry.task.take())
            .for_each(|task| task.abort());
    }
}

/// Handle receiving [`SeriesEvent`]s. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SeriesSubscription {
    receiver: broadcast::Receiver<SeriesEvent>,
}

impl SeriesSubscription {
    /// Next event, or `None` once the registry and all its load tasks are gone.
    pub async fn recv(&mut self) -> Option<SeriesEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "series subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
