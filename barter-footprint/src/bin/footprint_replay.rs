use async_trait::async_trait;
use barter_footprint::{
    Bar, FootprintConfig, FootprintEngine, FootprintUpdate, InstrumentStatus, PriceLevelStat,
    ProviderError, ResultCache, SeriesEvent, SeriesId, SeriesProvider, SeriesRegistry,
    StatusCache, StatusPoller, StatusProvider,
    series::{decimal_from_f64, decimal_to_f64},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use fnv::FnvHashSet;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_INSTRUMENTS: &str = "BTCUSDT-PERP,BTC-USD-SWAP,BTCUSDT";
const DEFAULT_BARS: usize = 48;
const LEVELS_PER_BAR: usize = 5;

/// Deterministic hourly bars oscillating around a per-instrument base price.
#[derive(Debug)]
struct SyntheticSeries {
    start: DateTime<Utc>,
    bars: usize,
}

impl SyntheticSeries {
    fn base_price(id: &SeriesId) -> f64 {
        let offset = id.as_str().bytes().map(f64::from).sum::<f64>() % 50.0;
        97_000.0 + offset
    }

    fn bar(&self, id: &SeriesId, index: usize) -> Bar {
        let base = Self::base_price(id);
        let phase = index as f64 / 6.0;
        let open = base + 40.0 * phase.sin();
        let close = base + 40.0 * (phase + 0.15).sin();
        let low = open.min(close) - 5.0;
        let high = open.max(close) + 5.0;
        let step = (high - low) / LEVELS_PER_BAR as f64;

        (0..LEVELS_PER_BAR)
            .filter_map(|level| {
                let price = decimal_from_f64((low + step * level as f64).round())?;
                let weight = 1.0 + ((index * 7 + level * 3) % 11) as f64;
                let buy = decimal_from_f64(weight * if close >= open { 0.6 } else { 0.4 })?;
                let sell = decimal_from_f64(weight * if close >= open { 0.4 } else { 0.6 })?;
                Some((price, PriceLevelStat::new(buy, sell, (weight as u64).max(1))))
            })
            .fold(
                Bar::new(
                    self.start + Duration::hours(index as i64),
                    open,
                    high,
                    low,
                    close,
                ),
                |bar, (price, stat)| bar.with_level(price, stat),
            )
    }
}

#[async_trait]
impl SeriesProvider for SyntheticSeries {
    async fn load_series(&self, id: &SeriesId) -> Result<Vec<Bar>, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok((0..self.bars).map(|index| self.bar(id, index)).collect())
    }
}

/// Fixed open interest and funding for every derivative instrument.
#[derive(Debug)]
struct SyntheticStatus;

#[async_trait]
impl StatusProvider for SyntheticStatus {
    async fn fetch_status(&self, id: &SeriesId) -> Result<InstrumentStatus, ProviderError> {
        Ok(InstrumentStatus {
            open_interest: 10_000.0 + SyntheticSeries::base_price(id),
            funding_rate: Some(0.0001),
            mark_price: Some(SyntheticSeries::base_price(id)),
            time: Utc::now(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ReplayLine<'a> {
    primary: &'a SeriesId,
    update: &'a FootprintUpdate,
    poc_intensity: f64,
    status: Option<InstrumentStatus>,
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = FootprintConfig::from_env();
    if let Err(error) = config.validate() {
        error!(%error, "invalid footprint configuration");
        return;
    }

    let instruments = std::env::var("FOOTPRINT_REPLAY_INSTRUMENTS")
        .unwrap_or_else(|_| DEFAULT_INSTRUMENTS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(SeriesId::new)
        .collect::<Vec<_>>();
    let Some(primary) = instruments.first().cloned() else {
        error!("no instruments configured");
        return;
    };
    let bars = std::env::var("FOOTPRINT_REPLAY_BARS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_BARS);

    info!(%primary, instruments = instruments.len(), bars, model = %config.model, "starting footprint replay");

    let cache = Arc::new(ResultCache::new(config.cache_ttl));
    let start = Utc
        .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let registry = SeriesRegistry::new(
        Arc::new(SyntheticSeries { start, bars }),
        Arc::clone(&cache),
    );

    let mut events = registry.subscribe();
    let mut pending = instruments.iter().cloned().collect::<FnvHashSet<_>>();
    for id in &instruments {
        registry.register(id.clone());
    }

    while !pending.is_empty() {
        match events.recv().await {
            Some(SeriesEvent::Ready(id)) => {
                info!(series = %id, "series ready");
                pending.remove(&id);
            }
            Some(SeriesEvent::Failed {
                id,
                reason,
                retryable,
            }) => {
                warn!(series = %id, %reason, retryable, "series failed, continuing without it");
                pending.remove(&id);
            }
            Some(_) => {}
            None => break,
        }
    }

    let status_cache = Arc::new(StatusCache::new(config.status_ttl, config.status_capacity));
    let poller = StatusPoller::spawn(
        Arc::new(SyntheticStatus),
        Arc::clone(&status_cache),
        config.status_interval,
    );
    poller.set_instruments(instruments.clone());

    let mut engine = match FootprintEngine::new(&config, primary.clone(), cache) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to build footprint engine");
            return;
        }
    };
    engine.set_strike_anchor(Some(0));

    let snapshot = registry.snapshot();
    for index in 0..bars {
        let update = engine.update(&snapshot, index);
        emit(&engine, &primary, &update, &status_cache);
    }

    // Revise the still forming last bar as a live feed would
    let forming = registry
        .series(&primary)
        .and_then(|series| series.latest().cloned())
        .and_then(|bar| {
            let price = *bar.levels.keys().next_back()?;
            Some(bar.with_level(price, PriceLevelStat::new(Decimal::new(25, 1), Decimal::ZERO, 1)))
        });
    if let Some(forming) = forming {
        match registry.push_bar(&primary, forming) {
            Ok(()) => {
                let update = engine.update(&registry.snapshot(), bars.saturating_sub(1));
                emit(&engine, &primary, &update, &status_cache);
            }
            Err(error) => warn!(%error, "failed to apply live bar"),
        }
    }

    poller.shutdown().await;
    info!(cached_status = status_cache.len(), "footprint replay complete");
}

fn emit(
    engine: &FootprintEngine,
    primary: &SeriesId,
    update: &FootprintUpdate,
    status_cache: &StatusCache,
) {
    let poc_volume = update
        .bar
        .max_level_volume()
        .map(decimal_to_f64)
        .unwrap_or_default();

    let line = ReplayLine {
        primary,
        update,
        poc_intensity: engine.color_scale().intensity(poc_volume),
        status: status_cache.get(primary),
    };

    match serde_json::to_string(&line) {
        Ok(json) => println!("{json}"),
        Err(error) => warn!(%error, "failed to serialise footprint update"),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
