//! Multi-series footprint aggregation.
//!
//! Every ready [`SourceSeries`] is aligned to the primary series' reference bar, its price levels
//! are optionally rescaled into the reference series' price range, quantized to the tick size
//! and merged into one [`AggregatedBar`] grid.

use crate::{
    align::aligned_bar,
    cache::{CacheKey, ResultCache},
    error::FootprintError,
    series::{Bar, PriceLevelStat, SeriesId, SourceSeries, decimal_from_f64, decimal_to_f64},
};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use tracing::{debug, warn};

/// Strategy used to merge price levels of different instruments.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationModel {
    /// Merge raw prices as reported by each source.
    #[default]
    Direct,
    /// Linearly rescale each source bar's price range onto the reference series' bar range.
    Normalized,
}

impl AggregationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationModel::Direct => "direct",
            AggregationModel::Normalized => "normalized",
        }
    }
}

impl fmt::Display for AggregationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AggregationModel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(AggregationModel::Direct),
            "normalized" | "normalised" => Ok(AggregationModel::Normalized),
            other => Err(format!("unknown aggregation model: {other}")),
        }
    }
}

/// Parameters of one aggregation call.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AggregationRequest {
    /// Index of the reference bar in the primary series.
    pub reference_index: usize,
    pub model: AggregationModel,
    /// Always positive.
    pub tick_size: Decimal,
    /// Series whose bar range [`AggregationModel::Normalized`] maps onto.
    pub reference_series: Option<SeriesId>,
}

impl AggregationRequest {
    pub fn new(
        reference_index: usize,
        model: AggregationModel,
        tick_size: f64,
        reference_series: Option<SeriesId>,
    ) -> Result<Self, FootprintError> {
        Ok(Self {
            reference_index,
            model,
            tick_size: tick_size_decimal(tick_size)?,
            reference_series,
        })
    }
}

/// Validate and convert a tick size into its exact decimal form.
pub fn tick_size_decimal(tick_size: f64) -> Result<Decimal, FootprintError> {
    decimal_from_f64(tick_size)
        .filter(|tick| *tick > Decimal::ZERO)
        .ok_or(FootprintError::InvalidTickSize(tick_size))
}

/// Merged price/volume grid for one reference bar.
///
/// Built fresh by every aggregation and never mutated afterwards; shared as
/// `Arc<AggregatedBar>` by the [`ResultCache`].
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct AggregatedBar {
    /// Start time of the primary series' reference bar, `None` if it could not be resolved.
    pub reference_time: Option<DateTime<Utc>>,
    pub model: AggregationModel,
    pub primary_series: SeriesId,
    pub reference_series: Option<SeriesId>,
    pub levels: BTreeMap<Decimal, PriceLevelStat>,
}

impl AggregatedBar {
    fn empty(primary: &SeriesId, request: &AggregationRequest) -> Self {
        Self {
            reference_time: None,
            model: request.model,
            primary_series: primary.clone(),
            reference_series: request.reference_series.clone(),
            levels: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn total_volume(&self) -> Decimal {
        self.levels.values().map(PriceLevelStat::total_volume).sum()
    }

    pub fn total_delta(&self) -> Decimal {
        self.levels.values().map(|stat| stat.delta).sum()
    }

    /// Largest `buy + sell` volume of any cell.
    pub fn max_level_volume(&self) -> Option<Decimal> {
        self.levels.values().map(PriceLevelStat::total_volume).max()
    }

    /// Price with the greatest volume, lowest price on ties.
    pub fn point_of_control(&self) -> Option<Decimal> {
        self.levels
            .iter()
            .fold(None, |best: Option<(Decimal, Decimal)>, (price, stat)| {
                let volume = stat.total_volume();
                match best {
                    Some((_, best_volume)) if best_volume >= volume => best,
                    _ => Some((*price, volume)),
                }
            })
            .map(|(price, _)| price)
    }

    /// Per-cell `buy + sell` volume as `f64`, in ascending price order.
    pub fn level_volumes(&self) -> impl Iterator<Item = f64> + '_ {
        self.levels
            .values()
            .map(|stat| decimal_to_f64(stat.total_volume()))
    }
}

/// Round `price` to the nearest multiple of `tick_size`, half away from zero.
///
/// Returns `None` if the number of ticks overflows [`Decimal`].
pub fn quantize(price: Decimal, tick_size: Decimal) -> Option<Decimal> {
    if tick_size <= Decimal::ZERO {
        return Some(price);
    }

    let ticks = price
        .checked_div(tick_size)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    ticks.checked_mul(tick_size).map(|price| price.normalize())
}

/// Map `price` from `source`'s bar range onto `reference`'s bar range.
///
/// Returns `None` if either range is degenerate, in which case callers keep the raw price.
pub fn normalize_price(price: f64, source: &Bar, reference: &Bar) -> Option<f64> {
    if !source.has_range() || !reference.has_range() {
        return None;
    }

    let position = ((price - source.low) / (source.high - source.low)).clamp(0.0, 1.0);
    Some(reference.low + position * (reference.high - reference.low))
}

/// Merge the aligned bars of every ready source into a single grid.
///
/// Pure function of its inputs; source visiting order does not affect the result.
pub fn merge_sources(
    primary: &SourceSeries,
    sources: &[Arc<SourceSeries>],
    request: &AggregationRequest,
) -> AggregatedBar {
    let mut output = AggregatedBar::empty(&primary.id, request);

    let Some(reference_time) = primary
        .bars
        .get(request.reference_index)
        .map(|bar| bar.time_start)
    else {
        return output;
    };
    output.reference_time = Some(reference_time);

    let reference_bar = match (request.model, &request.reference_series) {
        (AggregationModel::Normalized, Some(reference_id)) if *reference_id == primary.id => {
            aligned_bar(primary, reference_time)
        }
        (AggregationModel::Normalized, Some(reference_id)) => sources
            .iter()
            .find(|series| &series.id == reference_id)
            .and_then(|series| aligned_bar(series, reference_time)),
        _ => None,
    };

    for source in sources.iter().filter(|source| source.is_ready()) {
        let Some(bar) = aligned_bar(source, reference_time) else {
            debug!(series = %source.id, %reference_time, "source has no bar aligned to reference time");
            continue;
        };

        for (price, stat) in &bar.levels {
            let price = match reference_bar {
                Some(reference_bar) => normalize_price(decimal_to_f64(*price), bar, reference_bar)
                    .and_then(decimal_from_f64)
                    .unwrap_or(*price),
                None => *price,
            };

            let Some(price) = quantize(price, request.tick_size) else {
                warn!(series = %source.id, %price, tick_size = %request.tick_size, "price overflows tick grid, skipping level");
                continue;
            };

            *output
                .levels
                .entry(price)
                .or_insert(PriceLevelStat::ZERO) += *stat;
        }
    }

    output
}

/// Memoizing front of [`merge_sources`].
#[derive(Clone, Debug)]
pub struct VolumeAggregator {
    cache: Arc<ResultCache>,
}

impl VolumeAggregator {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Aggregate `sources` at `request.reference_index` of `primary`, reusing a cached grid when
    /// the same key was computed within the cache TTL.
    pub fn aggregate(
        &self,
        primary: &SourceSeries,
        sources: &[Arc<SourceSeries>],
        request: &AggregationRequest,
    ) -> Arc<AggregatedBar> {
        self.aggregate_tracked(primary, sources, request).0
    }

    /// Like [`VolumeAggregator::aggregate`], also reporting whether this call computed the grid.
    pub fn aggregate_tracked(
        &self,
        primary: &SourceSeries,
        sources: &[Arc<SourceSeries>],
        request: &AggregationRequest,
    ) -> (Arc<AggregatedBar>, bool) {
        let active = sources
            .iter()
            .filter(|source| source.is_ready())
            .map(Arc::as_ref);
        let key = CacheKey::new(primary, request, active);

        let mut computed = false;
        let bar = self.cache.get_or_compute(key, || {
            computed = true;
            merge_sources(primary, sources, request)
        });

        (bar, computed)
    }
}
