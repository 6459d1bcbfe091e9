//! Synchronous footprint update cycle.

use crate::{
    aggregator::{AggregatedBar, AggregationRequest, VolumeAggregator},
    cache::ResultCache,
    config::FootprintConfig,
    error::FootprintError,
    indicator::{
        cvd::CvdTracker,
        value_area::{ValueArea, ValueAreaCalculator},
        vwap::{SessionVwap, StrikeVwap},
    },
    scale::QuantileColorScale,
    series::{Bar, SeriesId, SourceSeries},
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Output of one [`FootprintEngine::update`].
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct FootprintUpdate {
    pub reference_index: usize,
    pub bar: Arc<AggregatedBar>,
    pub session_vwap: Option<f64>,
    pub strike_vwap: Option<f64>,
    pub value_area: Option<ValueArea>,
    pub cumulative_delta: Decimal,
}

/// Drives aggregation and every indicator for one primary series.
#[derive(Debug)]
pub struct FootprintEngine {
    primary: SeriesId,
    request: AggregationRequest,
    aggregator: VolumeAggregator,
    session_vwap: SessionVwap,
    strike_vwap: StrikeVwap,
    cvd: CvdTracker,
    value_area: ValueAreaCalculator,
    color_scale: QuantileColorScale,
    last_observed: Option<ObservedBar>,
}

/// Last primary bar fed to the running indicators, with their state from just before it.
#[derive(Clone, Debug)]
struct ObservedBar {
    bar: Bar,
    session_vwap: SessionVwap,
    cvd: CvdTracker,
}

impl FootprintEngine {
    pub fn new(
        config: &FootprintConfig,
        primary: SeriesId,
        cache: Arc<ResultCache>,
    ) -> Result<Self, FootprintError> {
        config.validate()?;

        Ok(Self {
            request: AggregationRequest {
                reference_index: 0,
                model: config.model,
                tick_size: config.tick_size_decimal()?,
                reference_series: config.reference_series.clone(),
            },
            primary,
            aggregator: VolumeAggregator::new(cache),
            session_vwap: SessionVwap::new(),
            strike_vwap: StrikeVwap::default(),
            cvd: CvdTracker::new(config.cvd_period),
            value_area: ValueAreaCalculator::new(
                config.poc_period,
                config.tick_size,
                config.value_area_ratio,
            )?,
            color_scale: QuantileColorScale::new(config.color_scale_capacity),
            last_observed: None,
        })
    }

    pub fn primary(&self) -> &SeriesId {
        &self.primary
    }

    pub fn color_scale(&self) -> &QuantileColorScale {
        &self.color_scale
    }

    pub fn set_strike_anchor(&mut self, anchor: Option<usize>) {
        self.strike_vwap.set_anchor(anchor);
    }

    /// Run one update cycle at `reference_index` of the primary series over `snapshot`.
    ///
    /// If the primary series is absent or not ready the grid is empty and indicators keep their
    /// previous state.
    pub fn update(
        &mut self,
        snapshot: &[Arc<SourceSeries>],
        reference_index: usize,
    ) -> FootprintUpdate {
        self.request.reference_index = reference_index;

        let Some(primary) = snapshot
            .iter()
            .find(|series| series.id == self.primary && series.is_ready())
        else {
            debug!(series = %self.primary, "primary series unavailable, skipping update");
            return FootprintUpdate {
                reference_index,
                bar: Arc::new(AggregatedBar {
                    reference_time: None,
                    model: self.request.model,
                    primary_series: self.primary.clone(),
                    reference_series: self.request.reference_series.clone(),
                    levels: BTreeMap::new(),
                }),
                session_vwap: self.session_vwap.value(),
                strike_vwap: None,
                value_area: None,
                cumulative_delta: self.cvd.cumulative_delta(),
            };
        };

        let (bar, computed) = self
            .aggregator
            .aggregate_tracked(primary, snapshot, &self.request);
        if computed {
            self.color_scale.record_bar(&bar);
        }

        self.observe_new_bars(primary);

        let value_area = bar
            .reference_time
            .and_then(|time| self.value_area.compute(snapshot, time));

        FootprintUpdate {
            reference_index,
            session_vwap: self.session_vwap.value(),
            strike_vwap: self.strike_vwap.value(primary, reference_index),
            value_area,
            cumulative_delta: self.cvd.cumulative_delta(),
            bar,
        }
    }

    /// Feed every primary bar not yet observed to session VWAP and CVD.
    ///
    /// A revised last observed bar (same start time, new contents) is re-applied on top of the
    /// indicator state from before it, so revisions replace rather than add to its contribution.
    fn observe_new_bars(&mut self, primary: &SourceSeries) {
        let start = match &self.last_observed {
            Some(observed) => {
                let index = primary
                    .bars
                    .partition_point(|bar| bar.time_start < observed.bar.time_start);

                match primary.bars.get(index) {
                    Some(bar) if bar.time_start == observed.bar.time_start => {
                        if *bar == observed.bar {
                            index + 1
                        } else {
                            debug!(series = %primary.id, time = %bar.time_start, "re-applying revised bar");
                            self.session_vwap = observed.session_vwap;
                            self.cvd = observed.cvd;
                            index
                        }
                    }
                    _ => index,
                }
            }
            None => 0,
        };

        let Some((latest, earlier)) = primary.bars.get(start..).and_then(<[Bar]>::split_last)
        else {
            return;
        };

        for bar in earlier {
            self.observe(bar);
        }

        self.last_observed = Some(ObservedBar {
            bar: latest.clone(),
            session_vwap: self.session_vwap,
            cvd: self.cvd,
        });
        self.observe(latest);
    }

    fn observe(&mut self, bar: &Bar) {
        self.session_vwap.observe(bar);
        self.cvd.observe(bar);
    }
}
