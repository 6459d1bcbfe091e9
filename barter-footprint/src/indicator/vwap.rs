use crate::{
    period::ResetPeriod,
    series::{Bar, SourceSeries, decimal_to_f64},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Running volume weighted average accumulator.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct VwapState {
    pub cumulative_weighted_price: f64,
    pub cumulative_volume: f64,
    pub reset_boundary: Option<DateTime<Utc>>,
}

impl VwapState {
    /// Fold one `(price, volume)` observation into the running mean.
    ///
    /// Zero or negative volume leaves the state untouched.
    pub fn add(&mut self, price: f64, volume: f64) {
        if volume <= 0.0 || !price.is_finite() {
            return;
        }

        let total = self.cumulative_volume + volume;
        self.cumulative_weighted_price =
            (self.cumulative_weighted_price * self.cumulative_volume + price * volume) / total;
        self.cumulative_volume = total;
    }

    pub fn vwap(&self) -> Option<f64> {
        (self.cumulative_volume > 0.0).then_some(self.cumulative_weighted_price)
    }

    pub fn reset(&mut self, boundary: DateTime<Utc>) {
        *self = Self {
            reset_boundary: Some(boundary),
            ..Self::default()
        };
    }
}

/// VWAP of the primary series since 00:00 UTC.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct SessionVwap {
    state: VwapState,
}

impl SessionVwap {
    const PERIOD: ResetPeriod = ResetPeriod::Daily;

    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one bar, resetting first if it opens a new UTC day.
    ///
    /// Every call accumulates, so callers must feed each bar exactly once.
    pub fn observe(&mut self, bar: &Bar) {
        let boundary = Self::PERIOD.period_start(bar.time_start);
        if self.state.reset_boundary.is_none_or(|last| boundary > last) {
            self.state.reset(boundary);
        }

        self.state
            .add(bar.typical_price(), decimal_to_f64(bar.total_volume()));
    }

    pub fn value(&self) -> Option<f64> {
        self.state.vwap()
    }

    pub fn state(&self) -> &VwapState {
        &self.state
    }
}

/// VWAP anchored at a fixed bar index of the primary series.
///
/// Recomputed from scratch over `[anchor, current]` on every query, with no periodic reset.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct StrikeVwap {
    anchor: Option<usize>,
}

impl StrikeVwap {
    pub fn new(anchor: Option<usize>) -> Self {
        Self { anchor }
    }

    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    pub fn set_anchor(&mut self, anchor: Option<usize>) {
        self.anchor = anchor;
    }

    pub fn value(&self, series: &SourceSeries, current_index: usize) -> Option<f64> {
        let anchor = self.anchor?;
        if anchor > current_index {
            return None;
        }

        let window = series.bars.get(anchor..=current_index)?;
        let state = window.iter().fold(VwapState::default(), |mut state, bar| {
            state.add(bar.typical_price(), decimal_to_f64(bar.total_volume()));
            state
        });

        state.vwap()
    }
}
