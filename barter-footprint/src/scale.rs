use crate::aggregator::AggregatedBar;
use itertools::Itertools;
use std::collections::VecDeque;

/// Default number of positive cell volumes retained.
pub const DEFAULT_COLOR_SAMPLES: usize = 1000;

/// Bounds are only derived once the buffer holds more samples than this.
pub const MIN_SAMPLES: usize = 10;

/// Intensity returned for anything below the lower bound or without usable bounds.
pub const INTENSITY_FLOOR: f64 = 0.1;

const LOWER_QUANTILE: f64 = 0.05;
const UPPER_QUANTILE: f64 = 0.95;

/// Maps cell volume to a rendering intensity in `[0.1, 1.0]` using the 5th and 95th
/// percentiles of a FIFO window of recent positive volumes.
#[derive(Clone, PartialEq, Debug)]
pub struct QuantileColorScale {
    capacity: usize,
    samples: VecDeque<f64>,
    bounds: Option<(f64, f64)>,
}

impl Default for QuantileColorScale {
    fn default() -> Self {
        Self::new(DEFAULT_COLOR_SAMPLES)
    }
}

impl QuantileColorScale {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            bounds: None,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        self.bounds
    }

    pub fn record(&mut self, volume: f64) {
        self.record_all(std::iter::once(volume));
    }

    /// Record every cell volume of `bar`.
    pub fn record_bar(&mut self, bar: &AggregatedBar) {
        self.record_all(bar.level_volumes());
    }

    /// Push each positive sample, evicting the oldest beyond capacity, then refresh the bounds.
    pub fn record_all(&mut self, volumes: impl IntoIterator<Item = f64>) {
        for volume in volumes
            .into_iter()
            .filter(|volume| volume.is_finite() && *volume > 0.0)
        {
            if self.samples.len() == self.capacity {
                self.samples.pop_front();
            }
            self.samples.push_back(volume);
        }

        self.refresh_bounds();
    }

    pub fn intensity(&self, volume: f64) -> f64 {
        match self.bounds {
            Some((lower, upper)) if upper > lower && volume > 0.0 => {
                ((volume - lower) / (upper - lower)).clamp(INTENSITY_FLOOR, 1.0)
            }
            _ => INTENSITY_FLOOR,
        }
    }

    fn refresh_bounds(&mut self) {
        if self.samples.len() <= MIN_SAMPLES {
            self.bounds = None;
            return;
        }

        let sorted = self.samples.iter().copied().sorted_by(f64::total_cmp).collect::<Vec<_>>();
        self.bounds = Some((
            percentile(&sorted, LOWER_QUANTILE),
            percentile(&sorted, UPPER_QUANTILE),
        ));
    }
}

/// Sample at position `floor(len * quantile)`, clamped to the last index. `sorted` is non empty.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    let position = ((sorted.len() as f64 * quantile).floor() as usize).min(sorted.len() - 1);
    sorted[position]
}
