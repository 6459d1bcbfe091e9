use crate::{period::ResetPeriod, series::Bar};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cumulative volume delta of the primary series with periodic resets.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct CvdTracker {
    period: ResetPeriod,
    cumulative_delta: Decimal,
    last_reset_boundary: Option<DateTime<Utc>>,
}

impl CvdTracker {
    pub fn new(period: ResetPeriod) -> Self {
        Self {
            period,
            cumulative_delta: Decimal::ZERO,
            last_reset_boundary: None,
        }
    }

    /// Fold one bar's delta into the running total.
    ///
    /// A bar that opens a new period replaces the total with its own delta.
    pub fn observe(&mut self, bar: &Bar) -> Decimal {
        let delta = bar.total_delta();
        let boundary = self.period.period_start(bar.time_start);

        match self.last_reset_boundary {
            Some(last) if boundary <= last => self.cumulative_delta += delta,
            _ => {
                self.cumulative_delta = delta;
                self.last_reset_boundary = Some(boundary);
            }
        }

        self.cumulative_delta
    }

    pub fn cumulative_delta(&self) -> Decimal {
        self.cumulative_delta
    }

    pub fn last_reset_boundary(&self) -> Option<DateTime<Utc>> {
        self.last_reset_boundary
    }

    pub fn period(&self) -> ResetPeriod {
        self.period
    }
}
