//! Time alignment of independently updating source series.

use crate::series::{Bar, SourceSeries};
use chrono::{DateTime, Utc};

/// Index of the last bar in `series` starting at or before `time`.
///
/// Returns `None` when the series is not ready, is empty, or `time` precedes its first bar.
/// Requires `series.bars` to be sorted ascending by start time.
pub fn align_at_or_before(series: &SourceSeries, time: DateTime<Utc>) -> Option<usize> {
    if !series.is_ready() || series.is_empty() {
        return None;
    }

    series
        .bars
        .partition_point(|bar| bar.time_start <= time)
        .checked_sub(1)
}

/// Convenience over [`align_at_or_before`] returning the aligned [`Bar`].
pub fn aligned_bar(series: &SourceSeries, time: DateTime<Utc>) -> Option<&Bar> {
    align_at_or_before(series, time).and_then(|index| series.bars.get(index))
}
