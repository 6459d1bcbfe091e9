use crate::series::SeriesId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure reported by an external [`SeriesProvider`](crate::registry::SeriesProvider) or
/// [`StatusProvider`](crate::status::StatusProvider).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("provider returned malformed data: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Determine if retrying the same request on a later cycle may succeed.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Unavailable(_) | ProviderError::Timeout => true,
            ProviderError::Malformed(_) => false,
        }
    }
}

/// All errors generated in `barter-footprint`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FootprintError {
    #[error("invalid tick size {0}: must be finite and greater than zero")]
    InvalidTickSize(f64),

    #[error("invalid value area ratio {0}: must be within (0, 1]")]
    InvalidValueAreaRatio(f64),

    #[error("unknown source series: {0}")]
    UnknownSeries(SeriesId),

    #[error("source series not ready: {0}")]
    SeriesNotReady(SeriesId),

    #[error("negative volume in {series} bar {time} at price {price}")]
    NegativeVolume {
        series: SeriesId,
        time: DateTime<Utc>,
        price: Decimal,
    },

    #[error("out of order bar for {series}: {time} precedes last bar {last}")]
    OutOfOrderBar {
        series: SeriesId,
        time: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("provider failure for {series}: {source}")]
    Provider {
        series: SeriesId,
        source: ProviderError,
    },
}

impl FootprintError {
    /// Determine if the error only means "no data for this cycle" rather than a defect in the
    /// ingested data or configuration.
    pub fn is_data_unavailable(&self) -> bool {
        match self {
            FootprintError::SeriesNotReady(_) => true,
            FootprintError::Provider { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
