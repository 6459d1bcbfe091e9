//! Barter Footprint - Multi-Instrument Order-Flow Aggregation
//!
//! Merges per-price aggressive buy/sell volume from many independently loaded instrument series
//! into one footprint grid per reference bar, and derives rolling indicators from the same
//! series:
//! - Direct or normalized (price range rescaled) aggregation with tick quantization
//! - TTL memoized aggregation results
//! - Session and strike anchored VWAP
//! - Cumulative volume delta with daily or weekly resets
//! - Point of control and value area
//! - Quantile based colour intensity scale
//!
//! Series loading and open interest/funding status are consumed through the
//! [`SeriesProvider`](registry::SeriesProvider) and [`StatusProvider`](status::StatusProvider)
//! traits.

/// Series identifiers, bars, price level stats and the source series container.
pub mod series;

/// UTC day and week boundaries used by indicator resets.
pub mod period;

/// Nearest at-or-before time alignment.
pub mod align;

/// Multi-series grid aggregation.
pub mod aggregator;

/// TTL result cache keyed by aggregation inputs.
pub mod cache;

/// VWAP, CVD and value area indicators.
pub mod indicator;

/// Cell volume to colour intensity mapping.
pub mod scale;

/// Update cycle tying aggregation and indicators together.
pub mod engine;

/// Async loading, readiness and removal of source series.
pub mod registry;

/// Derivative status cache and throttled poller.
pub mod status;

/// Footprint configuration with environment overrides.
pub mod config;

/// All [`Error`](std::error::Error)s generated in Barter-Footprint.
pub mod error;

// Re-export commonly used types for convenience
pub use aggregator::{AggregatedBar, AggregationModel, AggregationRequest, VolumeAggregator};
pub use cache::{CacheKey, ResultCache};
pub use config::FootprintConfig;
pub use engine::{FootprintEngine, FootprintUpdate};
pub use error::{FootprintError, ProviderError};
pub use indicator::{
    cvd::CvdTracker,
    value_area::{ValueArea, ValueAreaCalculator},
    vwap::{SessionVwap, StrikeVwap, VwapState},
};
pub use period::ResetPeriod;
pub use registry::{SeriesEvent, SeriesProvider, SeriesRegistry, SeriesSubscription};
pub use scale::QuantileColorScale;
pub use series::{Bar, PriceLevelStat, SeriesId, SourceSeries};
pub use status::{
    InstrumentStatus, StatusCache, StatusPoller, StatusPollerHandle, StatusProvider,
};
