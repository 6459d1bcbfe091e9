//! Rolling indicators derived from source series rather than the merged grid.

/// Session (UTC day) and strike (anchored) VWAP.
pub mod vwap;

/// Cumulative volume delta with daily or weekly resets.
pub mod cvd;

/// Point of control and value area of a period's volume profile.
pub mod value_area;
