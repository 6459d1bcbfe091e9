//! Runtime configuration of the footprint engine, status cache and poller.

use crate::{
    aggregator::{AggregationModel, tick_size_decimal},
    error::FootprintError,
    indicator::value_area::DEFAULT_VALUE_AREA_RATIO,
    period::ResetPeriod,
    scale::DEFAULT_COLOR_SAMPLES,
    series::SeriesId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_TICK_SIZE: f64 = 0.1;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_STATUS_CAPACITY: usize = 1000;
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Footprint configuration.
///
/// Defaults match the documented behaviour; override with the `with_*` builders or load from
/// `FOOTPRINT_*` environment variables via [`FootprintConfig::from_env`].
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct FootprintConfig {
    pub model: AggregationModel,
    /// Series whose bar range [`AggregationModel::Normalized`] maps onto.
    pub reference_series: Option<SeriesId>,
    pub tick_size: f64,
    pub poc_period: ResetPeriod,
    pub cvd_period: ResetPeriod,
    pub value_area_ratio: f64,
    pub cache_ttl: Duration,
    pub status_ttl: Duration,
    pub status_capacity: usize,
    pub status_interval: Duration,
    pub color_scale_capacity: usize,
}

impl Default for FootprintConfig {
    fn default() -> Self {
        Self {
            model: AggregationModel::default(),
            reference_series: None,
            tick_size: DEFAULT_TICK_SIZE,
            poc_period: ResetPeriod::Daily,
            cvd_period: ResetPeriod::Daily,
            value_area_ratio: DEFAULT_VALUE_AREA_RATIO,
            cache_ttl: DEFAULT_CACHE_TTL,
            status_ttl: DEFAULT_STATUS_TTL,
            status_capacity: DEFAULT_STATUS_CAPACITY,
            status_interval: DEFAULT_STATUS_INTERVAL,
            color_scale_capacity: DEFAULT_COLOR_SAMPLES,
        }
    }
}

impl FootprintConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `FOOTPRINT_*` environment variables, falling back to defaults for anything
    /// missing or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key/value source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|value| value.trim().parse().ok())
        }

        let default = Self::default();
        let seconds = |key| parsed::<u64>(&lookup, key).map(Duration::from_secs);

        Self {
            model: parsed(&lookup, "FOOTPRINT_MODEL").unwrap_or(default.model),
            reference_series: lookup("FOOTPRINT_REFERENCE_SERIES")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("none"))
                .map(SeriesId::new),
            tick_size: parsed(&lookup, "FOOTPRINT_TICK_SIZE").unwrap_or(default.tick_size),
            poc_period: parsed(&lookup, "FOOTPRINT_POC_PERIOD").unwrap_or(default.poc_period),
            cvd_period: parsed(&lookup, "FOOTPRINT_CVD_PERIOD").unwrap_or(default.cvd_period),
            value_area_ratio: parsed(&lookup, "FOOTPRINT_VALUE_AREA_RATIO")
                .unwrap_or(default.value_area_ratio),
            cache_ttl: seconds("FOOTPRINT_CACHE_TTL_SECS").unwrap_or(default.cache_ttl),
            status_ttl: seconds("FOOTPRINT_STATUS_TTL_SECS").unwrap_or(default.status_ttl),
            status_capacity: parsed(&lookup, "FOOTPRINT_STATUS_CAPACITY")
                .unwrap_or(default.status_capacity),
            status_interval: seconds("FOOTPRINT_STATUS_INTERVAL_SECS")
                .unwrap_or(default.status_interval),
            color_scale_capacity: parsed(&lookup, "FOOTPRINT_COLOR_SAMPLES")
                .unwrap_or(default.color_scale_capacity),
        }
    }

    pub fn with_model(mut self, model: AggregationModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_reference_series(mut self, reference_series: Option<SeriesId>) -> Self {
        self.reference_series = reference_series;
        self
    }

    pub fn with_tick_size(mut self, tick_size: f64) -> Self {
        self.tick_size = tick_size;
        self
    }

    pub fn with_poc_period(mut self, period: ResetPeriod) -> Self {
        self.poc_period = period;
        self
    }

    pub fn with_cvd_period(mut self, period: ResetPeriod) -> Self {
        self.cvd_period = period;
        self
    }

    pub fn with_value_area_ratio(mut self, ratio: f64) -> Self {
        self.value_area_ratio = ratio;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.status_capacity = capacity;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_color_scale_capacity(mut self, capacity: usize) -> Self {
        self.color_scale_capacity = capacity;
        self
    }

    pub fn tick_size_decimal(&self) -> Result<Decimal, FootprintError> {
        tick_size_decimal(self.tick_size)
    }

    pub fn validate(&self) -> Result<(), FootprintError> {
        self.tick_size_decimal()?;

        if !(self.value_area_ratio > 0.0 && self.value_area_ratio <= 1.0) {
            return Err(FootprintError::InvalidValueAreaRatio(self.value_area_ratio));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = FootprintConfig::from_lookup(lookup(&[]));

        assert_eq!(config, FootprintConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = FootprintConfig::from_lookup(lookup(&[
            ("FOOTPRINT_MODEL", "Normalized"),
            ("FOOTPRINT_REFERENCE_SERIES", " BTCUSDT-PERP "),
            ("FOOTPRINT_TICK_SIZE", "0.5"),
            ("FOOTPRINT_POC_PERIOD", "weekly"),
            ("FOOTPRINT_CVD_PERIOD", "w"),
            ("FOOTPRINT_VALUE_AREA_RATIO", "0.68"),
            ("FOOTPRINT_CACHE_TTL_SECS", "5"),
            ("FOOTPRINT_STATUS_TTL_SECS", "15"),
            ("FOOTPRINT_STATUS_CAPACITY", "64"),
            ("FOOTPRINT_STATUS_INTERVAL_SECS", "2"),
            ("FOOTPRINT_COLOR_SAMPLES", "250"),
        ]));

        let expected = FootprintConfig::default()
            .with_model(AggregationModel::Normalized)
            .with_reference_series(Some(SeriesId::new("BTCUSDT-PERP")))
            .with_tick_size(0.5)
            .with_poc_period(ResetPeriod::Weekly)
            .with_cvd_period(ResetPeriod::Weekly)
            .with_value_area_ratio(0.68)
            .with_cache_ttl(Duration::from_secs(5))
            .with_status_ttl(Duration::from_secs(15))
            .with_status_capacity(64)
            .with_status_interval(Duration::from_secs(2))
            .with_color_scale_capacity(250);

        assert_eq!(config, expected);
    }

    #[test]
    fn test_from_lookup_ignores_unparsable_values() {
        let config = FootprintConfig::from_lookup(lookup(&[
            ("FOOTPRINT_MODEL", "sideways"),
            ("FOOTPRINT_REFERENCE_SERIES", "none"),
            ("FOOTPRINT_TICK_SIZE", "tiny"),
            ("FOOTPRINT_CACHE_TTL_SECS", "-1"),
        ]));

        assert_eq!(config, FootprintConfig::default());
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            input: FootprintConfig,
            expected: Result<(), FootprintError>,
        }

        let tests = vec![
            TestCase {
                // TC0: default is valid
                input: FootprintConfig::default(),
                expected: Ok(()),
            },
            TestCase {
                // TC1: zero tick size
                input: FootprintConfig::default().with_tick_size(0.0),
                expected: Err(FootprintError::InvalidTickSize(0.0)),
            },
            TestCase {
                // TC2: ratio above one
                input: FootprintConfig::default().with_value_area_ratio(1.2),
                expected: Err(FootprintError::InvalidValueAreaRatio(1.2)),
            },
            TestCase {
                // TC3: whole profile is allowed
                input: FootprintConfig::default().with_value_area_ratio(1.0),
                expected: Ok(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.validate();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
