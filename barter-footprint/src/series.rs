//! Source series data model.
//!
//! A [`SourceSeries`] is an ordered sequence of [`Bar`]s for one instrument, each carrying a
//! per-price [`PriceLevelStat`] breakdown of aggressive buy/sell volume.

use crate::error::FootprintError;
use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::BTreeMap,
    iter::Sum,
    ops::{Add, AddAssign},
    str::FromStr,
};

/// Unique identifier of a source series (eg/ "BTCUSDT-PERP", "ETH-USD-SWAP").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct SeriesId(pub SmolStr);

impl SeriesId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for SeriesId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Aggressive volume traded at one price level.
///
/// Volumes are [`Decimal`] so that [`PriceLevelStat::merge`] is exact, which makes it
/// commutative and associative bit-for-bit regardless of merge order.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
pub struct PriceLevelStat {
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub trade_count: u64,
    /// Always `buy_volume - sell_volume`.
    pub delta: Decimal,
}

impl PriceLevelStat {
    /// Identity element of [`PriceLevelStat::merge`].
    pub const ZERO: Self = Self {
        buy_volume: Decimal::ZERO,
        sell_volume: Decimal::ZERO,
        trade_count: 0,
        delta: Decimal::ZERO,
    };

    pub fn new(buy_volume: Decimal, sell_volume: Decimal, trade_count: u64) -> Self {
        Self {
            buy_volume,
            sell_volume,
            trade_count,
            delta: buy_volume - sell_volume,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            buy_volume: self.buy_volume + other.buy_volume,
            sell_volume: self.sell_volume + other.sell_volume,
            trade_count: self.trade_count + other.trade_count,
            delta: self.delta + other.delta,
        }
    }

    pub fn total_volume(&self) -> Decimal {
        self.buy_volume + self.sell_volume
    }

    pub fn is_valid(&self) -> bool {
        self.buy_volume >= Decimal::ZERO && self.sell_volume >= Decimal::ZERO
    }
}

impl Add for PriceLevelStat {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.merge(rhs)
    }
}

impl AddAssign for PriceLevelStat {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.merge(rhs);
    }
}

impl Sum for PriceLevelStat {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::merge)
    }
}

/// OHLC bar with a per-price volume breakdown.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Bar {
    pub time_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub levels: BTreeMap<Decimal, PriceLevelStat>,
}

impl Bar {
    pub fn new(time_start: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time_start,
            open,
            high,
            low,
            close,
            levels: BTreeMap::new(),
        }
    }

    /// Builder style helper that merges a [`PriceLevelStat`] into the level at `price`.
    pub fn with_level(mut self, price: Decimal, stat: PriceLevelStat) -> Self {
        *self.levels.entry(price).or_insert(PriceLevelStat::ZERO) += stat;
        self
    }

    /// Σ(buy + sell) across every level.
    pub fn total_volume(&self) -> Decimal {
        self.levels.values().map(PriceLevelStat::total_volume).sum()
    }

    /// Σ(buy - sell) across every level.
    pub fn total_delta(&self) -> Decimal {
        self.levels.values().map(|stat| stat.delta).sum()
    }

    /// HLC3 typical price.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// True when the bar spans a non-degenerate price range.
    pub fn has_range(&self) -> bool {
        self.high > self.low
    }

    /// Reject bars that would inject negative volume into any accumulation.
    pub fn validate(&self, series: &SeriesId) -> Result<(), FootprintError> {
        match self.levels.iter().find(|(_, stat)| !stat.is_valid()) {
            Some((price, _)) => Err(FootprintError::NegativeVolume {
                series: series.clone(),
                time: self.time_start,
                price: *price,
            }),
            None => Ok(()),
        }
    }
}

/// Time ordered [`Bar`] sequence for one instrument plus its readiness flag.
///
/// A series is `ready` once its volume breakdown is fully computed. Consumers never mutate a
/// series; they hold `Arc<SourceSeries>` snapshots handed out by the
/// [`SeriesRegistry`](crate::registry::SeriesRegistry).
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct SourceSeries {
    pub id: SeriesId,
    pub bars: Vec<Bar>,
    pub ready: bool,
    /// Data version, advanced whenever `bars` change. Cached aggregations are keyed on it.
    pub revision: u64,
}

impl SourceSeries {
    /// Series whose volume breakdown is still being computed.
    pub fn pending(id: SeriesId) -> Self {
        Self {
            id,
            bars: Vec::new(),
            ready: false,
            revision: 0,
        }
    }

    /// Construct a ready series, validating ordering and volume invariants.
    pub fn from_bars(id: SeriesId, bars: Vec<Bar>) -> Result<Self, FootprintError> {
        for bar in &bars {
            bar.validate(&id)?;
        }

        if let Some((prev, next)) = bars
            .windows(2)
            .map(|pair| (&pair[0], &pair[1]))
            .find(|(prev, next)| next.time_start < prev.time_start)
        {
            return Err(FootprintError::OutOfOrderBar {
                series: id,
                time: next.time_start,
                last: prev.time_start,
            });
        }

        Ok(Self {
            id,
            bars,
            ready: true,
            revision: 0,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn with_revision(self, revision: u64) -> Self {
        Self { revision, ..self }
    }

    /// Append a live bar, or replace the still forming bar when `bar` shares its start time.
    pub fn push_bar(&mut self, bar: Bar) -> Result<(), FootprintError> {
        bar.validate(&self.id)?;

        match self.bars.last().map(|last| last.time_start) {
            Some(last) if bar.time_start < last => {
                return Err(FootprintError::OutOfOrderBar {
                    series: self.id.clone(),
                    time: bar.time_start,
                    last,
                });
            }
            Some(last) if bar.time_start == last => {
                if let Some(forming) = self.bars.last_mut() {
                    *forming = bar;
                }
            }
            _ => self.bars.push(bar),
        }

        self.revision += 1;
        Ok(())
    }
}

/// Convert an `f64` price into a [`Decimal`] via its shortest round-trip representation, so
/// `100.05_f64` becomes exactly `100.05`.
pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }

    Decimal::from_str(&value.to_string())
        .ok()
        .or_else(|| Decimal::from_f64(value))
}

/// Lossy conversion used where indicator maths is done in `f64`.
pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use chrono::TimeZone;

    pub fn time(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap()
    }

    pub fn stat(buy: Decimal, sell: Decimal) -> PriceLevelStat {
        PriceLevelStat::new(buy, sell, 1)
    }

    pub fn bar(time_start: DateTime<Utc>, low: f64, high: f64) -> Bar {
        Bar::new(time_start, low, high, low, high)
    }

    pub fn series(id: &str, bars: Vec<Bar>) -> SourceSeries {
        SourceSeries::from_bars(SeriesId::new(id), bars).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_level_stat_merge_is_commutative_and_associative() {
        let a = PriceLevelStat::new(dec!(1.1), dec!(0.3), 2);
        let b = PriceLevelStat::new(dec!(0.2), dec!(5.7), 1);
        let c = PriceLevelStat::new(dec!(3.333), dec!(0.001), 7);

        assert_eq!(a + b, b + a);
        assert_eq!((a + b) + c, a + (b + c));
        assert_eq!(a + PriceLevelStat::ZERO, a);

        let merged = a + b + c;
        assert_eq!(merged.buy_volume, dec!(4.633));
        assert_eq!(merged.sell_volume, dec!(6.001));
        assert_eq!(merged.trade_count, 10);
        assert_eq!(merged.delta, merged.buy_volume - merged.sell_volume);
    }

    #[test]
    fn test_price_level_stat_sum() {
        let total: PriceLevelStat = vec![stat(dec!(1), dec!(2)), stat(dec!(3), dec!(0))]
            .into_iter()
            .sum();

        assert_eq!(total, PriceLevelStat::new(dec!(4), dec!(2), 2));
    }

    #[test]
    fn test_bar_totals() {
        let bar = bar(time(1, 0), 100.0, 101.0)
            .with_level(dec!(100.0), stat(dec!(2), dec!(1)))
            .with_level(dec!(100.5), stat(dec!(0.5), dec!(3)))
            .with_level(dec!(100.0), stat(dec!(1), dec!(0)));

        assert_eq!(bar.levels.len(), 2);
        assert_eq!(bar.total_volume(), dec!(7.5));
        assert_eq!(bar.total_delta(), dec!(-0.5));
        assert!((bar.typical_price() - (101.0 + 100.0 + 101.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_bars_rejects_negative_volume() {
        let bars = vec![bar(time(1, 0), 1.0, 2.0).with_level(
            dec!(1.5),
            PriceLevelStat::new(dec!(-1), dec!(0), 1),
        )];

        let result = SourceSeries::from_bars(SeriesId::new("BAD"), bars);
        assert!(matches!(result, Err(FootprintError::NegativeVolume { .. })));
    }

    #[test]
    fn test_from_bars_rejects_unordered_bars() {
        let bars = vec![bar(time(2, 0), 1.0, 2.0), bar(time(1, 0), 1.0, 2.0)];

        let result = SourceSeries::from_bars(SeriesId::new("BAD"), bars);
        assert!(matches!(result, Err(FootprintError::OutOfOrderBar { .. })));
    }

    #[test]
    fn test_push_bar_replaces_forming_bar() {
        let mut series = series("BTC", vec![bar(time(1, 0), 1.0, 2.0)]);

        series
            .push_bar(bar(time(1, 0), 1.0, 3.0).with_level(dec!(2), stat(dec!(1), dec!(0))))
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series.latest().unwrap().high, 3.0);
        assert_eq!(series.revision, 1);

        series.push_bar(bar(time(1, 1), 2.0, 3.0)).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.revision, 2);

        let error = series.push_bar(bar(time(1, 0), 2.0, 3.0)).unwrap_err();
        assert!(matches!(error, FootprintError::OutOfOrderBar { .. }));
        assert_eq!(series.revision, 2);
    }

    #[test]
    fn test_decimal_from_f64_uses_shortest_representation() {
        assert_eq!(decimal_from_f64(100.05), Some(dec!(100.05)));
        assert_eq!(decimal_from_f64(0.1), Some(dec!(0.1)));
        assert_eq!(decimal_from_f64(f64::NAN), None);
        assert_eq!(decimal_from_f64(f64::INFINITY), None);
    }
}
