use crate::{
    aggregator::{quantize, tick_size_decimal},
    error::FootprintError,
    period::ResetPeriod,
    series::{SourceSeries, decimal_from_f64},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::warn;

/// Default share of period volume enclosed by the value area.
pub const DEFAULT_VALUE_AREA_RATIO: f64 = 0.70;

/// Point of control plus value area bounds of one period's volume profile.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct ValueArea {
    pub poc: Decimal,
    pub val: Decimal,
    pub vah: Decimal,
    pub period_start: DateTime<Utc>,
    pub total_volume: Decimal,
    pub area_volume: Decimal,
    /// Number of single level expansions applied after seeding at the POC.
    pub steps: usize,
}

impl ValueArea {
    /// Expand greedily from the POC until `ratio` of the profile volume is enclosed.
    ///
    /// Each step extends into the larger neighbour, preferring the upper side on ties.
    pub fn from_profile(
        profile: &BTreeMap<Decimal, Decimal>,
        ratio: Decimal,
        period_start: DateTime<Utc>,
    ) -> Option<Self> {
        let levels = profile
            .iter()
            .map(|(price, volume)| (*price, *volume))
            .collect::<Vec<_>>();

        // max_by_key keeps the last maximum, so scan in reverse to land on the lowest price
        let (poc_index, _) = levels
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, (_, volume))| *volume)?;

        let total_volume = levels.iter().map(|(_, volume)| *volume).sum::<Decimal>();
        let target = total_volume * ratio;

        let (mut low, mut high) = (poc_index, poc_index);
        let mut area_volume = levels[poc_index].1;
        let mut steps = 0;

        while area_volume < target {
            let up = levels.get(high + 1).map(|(_, volume)| *volume);
            let down = low
                .checked_sub(1)
                .and_then(|index| levels.get(index))
                .map(|(_, volume)| *volume);

            match (up, down) {
                (Some(up), Some(down)) if up >= down => {
                    high += 1;
                    area_volume += up;
                }
                (Some(_), Some(down)) | (None, Some(down)) => {
                    low -= 1;
                    area_volume += down;
                }
                (Some(up), None) => {
                    high += 1;
                    area_volume += up;
                }
                (None, None) => break,
            }
            steps += 1;
        }

        Some(Self {
            poc: levels[poc_index].0,
            val: levels[low].0,
            vah: levels[high].0,
            period_start,
            total_volume,
            area_volume,
            steps,
        })
    }
}

/// Computes the [`ValueArea`] of the period containing a reference time across every ready
/// source series.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ValueAreaCalculator {
    period: ResetPeriod,
    tick_size: Decimal,
    ratio: Decimal,
}

impl ValueAreaCalculator {
    pub fn new(period: ResetPeriod, tick_size: f64, ratio: f64) -> Result<Self, FootprintError> {
        let ratio = decimal_from_f64(ratio)
            .filter(|value| *value > Decimal::ZERO && *value <= Decimal::ONE)
            .ok_or(FootprintError::InvalidValueAreaRatio(ratio))?;

        Ok(Self {
            period,
            tick_size: tick_size_decimal(tick_size)?,
            ratio,
        })
    }

    pub fn period(&self) -> ResetPeriod {
        self.period
    }

    /// Tick quantized `buy + sell` volume per price, over bars starting inside the period.
    pub fn volume_profile(
        &self,
        sources: &[Arc<SourceSeries>],
        reference_time: DateTime<Utc>,
    ) -> BTreeMap<Decimal, Decimal> {
        let period_start = self.period.period_start(reference_time);

        sources
            .iter()
            .filter(|source| source.is_ready())
            .flat_map(|source| source.bars.iter())
            .filter(|bar| self.period.contains(period_start, bar.time_start))
            .flat_map(|bar| bar.levels.iter())
            .fold(BTreeMap::new(), |mut profile, (price, stat)| {
                match quantize(*price, self.tick_size) {
                    Some(price) => {
                        *profile.entry(price).or_insert(Decimal::ZERO) += stat.total_volume();
                    }
                    None => warn!(%price, tick_size = %self.tick_size, "price overflows tick grid, skipping level"),
                }
                profile
            })
    }

    pub fn compute(
        &self,
        sources: &[Arc<SourceSeries>],
        reference_time: DateTime<Utc>,
    ) -> Option<ValueArea> {
        ValueArea::from_profile(
            &self.volume_profile(sources, reference_time),
            self.ratio,
            self.period.period_start(reference_time),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::test_utils::*;
    use rust_decimal_macros::dec;

    fn profile(levels: &[(Decimal, Decimal)]) -> BTreeMap<Decimal, Decimal> {
        levels.iter().copied().collect()
    }

    #[test]
    fn test_value_area_ten_level_profile() {
        let volumes = [1, 2, 3, 5, 8, 13, 8, 4, 2, 1];
        let profile = volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| (Decimal::from(100 + index), Decimal::from(*volume)))
            .collect::<BTreeMap<_, _>>();

        let area = ValueArea::from_profile(&profile, dec!(0.70), time(1, 0)).unwrap();

        assert_eq!(area.poc, dec!(105));
        assert_eq!(area.total_volume, dec!(47));
        // 13, tie 8/8 goes up, 8 > 4 down, 5 > 4 down
        assert_eq!(area.val, dec!(103));
        assert_eq!(area.vah, dec!(106));
        assert_eq!(area.area_volume, dec!(34));
        assert_eq!(area.steps, 3);
        assert!(area.area_volume >= area.total_volume * dec!(0.70));
    }

    #[test]
    fn test_value_area_tie_rules() {
        struct TestCase {
            profile: BTreeMap<Decimal, Decimal>,
            expected: (Decimal, Decimal, Decimal),
        }

        let tests = vec![
            TestCase {
                // TC0: equal neighbours extend upwards
                profile: profile(&[(dec!(1), dec!(5)), (dec!(2), dec!(10)), (dec!(3), dec!(5))]),
                expected: (dec!(2), dec!(2), dec!(3)),
            },
            TestCase {
                // TC1: POC tie resolves to the lowest price
                profile: profile(&[(dec!(1), dec!(7)), (dec!(2), dec!(1)), (dec!(3), dec!(7))]),
                expected: (dec!(1), dec!(1), dec!(3)),
            },
            TestCase {
                // TC2: single level
                profile: profile(&[(dec!(4.5), dec!(2))]),
                expected: (dec!(4.5), dec!(4.5), dec!(4.5)),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let area = ValueArea::from_profile(&test.profile, dec!(0.70), time(1, 0)).unwrap();
            assert_eq!((area.poc, area.val, area.vah), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_value_area_empty_profile() {
        assert_eq!(ValueArea::from_profile(&BTreeMap::new(), dec!(0.7), time(1, 0)), None);
    }

    #[test]
    fn test_calculator_filters_period_and_readiness() {
        let btc = series(
            "BTC",
            vec![
                bar(time(1, 12), 1.0, 2.0).with_level(dec!(100.04), stat(dec!(50), dec!(50))),
                bar(time(2, 1), 1.0, 2.0).with_level(dec!(100.04), stat(dec!(2), dec!(1))),
                bar(time(2, 3), 1.0, 2.0).with_level(dec!(100.2), stat(dec!(1), dec!(0))),
            ],
        );
        let eth = series(
            "ETH",
            vec![bar(time(2, 2), 1.0, 2.0).with_level(dec!(99.96), stat(dec!(0.5), dec!(0.5)))],
        );
        let mut pending = series(
            "PENDING",
            vec![bar(time(2, 2), 1.0, 2.0).with_level(dec!(100.2), stat(dec!(99), dec!(0)))],
        );
        pending.ready = false;
        let sources = vec![Arc::new(btc), Arc::new(eth), Arc::new(pending)];

        let calculator = ValueAreaCalculator::new(ResetPeriod::Daily, 0.1, 0.7).unwrap();

        assert_eq!(
            calculator.volume_profile(&sources, time(2, 5)),
            profile(&[(dec!(100.0), dec!(4)), (dec!(100.2), dec!(1))])
        );

        let area = calculator.compute(&sources, time(2, 5)).unwrap();
        assert_eq!(area.poc, dec!(100.0));
        assert_eq!(area.period_start, time(2, 0));
        // POC alone already holds 4 of 5
        assert_eq!((area.val, area.vah), (dec!(100.0), dec!(100.0)));
        assert_eq!(area.steps, 0);
    }

    #[test]
    fn test_calculator_skips_levels_overflowing_tick_grid() {
        let btc = series(
            "BTC",
            vec![
                bar(time(2, 1), 0.5, 2.0)
                    .with_level(dec!(0.5), stat(dec!(1), dec!(1)))
                    .with_level(dec!(1000000000), stat(dec!(7), dec!(0))),
            ],
        );

        let calculator = ValueAreaCalculator::new(ResetPeriod::Daily, 1e-20, 0.7).unwrap();

        assert_eq!(
            calculator.volume_profile(&[Arc::new(btc)], time(2, 5)),
            profile(&[(dec!(0.5), dec!(2))])
        );
    }

    #[test]
    fn test_calculator_rejects_invalid_ratio() {
        assert_eq!(
            ValueAreaCalculator::new(ResetPeriod::Daily, 0.1, 0.0),
            Err(FootprintError::InvalidValueAreaRatio(0.0))
        );
        assert!(ValueAreaCalculator::new(ResetPeriod::Daily, 0.1, 1.5).is_err());
        assert!(ValueAreaCalculator::new(ResetPeriod::Weekly, 0.0, 0.7).is_err());
    }
}
