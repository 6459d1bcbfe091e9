use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Recurring UTC period used for indicator resets.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPeriod {
    /// 00:00 UTC every day.
    #[default]
    Daily,
    /// Monday 00:00 UTC every week.
    Weekly,
}

impl ResetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetPeriod::Daily => "daily",
            ResetPeriod::Weekly => "weekly",
        }
    }

    /// Start of the period containing `time`.
    pub fn period_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let day_start = time
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(time);
        match self {
            ResetPeriod::Daily => day_start,
            ResetPeriod::Weekly => {
                day_start - Duration::days(i64::from(time.weekday().num_days_from_monday()))
            }
        }
    }

    /// Exclusive end of the period containing `time`.
    pub fn period_end(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        self.period_start(time) + self.length()
    }

    pub fn length(&self) -> Duration {
        match self {
            ResetPeriod::Daily => Duration::days(1),
            ResetPeriod::Weekly => Duration::weeks(1),
        }
    }

    pub fn contains(&self, period_start: DateTime<Utc>, time: DateTime<Utc>) -> bool {
        time >= period_start && time < period_start + self.length()
    }
}

impl fmt::Display for ResetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResetPeriod {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "daily" | "day" | "d" => Ok(ResetPeriod::Daily),
            "weekly" | "week" | "w" => Ok(ResetPeriod::Weekly),
            other => Err(format!("unknown reset period: {other}")),
        }
    }
}
