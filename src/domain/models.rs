use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const DEFAULT_TARGET: u64 = 10_000;
pub const MAX_TARGET: u64 = 100_000;
pub const PACER_SOURCE: &str = "pacer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MinuteOfDay(u16);

impl MinuteOfDay {
    pub fn from_minutes(minutes: u16) -> Result<Self, String> {
        if minutes >= MINUTES_PER_DAY {
            return Err(format!("minute of day must be < {MINUTES_PER_DAY}, got {minutes}"));
        }
        Ok(Self(minutes))
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let (hour, minute) = parse_hhmm(value).ok_or_else(|| format!("'{value}' must be HH:MM"))?;
        Self::from_minutes(u16::from(hour) * 60 + u16::from(minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for MinuteOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl TryFrom<String> for MinuteOfDay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MinuteOfDay> for String {
    fn from(value: MinuteOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    pub target: u64,
    pub active_from: MinuteOfDay,
    pub active_to: MinuteOfDay,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            active_from: MinuteOfDay(6 * 60),
            active_to: MinuteOfDay(22 * 60),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<(), String> {
        if self.active_from.minutes() >= MINUTES_PER_DAY || self.active_to.minutes() >= MINUTES_PER_DAY {
            return Err("options.active_from/active_to must be within the day".to_string());
        }
        if self.active_from >= self.active_to {
            return Err(format!(
                "options.active_from ({}) must be before options.active_to ({})",
                self.active_from, self.active_to
            ));
        }
        if self.target > MAX_TARGET {
            return Err(format!("options.target must be <= {MAX_TARGET}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub last_execution: DateTime<Utc>,
    pub last_added_count: u64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            last_execution: DateTime::<Utc>::UNIX_EPOCH,
            last_added_count: 0,
        }
    }
}

impl RunState {
    pub fn has_run(&self) -> bool {
        self.last_execution > DateTime::<Utc>::UNIX_EPOCH
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Window {
    pub day_start: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partition {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub count: u64,
}

impl Partition {
    pub fn validate(&self) -> Result<(), String> {
        if self.to <= self.from {
            return Err("partition.to must be after partition.from".to_string());
        }
        Ok(())
    }

    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.from < to && from < self.to
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    pub steps_to_add: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionPlan {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.partitions.iter().map(|partition| partition.count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deficit {
    pub add_from: DateTime<Utc>,
    pub needed_steps: u64,
    pub time_remaining_minutes: f64,
    pub minutes_since_add_from: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    TooEarly,
    TooLate,
    TargetMet,
    Proceed(Deficit),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooEarly => "too_early",
            Self::TooLate => "too_late",
            Self::TargetMet => "target_met",
            Self::Proceed(_) => "proceed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceTotal {
    pub source: String,
    pub count: u64,
}

fn parse_hhmm(value: &str) -> Option<(u8, u8)> {
    let mut split = value.trim().split(':');
    let hour = split.next()?.parse::<u8>().ok()?;
    let minute = split.next()?.parse::<u8>().ok()?;
    if split.next().is_some() || hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}
