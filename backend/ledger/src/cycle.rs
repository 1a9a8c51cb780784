//! Cycle keys — the calendar month over which votes and contributions pool.
//!
//! Every component asks [`current_cycle`] (or [`CycleKey::containing`] for a
//! historical timestamp) instead of deriving month boundaries on its own.
//! Boundaries are computed in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::LedgerError;

/// A calendar month, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleKey {
    year: i32,
    month: u32,
}

/// The cycle in effect right now.
pub fn current_cycle() -> CycleKey {
    CycleKey::current(Utc::now())
}

impl CycleKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn current(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    /// The cycle containing the unix timestamp `ts`.
    pub fn containing(ts: i64) -> Self {
        let at = Utc.timestamp_opt(ts, 0).single().unwrap_or_default();
        Self::current(at)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// First second of the month (inclusive), unix seconds.
    pub fn starts_at(&self) -> i64 {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .map(|dt| dt.timestamp())
            .unwrap_or_default()
    }

    /// First second of the following month (exclusive), unix seconds.
    pub fn ends_at(&self) -> i64 {
        self.next().starts_at()
    }

    /// Tokens for this cycle stop working on the first of the next month.
    pub fn token_expiry(&self) -> i64 {
        self.ends_at()
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.starts_at() && ts < self.ends_at()
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for CycleKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::BadRequest(format!("invalid cycle key {s:?}, expected YYYY-MM"));
        let (y, m) = s.split_once('-').ok_or_else(invalid)?;
        if y.len() != 4 || m.len() != 2 {
            return Err(invalid());
        }
        let year = y.parse().map_err(|_| invalid())?;
        let month = m.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl Serialize for CycleKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CycleKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
