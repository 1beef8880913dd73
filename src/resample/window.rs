//! Resample window widths.

use crate::{Error, Result};

use arrow_schema::TimeUnit;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MIN: i64 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MIN;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;
const NANOS_PER_WEEK: i64 = 7 * NANOS_PER_DAY;

/// Largest unit first, used when formatting.
const UNITS: &[(&str, i64)] = &[
    ("w", NANOS_PER_WEEK),
    ("d", NANOS_PER_DAY),
    ("h", NANOS_PER_HOUR),
    ("m", NANOS_PER_MIN),
    ("s", NANOS_PER_SEC),
    ("ms", NANOS_PER_MILLI),
    ("us", NANOS_PER_MICRO),
    ("ns", 1),
];

/// A strictly positive fixed window width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    nanos: i64,
}

impl Window {
    pub fn from_nanos(nanos: i64) -> Result<Self> {
        if nanos <= 0 {
            return Err(Error::MalformedRequest(format!(
                "window must be positive, got {nanos}ns"
            )));
        }
        Ok(Self { nanos })
    }

    pub fn from_secs(secs: u64) -> Result<Self> {
        let nanos = i64::try_from(secs)
            .ok()
            .and_then(|s| s.checked_mul(NANOS_PER_SEC))
            .ok_or_else(|| Error::MalformedRequest(format!("window of {secs}s is too large")))?;
        Self::from_nanos(nanos)
    }

    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    /// Width expressed in ticks of `unit`. Fails unless it divides exactly.
    pub fn in_unit(&self, unit: &TimeUnit) -> Result<i64> {
        let tick = match unit {
            TimeUnit::Second => NANOS_PER_SEC,
            TimeUnit::Millisecond => NANOS_PER_MILLI,
            TimeUnit::Microsecond => NANOS_PER_MICRO,
            TimeUnit::Nanosecond => 1,
        };
        if self.nanos % tick != 0 {
            return Err(Error::Validation(format!(
                "window {self} is not a whole number of {unit:?} ticks"
            )));
        }
        Ok(self.nanos / tick)
    }
}

/// Parse `<n><unit>`, e.g. `30s`, `5min`, `1h`.
pub fn parse_window(raw: &str) -> Result<Window> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (count, unit) = raw.split_at(split);
    if count.is_empty() {
        return Err(Error::MalformedRequest(format!(
            "window '{raw}' must start with a number"
        )));
    }

    let per_unit = match unit.trim() {
        "ns" => 1,
        "us" => NANOS_PER_MICRO,
        "ms" => NANOS_PER_MILLI,
        "s" => NANOS_PER_SEC,
        "m" | "min" | "t" => NANOS_PER_MIN,
        "h" => NANOS_PER_HOUR,
        "d" => NANOS_PER_DAY,
        "w" => NANOS_PER_WEEK,
        other => {
            return Err(Error::MalformedRequest(format!(
                "unknown window unit '{other}', expected one of ns, us, ms, s, m, min, t, h, d, w"
            )));
        }
    };

    let nanos = count
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(per_unit))
        .ok_or_else(|| Error::MalformedRequest(format!("window '{raw}' is out of range")))?;
    Window::from_nanos(nanos)
}

impl FromStr for Window {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_window(s)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (suffix, per_unit) in UNITS {
            if self.nanos % per_unit == 0 {
                return write!(f, "{}{}", self.nanos / per_unit, suffix);
            }
        }
        write!(f, "{}ns", self.nanos)
    }
}

impl Serialize for Window {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Window {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawWindow {
            Secs(u64),
            Text(String),
        }

        let window = match RawWindow::deserialize(deserializer)? {
            RawWindow::Secs(secs) => Window::from_secs(secs),
            RawWindow::Text(text) => parse_window(&text),
        };
        window.map_err(|e| serde::de::Error::custom(e.message()))
    }
}
