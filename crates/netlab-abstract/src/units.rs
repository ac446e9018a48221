use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;
use thiserror::Error;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitParseError {
    #[error("missing numeric value in '{0}'")]
    MissingValue(String),
    #[error("invalid number in '{0}'")]
    InvalidNumber(String),
    #[error("unknown unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },
    #[error("value out of range in '{0}'")]
    OutOfRange(String),
}

/// Split `"2.5ms"` into `(2.5, "ms")`.
fn split_quantity(input: &str) -> Result<(f64, &str), UnitParseError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number = number.trim();
    if number.is_empty() {
        return Err(UnitParseError::MissingValue(input.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| UnitParseError::InvalidNumber(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(UnitParseError::OutOfRange(input.to_string()));
    }
    Ok((value, unit.trim()))
}

/// Virtual simulation time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * NANOS_PER_MICRO)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * NANOS_PER_MILLI)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * NANOS_PER_SEC)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * NANOS_PER_SEC as f64).round() as u64)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.0 as f64 / NANOS_PER_MILLI as f64
    }

    pub fn saturating_sub(self, other: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(other.0))
    }

    pub fn checked_add(self, other: SimTime) -> Option<SimTime> {
        self.0.checked_add(other.0).map(SimTime)
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        self.saturating_sub(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        if n == 0 {
            write!(f, "0s")
        } else if n % NANOS_PER_SEC == 0 {
            write!(f, "{}s", n / NANOS_PER_SEC)
        } else if n % NANOS_PER_MILLI == 0 {
            write!(f, "{}ms", n / NANOS_PER_MILLI)
        } else if n % NANOS_PER_MICRO == 0 {
            write!(f, "{}us", n / NANOS_PER_MICRO)
        } else {
            write!(f, "{}ns", n)
        }
    }
}

impl FromStr for SimTime {
    type Err = UnitParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_quantity(input)?;
        let scale = match unit {
            "s" | "" => NANOS_PER_SEC,
            "ms" => NANOS_PER_MILLI,
            "us" => NANOS_PER_MICRO,
            "ns" => 1,
            "min" => 60 * NANOS_PER_SEC,
            other => {
                return Err(UnitParseError::UnknownUnit {
                    input: input.to_string(),
                    unit: other.to_string(),
                });
            }
        };
        let nanos = (value * scale as f64).round();
        if nanos > u64::MAX as f64 {
            return Err(UnitParseError::OutOfRange(input.to_string()));
        }
        Ok(SimTime(nanos as u64))
    }
}

impl TryFrom<String> for SimTime {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SimTime> for String {
    fn from(value: SimTime) -> Self {
        value.to_string()
    }
}

/// Link or application data rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps * 1_000)
    }

    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    pub const fn bps(&self) -> u64 {
        self.0
    }

    /// Time needed to put `bytes` on the wire, rounded up to the next nanosecond.
    pub fn transmission_time(&self, bytes: u32) -> SimTime {
        if self.0 == 0 {
            return SimTime::MAX;
        }
        let bits = bytes as u128 * 8;
        let bps = self.0 as u128;
        let nanos = (bits * NANOS_PER_SEC as u128).div_ceil(bps);
        SimTime(nanos.min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bps = self.0;
        if bps >= 1_000_000_000 && bps % 1_000_000_000 == 0 {
            write!(f, "{}Gbps", bps / 1_000_000_000)
        } else if bps >= 1_000_000 && bps % 1_000_000 == 0 {
            write!(f, "{}Mbps", bps / 1_000_000)
        } else if bps >= 1_000 && bps % 1_000 == 0 {
            write!(f, "{}Kbps", bps / 1_000)
        } else {
            write!(f, "{}bps", bps)
        }
    }
}

impl FromStr for DataRate {
    type Err = UnitParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (value, unit) = split_quantity(input)?;
        let scale: u64 = match unit.to_ascii_lowercase().as_str() {
            "bps" | "b/s" => 1,
            "kbps" | "kb/s" => 1_000,
            "mbps" | "mb/s" => 1_000_000,
            "gbps" | "gb/s" => 1_000_000_000,
            _ => {
                return Err(UnitParseError::UnknownUnit {
                    input: input.to_string(),
                    unit: unit.to_string(),
                });
            }
        };
        let bps = (value * scale as f64).round();
        if bps > u64::MAX as f64 {
            return Err(UnitParseError::OutOfRange(input.to_string()));
        }
        Ok(DataRate(bps as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = UnitParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(value: DataRate) -> Self {
        value.to_string()
    }
}
