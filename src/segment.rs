//! Execution segments: half-open rational intervals of `[0, 1]` used to
//! partition a workload across instances.
//!
//! Segment arithmetic is exact. Scaling a whole number through a segment
//! rounds the *cumulative* boundaries, so that any partition of `[0, 1]`
//! into segments distributes `n` without gaps or overlaps:
//! `scale(n, [a,b)) = round(n*b) - round(n*a)`.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// An exact non-negative rational in `[0, 1]`, kept in lowest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: u64,
    den: u64,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    /// Builds `num/den` reduced to lowest terms. Fails outside `[0, 1]`.
    pub fn new(num: u64, den: u64) -> Result<Self, SegmentParseError> {
        if den == 0 {
            return Err(SegmentParseError::ZeroDenominator);
        }
        if num > den {
            return Err(SegmentParseError::OutOfRange);
        }
        let g = gcd(num, den);
        Ok(Rational {
            num: num / g,
            den: den / g,
        })
    }

    /// `round(n * self)` with exact integer arithmetic, rounding half up.
    pub fn scale(&self, n: u64) -> u64 {
        let num = n as u128 * self.num as u128;
        let den = self.den as u128;
        ((2 * num + den) / (2 * den)) as u64
    }

    fn cmp_key(&self) -> (u128, u128) {
        (self.num as u128, self.den as u128)
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let (an, ad) = self.cmp_key();
        let (bn, bd) = other.cmp_key();
        (an * bd).cmp(&(bn * ad))
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for Rational {
    type Err = SegmentParseError;

    /// Accepts `"1/4"`, `"0.25"`, `"25%"`, `"0"` and `"1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((num, den)) = s.split_once('/') {
            let num: u64 = num.trim().parse().map_err(|_| SegmentParseError::Malformed)?;
            let den: u64 = den.trim().parse().map_err(|_| SegmentParseError::Malformed)?;
            return Rational::new(num, den);
        }
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u64 = pct.trim().parse().map_err(|_| SegmentParseError::Malformed)?;
            return Rational::new(pct, 100);
        }
        if let Some((whole, frac)) = s.split_once('.') {
            let whole: u64 = if whole.is_empty() {
                0
            } else {
                whole.parse().map_err(|_| SegmentParseError::Malformed)?
            };
            if frac.is_empty() || frac.len() > 18 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(SegmentParseError::Malformed);
            }
            let den = 10u64.pow(frac.len() as u32);
            let frac: u64 = frac.parse().map_err(|_| SegmentParseError::Malformed)?;
            let num = whole
                .checked_mul(den)
                .and_then(|w| w.checked_add(frac))
                .ok_or(SegmentParseError::OutOfRange)?;
            return Rational::new(num, den);
        }
        let whole: u64 = s.parse().map_err(|_| SegmentParseError::Malformed)?;
        Rational::new(whole, 1)
    }
}

/// A half-open interval `[from, to)` of the unit range, assigning this
/// instance its share of the total load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionSegment {
    from: Rational,
    to: Rational,
}

impl ExecutionSegment {
    /// The whole range: this instance runs everything.
    pub fn full() -> Self {
        ExecutionSegment {
            from: Rational::ZERO,
            to: Rational::ONE,
        }
    }

    pub fn new(from: Rational, to: Rational) -> Result<Self, SegmentParseError> {
        if from >= to {
            return Err(SegmentParseError::EmptySegment);
        }
        Ok(ExecutionSegment { from, to })
    }

    pub fn is_full(&self) -> bool {
        self.from == Rational::ZERO && self.to == Rational::ONE
    }

    /// This segment's integer share of `n`, via cumulative rounding.
    pub fn scale(&self, n: u64) -> u64 {
        self.to.scale(n) - self.from.scale(n)
    }

    pub fn from_bound(&self) -> Rational {
        self.from
    }

    pub fn to_bound(&self) -> Rational {
        self.to
    }
}

impl Default for ExecutionSegment {
    fn default() -> Self {
        ExecutionSegment::full()
    }
}

impl fmt::Display for ExecutionSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

impl FromStr for ExecutionSegment {
    type Err = SegmentParseError;

    /// Accepts `"from:to"`; an omitted `from` defaults to 0 and an omitted
    /// `to` defaults to 1, so `":1/2"` and `"1/2:"` are both valid halves.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s.split_once(':').ok_or(SegmentParseError::Malformed)?;
        let from = if from.trim().is_empty() {
            Rational::ZERO
        } else {
            from.parse()?
        };
        let to = if to.trim().is_empty() {
            Rational::ONE
        } else {
            to.parse()?
        };
        ExecutionSegment::new(from, to)
    }
}

impl Serialize for ExecutionSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExecutionSegment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SegmentParseError {
    #[error("execution segments must look like `1/4:1/2`, `0.25:0.5` or `25%:50%`")]
    Malformed,
    #[error("segment boundaries must lie in [0, 1]")]
    OutOfRange,
    #[error("segment denominators cannot be zero")]
    ZeroDenominator,
    #[error("segment `from` must be strictly below `to`")]
    EmptySegment,
}
