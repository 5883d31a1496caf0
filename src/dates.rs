//! Dekadal calendar arithmetic.
//!
//! A dekad is a ten-day period. Each month holds three of them, starting on
//! days 1, 11 and 21, so a year holds 36. The third dekad absorbs the tail
//! of the month and is 8 to 11 days long.
//!
//! Dekads are ordered lexicographically on `(year, period)` and the derived
//! [`Ord`] implementation follows that order.

use std::cmp::Ordering;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::error::{Error, Result};

/// Number of dekads in a year.
pub const DEKADS_PER_YEAR: u32 = 36;

/// A ten-day period of a year, numbered 1 to 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Dekad {
    year: i32,
    period: u32,
}

impl Dekad {
    /// Build a dekad, checking the year has four digits and the period is 1..=36.
    pub fn new(year: i32, period: u32) -> Result<Self> {
        if !(1000..=9999).contains(&year) {
            return Err(Error::InvalidDekad {
                year,
                period: period.into(),
                reason: "year must have four digits",
            });
        }
        if !(1..=DEKADS_PER_YEAR).contains(&period) {
            return Err(Error::InvalidDekad {
                year,
                period: period.into(),
                reason: "period must be between 1 and 36",
            });
        }
        Ok(Self { year, period })
    }

    /// The dekad containing a calendar date.
    ///
    /// Dates outside four-digit years are rejected like [`Dekad::new`] does.
    pub fn from_date(date: NaiveDate) -> Result<Self> {
        let day_slot = ((date.day() - 1) / 10).min(2);
        Self::new(date.year(), day_slot + (date.month() - 1) * 3 + 1)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    /// First calendar day of the dekad (day 1, 11 or 21 of its month).
    pub fn first_day(&self) -> Result<NaiveDate> {
        let month = (self.period - 1) / 3 + 1;
        let day = 10 * ((self.period - 1) % 3) + 1;
        NaiveDate::from_ymd_opt(self.year, month, day).ok_or(Error::InvalidDekad {
            year: self.year,
            period: self.period.into(),
            reason: "does not map to a calendar date",
        })
    }

    /// Position on a continuous dekad axis, used for arithmetic.
    fn ordinal(&self) -> i64 {
        i64::from(self.year) * i64::from(DEKADS_PER_YEAR) + i64::from(self.period - 1)
    }

    fn from_ordinal(ordinal: i64) -> Result<Self> {
        let per_year = i64::from(DEKADS_PER_YEAR);
        let year = ordinal.div_euclid(per_year);
        let period = ordinal.rem_euclid(per_year) + 1;
        let year = i32::try_from(year).map_err(|_| Error::InvalidDekad {
            year: i32::MAX,
            period,
            reason: "year out of range",
        })?;
        // rem_euclid keeps the period within 1..=36
        Self::new(year, period as u32)
    }

    /// The dekad `n` periods after this one (before it if `n` is negative).
    pub fn offset(&self, n: i64) -> Result<Self> {
        Self::from_ordinal(self.ordinal() + n)
    }

    /// The following dekad, wrapping from period 36 to period 1 of the next year.
    pub fn succ(&self) -> Result<Self> {
        self.offset(1)
    }

    /// Signed number of dekads from `self` to `other`.
    pub fn dekads_until(&self, other: &Dekad) -> i64 {
        other.ordinal() - self.ordinal()
    }
}

impl fmt::Display for Dekad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.year, self.period)
    }
}

/// Any of the accepted ways to name a dekad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DekadInput {
    /// A calendar date inside the dekad.
    Date(NaiveDate),
    /// An ISO-8601 `YYYY-MM-DD` string inside the dekad.
    Iso(String),
    /// An explicit `(year, period)` pair.
    Pair(i32, u32),
}

impl From<NaiveDate> for DekadInput {
    fn from(date: NaiveDate) -> Self {
        DekadInput::Date(date)
    }
}

impl From<&str> for DekadInput {
    fn from(s: &str) -> Self {
        DekadInput::Iso(s.to_string())
    }
}

impl From<String> for DekadInput {
    fn from(s: String) -> Self {
        DekadInput::Iso(s)
    }
}

impl From<(i32, u32)> for DekadInput {
    fn from((year, period): (i32, u32)) -> Self {
        DekadInput::Pair(year, period)
    }
}

impl From<Dekad> for DekadInput {
    fn from(dekad: Dekad) -> Self {
        DekadInput::Pair(dekad.year, dekad.period)
    }
}

impl DekadInput {
    /// Resolve to a validated dekad.
    pub fn resolve(&self) -> Result<Dekad> {
        match self {
            DekadInput::Date(date) => Dekad::from_date(*date),
            DekadInput::Iso(s) => Dekad::from_date(parse_user_date(s)?),
            DekadInput::Pair(year, period) => Dekad::new(*year, *period),
        }
    }
}

/// Parse a strict `YYYY-MM-DD` date.
///
/// Single-digit months or days (`2020-01-1`) are rejected even though
/// chrono's parser would accept them.
pub fn parse_user_date(input: &str) -> Result<NaiveDate> {
    let bytes = input.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !well_formed {
        return Err(Error::InvalidDate {
            input: input.to_string(),
        });
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|_| Error::InvalidDate {
        input: input.to_string(),
    })
}

/// Convert a date to the dekad containing it.
pub fn date_to_dekad(date: NaiveDate) -> Result<Dekad> {
    Dekad::from_date(date)
}

/// First day of a dekad.
pub fn dekad_to_date(dekad: Dekad) -> Result<NaiveDate> {
    dekad.first_day()
}

/// Lexicographic comparison on `(year, period)`.
pub fn compare(a: Dekad, b: Dekad) -> Ordering {
    a.cmp(&b)
}

/// All dekads from `start` to `end` inclusive.
///
/// # Errors
///
/// Returns [`Error::InvalidDateRange`] when `start` comes after `end`.
pub fn expand_range(start: Dekad, end: Dekad) -> Result<Vec<Dekad>> {
    if start > end {
        return Err(Error::InvalidDateRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    let len = start.dekads_until(&end) + 1;
    (0..len).map(|n| start.offset(n)).collect()
}

/// Resolve an optional user input to a dekad, falling back to `default`.
pub fn get_dekadal_date(input: Option<DekadInput>, default: Dekad) -> Result<Dekad> {
    match input {
        Some(input) => input.resolve(),
        None => Ok(default),
    }
}
