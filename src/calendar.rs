//! Calendar handling for the exchange portal.
//!
//! TSETMC addresses trading days by Jalali (Solar Hijri) date and its exports may
//! carry Persian digits. Everything inside the crate is a [`NaiveDate`]; this module
//! only converts at the edges.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Calendar {
    Gregorian,
    #[default]
    Jalali,
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calendar::Gregorian => write!(f, "gregorian"),
            Calendar::Jalali => write!(f, "jalali"),
        }
    }
}

impl Calendar {
    /// Render a date as `YYYY-MM-DD` in this calendar.
    pub fn format(self, date: NaiveDate) -> String {
        match self {
            Calendar::Gregorian => date.format("%Y-%m-%d").to_string(),
            Calendar::Jalali => {
                let (y, m, d) = gregorian_to_jalali(date.year(), date.month(), date.day());
                format!("{y:04}-{m:02}-{d:02}")
            }
        }
    }

    /// Parse `YYYY-MM-DD` (or `YYYY/MM/DD`) in this calendar. Persian and
    /// Arabic-Indic digits are accepted.
    pub fn parse(self, value: &str) -> Option<NaiveDate> {
        let folded = fold_digits(value.trim());
        let caps = date_pattern().captures(&folded)?;
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        match self {
            Calendar::Gregorian => NaiveDate::from_ymd_opt(year, month, day),
            Calendar::Jalali => jalali_to_date(year, month, day),
        }
    }

    pub fn parse_arg(self, value: &str) -> Result<NaiveDate, ConfigError> {
        self.parse(value)
            .ok_or_else(|| ConfigError::InvalidDate(value.to_string()))
    }
}

impl FromStr for Calendar {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gregorian" => Ok(Calendar::Gregorian),
            "jalali" | "shamsi" | "persian" => Ok(Calendar::Jalali),
            other => Err(ConfigError::InvalidValue(format!("unknown calendar {other:?}"))),
        }
    }
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})$").expect("static date pattern")
    })
}

/// Replace Persian (U+06F0..) and Arabic-Indic (U+0660..) digits with ASCII and
/// the Arabic decimal/thousands separators with `.` and `,`.
pub fn fold_digits(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (ch as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (ch as u32 - 0x0660) as u8),
            '\u{066B}' => '.',
            '\u{066C}' | '\u{060C}' => ',',
            other => other,
        })
        .collect()
}

/// Jalali date to Gregorian, rejecting dates that do not exist (e.g. Esfand 30 of a
/// common year).
pub fn jalali_to_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    if year < 1 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let (gy, gm, gd) = jalali_to_gregorian(year, month, day);
    let date = NaiveDate::from_ymd_opt(gy, gm, gd)?;
    (gregorian_to_jalali(date.year(), date.month(), date.day()) == (year, month, day))
        .then_some(date)
}

pub fn gregorian_to_jalali(year: i32, month: u32, day: u32) -> (i32, u32, u32) {
    const DAYS_BEFORE_MONTH: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let gy = i64::from(year);
    let gy2 = if month > 2 { gy + 1 } else { gy };
    let mut days = 355_666 + 365 * gy + (gy2 + 3) / 4 - (gy2 + 99) / 100
        + (gy2 + 399) / 400
        + i64::from(day)
        + DAYS_BEFORE_MONTH[(month - 1) as usize];
    let mut jy = -1595 + 33 * (days / 12_053);
    days %= 12_053;
    jy += 4 * (days / 1461);
    days %= 1461;
    if days > 365 {
        jy += (days - 1) / 365;
        days = (days - 1) % 365;
    }
    let (jm, jd) = if days < 186 {
        (1 + days / 31, 1 + days % 31)
    } else {
        (7 + (days - 186) / 30, 1 + (days - 186) % 30)
    };
    (jy as i32, jm as u32, jd as u32)
}

pub fn jalali_to_gregorian(year: i32, month: u32, day: u32) -> (i32, u32, u32) {
    let jy = i64::from(year) + 1595;
    let jm = i64::from(month);
    let month_days = if jm < 7 {
        (jm - 1) * 31
    } else {
        (jm - 7) * 30 + 186
    };
    let mut days = -355_668 + 365 * jy + (jy / 33) * 8 + ((jy % 33) + 3) / 4
        + i64::from(day)
        + month_days;
    let mut gy = 400 * (days / 146_097);
    days %= 146_097;
    if days > 36_524 {
        days -= 1;
        gy += 100 * (days / 36_524);
        days %= 36_524;
        if days >= 365 {
            days += 1;
        }
    }
    gy += 4 * (days / 1461);
    days %= 1461;
    if days > 365 {
        gy += (days - 1) / 365;
        days = (days - 1) % 365;
    }
    let mut gd = days + 1;
    let leap = (gy % 4 == 0 && gy % 100 != 0) || gy % 400 == 0;
    let month_lengths = [31, if leap { 29 } else { 28 }, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut gm = 1;
    for len in month_lengths {
        if gd <= len {
            break;
        }
        gd -= len;
        gm += 1;
    }
    (gy as i32, gm as u32, gd as u32)
}
