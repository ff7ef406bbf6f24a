// SPDX-License-Identifier: MIT

//! Suffix parsing for `-p`/`-b` rates and `-w` wait times (spec.md §6).
//!
//! Both follow the same shape as the upstream client: a decimal number
//! followed by an optional one-letter suffix, with cascading multipliers
//! (`T` implies the `G`/`M`/`K` steps too).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("invalid suffix '{0}'")]
    InvalidSuffix(char),
}

/// Parses `RATE[K|M|G|T]` (bits or packets per second) into a plain integer,
/// decimal multipliers (1e3/1e6/1e9/1e12).
pub fn parse_rate(s: &str) -> Result<u64, ParseError> {
    let (digits, suffix) = split_trailing_alpha(s);
    let raw: u64 = digits.parse().map_err(|_| ParseError::InvalidNumber(s.to_string()))?;
    let multiplier = match suffix {
        None => 1,
        Some(c) => match c.to_ascii_uppercase() {
            'K' => 1_000,
            'M' => 1_000_000,
            'G' => 1_000_000_000,
            'T' => 1_000_000_000_000,
            other => return Err(ParseError::InvalidSuffix(other)),
        },
    };
    Ok(raw.saturating_mul(multiplier))
}

/// Parses `TIME[m|h|d]` (spec.md §6) into whole seconds. No suffix means
/// seconds; `m`/`h`/`d` mean minutes/hours/days.
pub fn parse_wait_seconds(s: &str) -> Result<u64, ParseError> {
    let (digits, suffix) = split_trailing_alpha(s);
    let raw: u64 = digits.parse().map_err(|_| ParseError::InvalidNumber(s.to_string()))?;
    let multiplier = match suffix {
        None => 1,
        Some(c) => match c.to_ascii_lowercase() {
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            other => return Err(ParseError::InvalidSuffix(other)),
        },
    };
    Ok(raw.saturating_mul(multiplier))
}

fn split_trailing_alpha(s: &str) -> (&str, Option<char>) {
    match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - c.len_utf8()], Some(c)),
        _ => (s, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_has_no_multiplier() {
        assert_eq!(parse_rate("125000"), Ok(125_000));
    }

    #[test]
    fn suffixes_apply_decimal_multipliers() {
        assert_eq!(parse_rate("1K"), Ok(1_000));
        assert_eq!(parse_rate("1M"), Ok(1_000_000));
        assert_eq!(parse_rate("1G"), Ok(1_000_000_000));
        assert_eq!(parse_rate("1T"), Ok(1_000_000_000_000));
    }

    #[test]
    fn suffixes_are_case_insensitive() {
        assert_eq!(parse_rate("2k"), parse_rate("2K"));
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        assert_eq!(parse_rate("5X"), Err(ParseError::InvalidSuffix('X')));
    }

    #[test]
    fn wait_time_defaults_to_seconds() {
        assert_eq!(parse_wait_seconds("30"), Ok(30));
    }

    #[test]
    fn wait_time_suffixes_apply() {
        assert_eq!(parse_wait_seconds("5m"), Ok(300));
        assert_eq!(parse_wait_seconds("2h"), Ok(7_200));
        assert_eq!(parse_wait_seconds("1d"), Ok(86_400));
    }

    #[test]
    fn zero_wait_time_is_valid() {
        assert_eq!(parse_wait_seconds("0"), Ok(0));
    }
}
