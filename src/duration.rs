/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/duration.rs
* Parsing for the duration strings carried in CRD specs ("15s", "1m",
* "2h30m", plain seconds). The accepted unit set is the one Kubernetes
* duration fields use; fractional values are not.
* SPDX-License-Identifier: Apache-2.0 */

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a duration string like "15s", "5m", "1h30m", or "90" (seconds).
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::UserInputError("empty duration".to_string()));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut consumed_any = false;
    for ch in input.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value: u64 = number
            .parse()
            .map_err(|_| Error::UserInputError(format!("invalid duration {input:?}")))?;
        number.clear();
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => {
                return Err(Error::UserInputError(format!(
                    "invalid duration unit {ch:?} in {input:?}"
                )))
            }
        };
        total += Duration::from_secs(value * unit);
        consumed_any = true;
    }
    if !number.is_empty() || !consumed_any {
        return Err(Error::UserInputError(format!("invalid duration {input:?}")));
    }
    Ok(total)
}

/// Parse an optional spec field, falling back to a default.
pub fn parse_or_default(input: Option<&str>, default: Duration) -> Duration {
    input
        .and_then(|s| parse_duration(s).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("15x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("1h30").is_err());
    }

    #[test]
    fn optional_falls_back() {
        let d = Duration::from_secs(15);
        assert_eq!(parse_or_default(None, d), d);
        assert_eq!(parse_or_default(Some("bogus"), d), d);
        assert_eq!(parse_or_default(Some("1m"), d), Duration::from_secs(60));
    }
}
