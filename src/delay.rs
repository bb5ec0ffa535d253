//! Delay literal parsing.
//!
//! Delays appear after `+` in command expressions, either as plain seconds
//! (`1`, `1.5`) or as unit-suffixed groups that concatenate into a single
//! term (`500ms`, `1m30s750ms`). Groups within a term always sum, so
//! `30s1m` and `1m30s` read the same.

use std::time::Duration;

use anyhow::{bail, Result};

// Largest delay we accept, in seconds. Keeps Duration construction safe.
const MAX_DELAY_SECS: f64 = 1e12;

/// Parses one delay term into a [`Duration`].
///
/// Grammar: `(number unit?)+` with `number = digit+ ("." digit+)?` and
/// `unit ∈ {ms, s, m}`. A missing unit means seconds.
pub fn parse_delay(text: &str) -> Result<Duration> {
    if text.is_empty() {
        bail!("empty delay");
    }
    let mut total = 0.0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let value = parse_number(number, text)?;
        let scale = match unit {
            "" | "s" => 1.0,
            "m" => 60.0,
            "ms" => 0.001,
            other => bail!("unknown unit {:?} in delay {:?}", other, text),
        };
        total += value * scale;
    }
    if !total.is_finite() || total > MAX_DELAY_SECS {
        bail!("delay {:?} is out of range", text);
    }
    Ok(Duration::from_secs_f64(total))
}

/// Renders a duration back to its canonical literal: plain seconds with the
/// shortest decimal expansion (`90.75`, `0.5`, `1`).
pub fn format_delay(delay: Duration) -> String {
    format!("{}", delay.as_secs_f64())
}

// digit+ ("." digit+)?, stricter than f64's own parser, which would also
// accept "1." and ".5".
fn parse_number(number: &str, whole: &str) -> Result<f64> {
    let valid = match number.split_once('.') {
        Some((int, frac)) => {
            !int.is_empty()
                && !frac.is_empty()
                && int.chars().all(|c| c.is_ascii_digit())
                && frac.chars().all(|c| c.is_ascii_digit())
        }
        None => !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()),
    };
    if !valid {
        bail!("expected a number in delay {:?}", whole);
    }
    Ok(number.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(text: &str) -> f64 {
        parse_delay(text).unwrap().as_secs_f64()
    }

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    #[test]
    fn plain_numbers_are_seconds() {
        assert!(close(secs("5"), 5.0));
        assert!(close(secs("1.0"), 1.0));
        assert!(close(secs("1.5"), 1.5));
        assert!(close(secs("0"), 0.0));
    }

    #[test]
    fn unit_suffixes() {
        assert!(close(secs("500ms"), 0.5));
        assert!(close(secs("5s"), 5.0));
        assert!(close(secs("2m"), 120.0));
        assert!(close(secs("1.5m"), 90.0));
        assert!(close(secs("2.5s"), 2.5));
        assert!(close(secs("1500ms"), 1.5));
    }

    #[test]
    fn groups_concatenate_and_sum() {
        assert!(close(secs("1m30s"), 90.0));
        assert!(close(secs("2m15s"), 135.0));
        assert!(close(secs("1m1s1ms"), 61.001));
        assert!(close(secs("2s500ms"), 2.5));
        assert!(close(secs("1m500ms"), 60.5));
        assert!(close(secs("2m30s750ms"), 150.75));
    }

    #[test]
    fn group_order_does_not_matter() {
        assert_eq!(parse_delay("1m30s").unwrap(), parse_delay("30s1m").unwrap());
        assert!(close(secs("30s1m"), 90.0));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_delay("").is_err());
        assert!(parse_delay("A").is_err());
        assert!(parse_delay("server").is_err());
        assert!(parse_delay("1x").is_err());
        assert!(parse_delay("ms").is_err());
        assert!(parse_delay("1.").is_err());
        assert!(parse_delay(".5").is_err());
        assert!(parse_delay("1.2.3").is_err());
        assert!(parse_delay("-1").is_err());
        assert!(parse_delay("1 2").is_err());
    }

    #[test]
    fn format_round_trips() {
        for text in ["1", "1.5", "90.75", "0.5", "61.001"] {
            let parsed = parse_delay(text).unwrap();
            assert_eq!(parse_delay(&format_delay(parsed)).unwrap(), parsed);
        }
        assert_eq!(format_delay(Duration::from_secs_f64(90.75)), "90.75");
        assert_eq!(format_delay(Duration::from_secs(1)), "1");
    }
}
