//! Duration strings as used by health checks and stop grace periods.
//!
//! Accepts compound values such as `1h2m3s`, `1m30s`, `500ms`, `1.5s`,
//! and bare integers, which are read as seconds.

use std::time::Duration;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, opt, recognize},
    multi::many1,
};

fn unit_seconds(unit: &str) -> f64 {
    match unit {
        "h" => 3600.0,
        "m" => 60.0,
        "ms" => 1e-3,
        "us" | "µs" => 1e-6,
        "ns" => 1e-9,
        _ => 1.0,
    }
}

/// Parses one `<number><unit>` component into seconds.
fn component(input: &str) -> IResult<&str, f64> {
    let (input, number) = recognize((digit1, opt((char('.'), digit1)))).parse(input)?;
    let (input, unit) = alt((
        tag("ms"),
        tag("us"),
        tag("µs"),
        tag("ns"),
        tag("h"),
        tag("m"),
        tag("s"),
    ))
    .parse(input)?;
    let value: f64 = number.parse().map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))
    })?;
    Ok((input, value * unit_seconds(unit)))
}

/// Parses a duration string.
///
/// Returns `None` if the input is empty, malformed, or out of range.
#[must_use]
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse().ok().map(Duration::from_secs);
    }
    let (_, parts) = all_consuming(many1(component)).parse(input).ok()?;
    Duration::try_from_secs_f64(parts.iter().sum()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn parses_compound_values() {
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h2m3s"), Some(Duration::from_secs(3723)));
    }

    #[test]
    fn parses_fractional_and_bare_seconds() {
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("10 s"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("-5s"), None);
    }
}
