//! Duration string parsing for intervals like `30s`, `5m`, `1h`, `2d`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").expect("duration regex is valid")
});

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let trimmed = s.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }

    let captures = DURATION_RE.captures(&trimmed).ok_or_else(|| {
        format!("invalid duration format {s:?}, expected <number><unit> (e.g. '30s', '5m', '1h')")
    })?;

    let number: u64 = captures["number"]
        .parse()
        .map_err(|e| format!("invalid duration number in {s:?}: {e}"))?;

    let seconds = match &captures["unit"] {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        _ => unreachable!("regex only admits smhd"),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration(" 10S ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_invalid_durations() {
        for bad in ["", "10", "s", "10x", "-5s", "1.5h"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be invalid");
        }
    }
}
