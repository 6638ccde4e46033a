//! Duration parsing and formatting for configuration and Flux literals.

use std::time::Duration;

/// Parse a duration in the formats used by the configuration file.
///
/// Supports:
/// - Unit sequences: "30s", "1m", "1h30m", "500ms", "2d"
/// - Seconds as integer: "30"
///
/// Returns None for empty strings, unknown units or a missing number.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_ms = total_ms.checked_add(value.checked_mul(unit_ms)?)?;
    }

    Some(Duration::from_millis(total_ms))
}

/// Format a duration as a Flux duration literal ("30s", or "1500ms" for
/// sub-second precision).
pub fn format_flux_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_none());
        assert!(parse_duration("s").is_none());
        assert!(parse_duration("10x").is_none());
        assert!(parse_duration("1h-5m").is_none());
    }

    #[test]
    fn test_format_flux_duration() {
        assert_eq!(format_flux_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_flux_duration(Duration::from_secs(3600)), "3600s");
        assert_eq!(format_flux_duration(Duration::from_millis(1500)), "1500ms");
    }
}
