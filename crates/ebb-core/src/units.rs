//! Duration and size parsing for option values.

use std::time::Duration;

use crate::types::WaitTimeout;

/// Split "30 s" / "16mb" / "-1" into a numeric part and a lowercase unit.
fn split_unit(s: &str) -> (&str, String) {
    let s = s.trim();
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(idx);
    (num.trim(), unit.trim().to_ascii_lowercase())
}

/// Parse a duration string like "500ms", "5s", "1m", "2h" or bare seconds.
///
/// Negative values are rejected; see [`parse_wait_timeout`] for the one
/// option where they are meaningful.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (num, unit) = split_unit(s);
    let value: u64 = num.parse().ok()?;
    match unit.as_str() {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" | "min" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Parse `resource-wait-timeout`: any negative number disables the timeout.
pub fn parse_wait_timeout(s: &str) -> Option<WaitTimeout> {
    let (num, _) = split_unit(s);
    if num.starts_with('-') {
        return num
            .trim_start_matches('-')
            .parse::<u64>()
            .ok()
            .map(|_| WaitTimeout::Forever);
    }
    parse_duration(s).map(WaitTimeout::After)
}

/// Parse a byte size like "16mb", "1gb", "512kb" or bare bytes. Binary multiples.
pub fn parse_bytes(s: &str) -> Option<u64> {
    let (num, unit) = split_unit(s);
    let value: u64 = num.parse().ok()?;
    let multiplier: u64 = match unit.as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// `d * factor`, saturating at `Duration::MAX`. A factor that is not a
/// positive number yields zero.
pub fn scale_duration(d: Duration, factor: f64) -> Duration {
    if d.is_zero() || factor.is_nan() || factor <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Render a byte size in the largest binary unit that represents it exactly.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "gb"), (1 << 20, "mb"), (1 << 10, "kb")];
    for (size, suffix) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{suffix}", bytes / size);
        }
    }
    format!("{bytes}b")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("10 s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn negative_wait_timeout_is_forever() {
        assert_eq!(parse_wait_timeout("-1"), Some(WaitTimeout::Forever));
        assert_eq!(parse_wait_timeout("-5 s"), Some(WaitTimeout::Forever));
        assert_eq!(
            parse_wait_timeout("5m"),
            Some(WaitTimeout::After(Duration::from_secs(300)))
        );
        assert_eq!(parse_wait_timeout("-"), None);
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_bytes("16mb"), Some(16 * 1024 * 1024));
        assert_eq!(parse_bytes("1 GB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_bytes("4096"), Some(4096));
        assert_eq!(parse_bytes("3 parsecs"), None);
    }

    #[test]
    fn scaling_saturates_instead_of_panicking() {
        let d = Duration::from_secs(100);
        assert_eq!(scale_duration(d, 1.5), Duration::from_secs(150));
        assert_eq!(scale_duration(d, 1e300), Duration::MAX);
        assert_eq!(scale_duration(d, f64::INFINITY), Duration::MAX);
        assert_eq!(scale_duration(d, f64::NAN), Duration::ZERO);
        assert_eq!(scale_duration(d, -2.0), Duration::ZERO);
        assert_eq!(scale_duration(Duration::ZERO, f64::INFINITY), Duration::ZERO);
    }

    #[test]
    fn formats_exact_units() {
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_bytes(16 * 1024 * 1024), "16mb");
        assert_eq!(format_bytes(1000), "1000b");
    }
}
