//! Utility functions for meshkeeper

use std::time::Duration;

/// Parse duration string (e.g., "30s", "5m", "1h", "250ms")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Backoff for the given retry attempt, with up to 50% random jitter
pub fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(6);
    let delay = base.saturating_mul(factor);
    let jitter_ms = (delay.as_millis() as u64 / 2).max(1);
    delay + Duration::from_millis(rand::random::<u64>() % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(10);
        let first = backoff_with_jitter(base, 0);
        assert!(first >= base && first < base * 2);
        let later = backoff_with_jitter(base, 3);
        assert!(later >= base * 8);
    }
}
