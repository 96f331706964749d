use httpdate::parse_http_date;
use std::time::{Duration, SystemTime};

/// Parses a `Retry-After` header into the time left to wait.
///
/// Accepts delta seconds (fractions are rounded up) and HTTP dates. A date in
/// the past yields a zero duration.
pub fn parse_retry_after(header: &str) -> Option<Duration> {
    let header = header.trim();
    if let Ok(seconds) = header.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs(seconds.ceil() as u64));
        }
        return None;
    }
    let until = parse_http_date(header).ok()?;
    Some(
        until
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_seconds() {
        assert_eq!(parse_retry_after("60"), Some(Duration::from_secs(60)));
        assert_eq!(parse_retry_after(" 1.2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_http_date() {
        let later = SystemTime::now() + Duration::from_secs(120);
        let header = httpdate::fmt_http_date(later);
        let wait = parse_retry_after(&header).unwrap();
        assert!(wait <= Duration::from_secs(120));
        assert!(wait >= Duration::from_secs(100));

        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_garbage() {
        assert_eq!(parse_retry_after("soon"), None);
    }
}
