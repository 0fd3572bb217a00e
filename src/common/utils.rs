//! Utility functions for leasehold

use std::time::Duration;

/// Longest election key accepted by the stores
pub const MAX_KEY_LEN: usize = 128;

/// Reject keys the election table cannot hold
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidKey("empty key".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(crate::Error::InvalidKey(format!(
            "key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidKey(format!(
            "key contains control characters: {:?}",
            key
        )));
    }
    Ok(())
}

/// Resolve the identity this process elects under.
///
/// Returns the identity and whether it is stable across restarts.
pub fn resolve_host(configured: &str) -> (String, bool) {
    let configured = configured.trim();
    if !configured.is_empty() {
        return (configured.to_string(), true);
    }
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return (hostname.to_string(), true);
        }
    }
    (uuid::Uuid::new_v4().to_string(), false)
}

/// Parse duration string (e.g., "500ms", "2s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" | "" => 1,
        "m" => 60,
        "h" => 3600,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}
