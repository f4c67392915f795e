use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_bool(name: &str, default_value: bool) -> bool {
    match std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

pub(crate) fn env_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    let out: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

/// Reads a millisecond duration from the environment, clamped to `[min_ms, max_ms]`.
pub(crate) fn env_duration_ms(name: &str, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(
        env_u64(name)
            .map(|v| v.clamp(min_ms, max_ms))
            .unwrap_or(default_ms),
    )
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Exponential backoff; `attempt` is 1-based.
pub(crate) fn compute_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
    base.saturating_mul(mult).min(max)
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(4);
        assert_eq!(compute_backoff(base, max, 1), Duration::from_millis(500));
        assert_eq!(compute_backoff(base, max, 2), Duration::from_millis(1000));
        assert_eq!(compute_backoff(base, max, 3), Duration::from_millis(2000));
        assert_eq!(compute_backoff(base, max, 10), max);
        assert_eq!(compute_backoff(base, max, u32::MAX), max);
    }

    #[test]
    fn error_chain_dedupes_repeated_causes() {
        let err = anyhow::anyhow!("connection refused")
            .context("connection refused")
            .context("probe /health");
        assert_eq!(format_error_chain(&err), "probe /health: connection refused");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 40);
        assert!(out.len() <= 40);
        assert!(out.ends_with("…(truncated)"));
        assert_eq!(truncate_utf8("short", 40), "short");
    }
}
