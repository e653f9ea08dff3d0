//! Small string and clock helpers used by the bus.

use chrono::Utc;

/// Keep at most `max_chars` characters of `text` for a log line, marking the cut with "...".
///
/// Counting is per `char`, so multi-byte characters are never split.
///
/// ```
/// use repairbus::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("timeout", 32), "timeout");
/// assert_eq!(truncate_with_ellipsis("handler failed: disk full", 14), "handler failed...");
/// assert_eq!(truncate_with_ellipsis("ошибка", 3), "оши...");
/// ```
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text.to_owned();
    };
    let mut kept = text[..cut].trim_end().to_owned();
    kept.push_str("...");
    kept
}

/// Largest char boundary `<= index`, clamped to `text.len()`.
pub fn floor_utf8_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&candidate| text.is_char_boundary(candidate))
        .unwrap_or(0)
}

/// Smallest char boundary `> index`, clamped to `text.len()`.
pub fn next_utf8_char_boundary(text: &str, index: usize) -> usize {
    (index + 1..text.len())
        .find(|&candidate| text.is_char_boundary(candidate))
        .unwrap_or(text.len())
}

/// Wall-clock time as fractional seconds since the Unix epoch.
pub fn unix_timestamp_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_with_ellipsis("retry", 5), "retry");
        assert_eq!(truncate_with_ellipsis("", 3), "");
    }

    #[test]
    fn long_text_is_cut_and_trimmed() {
        assert_eq!(truncate_with_ellipsis("circuit open for fixer", 8), "circuit...");
        assert_eq!(truncate_with_ellipsis("patch 🦀 applied", 7), "patch 🦀...");
    }

    #[test]
    fn floor_backs_off_inside_multibyte_char() {
        let text = "aé"; // 'é' occupies bytes 1..3
        assert_eq!(floor_utf8_char_boundary(text, 2), 1);
        assert_eq!(floor_utf8_char_boundary(text, 3), 3);
        assert_eq!(floor_utf8_char_boundary(text, 10), text.len());
    }

    #[test]
    fn next_boundary_skips_continuation_bytes() {
        let text = "🦀a"; // crab is 4 bytes
        assert_eq!(next_utf8_char_boundary(text, 0), 4);
        assert_eq!(next_utf8_char_boundary(text, 4), 5);
        assert_eq!(next_utf8_char_boundary(text, 5), 5);
    }

    #[test]
    fn unix_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_timestamp_secs() > 1_577_836_800.0);
    }
}
