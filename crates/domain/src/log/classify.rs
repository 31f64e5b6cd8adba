use super::LogLevel;

/// Trim a raw stdio payload and derive its level. Returns `None` for
/// payloads that are empty after trimming (dropped).
///
/// Explicit markers win: `[ERROR]`, `[WARN]`, `[DEBUG]`, `[INFO]`
/// (case-insensitive) anywhere in the line, or `ERROR:`/`WARN:`-style
/// prefixes. Without a marker, stderr maps to `warn` and stdout to `info`.
pub fn classify(payload: &str, is_std_err: bool) -> Option<(LogLevel, String)> {
    let message = payload.trim();
    if message.is_empty() {
        return None;
    }

    let level = detect_marker(message).unwrap_or(if is_std_err {
        LogLevel::Warn
    } else {
        LogLevel::Info
    });

    Some((level, message.to_string()))
}

fn detect_marker(message: &str) -> Option<LogLevel> {
    let upper = message.to_ascii_uppercase();
    for (marker, level) in [
        ("[ERROR]", LogLevel::Error),
        ("[WARN]", LogLevel::Warn),
        ("[WARNING]", LogLevel::Warn),
        ("[DEBUG]", LogLevel::Debug),
        ("[INFO]", LogLevel::Info),
    ] {
        if upper.contains(marker) {
            return Some(level);
        }
    }
    for (prefix, level) in [
        ("ERROR:", LogLevel::Error),
        ("WARN:", LogLevel::Warn),
        ("WARNING:", LogLevel::Warn),
        ("DEBUG:", LogLevel::Debug),
        ("INFO:", LogLevel::Info),
    ] {
        if upper.starts_with(prefix) {
            return Some(level);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_markers_set_level() {
        assert_eq!(
            classify("[ERROR] db gone", false).unwrap().0,
            LogLevel::Error
        );
        assert_eq!(
            classify("[warn] disk almost full", false).unwrap().0,
            LogLevel::Warn
        );
        assert_eq!(
            classify("2024-01-01 [DEBUG] probe", true).unwrap().0,
            LogLevel::Debug
        );
    }

    #[test]
    fn test_prefix_markers_set_level() {
        assert_eq!(classify("ERROR: boom", false).unwrap().0, LogLevel::Error);
        assert_eq!(classify("warn: slow", false).unwrap().0, LogLevel::Warn);
    }

    #[test]
    fn test_stream_defaults() {
        assert_eq!(classify("plain line", false).unwrap().0, LogLevel::Info);
        assert_eq!(classify("plain line", true).unwrap().0, LogLevel::Warn);
    }

    #[test]
    fn test_empty_payload_dropped() {
        assert!(classify("", false).is_none());
        assert!(classify("   \n", true).is_none());
    }

    #[test]
    fn test_message_is_trimmed_not_rewritten() {
        let (_, message) = classify("  [ERROR] kept as-is  ", false).unwrap();
        assert_eq!(message, "[ERROR] kept as-is");
    }
}
