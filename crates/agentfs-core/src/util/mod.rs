pub mod content;
pub mod http;
pub mod path;
pub mod pattern;

pub use content::{
    check_empty_content, format_read_response, format_with_line_numbers, perform_replacement,
    truncate_if_too_long, Truncate, EMPTY_CONTENT_WARNING, TRUNCATION_GUIDANCE,
};
pub use path::validate_and_normalize;

/// Get current timestamp in ISO format.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Convert fractional epoch seconds (as printed by `find -printf %T@`) to RFC 3339.
pub fn iso_from_epoch_secs(secs: f64) -> Option<String> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    chrono::DateTime::from_timestamp(whole, nanos).map(|dt| dt.to_rfc3339())
}

/// Convert a filesystem modification time to RFC 3339.
pub fn iso_from_system_time(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339()
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Keep at most `max_chars` characters without splitting a multi-byte character.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
