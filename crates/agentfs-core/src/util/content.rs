//! Formatting and editing helpers shared by every backend.

use super::truncate_chars;

/// Returned instead of line-numbered output when a file has no visible content.
pub const EMPTY_CONTENT_WARNING: &str = "System reminder: File exists but has empty contents";

/// Lines longer than this are cut when displayed.
pub const MAX_LINE_LENGTH: usize = 2000;

/// Width of the right-aligned line-number column.
pub const LINE_NUMBER_WIDTH: usize = 6;

/// Default number of lines returned by a read.
pub const DEFAULT_READ_LIMIT: usize = 2000;

pub const TOOL_RESULT_TOKEN_LIMIT: usize = 20_000;
pub const CHARS_PER_TOKEN: usize = 4;

/// Marker appended to any result cut down to the token budget.
pub const TRUNCATION_GUIDANCE: &str =
    "... [results truncated, try being more specific with your parameters]";

/// Render lines `cat -n` style, numbering from `start_line` (1-indexed).
pub fn format_with_line_numbers<S: AsRef<str>>(lines: &[S], start_line: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            format!(
                "{:>width$}\t{}",
                start_line + i,
                truncate_chars(line.as_ref(), MAX_LINE_LENGTH),
                width = LINE_NUMBER_WIDTH
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn check_empty_content(content: &str) -> Option<&'static str> {
    if content.trim().is_empty() {
        Some(EMPTY_CONTENT_WARNING)
    } else {
        None
    }
}

/// Produce the read response for `content`: the empty-file reminder, an
/// offset error, or `limit` numbered lines starting after `offset`.
pub fn format_read_response(content: &str, offset: usize, limit: usize) -> String {
    if let Some(warning) = check_empty_content(content) {
        return warning.to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    if offset >= lines.len() {
        return format!(
            "Error: Line offset {} exceeds file length ({} lines)",
            offset,
            lines.len()
        );
    }

    let end = offset.saturating_add(limit).min(lines.len());
    format_with_line_numbers(&lines[offset..end], offset + 1)
}

/// Replace `old` with `new` in `content`.
///
/// Returns the new content and the number of occurrences found before the
/// edit, or an error message the caller can act on.
pub fn perform_replacement(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<(String, usize), String> {
    let occurrences = content.matches(old).count();
    if occurrences == 0 {
        return Err(format!("Error: String not found in file: '{old}'"));
    }
    if occurrences > 1 && !replace_all {
        return Err(format!(
            "Error: String '{old}' appears {occurrences} times. Use replace_all=True to replace all occurrences."
        ));
    }

    let updated = if replace_all {
        content.replace(old, new)
    } else {
        content.replacen(old, new, 1)
    };
    Ok((updated, occurrences))
}

/// Results that can be cut down to a character budget.
pub trait Truncate: Sized {
    fn truncate_to(self, limit_chars: usize) -> Self;
}

impl Truncate for String {
    fn truncate_to(self, limit_chars: usize) -> Self {
        if self.chars().count() <= limit_chars {
            return self;
        }
        format!("{}\n{}", truncate_chars(&self, limit_chars), TRUNCATION_GUIDANCE)
    }
}

impl Truncate for Vec<String> {
    fn truncate_to(mut self, limit_chars: usize) -> Self {
        let total: usize = self.iter().map(|s| s.chars().count()).sum();
        if total <= limit_chars {
            return self;
        }
        // Keep a share of the entries proportional to the budget.
        let keep = self.len() * limit_chars / total;
        self.truncate(keep);
        self.push(TRUNCATION_GUIDANCE.to_string());
        self
    }
}

/// Apply the default tool-result budget.
pub fn truncate_if_too_long<T: Truncate>(result: T) -> T {
    result.truncate_to(TOOL_RESULT_TOKEN_LIMIT * CHARS_PER_TOKEN)
}
