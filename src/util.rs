//! Small path and text helpers shared by the lifecycle components.

use camino::Utf8PathBuf;

/// Expands a leading `~/` prefix to the operator's home directory.
///
/// When no home directory can be resolved the input is returned unchanged so
/// the caller surfaces a "not found" error naming the literal path.
///
/// # Examples
///
/// ```
/// # use clwd::util::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// assert!(!expand_tilde("~/.ssh/id_ed25519").starts_with('~'));
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Returns the operator's home directory as a UTF-8 path, if it has one.
#[must_use]
pub fn home_dir() -> Option<Utf8PathBuf> {
    dirs::home_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

/// Keeps at most `max_lines` trailing lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(max_lines);
    lines
        .into_iter()
        .skip(skip)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replaces every occurrence of each non-empty secret with a placeholder.
#[must_use]
pub fn redact(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.trim().is_empty())
        .fold(text.to_owned(), |acc, secret| acc.replace(secret, "[REDACTED]"))
}
