/// Characters that are not allowed in a download name on common filesystems.
pub const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Used when nothing usable is left after sanitizing.
pub const FALLBACK_NAME: &str = "media";

/// Turn a user- or engine-supplied title into a safe display filename (without extension).
///
/// Strips every forbidden character and control character, then trims surrounding
/// whitespace. Never returns an empty string.
pub fn sanitize_download_name(candidate: &str) -> String {
    let cleaned: String = candidate
        .chars()
        .filter(|c| !FORBIDDEN_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Pick the base name for a download: a non-blank custom name wins over the source title.
pub fn build_download_name(custom_name: Option<&str>, source_title: &str) -> String {
    let base = custom_name
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(source_title);
    sanitize_download_name(base)
}
