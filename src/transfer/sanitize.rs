//! Filename sanitisation for received files.
//!
//! Boards send whatever the remote filesystem holds, including characters
//! that are illegal locally. Every receive path funnels on-wire names
//! through here before touching the filesystem.

/// Characters replaced with `-` in received filenames.
const ILLEGAL: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Fallback name when sanitisation leaves nothing usable.
const FALLBACK: &str = "download.dat";

/// Sanitise a received filename.
///
/// Illegal characters become `-`, leading/trailing dots and spaces are
/// trimmed, and `default_ext` (with leading dot, e.g. `".prg"`) is appended
/// when the name has no extension.
pub fn sanitize_filename(name: &str, default_ext: &str) -> String {
    let mut safe: String = name
        .chars()
        .map(|c| if ILLEGAL.contains(&c) { '-' } else { c })
        .collect();
    safe = safe.trim_matches(|c| c == '.' || c == ' ').to_string();

    if safe.is_empty() {
        return FALLBACK.to_string();
    }

    if !safe.contains('.') && !default_ext.is_empty() {
        safe.push_str(default_ext);
    }
    safe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name_gets_extension() {
        assert_eq!(sanitize_filename("GAME", ".prg"), "GAME.prg");
    }

    #[test]
    fn test_existing_extension_kept() {
        assert_eq!(sanitize_filename("GAME.SEQ", ".prg"), "GAME.SEQ");
    }

    #[test]
    fn test_illegal_characters_replaced() {
        assert_eq!(
            sanitize_filename("a/b\\c:d*e?f\"g<h>i|j", ".prg"),
            "a-b-c-d-e-f-g-h-i-j.prg"
        );
    }

    #[test]
    fn test_dots_and_spaces_trimmed() {
        assert_eq!(sanitize_filename("  ..name.. ", ".prg"), "name.prg");
    }

    #[test]
    fn test_empty_falls_back() {
        assert_eq!(sanitize_filename("", ".prg"), "download.dat");
        assert_eq!(sanitize_filename(" ... ", ".prg"), "download.dat");
    }

    #[test]
    fn test_no_default_extension() {
        assert_eq!(sanitize_filename("NOTES", ""), "NOTES");
    }
}
