/// Longest base name, in characters, used in headers and paths.
pub const MAX_BASE_NAME_CHARS: usize = 120;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Run {
    Text,
    Illegal,
    Space,
}

fn is_path_unsafe(character: char) -> bool {
    matches!(
        character,
        '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'
    ) || (character.is_control() && !character.is_whitespace())
}

/// Makes a user-supplied title safe for file names and headers: runs of
/// path-unsafe characters become a single `_`, whitespace runs a single space,
/// and the result is trimmed and cut to [`MAX_BASE_NAME_CHARS`].
pub fn safe_filename(raw: Option<&str>, fallback: &str) -> String {
    let raw = raw.filter(|value| !value.is_empty()).unwrap_or(fallback);

    let mut cleaned = String::with_capacity(raw.len());
    let mut previous = Run::Text;
    for character in raw.chars() {
        if is_path_unsafe(character) {
            if previous != Run::Illegal {
                cleaned.push('_');
            }
            previous = Run::Illegal;
        } else if character.is_whitespace() {
            if previous != Run::Space {
                cleaned.push(' ');
            }
            previous = Run::Space;
        } else {
            cleaned.push(character);
            previous = Run::Text;
        }
    }

    let truncated = cleaned
        .trim()
        .chars()
        .take(MAX_BASE_NAME_CHARS)
        .collect::<String>();

    if truncated.is_empty() {
        fallback.to_string()
    } else {
        truncated
    }
}

/// Keeps a client-supplied extension only when it is a short alphanumeric token.
pub fn safe_extension(raw: Option<&str>, fallback: &str) -> String {
    raw.map(|value| value.trim().trim_start_matches('.'))
        .filter(|value| {
            !value.is_empty()
                && value.len() <= 10
                && value.chars().all(|character| character.is_ascii_alphanumeric())
        })
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| fallback.to_string())
}

/// `attachment` disposition with an ASCII fallback name and an RFC 5987
/// percent-encoded UTF-8 name.
pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_unsafe_characters_collapses_whitespace_and_truncates() {
        let raw = format!(
            "a/b\\c:d*e?f\"g<h>i|j   lots \t\n of    space {}",
            "x".repeat(200)
        );

        let safe = safe_filename(Some(&raw), "download");

        assert_eq!(safe.chars().count(), MAX_BASE_NAME_CHARS);
        assert!(!safe.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|']));
        assert!(!safe.contains("  "));
        assert!(safe.starts_with("a_b_c_d_e_f_g_h_i_j lots of space x"));
    }

    #[test]
    fn runs_of_unsafe_characters_become_one_underscore() {
        assert_eq!(safe_filename(Some("a//\\::b"), "download"), "a_b");
        assert_eq!(safe_filename(Some("  My   Clip  "), "download"), "My Clip");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let raw = "é".repeat(130);
        let safe = safe_filename(Some(&raw), "download");
        assert_eq!(safe.chars().count(), 120);
    }

    #[test]
    fn empty_or_blank_titles_use_fallback() {
        assert_eq!(safe_filename(None, "download"), "download");
        assert_eq!(safe_filename(Some(""), "preview"), "preview");
        assert_eq!(safe_filename(Some("   "), "download"), "download");
    }

    #[test]
    fn control_characters_cannot_reach_headers() {
        assert_eq!(safe_filename(Some("a\u{0}b\u{7}c"), "download"), "a_b_c");
    }

    #[test]
    fn extension_must_be_short_alphanumeric() {
        assert_eq!(safe_extension(Some("WEBM"), "mp4"), "webm");
        assert_eq!(safe_extension(Some(".m4a"), "mp4"), "m4a");
        assert_eq!(safe_extension(Some("../etc"), "mp4"), "mp4");
        assert_eq!(safe_extension(None, "mp4"), "mp4");
    }

    #[test]
    fn content_disposition_carries_ascii_and_encoded_names() {
        let header = build_content_disposition("My Clip.mp4");
        assert_eq!(
            header,
            "attachment; filename=\"My Clip.mp4\"; filename*=UTF-8''My%20Clip.mp4"
        );

        let unicode = build_content_disposition("Canción.mp3");
        assert!(unicode.contains("filename=\"Canci_n.mp3\""));
        assert!(unicode.contains("filename*=UTF-8''Canci%C3%B3n.mp3"));
    }
}
