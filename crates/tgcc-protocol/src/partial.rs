//! Tolerant field extraction from partial JSON.
//!
//! Tool input streams in as `input_json_delta` fragments; the accumulated
//! prefix usually does not parse yet. The sub-agent tracker still wants a
//! display label as early as possible, so this module pulls the first
//! complete string value for a known key out of an incomplete document.

/// Extract the string value of `key` from a (possibly incomplete) JSON
/// fragment.
///
/// Returns `None` when the key is absent or its value's closing quote has
/// not arrived yet. Escape sequences are decoded (`\n`, `\t`, `\"`, `\\`,
/// `\uXXXX`); an unterminated escape also yields `None`.
pub fn extract_string_field(fragment: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let key_at = fragment.find(&needle)?;
    let rest = &fragment[key_at + needle.len()..];

    // Skip whitespace, the colon, more whitespace, then require a quote.
    let rest = rest.trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;

    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                '/' => out.push('/'),
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{0008}'),
                'f' => out.push('\u{000C}'),
                'u' => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() < 4 {
                        return None;
                    }
                    let code = u32::from_str_radix(&hex, 16).ok()?;
                    out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                }
                _ => return None,
            },
            _ => out.push(c),
        }
    }
    // Ran off the end of the fragment before the closing quote.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_value_extracts() {
        let fragment = r#"{"description":"Scout the auth module","prompt":"Look at"#;
        assert_eq!(
            extract_string_field(fragment, "description"),
            Some("Scout the auth module".to_string())
        );
    }

    #[test]
    fn incomplete_value_yields_none() {
        let fragment = r#"{"description":"Scout the auth mo"#;
        assert_eq!(extract_string_field(fragment, "description"), None);
    }

    #[test]
    fn missing_key_yields_none() {
        assert_eq!(extract_string_field(r#"{"name":"x"}"#, "description"), None);
    }

    #[test]
    fn escapes_are_decoded() {
        let fragment = r#"{"name":"line one\nline \"two\" \\ done","x":1"#;
        assert_eq!(
            extract_string_field(fragment, "name"),
            Some("line one\nline \"two\" \\ done".to_string())
        );
    }

    #[test]
    fn unicode_escape_decodes() {
        let fragment = r#"{"name":"Agent"}"#;
        assert_eq!(extract_string_field(fragment, "name"), Some("Agent".to_string()));
    }

    #[test]
    fn dangling_escape_yields_none() {
        assert_eq!(extract_string_field(r#"{"name":"abc\"#, "name"), None);
        assert_eq!(extract_string_field(r#"{"name":"abc\u00"#, "name"), None);
    }

    #[test]
    fn non_string_value_yields_none() {
        assert_eq!(extract_string_field(r#"{"count":42}"#, "count"), None);
    }

    #[test]
    fn whitespace_around_colon_is_tolerated() {
        let fragment = "{\"name\" :  \"spaced\"}";
        assert_eq!(extract_string_field(fragment, "name"), Some("spaced".to_string()));
    }
}
