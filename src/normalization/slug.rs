//! Derived identifiers: usernames, slugs, tag names and display titles.

use super::text::escape_html;

pub const MAX_USERNAME_LEN: usize = 60;
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_TAG_LEN: usize = 20;

fn trim_specials(s: &str) -> &str {
    s.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

fn squeeze_username(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_special = false;
    for c in raw.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '_'
        };
        let special = !c.is_ascii_alphanumeric();
        if special && last_special {
            continue;
        }
        out.push(c);
        last_special = special;
    }
    let mut name = trim_specials(&out).to_string();
    if name.len() > MAX_USERNAME_LEN {
        name.truncate(MAX_USERNAME_LEN);
        name = trim_specials(&name).to_string();
    }
    name
}

/// Turn a legacy login name into a valid username. Falls back to the e-mail
/// local part, then to `user`; short names are padded with `1`.
pub fn sanitize_username(raw: &str, email: Option<&str>) -> String {
    let mut name = squeeze_username(raw);
    if name.is_empty() {
        if let Some(local) = email.and_then(|e| e.split('@').next()) {
            name = squeeze_username(local);
        }
    }
    if name.is_empty() {
        name = "user".to_string();
    }
    while name.len() < MIN_USERNAME_LEN {
        name.push('1');
    }
    name
}

/// Lowercase ASCII slug; runs of other characters become a single `-`.
/// May be empty for titles without any ASCII letters or digits.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.truncate(255);
    out
}

/// Normalize a tag name: lowercase, whitespace to `-`, URL-hostile punctuation removed.
pub fn clean_tag(raw: &str) -> String {
    const FORBIDDEN: &str = "/?#[]@!$&'()*+,;=.%\\`^|{}\"<>";
    let mut out = String::new();
    for c in raw.trim().to_lowercase().chars() {
        if c.is_whitespace() || c == '-' {
            if !out.is_empty() && !out.ends_with('-') {
                out.push('-');
            }
        } else if !FORBIDDEN.contains(c) {
            out.push(c);
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(MAX_TAG_LEN).collect();
    trimmed.trim_end_matches('-').to_string()
}

pub fn fancy_title(title: &str) -> String {
    escape_html(title)
}

pub fn word_count(raw: &str) -> i32 {
    i32::try_from(raw.split_whitespace().count()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_sanitized() {
        assert_eq!(sanitize_username("  John  Smith!! ", None), "John_Smith");
        assert_eq!(sanitize_username("..__x.y__..", None), "x.y");
        assert_eq!(sanitize_username("???", Some("mary.jones@example.com")), "mary.jones");
        assert_eq!(sanitize_username("", None), "user");
        assert_eq!(sanitize_username("Al", None), "Al1");
        assert_eq!(sanitize_username(&"a".repeat(80), None).len(), MAX_USERNAME_LEN);
    }

    #[test]
    fn slugs_and_tags() {
        assert_eq!(slugify("Hello, World! 2024"), "hello-world-2024");
        assert_eq!(slugify("¿Qué?"), "qu");
        assert_eq!(slugify("日本語"), "");
        assert_eq!(clean_tag("  Rust Lang "), "rust-lang");
        assert_eq!(clean_tag("c++/#gamedev"), "cgamedev");
    }

    #[test]
    fn fancy_title_escapes_markup() {
        assert_eq!(fancy_title("<b>\"hi\" & bye"), "&lt;b&gt;&quot;hi&quot; &amp; bye");
        assert_eq!(word_count("one two\n three "), 3);
    }
}
