//! Legacy text decoding: charsets, double-encoded UTF-8 and HTML entities.

use encoding_rs::{Encoding, WINDOWS_1252};
use std::borrow::Cow;

/// Resolve a WHATWG encoding label such as `latin1` or `windows-1251`.
pub fn charset_for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Decode raw column bytes. Valid UTF-8 is taken as-is; anything else is decoded
/// with the source's declared charset (windows-1252 when none is configured).
pub fn decode_legacy(bytes: &[u8], charset: Option<&'static Encoding>) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    let enc = charset.unwrap_or(WINDOWS_1252);
    let (text, _) = enc.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Undo the classic "UTF-8 stored through a latin1 connection" corruption
/// (`CafÃ©` -> `Café`). Text that does not round-trip cleanly is left alone.
pub fn repair_mojibake(s: &str) -> Cow<'_, str> {
    if !s.contains(['Ã', 'Â', 'â', 'Ð', 'Ñ']) {
        return Cow::Borrowed(s);
    }
    let (bytes, _, had_errors) = WINDOWS_1252.encode(s);
    if had_errors {
        return Cow::Borrowed(s);
    }
    match String::from_utf8(bytes.into_owned()) {
        Ok(fixed) if fixed != s => Cow::Owned(fixed),
        _ => Cow::Borrowed(s),
    }
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "laquo" => '«',
        "raquo" => '»',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "euro" => '€',
        "pound" => '£',
        "middot" => '·',
        "bull" => '•',
        "deg" => '°',
        "times" => '×',
        "eacute" => 'é',
        "egrave" => 'è',
        "agrave" => 'à',
        "aacute" => 'á',
        "ouml" => 'ö',
        "auml" => 'ä',
        "uuml" => 'ü',
        "szlig" => 'ß',
        "ccedil" => 'ç',
        "ntilde" => 'ñ',
        _ => return None,
    };
    Some(c)
}

fn numeric_entity(body: &str) -> Option<char> {
    let code = if let Some(hex) = body.strip_prefix(['x', 'X']) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        body.parse::<u32>().ok()?
    };
    match char::from_u32(code) {
        Some('\0') | None => None,
        Some(c) => Some(c),
    }
}

/// Decode HTML character references. Unknown or malformed references pass through.
pub fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let decoded = tail
            .find(';')
            .filter(|&end| end > 0 && end <= 10)
            .and_then(|end| {
                let body = &tail[..end];
                let c = match body.strip_prefix('#') {
                    Some(num) => numeric_entity(num),
                    None => named_entity(body),
                };
                c.map(|c| (c, end))
            });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Normalize a post body before markup conversion: NUL bytes removed, line endings
/// unified, mojibake repaired. Entities are left for the markup pipeline.
pub fn clean_body(raw: &str) -> String {
    let repaired = repair_mojibake(raw);
    let mut out = String::with_capacity(repaired.len());
    let mut chars = repaired.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\0' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            c => out.push(c),
        }
    }
    out
}

/// Normalize a single-line field (titles, names): cleaned, entity-decoded and
/// whitespace-collapsed.
pub fn normalize_line(raw: &str) -> String {
    let body = clean_body(raw);
    decode_entities(&body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape text for inclusion in HTML attributes and bodies.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_and_numeric_entities() {
        assert_eq!(
            decode_entities("Tom &amp; Jerry &#8220;hi&#x201D; &nbsp;x"),
            "Tom & Jerry “hi” \u{a0}x"
        );
        assert_eq!(decode_entities("a & b &bogus; &#;"), "a & b &bogus; &#;");
    }

    #[test]
    fn legacy_bytes_fall_back_to_charset() {
        assert_eq!(decode_legacy(b"caf\xe9", None), "café");
        assert_eq!(decode_legacy("café".as_bytes(), None), "café");
        let cyr = charset_for_label("windows-1251");
        assert_eq!(decode_legacy(b"\xcf\xf0\xe8", cyr), "При");
    }

    #[test]
    fn repairs_double_encoded_utf8() {
        assert_eq!(repair_mojibake("CafÃ©"), "Café");
        assert_eq!(repair_mojibake("plain ascii"), "plain ascii");
        assert_eq!(repair_mojibake("SÃO"), "SÃO");
    }

    #[test]
    fn body_cleanup_keeps_entities() {
        assert_eq!(clean_body("a\r\nb\rc\0d &amp;"), "a\nb\ncd &amp;");
        assert_eq!(normalize_line("  Hello\r\n  &quot;world&quot; "), "Hello \"world\"");
    }
}
