//! Legacy bulletin-board markup to target markup.
//!
//! A transformer is an ordered list of rewrite rules applied to the whole text,
//! one after another. The fixed stage order is: adapter dialect rules, entity
//! decoding, code-block extraction, chevron escaping, bbcode rules, cleanup,
//! code restore. Nothing here fails on malformed input; unmatched tags are
//! dropped during cleanup and their content kept.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::borrow::Cow;

use super::slug::sanitize_username;
use super::text::decode_entities;

/// Lookups the rewrite rules need from the running migration.
pub trait MarkupLookup {
    /// Destination `(topic_id, post_number)` of a legacy post id.
    fn quoted_post(&self, _legacy_post_id: i64) -> Option<(i64, i64)> {
        None
    }
    /// Destination topic id for a topic id taken from already-converted markup.
    fn remapped_topic(&self, _legacy_topic_id: i64) -> Option<i64> {
        None
    }
    /// The username a legacy name was imported as, when it had to change.
    fn username_for(&self, _legacy_name: &str) -> Option<String> {
        None
    }
    fn user_exists(&self, _username: &str) -> bool {
        false
    }
}

/// Lookup that resolves nothing.
pub struct NoLookup;

impl MarkupLookup for NoLookup {}

pub type CaptureFn = fn(&Captures<'_>, &dyn MarkupLookup) -> String;
pub type TextFn = fn(&str, &dyn MarkupLookup) -> String;

enum Action {
    Template(String),
    Captures(CaptureFn),
    /// Whole-text rewrite, run only when the pattern matches somewhere.
    Text(TextFn),
}

pub struct Rule {
    name: &'static str,
    pattern: Regex,
    action: Action,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid markup rule `{name}`"))
}

impl Rule {
    /// `regex::Regex::replace_all` with `$n` template expansion.
    pub fn replace(name: &'static str, pattern: &str, template: &str) -> Result<Self> {
        Ok(Self {
            name,
            pattern: compile(name, pattern)?,
            action: Action::Template(template.to_string()),
        })
    }

    pub fn with(name: &'static str, pattern: &str, f: CaptureFn) -> Result<Self> {
        Ok(Self {
            name,
            pattern: compile(name, pattern)?,
            action: Action::Captures(f),
        })
    }

    pub fn text(name: &'static str, trigger: &str, f: TextFn) -> Result<Self> {
        Ok(Self {
            name,
            pattern: compile(name, trigger)?,
            action: Action::Text(f),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply<'t>(&self, text: &'t str, lookup: &dyn MarkupLookup) -> Cow<'t, str> {
        match &self.action {
            Action::Template(t) => self.pattern.replace_all(text, t.as_str()),
            Action::Captures(f) => self
                .pattern
                .replace_all(text, |caps: &Captures<'_>| f(caps, lookup)),
            Action::Text(f) => {
                if self.pattern.is_match(text) {
                    Cow::Owned(f(text, lookup))
                } else {
                    Cow::Borrowed(text)
                }
            }
        }
    }
}

fn apply_rules(rules: &[Rule], text: &str, lookup: &dyn MarkupLookup) -> String {
    let mut out = text.to_string();
    for rule in rules {
        if let Cow::Owned(next) = rule.apply(&out, lookup) {
            out = next;
        }
    }
    out
}

const PLACEHOLDER: char = '\u{1A}';

pub struct MarkupTransformer {
    dialect: Vec<Rule>,
    bbcode: Vec<Rule>,
    cleanup: Vec<Rule>,
    code_block: Regex,
    decode_entities: bool,
}

impl std::fmt::Debug for MarkupTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkupTransformer")
            .field("dialect", &self.dialect)
            .field("bbcode_rules", &self.bbcode.len())
            .finish()
    }
}

impl MarkupTransformer {
    pub fn new(dialect: Vec<Rule>) -> Result<Self> {
        Ok(Self {
            dialect,
            bbcode: bbcode_rules()?,
            cleanup: cleanup_rules()?,
            code_block: compile("code", r"(?is)\[code(?:=[^\]]*)?\](.*?)\[/code\]")?,
            decode_entities: true,
        })
    }

    /// Sources that store plain text (not HTML-escaped) should turn this off.
    pub fn decode_entities(mut self, on: bool) -> Self {
        self.decode_entities = on;
        self
    }

    /// Full conversion of a legacy body into target markup.
    pub fn transform(&self, raw: &str, lookup: &dyn MarkupLookup) -> String {
        let mut text = apply_rules(&self.dialect, raw, lookup);
        if self.decode_entities {
            if let Cow::Owned(decoded) = decode_entities(&text) {
                text = decoded;
            }
        }
        let (text, blocks) = self.extract_code(&text);
        let text = escape_chevrons(&text);
        let text = apply_rules(&self.bbcode, &text, lookup);
        let text = apply_rules(&self.cleanup, &text, lookup);
        restore_code(&text, &blocks).trim().to_string()
    }

    /// Only the adapter's dialect rules; used when the body is already in target markup.
    pub fn apply_dialect(&self, raw: &str, lookup: &dyn MarkupLookup) -> String {
        apply_rules(&self.dialect, raw, lookup)
    }

    fn extract_code(&self, text: &str) -> (String, Vec<String>) {
        let mut blocks = Vec::new();
        let out = self.code_block.replace_all(text, |caps: &Captures<'_>| {
            let body = caps[1].trim_matches(|c| c == '\n' || c == '\r');
            let rendered = if body.contains('\n') || body.contains('`') {
                format!("\n```\n{body}\n```\n")
            } else {
                format!("`{body}`")
            };
            blocks.push(rendered);
            format!("{PLACEHOLDER}{}{PLACEHOLDER}", blocks.len() - 1)
        });
        (out.into_owned(), blocks)
    }
}

fn escape_chevrons(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

fn restore_code(text: &str, blocks: &[String]) -> String {
    if blocks.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    for (i, block) in blocks.iter().enumerate().rev() {
        out = out.replace(&format!("{PLACEHOLDER}{i}{PLACEHOLDER}"), block);
    }
    out
}

/// `[quote="user, post:N, topic:T"]` when the post resolves, `[quote="user"]` otherwise.
pub fn quote_header(name: &str, legacy_post_id: Option<i64>, lookup: &dyn MarkupLookup) -> String {
    let name = name.trim();
    let user = lookup
        .username_for(name)
        .unwrap_or_else(|| name.to_string());
    match legacy_post_id.and_then(|id| lookup.quoted_post(id)) {
        Some((topic, post_number)) => {
            format!("[quote=\"{user}, post:{post_number}, topic:{topic}\"]")
        }
        None => format!("[quote=\"{user}\"]"),
    }
}

fn quote_with_post(caps: &Captures<'_>, lookup: &dyn MarkupLookup) -> String {
    let id = caps[2].parse::<i64>().ok();
    quote_header(&caps[1], id, lookup)
}

fn quote_named(caps: &Captures<'_>, lookup: &dyn MarkupLookup) -> String {
    let attr = caps[1].trim();
    match attr.split_once(',') {
        Some((name, rest)) => {
            let name = name.trim();
            let user = lookup
                .username_for(name)
                .unwrap_or_else(|| name.to_string());
            format!("[quote=\"{user},{rest}\"]")
        }
        None => quote_header(attr, None, lookup),
    }
}

fn url_with_text(caps: &Captures<'_>, _: &dyn MarkupLookup) -> String {
    let url = caps[1].trim();
    let label = caps[2].trim();
    if label.is_empty() || label == url {
        url.to_string()
    } else {
        format!("[{label}]({url})")
    }
}

fn media_url(caps: &Captures<'_>, _: &dyn MarkupLookup) -> String {
    let target = caps[2].trim();
    let is_video_id = target.len() == 11
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if is_video_id {
        format!("\nhttps://www.youtube.com/watch?v={target}\n")
    } else {
        format!("\n{target}\n")
    }
}

fn mention(caps: &Captures<'_>, lookup: &dyn MarkupLookup) -> String {
    let name = caps[1].trim();
    let user = lookup
        .username_for(name)
        .unwrap_or_else(|| sanitize_username(name, None));
    format!("@{user}")
}

fn heading(caps: &Captures<'_>, _: &dyn MarkupLookup) -> String {
    let level = caps[1].parse::<usize>().unwrap_or(1).clamp(1, 6);
    format!("\n{} {}\n", "#".repeat(level), caps[2].trim())
}

fn render_list(attr: &str, body: &str) -> String {
    let attr = attr.trim_start_matches('=').trim_matches(|c| c == '"' || c == '\'');
    let ordered = !attr.is_empty() && !matches!(attr, "disc" | "circle" | "square");
    let marker = if ordered { "1. " } else { "* " };
    let indent = " ".repeat(marker.len());
    let mut out = String::from("\n");
    for item in body.split("[*]").skip(1) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut lines = item.lines();
        if let Some(first) = lines.next() {
            out.push_str(marker);
            out.push_str(first.trim_end());
            out.push('\n');
        }
        for line in lines {
            if !line.trim().is_empty() {
                out.push_str(&indent);
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
    }
    out
}

/// Innermost-first list rewrite, so nested lists render as indented items.
fn rewrite_lists(text: &str, _: &dyn MarkupLookup) -> String {
    let mut out = text.to_string();
    loop {
        let lower = out.to_ascii_lowercase();
        let Some(close) = lower.find("[/list]") else {
            break;
        };
        let open = lower[..close]
            .rfind("[list")
            .filter(|&o| matches!(lower.as_bytes().get(o + 5), Some(b']') | Some(b'=')));
        let Some(open) = open else {
            out.replace_range(close..close + 7, "");
            continue;
        };
        let Some(open_end) = lower[open..close].find(']').map(|i| open + i) else {
            out.replace_range(close..close + 7, "");
            continue;
        };
        let rendered = render_list(&out[open + 5..open_end], &out[open_end + 1..close]);
        out.replace_range(open..close + 7, &rendered);
    }
    out
}

fn bbcode_rules() -> Result<Vec<Rule>> {
    Ok(vec![
        Rule::replace("bold", r"(?is)\[b\](.*?)\[/b\]", "**$1**")?,
        Rule::replace("italic", r"(?is)\[i\](.*?)\[/i\]", "*$1*")?,
        Rule::replace("underline", r"(?is)\[u\](.*?)\[/u\]", "$1")?,
        Rule::replace(
            "strike",
            r"(?is)\[(s|strike)\](.*?)\[/(?:s|strike)\]",
            "~~$2~~",
        )?,
        Rule::with(
            "url",
            r#"(?is)\[url=\s*["']?([^\]"'\s]+)["']?\s*\](.*?)\[/url\]"#,
            url_with_text,
        )?,
        Rule::replace("bare-url", r"(?is)\[url\]\s*(.*?)\s*\[/url\]", "$1")?,
        Rule::replace(
            "email",
            r#"(?is)\[email=["']?([^\]"']+)["']?\](.*?)\[/email\]"#,
            "[$2](mailto:$1)",
        )?,
        Rule::replace("bare-email", r"(?is)\[email\]\s*(.*?)\s*\[/email\]", "$1")?,
        Rule::replace("image", r"(?is)\[img(?:=[^\]]*)?\]\s*(.*?)\s*\[/img\]", "![]($1)")?,
        Rule::with(
            "media",
            r"(?is)\[(youtube|video|media|flash)(?:=[^\]]*)?\]\s*(.*?)\s*\[/(?:youtube|video|media|flash)\]",
            media_url,
        )?,
        Rule::with("mention", r"(?is)\[mention(?:=[^\]]*)?\](.*?)\[/mention\]", mention)?,
        Rule::with(
            "quote-post",
            r#"(?i)\[quote=\s*["']?([^;\]"']+?)["']?\s*;\s*(\d+)\s*\]"#,
            quote_with_post,
        )?,
        Rule::with("quote-named", r#"(?i)\[quote=\s*["']?([^\]"']+?)["']?\s*\]"#, quote_named)?,
        Rule::text("lists", r"(?i)\[/list\]", rewrite_lists)?,
        Rule::replace("rule", r"(?i)\[hr\]", "\n---\n")?,
        Rule::with("heading", r"(?is)\[h([1-6])\](.*?)\[/h[1-6]\]", heading)?,
        Rule::replace(
            "formatting",
            r"(?i)\[/?(?:font|size|color|colour|align|center|left|right|justify|indent|highlight|glow|shadow|sub|sup)(?:=[^\]]*)?\]",
            "",
        )?,
    ])
}

fn cleanup_rules() -> Result<Vec<Rule>> {
    Ok(vec![
        Rule::replace(
            "stray-tags",
            r"(?i)\[/?(?:b|i|u|s|strike|url|img|email|list|\*|youtube|video|media|flash|mention|h[1-6])(?:=[^\]]*)?\]",
            "",
        )?,
        Rule::replace("trailing-space", r"(?m)[ \t]+$", "")?,
        Rule::replace("blank-lines", r"\n{3,}", "\n\n")?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Lookup {
        posts: HashMap<i64, (i64, i64)>,
        renamed: HashMap<String, String>,
    }

    impl MarkupLookup for Lookup {
        fn quoted_post(&self, legacy_post_id: i64) -> Option<(i64, i64)> {
            self.posts.get(&legacy_post_id).copied()
        }
        fn username_for(&self, legacy_name: &str) -> Option<String> {
            self.renamed.get(legacy_name).cloned()
        }
    }

    fn transformer() -> MarkupTransformer {
        MarkupTransformer::new(Vec::new()).unwrap()
    }

    #[test]
    fn bold_and_link() {
        let out = transformer().transform("[b]hi[/b] [url=http://x]click[/url]", &NoLookup);
        assert_eq!(out, "**hi** [click](http://x)");
    }

    #[test]
    fn quotes_resolve_through_lookup() {
        let lookup = Lookup {
            posts: HashMap::from([(417, (12, 3))]),
            renamed: HashMap::from([("Bob".to_string(), "bob_1".to_string())]),
        };
        let t = transformer();
        assert_eq!(
            t.transform("[quote=Bob;417]hello[/quote]", &lookup),
            "[quote=\"bob_1, post:3, topic:12\"]hello[/quote]"
        );
        assert_eq!(
            t.transform("[quote=\"alice\";999]x[/quote]", &lookup),
            "[quote=\"alice\"]x[/quote]"
        );
        assert_eq!(
            t.transform("[quote=\"alice, post:2, topic:5\"]x[/quote]", &lookup),
            "[quote=\"alice, post:2, topic:5\"]x[/quote]"
        );
    }

    #[test]
    fn lists_and_nesting() {
        let t = transformer();
        assert_eq!(t.transform("[list][*]a[*]b[/list]", &NoLookup), "* a\n* b");
        assert_eq!(
            t.transform("[list=1][*]one[*]two[/list]", &NoLookup),
            "1. one\n1. two"
        );
        let nested = t.transform("[list][*]a[list][*]b[/list][*]c[/list]", &NoLookup);
        assert_eq!(nested, "* a\n  * b\n* c");
    }

    #[test]
    fn code_is_protected_from_escaping() {
        let t = transformer();
        assert_eq!(
            t.transform("[code]<b>[i]x[/i]</b>[/code] <i>", &NoLookup),
            "`<b>[i]x[/i]</b>` &lt;i&gt;"
        );
        assert_eq!(
            t.transform("[code]\nfn main() {}\nlet x = 1;\n[/code]", &NoLookup),
            "```\nfn main() {}\nlet x = 1;\n```"
        );
    }

    #[test]
    fn malformed_markup_keeps_content() {
        let t = transformer();
        assert_eq!(t.transform("[b]bold [url=http://y]link", &NoLookup), "bold link");
        assert_eq!(
            t.transform("[color=red][size=4]Hot[/size][/color] &amp; new", &NoLookup),
            "Hot & new"
        );
    }

    #[test]
    fn media_and_mentions() {
        let t = transformer();
        assert_eq!(
            t.transform("see [youtube]dQw4w9WgXcQ[/youtube]", &NoLookup),
            "see\nhttps://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
        assert_eq!(t.transform("[mention]Jane Doe[/mention] hi", &NoLookup), "@Jane_Doe hi");
    }

    #[test]
    fn dialect_rules_run_first() {
        let dialect = vec![Rule::replace("php", r"(?is)\[php\](.*?)\[/php\]", "[code]$1[/code]").unwrap()];
        let t = MarkupTransformer::new(dialect).unwrap();
        assert_eq!(t.transform("[php]<?php echo 1;[/php]", &NoLookup), "`<?php echo 1;`");
        assert_eq!(t.apply_dialect("[php]x[/php] [b]y[/b]", &NoLookup), "[code]x[/code] [b]y[/b]");
    }
}
