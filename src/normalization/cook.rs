//! Pre-rendered ("cooked") HTML for target markup.
//!
//! Quote blocks and lone YouTube links are swapped for placeholders, the rest is
//! rendered with pulldown-cmark, then the placeholders are filled back in.

use anyhow::{Context, Result};
use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag, TagEnd, TextMergeStream};
use regex::Regex;

use super::bbcode::MarkupLookup;
use super::text::escape_html;

const PLACEHOLDER: char = '\u{1A}';

pub struct Cooker {
    youtube: Regex,
}

struct QuoteAttrs {
    username: Option<String>,
    post: Option<i64>,
    topic: Option<i64>,
}

fn parse_quote_attrs(attr: &str) -> QuoteAttrs {
    let attr = attr
        .trim()
        .trim_start_matches('=')
        .trim_matches(|c| c == '"' || c == '\'');
    let mut parts = attr.split(',').map(str::trim);
    let username = parts
        .next()
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);
    let mut out = QuoteAttrs {
        username,
        post: None,
        topic: None,
    };
    for part in parts {
        if let Some(v) = part.strip_prefix("post:") {
            out.post = v.trim().parse().ok();
        } else if let Some(v) = part.strip_prefix("topic:") {
            out.topic = v.trim().parse().ok();
        }
    }
    out
}

fn quote_html(attrs: &QuoteAttrs, inner_html: &str) -> String {
    let mut out = String::from("<aside class=\"quote no-group\"");
    if let Some(u) = &attrs.username {
        out.push_str(&format!(" data-username=\"{}\"", escape_html(u)));
    }
    if let Some(p) = attrs.post {
        out.push_str(&format!(" data-post=\"{p}\""));
    }
    if let Some(t) = attrs.topic {
        out.push_str(&format!(" data-topic=\"{t}\""));
    }
    out.push_str(">\n");
    if let Some(u) = &attrs.username {
        out.push_str(&format!(
            "<div class=\"title\">\n<div class=\"quote-controls\"></div>\n {}:</div>\n",
            escape_html(u)
        ));
    }
    out.push_str("<blockquote>\n");
    out.push_str(inner_html.trim_end());
    out.push_str("\n</blockquote>\n</aside>\n");
    out
}

fn is_mention_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Split a text run around `@name` tokens that name existing users.
fn link_mentions<'a>(text: &str, lookup: &dyn MarkupLookup, events: &mut Vec<Event<'a>>) {
    let mut plain = String::new();
    let mut rest = text;
    while let Some(at) = rest.find('@') {
        let preceded_ok = rest[..at]
            .chars()
            .next_back()
            .map_or(plain.is_empty() || !plain.ends_with(is_mention_char), |c| {
                !is_mention_char(c)
            });
        let after = &rest[at + 1..];
        let len = after.find(|c| !is_mention_char(c)).unwrap_or(after.len());
        let name = after[..len].trim_end_matches(['.', '-']);
        if preceded_ok && !name.is_empty() && lookup.user_exists(name) {
            plain.push_str(&rest[..at]);
            if !plain.is_empty() {
                events.push(Event::Text(CowStr::from(std::mem::take(&mut plain))));
            }
            let link = format!(
                "<a class=\"mention\" href=\"/u/{}\">@{}</a>",
                escape_html(&name.to_lowercase()),
                escape_html(name)
            );
            events.push(Event::InlineHtml(CowStr::from(link)));
            rest = &after[name.len()..];
        } else {
            plain.push_str(&rest[..=at]);
            rest = after;
        }
    }
    plain.push_str(rest);
    if !plain.is_empty() {
        events.push(Event::Text(CowStr::from(plain)));
    }
}

fn render_markdown(text: &str, lookup: &dyn MarkupLookup) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_TABLES);
    let parser = TextMergeStream::new(Parser::new_ext(text, opts));

    let mut events: Vec<Event<'_>> = Vec::new();
    let mut in_code = 0usize;
    let mut in_link = 0usize;
    for ev in parser {
        match ev {
            Event::Start(Tag::CodeBlock(_)) => {
                in_code += 1;
                events.push(ev);
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code = in_code.saturating_sub(1);
                events.push(ev);
            }
            Event::Start(Tag::Link { .. }) => {
                in_link += 1;
                events.push(ev);
            }
            Event::End(TagEnd::Link) => {
                in_link = in_link.saturating_sub(1);
                events.push(ev);
            }
            Event::Text(t) if in_code == 0 && in_link == 0 && t.contains('@') => {
                link_mentions(&t, lookup, &mut events);
            }
            other => events.push(other),
        }
    }
    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, events.into_iter());
    out
}

impl Cooker {
    pub fn new() -> Result<Self> {
        let youtube = Regex::new(
            r"(?m)^[ \t]*https?://(?:www\.|m\.)?(?:youtube\.com/watch\?v=|youtu\.be/)([\w-]{11})\S*[ \t]*$",
        )
        .context("invalid youtube pattern")?;
        Ok(Self { youtube })
    }

    pub fn cook(&self, raw: &str, lookup: &dyn MarkupLookup) -> String {
        let mut fragments: Vec<String> = Vec::new();
        let text = self.extract_quotes(raw, lookup, &mut fragments);
        let text = self
            .youtube
            .replace_all(&text, |caps: &regex::Captures<'_>| {
                fragments.push(format!(
                    "<div class=\"lazyYT\" data-youtube-id=\"{}\" data-width=\"480\" data-height=\"270\"></div>\n",
                    &caps[1]
                ));
                format!("\n\n{PLACEHOLDER}{}{PLACEHOLDER}\n\n", fragments.len() - 1)
            })
            .into_owned();

        let mut out = render_markdown(&text, lookup);
        for (i, fragment) in fragments.iter().enumerate().rev() {
            let token = format!("{PLACEHOLDER}{i}{PLACEHOLDER}");
            out = out
                .replace(&format!("<p>{token}</p>\n"), fragment)
                .replace(&token, fragment);
        }
        out.trim_end().to_string()
    }

    /// Innermost quotes first; each becomes a fragment holding its rendered body.
    fn extract_quotes(
        &self,
        raw: &str,
        lookup: &dyn MarkupLookup,
        fragments: &mut Vec<String>,
    ) -> String {
        let mut out = raw.to_string();
        loop {
            let lower = out.to_ascii_lowercase();
            let Some(close) = lower.find("[/quote]") else {
                break;
            };
            let open = lower[..close]
                .rfind("[quote")
                .filter(|&o| matches!(lower.as_bytes().get(o + 6), Some(b']') | Some(b'=')));
            let header_end = open.and_then(|o| lower[o..close].find(']').map(|i| o + i));
            let (Some(open), Some(header_end)) = (open, header_end) else {
                out.replace_range(close..close + 8, "");
                continue;
            };
            let attrs = parse_quote_attrs(&out[open + 6..header_end]);
            let inner = render_markdown(out[header_end + 1..close].trim(), lookup);
            fragments.push(quote_html(&attrs, &inner));
            let token = format!("\n\n{PLACEHOLDER}{}{PLACEHOLDER}\n\n", fragments.len() - 1);
            out.replace_range(open..close + 8, &token);
        }
        out
    }
}
