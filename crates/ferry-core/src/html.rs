//! HTML rewriting for pages served in reverse mode.
//!
//! The document is walked with a regex tokenizer that recognizes comments,
//! `<script>` and `<style>` elements (whose bodies are passed through
//! untouched), `</head>` and start tags. Only start tags whose URL attributes
//! change are re-rendered; everything else is copied byte for byte.
//!
//! URL handling, with the base URL being the first `<base href>` resolved
//! against the fetched target (or the target itself):
//!
//! * `<base href>` becomes absolute, proxied when links are proxied.
//! * `<a href>` with links proxied: absolute, protocol-relative and
//!   root-relative values are resolved and proxied; relative ones are left
//!   for the browser to resolve against the base.
//! * `<link href>`, every `src` and any other root-relative `href` are
//!   resolved against the base but never proxied.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::state::ServerState;
use crate::target::has_scheme;

/// Icon injected into every rewritten page.
pub const FAVICON_URL: &str = "https://js.sitecues.com/favicon.ico";

/// Attribute list. Whitespace separates attributes except after a quoted
/// value, where browsers accept none.
const ATTRS: &str = r#"(?:\s+(?:[^\s"'>/=]+\s*=\s*(?:"[^"]*"|'[^']*')\s*)*(?:[^\s"'>/=]+(?:\s*=\s*[^\s"'=<>`]+)?)?)*"#;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)(?P<comment><!--.*?-->)|<script(?P<script_attrs>{ATTRS})\s*>(?P<script_body>.*?)</script\s*>|(?P<style><style\b[^>]*>.*?</style\s*>)|(?P<head_close></head\s*>)|<(?P<name>[a-z][a-z0-9:-]*)(?P<attrs>{ATTRS})\s*(?P<self_close>/?)>"
    ))
    .expect("valid html token regex")
});

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid html attribute regex")
});

static ENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#([0-9]+)|#[xX]([0-9a-fA-F]+)|(amp|quot|apos|lt|gt|nbsp));")
        .expect("valid html entity regex")
});

static DOCTYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*<!doctype[^>]*>").expect("valid doctype regex"));

/// Rewrites `html` fetched from `target` so that it renders through the proxy.
pub fn rewrite_document(state: &ServerState, html: &str, target: &Url) -> String {
    let outline = Outline::scan(html);
    let base = outline
        .base_href
        .as_deref()
        .and_then(|href| target.join(href.trim()).ok())
        .filter(is_http)
        .unwrap_or_else(|| target.clone());

    let mut rewriter = Rewriter {
        state,
        target,
        base,
        outline,
        head_done: false,
        base_done: false,
        loader_done: false,
    };

    let mut output = TOKEN_RE
        .replace_all(html, |caps: &Captures| rewriter.token(caps))
        .into_owned();

    if !rewriter.head_done {
        let head = format!("<head>{}</head>", rewriter.head_contents());
        let at = DOCTYPE_RE.find(&output).map_or(0, |m| m.end());
        output.insert_str(at, &head);
    }
    output
}

/// Escapes a value for use inside a double-quoted attribute.
pub(crate) fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn decode_entities(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }
    ENTITY_RE.replace_all(value, |caps: &Captures| {
        let decoded = if let Some(dec) = caps.get(1) {
            dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
        } else if let Some(hex) = caps.get(2) {
            u32::from_str_radix(hex.as_str(), 16)
                .ok()
                .and_then(char::from_u32)
        } else {
            caps.get(3).and_then(|name| match name.as_str() {
                "amp" => Some('&'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "nbsp" => Some('\u{a0}'),
                _ => None,
            })
        };
        decoded.map_or_else(|| caps[0].to_string(), String::from)
    })
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn is_root_relative(value: &str) -> bool {
    let value = value.trim_start();
    value.starts_with('/') && !value.starts_with("//")
}

/// Structural facts gathered before rewriting.
#[derive(Debug, Default)]
struct Outline {
    base_href: Option<String>,
    has_head: bool,
    has_head_close: bool,
    has_body: bool,
}

impl Outline {
    fn scan(html: &str) -> Self {
        let mut outline = Self::default();
        for caps in TOKEN_RE.captures_iter(html) {
            if caps.name("head_close").is_some() {
                outline.has_head_close = true;
                continue;
            }
            let (Some(name), Some(attrs)) = (caps.name("name"), caps.name("attrs")) else {
                continue;
            };
            let tag = Tag::parse(name.as_str(), attrs.as_str(), false);
            if tag.is("head") {
                outline.has_head = true;
            } else if tag.is("body") {
                outline.has_body = true;
            } else if tag.is("base") && outline.base_href.is_none() {
                outline.base_href = tag
                    .get("href")
                    .filter(|href| !href.trim().is_empty())
                    .map(str::to_string);
            }
        }
        outline
    }
}

#[derive(Debug)]
struct Attr<'h> {
    name: &'h str,
    raw: &'h str,
    value: Option<String>,
    replacement: Option<String>,
}

/// A start tag, re-rendered only when an attribute was replaced.
#[derive(Debug)]
struct Tag<'h> {
    name: &'h str,
    attrs: Vec<Attr<'h>>,
    self_close: bool,
}

impl<'h> Tag<'h> {
    fn parse(name: &'h str, attrs: &'h str, self_close: bool) -> Self {
        let attrs = ATTR_RE
            .captures_iter(attrs)
            .filter_map(|caps| {
                let raw = caps.get(0)?.as_str();
                let name = caps.get(1)?.as_str();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| decode_entities(m.as_str()).into_owned());
                Some(Attr {
                    name,
                    raw,
                    value,
                    replacement: None,
                })
            })
            .collect();
        Self {
            name,
            attrs,
            self_close,
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.value.as_deref())
    }

    fn set(&mut self, name: &str, value: String) {
        if let Some(attr) = self
            .attrs
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            if attr.value.as_deref() != Some(value.as_str()) {
                attr.replacement = Some(value);
            }
        }
    }

    fn is_modified(&self) -> bool {
        self.attrs.iter().any(|a| a.replacement.is_some())
    }

    fn render(&self) -> String {
        let mut out = format!("<{}", self.name);
        for attr in &self.attrs {
            out.push(' ');
            match &attr.replacement {
                Some(value) => {
                    out.push_str(attr.name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                None => out.push_str(attr.raw),
            }
        }
        if self.self_close {
            out.push_str(" /");
        }
        out.push('>');
        out
    }
}

struct Rewriter<'a> {
    state: &'a ServerState,
    target: &'a Url,
    base: Url,
    outline: Outline,
    head_done: bool,
    base_done: bool,
    loader_done: bool,
}

impl Rewriter<'_> {
    fn proxy_links(&self) -> bool {
        self.state.config().proxy_links
    }

    fn token(&mut self, caps: &Captures) -> String {
        let whole = &caps[0];
        if caps.name("comment").is_some() || caps.name("style").is_some() {
            return whole.to_string();
        }
        if let Some(attrs) = caps.name("script_attrs") {
            return self.script(caps, attrs.as_str());
        }
        if caps.name("head_close").is_some() {
            return format!("{}{}", self.take_loader(), whole);
        }

        let (Some(name), Some(attrs)) = (caps.name("name"), caps.name("attrs")) else {
            return whole.to_string();
        };
        let self_close = caps
            .name("self_close")
            .is_some_and(|m| !m.as_str().is_empty());
        let mut tag = Tag::parse(name.as_str(), attrs.as_str(), self_close);
        self.rewrite_urls(&mut tag);

        let rendered = if tag.is_modified() {
            tag.render()
        } else {
            whole.to_string()
        };
        self.place_injections(&tag, rendered)
    }

    fn script(&mut self, caps: &Captures, attrs: &str) -> String {
        let whole = &caps[0];
        let mut tag = Tag::parse(&whole[1..7], attrs, false);

        if let Some(loader) = &self.state.config().loader {
            if tag.get("data-provider") == Some(loader.provider.as_str()) {
                tracing::debug!("Removing existing {} loader script", loader.provider);
                return String::new();
            }
        }

        let src = tag.get("src").and_then(|v| self.resolve(v));
        if let Some(src) = src {
            tag.set("src", String::from(src));
        }
        if !tag.is_modified() {
            return whole.to_string();
        }

        let start = caps.get(0).map_or(0, |m| m.start());
        let rest = caps
            .name("script_body")
            .map_or("", |body| &whole[body.start() - start..]);
        format!("{}{}", tag.render(), rest)
    }

    fn rewrite_urls(&mut self, tag: &mut Tag<'_>) {
        if tag.is("base") {
            let has_href = tag.get("href").is_some_and(|h| !h.trim().is_empty());
            if has_href && !self.base_done {
                self.base_done = true;
                let href = if self.proxy_links() {
                    self.state.proxied_url(&self.base)
                } else {
                    self.base.to_string()
                };
                tag.set("href", href);
            }
            return;
        }

        let src = tag.get("src").and_then(|v| self.resolve(v));
        if let Some(src) = src {
            tag.set("src", String::from(src));
        }

        let Some(href) = tag.get("href").map(str::to_string) else {
            return;
        };
        let rewritten = if tag.is("a") && self.proxy_links() {
            self.anchor(&href)
        } else if tag.is("link") || is_root_relative(&href) {
            self.resolve(&href).map(String::from)
        } else {
            None
        };
        if let Some(value) = rewritten {
            tag.set("href", value);
        }
    }

    fn anchor(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() || !(has_scheme(href) || href.starts_with('/')) {
            return None;
        }
        let url = self.base.join(href).ok().filter(is_http)?;
        Some(self.state.proxied_url(&url))
    }

    fn resolve(&self, value: &str) -> Option<Url> {
        let value = value.trim();
        if value.is_empty() || value.starts_with('#') {
            return None;
        }
        self.base.join(value).ok().filter(is_http)
    }

    fn place_injections(&mut self, tag: &Tag<'_>, rendered: String) -> String {
        if tag.is("head") && !self.head_done {
            self.head_done = true;
            let mut out = rendered;
            out.push_str(&self.head_prelude());
            if !self.outline.has_head_close && !self.outline.has_body {
                out.push_str(&self.take_loader());
            }
            return out;
        }
        if tag.is("html") && !self.outline.has_head && !self.head_done {
            self.head_done = true;
            return format!("{}<head>{}</head>", rendered, self.head_contents());
        }
        if tag.is("body") && self.outline.has_head && !self.outline.has_head_close {
            return format!("{}{}", self.take_loader(), rendered);
        }
        rendered
    }

    fn head_prelude(&self) -> String {
        let mut out = String::new();
        if self.outline.base_href.is_none() {
            let href = if self.proxy_links() {
                self.state.proxied_url(self.target)
            } else {
                self.target.to_string()
            };
            out.push_str(&format!("<base href=\"{}\">", escape_attr(&href)));
        }
        out.push_str(&format!("<link rel=\"icon\" href=\"{FAVICON_URL}\">"));
        out
    }

    fn head_contents(&mut self) -> String {
        let mut out = self.head_prelude();
        out.push_str(&self.take_loader());
        out
    }

    fn take_loader(&mut self) -> String {
        if self.loader_done {
            return String::new();
        }
        self.loader_done = true;
        self.state
            .config()
            .loader
            .as_ref()
            .map(|loader| loader.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::loader::LoaderScript;

    const ICON: &str = r#"<link rel="icon" href="https://js.sitecues.com/favicon.ico">"#;

    fn state(proxy_links: bool) -> ServerState {
        let config = ServerConfig::reverse("http://example.com")
            .unwrap()
            .with_proxy_links(proxy_links);
        ServerState::new(config).unwrap()
    }

    fn loader() -> LoaderScript {
        LoaderScript::new("s-1", "https://js.sitecues.com/l/s;id=s-1/js/sitecues.js")
    }

    fn state_with_loader() -> ServerState {
        let config = ServerConfig::reverse("http://example.com")
            .unwrap()
            .with_loader(loader());
        ServerState::new(config).unwrap()
    }

    fn target() -> Url {
        Url::parse("http://example.com/dir/index.html").unwrap()
    }

    fn rewrite(state: &ServerState, html: &str) -> String {
        rewrite_document(state, html, &target())
    }

    #[test]
    fn synthesized_base_points_at_raw_target() {
        let out = rewrite(
            &state(false),
            "<html><head><title>T</title></head><body><img src=\"a.png\"></body></html>",
        );
        assert_eq!(
            out,
            format!(
                "<html><head><base href=\"http://example.com/dir/index.html\">{ICON}<title>T</title></head><body><img src=\"http://example.com/dir/a.png\"></body></html>"
            )
        );
    }

    #[test]
    fn synthesized_base_is_proxied_with_proxy_links() {
        let out = rewrite(&state(true), "<head></head>");
        assert!(out.starts_with(
            "<head><base href=\"http://localhost:8000/page/http://example.com/dir/index.html\">"
        ));
    }

    #[test]
    fn existing_base_is_made_absolute() {
        let html = "<head><base href=\"/assets/\"></head><body><img src=\"x.png\"></body>";

        let out = rewrite(&state(false), html);
        assert!(out.contains("<base href=\"http://example.com/assets/\">"));
        assert!(out.contains("<img src=\"http://example.com/assets/x.png\">"));
        assert_eq!(out.matches("<base").count(), 1);

        let out = rewrite(&state(true), html);
        assert!(out.contains("<base href=\"http://localhost:8000/page/http://example.com/assets/\">"));
        assert!(out.contains("<img src=\"http://example.com/assets/x.png\">"));
    }

    #[test]
    fn anchors_are_proxied_when_enabled() {
        let html = concat!(
            "<head></head>",
            "<a href=\"http://other.com/x\">1</a>",
            "<a href=\"/root\">2</a>",
            "<a href=\"rel.html\">3</a>",
            "<a href=\"#top\">4</a>",
            "<a href=\"mailto:a@b.c\">5</a>",
            "<a href=\"//cdn.com/y\">6</a>",
            "<a href=\"\">7</a>",
        );
        let out = rewrite(&state(true), html);
        assert!(out.contains("<a href=\"http://localhost:8000/page/http://other.com/x\">1</a>"));
        assert!(out.contains("<a href=\"http://localhost:8000/page/http://example.com/root\">2</a>"));
        assert!(out.contains("<a href=\"rel.html\">3</a>"));
        assert!(out.contains("<a href=\"#top\">4</a>"));
        assert!(out.contains("<a href=\"mailto:a@b.c\">5</a>"));
        assert!(out.contains("<a href=\"http://localhost:8000/page/http://cdn.com/y\">6</a>"));
        assert!(out.contains("<a href=\"\">7</a>"));
    }

    #[test]
    fn attributes_without_separating_whitespace() {
        let html = "<head></head><a href=\"/x\"title='t'>x</a><img alt=\"a\"src=\"p.png\">";
        let out = rewrite(&state(true), html);
        assert!(out.contains(
            "<a href=\"http://localhost:8000/page/http://example.com/x\" title='t'>x</a>"
        ));
        assert!(out.contains("<img alt=\"a\" src=\"http://example.com/dir/p.png\">"));
    }

    #[test]
    fn unquoted_values_still_need_whitespace() {
        let html = "<head></head><a href=/x class=c>x</a>";
        let out = rewrite(&state(false), html);
        assert!(out.contains("<a href=\"http://example.com/x\" class=c>x</a>"));
    }

    #[test]
    fn anchors_are_only_resolved_without_proxy_links() {
        let html = "<head></head><a href=\"/root\">r</a><a href=\"http://other.com/x\">o</a>";
        let out = rewrite(&state(false), html);
        assert!(out.contains("<a href=\"http://example.com/root\">r</a>"));
        assert!(out.contains("<a href=\"http://other.com/x\">o</a>"));
    }

    #[test]
    fn resources_are_resolved_but_not_proxied() {
        let html = concat!(
            "<head><link rel=\"stylesheet\" href=\"/s.css\"><script src=\"app.js\"></script></head>",
            "<body><area href=\"/map\"><img alt='q' src=pic.png></body>",
        );
        let out = rewrite(&state(true), html);
        assert!(out.contains("<link rel=\"stylesheet\" href=\"http://example.com/s.css\">"));
        assert!(out.contains("<script src=\"http://example.com/dir/app.js\"></script>"));
        assert!(out.contains("<area href=\"http://example.com/map\">"));
        assert!(out.contains("<img alt='q' src=\"http://example.com/dir/pic.png\">"));
    }

    #[test]
    fn comments_styles_and_script_bodies_are_untouched() {
        let html = concat!(
            "<head></head>",
            "<!-- <a href=\"/c\"> -->",
            "<style>a { background: url(/bg.png) }</style>",
            "<script>var s = '<img src=\"/x.png\">';</script>",
        );
        let out = rewrite(&state(true), html);
        assert!(out.contains("<!-- <a href=\"/c\"> -->"));
        assert!(out.contains("<style>a { background: url(/bg.png) }</style>"));
        assert!(out.contains("<script>var s = '<img src=\"/x.png\">';</script>"));
    }

    #[test]
    fn data_and_fragment_sources_are_untouched() {
        let html = "<head></head><img src=\"data:image/png;base64,AAAA\"><use href=\"#icon\">";
        let out = rewrite(&state(false), html);
        assert!(out.contains("<img src=\"data:image/png;base64,AAAA\">"));
        assert!(out.contains("<use href=\"#icon\">"));
    }

    #[test]
    fn attribute_entities_round_trip() {
        let out = rewrite(&state(true), "<head></head><a href=\"/x?a=1&amp;b=2\">x</a>");
        assert!(out.contains(
            "<a href=\"http://localhost:8000/page/http://example.com/x?a=1&amp;b=2\">x</a>"
        ));
    }

    #[test]
    fn tag_and_attribute_case_is_kept() {
        let out = rewrite(&state(true), "<HEAD></HEAD><A HREF=\"/x\">x</A>");
        assert!(out.contains("<A HREF=\"http://localhost:8000/page/http://example.com/x\">"));
        assert!(out.starts_with("<HEAD><base href="));
    }

    #[test]
    fn loader_is_last_in_head_and_replaces_existing() {
        let html = concat!(
            "<html><head><script data-provider=\"sitecues\">old()</script>",
            "<title>T</title></head><body></body></html>",
        );
        let out = rewrite(&state_with_loader(), html);
        assert!(!out.contains("old()"));
        assert!(out.contains(&format!("<title>T</title>{}</head>", loader().render())));
        assert_eq!(out.matches("data-provider=\"sitecues\"").count(), 1);
    }

    #[test]
    fn other_providers_scripts_are_kept() {
        let html = "<head><script data-provider=\"other\">keep()</script></head>";
        let out = rewrite(&state_with_loader(), html);
        assert!(out.contains("<script data-provider=\"other\">keep()</script>"));
    }

    #[test]
    fn loader_goes_before_body_when_head_is_not_closed() {
        let out = rewrite(&state_with_loader(), "<html><head><title>T</title><body></body></html>");
        assert!(out.contains(&format!("<title>T</title>{}<body>", loader().render())));
    }

    #[test]
    fn missing_head_is_synthesized_after_html() {
        let out = rewrite(&state(false), "<html lang=\"en\"><body><p>x</p></body></html>");
        assert!(out.starts_with(&format!(
            "<html lang=\"en\"><head><base href=\"http://example.com/dir/index.html\">{ICON}</head><body>"
        )));
    }

    #[test]
    fn missing_head_is_synthesized_after_doctype() {
        let out = rewrite(&state_with_loader(), "<!DOCTYPE html>\n<p>x</p>");
        assert!(out.starts_with("<!DOCTYPE html><head><base href="));
        assert!(out.contains(&format!("{}</head>\n<p>x</p>", loader().render())));
    }

    #[test]
    fn bare_fragment_gets_head_prepended() {
        let out = rewrite(&state(false), "<p>x</p>");
        assert!(out.starts_with("<head><base href="));
        assert!(out.ends_with("</head><p>x</p>"));
    }

    #[test]
    fn self_closing_tags_stay_self_closing() {
        let out = rewrite(&state(false), "<head></head><img src=\"a.png\"/>");
        assert!(out.contains("<img src=\"http://example.com/dir/a.png\" />"));
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_attr("a\"b<c>&"), "a&quot;b&lt;c&gt;&amp;");
        assert_eq!(decode_entities("&lt;&#65;&#x42;&amp;&bogus;"), "<AB&&bogus;");
    }
}
