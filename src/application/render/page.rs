//! Final page assembly around the static client shell.

use std::{fmt::Write as _, sync::Arc};

use lol_html::{RewriteStrSettings, element, rewrite_str};
use tracing::warn;

use super::types::{DATA_GLOBAL, RenderResult};
use crate::domain::payload::Payload;

/// Slot in the client shell that receives the rendered application markup.
pub const APP_HTML_PLACEHOLDER: &str = "<!--app-html-->";
/// `id` of the inline script carrying the request payload.
pub const SSR_DATA_SCRIPT_ID: &str = "ssr-data";

const HEAD_CLOSE: &str = "</head>";
const BODY_CLOSE: &str = "</body>";

/// The client `index.html`, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PageShell {
    html: Arc<str>,
}

impl PageShell {
    pub fn new(html: impl Into<Arc<str>>) -> Self {
        Self { html: html.into() }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    /// Full page for a successful render.
    pub fn compose(&self, result: &RenderResult, locale: &str, payload: &Payload) -> String {
        let page = self.html.replacen(APP_HTML_PLACEHOLDER, &result.html, 1);
        let page = apply_html_lang(&page, locale);
        let page = inject_head_content(&page, &result.head);
        inject_ssr_data(&page, payload)
    }

    /// Degraded page: no application markup, but the payload and a correlation id
    /// so the client can take over.
    pub fn fallback(&self, payload: &Payload, locale: &str, request_id: &str) -> String {
        let page = self.html.replacen(APP_HTML_PLACEHOLDER, "", 1);
        let mut page = apply_html_lang(&page, locale);
        if !request_id.trim().is_empty() {
            let meta = format!(
                r#"<meta name="ssr-error-id" content="{}">"#,
                escape_attribute(request_id)
            );
            page = inject_head_content(&page, &meta);
        }
        inject_ssr_data(&page, payload)
    }
}

/// Set `lang` on `<html>` and on every element that already carries one.
pub fn apply_html_lang(html: &str, locale: &str) -> String {
    let locale = locale.trim();
    if locale.is_empty() {
        return html.to_string();
    }

    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("html, [lang]", |el| {
                el.set_attribute("lang", locale)?;
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    );

    match rewritten {
        Ok(page) => page,
        Err(err) => {
            warn!(
                target = "ssrd::render::page",
                error = %err,
                locale,
                "failed to rewrite lang attribute"
            );
            html.to_string()
        }
    }
}

/// Insert `head` before the first `</head>`, or prepend it when the page has none.
pub fn inject_head_content(html: &str, head: &str) -> String {
    if head.trim().is_empty() {
        return html.to_string();
    }

    let mut block = head.to_string();
    if !block.ends_with('\n') {
        block.push('\n');
    }

    match html.find(HEAD_CLOSE) {
        Some(index) => {
            let mut page = String::with_capacity(html.len() + block.len());
            page.push_str(&html[..index]);
            page.push_str(&block);
            page.push_str(&html[index..]);
            page
        }
        None => block + html,
    }
}

/// Embed `payload` as an inline script the client reads back with `JSON.parse`.
///
/// Any previously injected data script is replaced.
pub fn inject_ssr_data(html: &str, payload: &Payload) -> String {
    if payload.is_empty() {
        return html.to_string();
    }

    let json = match serde_json::to_string(payload) {
        Ok(json) => json,
        Err(err) => {
            warn!(
                target = "ssrd::render::page",
                error = %err,
                "failed to serialise ssr payload"
            );
            return html.to_string();
        }
    };

    let script = format!(
        r#"<script id="{SSR_DATA_SCRIPT_ID}">window.{DATA_GLOBAL}=JSON.parse("{}")</script>"#,
        js_escape(&json)
    );

    let page = strip_ssr_data(html);
    let anchor = page.find(HEAD_CLOSE).or_else(|| page.find(BODY_CLOSE));
    match anchor {
        Some(index) => {
            let mut out = String::with_capacity(page.len() + script.len());
            out.push_str(&page[..index]);
            out.push_str(&script);
            out.push_str(&page[index..]);
            out
        }
        None => page + &script,
    }
}

/// Escape `text` for a double-quoted JS string literal.
///
/// The output is also a valid JSON string body and contains no characters that
/// could close the surrounding script element.
pub fn js_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' | '<' | '>' | '&' | '=' | '\u{2028}' | '\u{2029}' => {
                let _ = write!(out, "\\u{:04X}", ch as u32);
            }
            ch if (ch as u32) < 0x20 || ch == '\u{7f}' => {
                let _ = write!(out, "\\u{:04X}", ch as u32);
            }
            ch => out.push(ch),
        }
    }
    out
}

fn strip_ssr_data(html: &str) -> String {
    let opening = format!(r#"<script id="{SSR_DATA_SCRIPT_ID}">"#);
    let mut page = html.to_string();
    while let Some(start) = page.find(&opening) {
        let Some(offset) = page[start..].find("</script>") else {
            break;
        };
        page.replace_range(start..start + offset + "</script>".len(), "");
    }
    page
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            ch => out.push(ch),
        }
    }
    out
}
