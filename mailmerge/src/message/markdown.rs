//! # Markdown promotion
//!
//! Module dedicated to messages written in Markdown. The plain text
//! is kept as is, and an HTML rendering of it is added as the richer
//! alternative.

use pulldown_cmark::{html, Event, Options, Parser};
use tracing::debug;

use super::mime::{Leaf, MimePart};

/// Render the given Markdown text as HTML.
///
/// Single line breaks are kept as HTML line breaks.
pub fn to_html(text: &str) -> String {
    let parser = Parser::new_ext(text, Options::empty()).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        event => event,
    });

    let mut html = String::new();
    html::push_html(&mut html, parser);
    html
}

/// Promote the given body to a related container, then replace its
/// first plain text child by an alternative holding both the plain
/// text and its HTML rendering.
pub fn promote(body: MimePart) -> MimePart {
    let mut parts = body.into_related_parts();

    let plain = parts
        .iter()
        .position(|part| matches!(part, MimePart::Leaf(leaf) if leaf.is_mime_type("text/plain")));

    let Some(i) = plain else {
        debug!("cannot find plain text part to render as markdown, skipping it");
        return MimePart::Related(parts);
    };

    let plain = parts.remove(i);
    let text = plain
        .as_leaf()
        .and_then(Leaf::text_contents)
        .unwrap_or_default();
    let html = Leaf::text("html", format!("<html><body>{}</body></html>", to_html(text)));

    parts.insert(i, MimePart::Alternative(vec![plain, html.into()]));
    MimePart::Related(parts)
}
