//! # Inline images
//!
//! Module dedicated to the `src` attribute of HTML images. Images
//! pointing to an attached file are rewritten to reference the
//! attachment part by content id.
//!
//! The HTML is scanned tag by tag, and the attributes of each start
//! tag are read one after the other, so that quoted values (which
//! may hold `src=` or `>`) are never mistaken for markup.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

const COMMENT_START: &str = "<!--";
const COMMENT_END: &str = "-->";

/// The `<` and the name of a start tag.
static TAG_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<([a-zA-Z][^\s/>]*)").unwrap());

/// A single attribute, with its optional value.
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[\s/]*([^\s"'<>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .unwrap()
});

/// Rewrite the `src` attribute of every `<img>` of the given HTML.
///
/// The given function maps a source to the content id of the
/// matching attachment. Sources it cannot map are left untouched.
/// Returns `None` if nothing was rewritten.
pub fn rewrite_img_srcs(
    html: &str,
    mut content_id: impl FnMut(&str) -> Option<String>,
) -> Option<String> {
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let mut offset = 0;

    while let Some(i) = html[offset..].find('<') {
        let start = offset + i;
        let tail = &html[start..];

        if tail.starts_with(COMMENT_START) {
            offset = match tail.find(COMMENT_END) {
                Some(end) => start + end + COMMENT_END.len(),
                None => html.len(),
            };
            continue;
        }

        let Some(tag) = TAG_START.captures(tail) else {
            offset = start + 1;
            continue;
        };

        let is_img = tag[1].eq_ignore_ascii_case("img");
        let mut pos = tag[0].len();
        let mut src_seen = false;

        while let Some(attr) = ATTR.captures(&tail[pos..]) {
            // only the first src of a tag counts
            if is_img && !src_seen && attr[1].eq_ignore_ascii_case("src") {
                src_seen = true;

                if let Some((range, src)) = attr_value(&attr) {
                    match content_id(src) {
                        Some(cid) => {
                            let range = start + pos + range.start..start + pos + range.end;
                            edits.push((range, format!("\"cid:{cid}\"")));
                        }
                        None => debug!(src, "skipping image not matching any attachment"),
                    }
                }
            }

            pos += attr[0].len();
        }

        offset = match tail[pos..].find('>') {
            Some(end) => start + pos + end + 1,
            None => html.len(),
        };
    }

    if edits.is_empty() {
        return None;
    }

    let mut rewritten = String::with_capacity(html.len());
    let mut copied = 0;

    for (range, value) in edits {
        rewritten.push_str(&html[copied..range.start]);
        rewritten.push_str(&value);
        copied = range.end;
    }

    rewritten.push_str(&html[copied..]);
    Some(rewritten)
}

/// Return the range of the whole value token of the given attribute,
/// quotes included, along with the unquoted value.
fn attr_value<'a>(attr: &Captures<'a>) -> Option<(Range<usize>, &'a str)> {
    if let Some(quoted) = attr.get(2).or_else(|| attr.get(3)) {
        return Some((quoted.start() - 1..quoted.end() + 1, quoted.as_str()));
    }

    attr.get(4).map(|bare| (bare.range(), bare.as_str()))
}
