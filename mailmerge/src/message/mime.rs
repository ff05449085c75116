//! # MIME tree
//!
//! Module dedicated to the structure of rendered messages. A message
//! body is either a single [`Leaf`] or a container of parts. The
//! structure only grows: a leaf can be promoted to a related
//! container, never the opposite.
//!
//! Hand-written multipart bodies are parsed with [`mail_parser`], and
//! the tree is serialized with [`mail_builder`].

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use mail_builder::{
    headers::content_type::ContentType as BuilderContentType, mime::MimePart as BuilderPart,
};
use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::debug;

use super::{
    header::Headers, Error, Result, ALTERNATIVE, BOUNDARY, CHARSET, CONTENT_TRANSFER_ENCODING,
    CONTENT_TYPE, ENCODING_7BIT, ENCODING_BASE64, MIME_VERSION, NAME, OCTET_STREAM, RELATED,
};

const MULTIPART_ALTERNATIVE: &str = "multipart/alternative";
const MULTIPART_RELATED: &str = "multipart/related";
const TEXT_PLAIN: &str = "text/plain";
const NONAME: &str = "noname";

const CRLF: &str = "\r\n";
const BASE64_LINE_LEN: usize = 76;

/// The character set of a text leaf.
///
/// Ordered from the most to the least restrictive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Charset {
    UsAscii,
    Utf8,
}

impl Charset {
    /// Detect the most restrictive charset able to represent the
    /// given text.
    pub fn detect(text: &str) -> Self {
        if text.is_ascii() {
            Self::UsAscii
        } else {
            Self::Utf8
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsAscii => "us-ascii",
            Self::Utf8 => "utf-8",
        }
    }

    /// Return the transfer encoding used for text of this charset.
    pub fn transfer_encoding(&self) -> TransferEncoding {
        match self {
            Self::UsAscii => TransferEncoding::SevenBit,
            Self::Utf8 => TransferEncoding::Base64,
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The transfer encoding of a leaf.
///
/// A 7bit leaf holding a line longer than the 998 octets allowed by
/// RFC 5322 is written quoted-printable instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransferEncoding {
    SevenBit,
    Base64,
}

impl TransferEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SevenBit => ENCODING_7BIT,
            Self::Base64 => ENCODING_BASE64,
        }
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The MIME type of a leaf and its parameters.
///
/// The charset is not part of it: it derives from the body of the
/// leaf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContentType {
    mime_type: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    pub fn new(mime_type: impl ToString) -> Self {
        Self {
            mime_type: mime_type.to_string().to_ascii_lowercase(),
            params: Vec::new(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, val)| val.as_str())
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .map(|(key, val)| (key.as_str(), val.as_str()))
    }

    pub fn with_param(mut self, name: impl ToString, value: impl ToString) -> Self {
        let name = name.to_string();
        self.params.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.params.push((name, value.to_string()));
        self
    }

    pub fn without_param(mut self, name: &str) -> Self {
        self.params.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self
    }

    fn to_builder(&self) -> BuilderContentType<'_> {
        self.params().fold(
            BuilderContentType::new(self.mime_type.as_str()),
            |ctype, (key, val)| ctype.attribute(key, val),
        )
    }
}

impl From<&mail_parser::ContentType<'_>> for ContentType {
    fn from(ctype: &mail_parser::ContentType<'_>) -> Self {
        let mime_type = match ctype.subtype() {
            Some(subtype) => format!("{}/{subtype}", ctype.ctype()),
            None => ctype.ctype().to_owned(),
        };

        ctype
            .attributes()
            .unwrap_or_default()
            .iter()
            .fold(Self::new(mime_type), |ctype, (key, val)| {
                ctype.with_param(key.to_ascii_lowercase(), val)
            })
    }
}

/// The disposition of a leaf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Inline,
    /// An attachment, with the file name proposed to the recipient.
    Attachment(String),
}

/// The payload of a leaf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Body {
    Text { text: String, charset: Charset },
    Binary(Vec<u8>),
}

/// A non-multipart part.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Leaf {
    content_type: ContentType,
    disposition: Option<Disposition>,
    content_id: Option<String>,
    body: Body,
}

impl Leaf {
    /// Build a text leaf of the given subtype, with a charset
    /// detected from its own content.
    pub fn text(subtype: &str, text: impl ToString) -> Self {
        let text = text.to_string();
        let charset = Charset::detect(&text);
        Self::text_with_charset(subtype, text, charset)
    }

    /// Build a text leaf of the given subtype and charset.
    ///
    /// The charset is widened to UTF-8 when the text is not ASCII.
    pub fn text_with_charset(subtype: &str, text: impl ToString, charset: Charset) -> Self {
        let text = text.to_string();
        let charset = charset.max(Charset::detect(&text));

        Self {
            content_type: ContentType::new(format!("text/{subtype}")),
            disposition: None,
            content_id: None,
            body: Body::Text { text, charset },
        }
    }

    /// Build an attachment leaf.
    ///
    /// The content id is given without angle brackets.
    pub fn attachment(filename: &str, contents: Vec<u8>, content_id: &str) -> Self {
        Self {
            content_type: ContentType::new(OCTET_STREAM).with_param(NAME, filename),
            disposition: Some(Disposition::Attachment(filename.to_owned())),
            content_id: Some(content_id.to_owned()),
            body: Body::Binary(contents),
        }
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn mime_type(&self) -> &str {
        self.content_type.mime_type()
    }

    pub fn is_mime_type(&self, mime_type: &str) -> bool {
        self.mime_type().eq_ignore_ascii_case(mime_type)
    }

    pub fn disposition(&self) -> Option<&Disposition> {
        self.disposition.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Return the decoded text of the leaf, if it is a text leaf.
    pub fn text_contents(&self) -> Option<&str> {
        match &self.body {
            Body::Text { text, .. } => Some(text),
            Body::Binary(_) => None,
        }
    }

    /// Return the decoded bytes of the leaf.
    pub fn contents(&self) -> &[u8] {
        match &self.body {
            Body::Text { text, .. } => text.as_bytes(),
            Body::Binary(bytes) => bytes,
        }
    }

    pub fn charset(&self) -> Option<Charset> {
        match &self.body {
            Body::Text { charset, .. } => Some(*charset),
            Body::Binary(_) => None,
        }
    }

    pub fn transfer_encoding(&self) -> TransferEncoding {
        match &self.body {
            Body::Text { charset, .. } => charset.transfer_encoding(),
            Body::Binary(_) => TransferEncoding::Base64,
        }
    }

    /// Replace the text of the leaf.
    ///
    /// The charset, hence the transfer encoding, is derived again
    /// from the new text.
    pub fn set_text(&mut self, text: impl ToString) {
        let text = text.to_string();
        let charset = Charset::detect(&text);
        self.body = Body::Text { text, charset };
    }

    /// Return the content id of the leaf, without angle brackets.
    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    /// Return the file name of the leaf, if any.
    pub fn filename(&self) -> Option<&str> {
        match &self.disposition {
            Some(Disposition::Attachment(filename)) => Some(filename),
            _ => self.content_type.param(NAME),
        }
    }

    fn to_builder(&self) -> BuilderPart<'_> {
        let ctype = self.content_type.to_builder();

        // 7bit text is left to the builder, which switches to
        // quoted-printable when a line is too long
        let mut part = match &self.body {
            Body::Text {
                text,
                charset: Charset::UsAscii,
            } => BuilderPart::new(
                ctype.attribute(CHARSET, Charset::UsAscii.as_str()),
                text.as_str(),
            ),
            Body::Text { text, charset } => BuilderPart::new(
                ctype.attribute(CHARSET, charset.as_str()),
                encode_base64(text.as_bytes()),
            )
            .transfer_encoding(ENCODING_BASE64),
            Body::Binary(bytes) => {
                BuilderPart::new(ctype, encode_base64(bytes)).transfer_encoding(ENCODING_BASE64)
            }
        };

        part = match &self.disposition {
            Some(Disposition::Inline) => part.inline(),
            Some(Disposition::Attachment(filename)) => part.attachment(filename.as_str()),
            None => part,
        };

        match &self.content_id {
            Some(id) => part.cid(id.as_str()),
            None => part,
        }
    }
}

/// A node of the MIME tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MimePart {
    Leaf(Leaf),
    /// Equivalent renderings of the same content, the richest last.
    Alternative(Vec<MimePart>),
    /// A primary part followed by the resources it refers to.
    Related(Vec<MimePart>),
}

impl MimePart {
    pub fn is_multipart(&self) -> bool {
        !matches!(self, Self::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Return the children of the part, empty for a leaf.
    pub fn parts(&self) -> &[MimePart] {
        match self {
            Self::Leaf(_) => &[],
            Self::Alternative(parts) | Self::Related(parts) => parts,
        }
    }

    /// Return all leaves of the tree, depth first.
    pub fn leaves(&self) -> Vec<&Leaf> {
        match self {
            Self::Leaf(leaf) => vec![leaf],
            Self::Alternative(parts) | Self::Related(parts) => {
                parts.iter().flat_map(MimePart::leaves).collect()
            }
        }
    }

    /// Apply the given function to all leaves of the tree, depth
    /// first.
    pub fn for_each_leaf_mut(&mut self, f: &mut impl FnMut(&mut Leaf)) {
        match self {
            Self::Leaf(leaf) => f(leaf),
            Self::Alternative(parts) | Self::Related(parts) => {
                for part in parts {
                    part.for_each_leaf_mut(f);
                }
            }
        }
    }

    /// Promote the part to a related container.
    ///
    /// A related container is returned as is, any other part becomes
    /// the first child of a new related container.
    pub fn into_related(self) -> Self {
        Self::Related(self.into_related_parts())
    }

    /// Return the children the part would have once promoted to a
    /// related container.
    pub fn into_related_parts(self) -> Vec<MimePart> {
        match self {
            Self::Related(parts) => parts,
            part => vec![part],
        }
    }

    /// Build the serializable counterpart of the tree.
    ///
    /// Multipart boundaries are generated by the builder.
    pub fn to_builder(&self) -> BuilderPart<'_> {
        match self {
            Self::Leaf(leaf) => leaf.to_builder(),
            Self::Alternative(parts) => BuilderPart::new(
                MULTIPART_ALTERNATIVE,
                parts.iter().map(MimePart::to_builder).collect::<Vec<_>>(),
            ),
            Self::Related(parts) => BuilderPart::new(
                MULTIPART_RELATED,
                parts.iter().map(MimePart::to_builder).collect::<Vec<_>>(),
            ),
        }
    }
}

impl From<Leaf> for MimePart {
    fn from(leaf: Leaf) -> Self {
        Self::Leaf(leaf)
    }
}

/// Encode the given bytes as base64, wrapped at 76 columns with CRLF
/// line endings.
fn encode_base64(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LEN * 2 + 2);

    for line in encoded.as_bytes().chunks(BASE64_LINE_LEN) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push_str(CRLF);
    }

    out
}

/// Build the MIME tree of the given LF-terminated body.
///
/// The structural headers describe the body. Text leaves get at
/// least the given charset.
pub(crate) fn parse(structural: &Headers, body: &str, charset: Charset) -> Result<MimePart> {
    let mut raw = String::new();

    for header in structural {
        raw.push_str(&header.name);
        raw.push_str(": ");
        raw.push_str(&header.value);
        raw.push('\n');
    }

    if !structural.contains(CONTENT_TYPE) {
        raw.push_str(CONTENT_TYPE);
        raw.push_str(": ");
        raw.push_str(TEXT_PLAIN);
        raw.push('\n');
    }

    raw.push('\n');
    raw.push_str(body);

    let msg = MessageParser::new()
        .parse(raw.as_bytes())
        .ok_or(Error::ParseBodyError)?;

    parse_part(&msg, msg.root_part(), charset)
}

fn parse_part(msg: &Message<'_>, part: &MessagePart<'_>, charset: Charset) -> Result<MimePart> {
    let content_type = part
        .content_type()
        .map(ContentType::from)
        .unwrap_or_else(|| ContentType::new(TEXT_PLAIN));

    if let Some(subtype) = content_type.mime_type().strip_prefix("multipart/") {
        let boundary = content_type
            .param(BOUNDARY)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::MissingBoundaryError(content_type.mime_type().to_owned()))?;

        let ids = part
            .sub_parts()
            .ok_or_else(|| Error::MissingDelimiterError(boundary.to_owned()))?;

        let parts = ids
            .iter()
            .filter_map(|id| msg.part(*id))
            .map(|part| parse_part(msg, part, charset))
            .collect::<Result<Vec<_>>>()?;

        return Ok(match subtype {
            ALTERNATIVE => MimePart::Alternative(parts),
            RELATED => MimePart::Related(parts),
            unknown => {
                debug!("unknown multipart type {unknown}, falling back to related");
                MimePart::Related(parts)
            }
        });
    }

    let body = match &part.body {
        PartType::Text(text) | PartType::Html(text) => {
            let charset = charset.max(Charset::detect(text));
            Body::Text {
                text: text.to_string(),
                charset,
            }
        }
        _ => Body::Binary(part.contents().to_vec()),
    };

    let disposition = part.content_disposition().map(|disposition| {
        if disposition.is_attachment() {
            let filename = part.attachment_name().unwrap_or(NONAME);
            Disposition::Attachment(filename.to_owned())
        } else {
            Disposition::Inline
        }
    });

    let content_id = part
        .content_id()
        .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>'))
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned);

    Ok(MimePart::Leaf(Leaf {
        content_type: content_type.without_param(CHARSET),
        disposition,
        content_id,
        body,
    }))
}

/// Remove the structural headers from the given headers, and return
/// them.
pub(crate) fn take_structural(headers: &mut Headers) -> Headers {
    let mut structural = Headers::new();

    for name in [CONTENT_TYPE, CONTENT_TRANSFER_ENCODING, MIME_VERSION] {
        for value in headers.remove(name) {
            structural.push(name, value);
        }
    }

    structural
}

#[cfg(test)]
mod tests {
    use concat_with::concat_line;
    use mail_builder::MessageBuilder;

    use super::{parse, Charset, Disposition, Leaf, MimePart, TransferEncoding};
    use crate::message::header::Headers;

    fn content_type(value: &str) -> Headers {
        let mut headers = Headers::new();
        headers.push("Content-Type", value);
        headers
    }

    fn write(part: &MimePart) -> String {
        MessageBuilder::new()
            .body(part.to_builder())
            .write_to_string()
            .unwrap()
    }

    #[test]
    fn charset_detection() {
        assert_eq!(Charset::detect("Hello"), Charset::UsAscii);
        assert_eq!(Charset::detect("Héllo"), Charset::Utf8);
        assert_eq!(Charset::UsAscii.transfer_encoding(), TransferEncoding::SevenBit);
        assert_eq!(Charset::Utf8.transfer_encoding(), TransferEncoding::Base64);
    }

    #[test]
    fn parse_plain_leaf() {
        let part = parse(&Headers::new(), "Hello\n", Charset::UsAscii).unwrap();

        let leaf = part.as_leaf().unwrap();
        assert!(leaf.is_mime_type("text/plain"));
        assert_eq!(leaf.text_contents(), Some("Hello\n"));
        assert_eq!(leaf.charset(), Some(Charset::UsAscii));
    }

    #[test]
    fn parse_leaf_with_global_charset() {
        let part = parse(&content_type("text/html"), "<p>Hello</p>", Charset::Utf8).unwrap();

        let leaf = part.as_leaf().unwrap();
        assert!(leaf.is_mime_type("text/html"));
        assert_eq!(leaf.charset(), Some(Charset::Utf8));
        assert_eq!(leaf.transfer_encoding(), TransferEncoding::Base64);
    }

    #[test]
    fn parse_content_type_params() {
        let part = parse(
            &content_type("Text/Plain; Format=\"flowed\"; charset=us-ascii"),
            "Hello\n",
            Charset::UsAscii,
        )
        .unwrap();

        let leaf = part.as_leaf().unwrap();
        assert_eq!(leaf.mime_type(), "text/plain");
        assert_eq!(leaf.content_type().param("format"), Some("flowed"));
        assert_eq!(leaf.content_type().param("charset"), None);
    }

    #[test]
    fn parse_multipart() {
        let body = concat_line!(
            "This is a preamble",
            "--a;b",
            "Content-Type: text/plain; charset=us-ascii",
            "",
            "Hello",
            "",
            "--a;b",
            "Content-Type: text/html",
            "Content-Transfer-Encoding: base64",
            "",
            "PHA+SGVsbG88L3A+",
            "--a;b--",
            "",
        );

        let part = parse(
            &content_type("Multipart/Alternative; boundary=\"a;b\""),
            body,
            Charset::UsAscii,
        )
        .unwrap();

        let MimePart::Alternative(parts) = part else {
            panic!("expected alternative part");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_leaf().unwrap().text_contents(), Some("Hello\n"));
        assert_eq!(parts[1].as_leaf().unwrap().text_contents(), Some("<p>Hello</p>"));
        assert!(parts[1].as_leaf().unwrap().is_mime_type("text/html"));
    }

    #[test]
    fn parse_multipart_attachment() {
        let body = concat_line!(
            "--b",
            "Content-Type: text/plain",
            "",
            "Hello",
            "--b",
            "Content-Type: application/pdf",
            "Content-Disposition: attachment; filename=\"doc.pdf\"",
            "Content-ID: <doc@test.com>",
            "Content-Transfer-Encoding: base64",
            "",
            "SGVsbG8=",
            "--b--",
        );

        let part = parse(&content_type("multipart/related; boundary=b"), body, Charset::UsAscii)
            .unwrap();

        let MimePart::Related(parts) = part else {
            panic!("expected related part");
        };
        let attachment = parts[1].as_leaf().unwrap();
        assert!(attachment.is_mime_type("application/pdf"));
        assert_eq!(
            attachment.disposition(),
            Some(&Disposition::Attachment(String::from("doc.pdf")))
        );
        assert_eq!(attachment.content_id(), Some("doc@test.com"));
        assert_eq!(attachment.contents(), b"Hello");
    }

    #[test]
    fn parse_multipart_without_boundary() {
        let res = parse(&content_type("multipart/alternative"), "", Charset::UsAscii);
        assert!(res.is_err());
    }

    #[test]
    fn parse_multipart_without_delimiter() {
        let res = parse(
            &content_type("multipart/related; boundary=b"),
            "Hello\n",
            Charset::UsAscii,
        );
        assert!(res.is_err());
    }

    #[test]
    fn promote_leaf() {
        let leaf = MimePart::from(Leaf::text("plain", "Hello"));

        let related = leaf.clone().into_related();
        assert_eq!(related, MimePart::Related(vec![leaf]));

        // promotion is idempotent
        assert_eq!(related.clone().into_related(), related);
    }

    #[test]
    fn set_text_detects_charset() {
        let mut leaf = Leaf::text("html", "<p>Hello</p>");
        assert_eq!(leaf.transfer_encoding(), TransferEncoding::SevenBit);

        leaf.set_text("<p>Héllo</p>");
        assert_eq!(leaf.charset(), Some(Charset::Utf8));
        assert_eq!(leaf.transfer_encoding(), TransferEncoding::Base64);
    }

    #[test]
    fn write_ascii_leaf() {
        let out = write(&Leaf::text("plain", "Hello\nworld\n").into());

        assert!(out.contains("Content-Type: text/plain; charset=\"us-ascii\"\r\n"));
        assert!(out.contains("Content-Transfer-Encoding: 7bit\r\n"));
        assert!(out.contains("\r\n\r\nHello\r\nworld\r\n"));
    }

    #[test]
    fn write_utf8_leaf() {
        let out = write(&Leaf::text("plain", "Héllo").into());

        assert!(out.contains("Content-Type: text/plain; charset=\"utf-8\"\r\n"));
        assert!(out.contains("Content-Transfer-Encoding: base64\r\n"));
        assert!(out.contains("\r\n\r\nSMOpbGxv\r\n"));
    }

    #[test]
    fn write_attachment_leaf() {
        let leaf = Leaf::attachment("a.txt", b"Hello".to_vec(), "id@mailmerge.invalid");
        let out = write(&leaf.into());

        assert!(out.contains("Content-Type: application/octet-stream; name=\"a.txt\"\r\n"));
        assert!(out.contains("Content-Transfer-Encoding: base64\r\n"));
        assert!(out.contains("Content-Disposition: attachment; filename=\"a.txt\"\r\n"));
        assert!(out
            .to_ascii_lowercase()
            .contains("content-id: <id@mailmerge.invalid>\r\n"));
        assert!(out.contains("\r\n\r\nSGVsbG8=\r\n"));
    }

    #[test]
    fn write_long_ascii_line() {
        let line = "a".repeat(1200);
        let out = write(&Leaf::text("plain", format!("{line}\n")).into());

        assert!(!out.contains("Content-Transfer-Encoding: 7bit"));
        assert!(out.lines().all(|l| l.len() <= 998));
    }
}
