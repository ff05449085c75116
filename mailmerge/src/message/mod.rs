//! # Message building
//!
//! Module dedicated to the transformation of a rendered template into
//! a MIME message ready to be sent. See [`MessageBuilder::render`]
//! for the list of transformations.

pub mod header;
pub mod inline;
pub mod markdown;
pub mod mime;

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    result,
};

use chrono::Local;
use mail_builder::MessageBuilder as BuilderMessage;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::attachment::{self, AttachmentResolver};

#[doc(inline)]
pub use self::{
    header::{Header, Headers},
    mime::{Body, Charset, ContentType, Disposition, Leaf, MimePart, TransferEncoding},
};

pub(crate) const TO: &str = "To";
pub(crate) const CC: &str = "Cc";
pub(crate) const BCC: &str = "Bcc";
pub(crate) const FROM: &str = "From";
pub(crate) const DATE: &str = "Date";
pub(crate) const ATTACHMENT_HEADER: &str = "Attachment";
pub(crate) const CONTENT_TYPE: &str = "Content-Type";
pub(crate) const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub(crate) const MESSAGE_ID: &str = "Message-ID";
pub(crate) const MIME_VERSION: &str = "MIME-Version";

pub(crate) const ALTERNATIVE: &str = "alternative";
pub(crate) const RELATED: &str = "related";
pub(crate) const BOUNDARY: &str = "boundary";
pub(crate) const CHARSET: &str = "charset";
pub(crate) const NAME: &str = "name";
pub(crate) const ENCODING_7BIT: &str = "7bit";
pub(crate) const ENCODING_BASE64: &str = "base64";
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
pub(crate) const MARKDOWN: &str = "text/markdown";

/// The domain of generated content ids, which avoids leaking the
/// host name.
pub(crate) const CONTENT_ID_DOMAIN: &str = "mailmerge.invalid";

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find sender of message: missing FROM header")]
    MissingSenderError,
    #[error("cannot parse {0} body: missing boundary parameter")]
    MissingBoundaryError(String),
    #[error("cannot parse multipart body: missing delimiter for boundary {0:?}")]
    MissingDelimiterError(String),
    #[error("cannot parse message body")]
    ParseBodyError,
    #[error("cannot write message")]
    WriteMessageError(#[source] io::Error),
    #[error("cannot build message from template {1:?}")]
    AttachError(#[source] attachment::Error, PathBuf),
}

impl Error {
    /// Return the attachment error at the origin of this error, if
    /// any.
    pub fn as_attachment_error(&self) -> Option<&attachment::Error> {
        match self {
            Self::AttachError(err, _) => Some(err),
            _ => None,
        }
    }
}

/// A message ready to be sent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenderedMessage {
    sender: String,
    recipients: Vec<String>,
    headers: Headers,
    body: MimePart,
}

impl RenderedMessage {
    /// Return the literal value of the FROM header.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Return the bare addresses of all TO, CC then BCC recipients.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Return the top-level headers, structural headers excluded.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &MimePart {
        &self.body
    }

    /// Build the serializable counterpart of the message.
    ///
    /// Header names the builder generates when missing are written
    /// in their canonical case, so that they are never duplicated.
    pub fn to_builder(&self) -> BuilderMessage<'_> {
        let builder = self.headers.iter().fold(BuilderMessage::new(), |builder, header| {
            let name = [DATE, MESSAGE_ID, MIME_VERSION]
                .into_iter()
                .find(|name| name.eq_ignore_ascii_case(&header.name))
                .unwrap_or(header.name.as_str());
            let value = header::to_builder_value(name, &header.value);
            builder.header(name, value)
        });

        builder.body(self.body.to_builder())
    }

    /// Serialize the message with CRLF line endings.
    ///
    /// Multipart boundaries are generated at each call.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.to_builder()
            .write_to_vec()
            .map_err(Error::WriteMessageError)
    }
}

impl fmt::Display for RenderedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.to_builder().write_to_string().map_err(|_| fmt::Error)?;
        f.write_str(&msg)
    }
}

/// Builder of messages from rendered templates.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageBuilder {
    template_path: PathBuf,
    resolver: AttachmentResolver,
}

impl MessageBuilder {
    /// Create a builder for messages rendered from the template
    /// located at the given path.
    ///
    /// Relative attachment paths are resolved against the directory
    /// of the template.
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        let template_path = template_path.into();
        let template_dir = template_path
            .parent()
            .map(ToOwned::to_owned)
            .unwrap_or_default();

        Self {
            resolver: AttachmentResolver::new(template_dir),
            template_path,
        }
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    pub fn resolver(&self) -> &AttachmentResolver {
        &self.resolver
    }

    /// Build a message from the given rendered template.
    ///
    /// Transformations are applied in this order, each one being a
    /// no-op when its trigger is absent:
    ///
    /// 1. the header block and the body are parsed
    /// 2. the charset is detected from the whole text
    /// 3. recipients are extracted and the BCC header is removed
    /// 4. a `text/markdown` body gets an HTML alternative
    /// 5. files named by `Attachment` headers are attached
    /// 6. HTML images pointing to attached files are rewritten
    ///
    /// A `Date` header is finally added unless already present.
    pub fn render(&self, raw: &str) -> Result<RenderedMessage> {
        let charset = Charset::detect(raw);
        let text = raw.replace("\r\n", "\n");

        let (mut headers, body) = header::parse_block(&text);
        let mut structural = mime::take_structural(&mut headers);

        let is_markdown = structural
            .get(CONTENT_TYPE)
            .is_some_and(|ct| ct.starts_with(MARKDOWN));
        if is_markdown {
            structural.remove(CONTENT_TYPE);
        }

        let mut body = mime::parse(&structural, body, charset)?;
        debug!(%charset, "parsed message body");

        let recipients = header::collect_recipients(&headers);
        headers.remove(BCC);

        let sender = headers
            .get(FROM)
            .ok_or(Error::MissingSenderError)?
            .to_owned();

        if is_markdown {
            debug!("rendering markdown body as html");
            body = markdown::promote(body);
        }

        let attachments = headers.remove(ATTACHMENT_HEADER);
        let mut content_ids = HashMap::new();

        if !attachments.is_empty() {
            let mut parts = body.into_related_parts();

            for raw_path in attachments {
                let (path, contents) = self
                    .resolver
                    .read(&raw_path)
                    .map_err(|err| Error::AttachError(err, self.template_path.clone()))?;

                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let content_id = format!("{}@{CONTENT_ID_DOMAIN}", Uuid::new_v4());

                debug!(?path, %content_id, "attaching file");
                parts.push(Leaf::attachment(&filename, contents, &content_id).into());
                content_ids.insert(path, content_id);
            }

            body = MimePart::Related(parts);
        }

        if !content_ids.is_empty() {
            body.for_each_leaf_mut(&mut |leaf: &mut Leaf| {
                if !leaf.is_mime_type("text/html") {
                    return;
                }

                let html = leaf.text_contents().and_then(|html| {
                    inline::rewrite_img_srcs(html, |src| {
                        let path = self.resolver.resolve(src).ok()?;
                        content_ids.get(&path).cloned()
                    })
                });

                if let Some(html) = html {
                    leaf.set_text(html);
                }
            });
        }

        if !headers.contains(DATE) {
            headers.push(DATE, Local::now().to_rfc2822());
        }

        Ok(RenderedMessage {
            sender,
            recipients,
            headers,
            body,
        })
    }
}
