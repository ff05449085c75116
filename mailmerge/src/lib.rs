//! Asynchronous library to render templated emails from a tabular
//! data source and send them in bulk.
//!
//! The core concept of this library is a pipeline executed once per
//! row of the data source:
//!
//! 1. A [`Row`](crate::row::Row) is read from a delimited file by the
//! [`RowSource`](crate::row::RowSource).
//!
//! 2. The row is rendered as raw text by a
//! [`TemplateEngine`](crate::template::TemplateEngine).
//!
//! 3. The raw text is transformed into a well-formed MIME message by
//! the [`MessageBuilder`](crate::message::MessageBuilder): encoding
//! detection, recipients extraction, Markdown promotion, attachments
//! and inline images.
//!
//! 4. The message is handed to a [`SendPort`](crate::sender::SendPort)
//! by the [`DeliveryController`](crate::delivery::DeliveryController),
//! which takes care of rate limiting, resuming and partial failures.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod attachment;
pub mod delivery;
pub mod message;
pub mod row;
pub mod sender;
pub mod template;

#[doc(inline)]
pub use self::{
    attachment::AttachmentResolver,
    delivery::{DeliveryConfig, DeliveryController, DeliveryReport, Outcome, RowOutcome},
    message::{MessageBuilder, MimePart, RenderedMessage},
    row::{Row, RowSource},
    sender::SendPort,
    template::{JinjaTemplate, TemplateEngine, TemplateFunctions},
};

/// The global `Error` enum of the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    RowError(#[from] row::Error),
    #[error(transparent)]
    TemplateError(#[from] template::Error),
    #[error(transparent)]
    MessageError(#[from] message::Error),
    #[error(transparent)]
    AttachmentError(#[from] attachment::Error),
    #[error(transparent)]
    SenderError(#[from] sender::Error),
    #[error(transparent)]
    DeliveryError(#[from] delivery::Error),
}

/// The global `Result` alias of the library.
pub type Result<T> = std::result::Result<T, Error>;
