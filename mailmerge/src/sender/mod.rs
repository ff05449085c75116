//! # Send port
//!
//! Module dedicated to message delivery. The [`SendPort`] accepts one
//! fully serialized message at a time, and either accepts it or
//! rejects it with a reason.

#[cfg(feature = "smtp")]
pub mod smtp;

use std::result;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "smtp")]
#[doc(inline)]
pub use self::smtp::{SmtpConfig, SmtpSecurity, SmtpSender};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot send message: {0}")]
    SendRejectedError(String),
    #[cfg(feature = "smtp")]
    #[error(transparent)]
    SmtpError(#[from] smtp::Error),
}

/// The message delivery interface.
#[async_trait]
pub trait SendPort: Send {
    /// Send the given serialized message from the given sender to the
    /// given recipients.
    ///
    /// The sender is the literal value of the FROM header, which may
    /// contain a display name.
    async fn send(&mut self, sender: &str, recipients: &[String], message: &[u8]) -> Result<()>;
}

#[async_trait]
impl<T: SendPort + ?Sized> SendPort for Box<T> {
    async fn send(&mut self, sender: &str, recipients: &[String], message: &[u8]) -> Result<()> {
        (**self).send(sender, recipients, message).await
    }
}

#[async_trait]
impl<'a, T: SendPort + ?Sized> SendPort for &'a mut T {
    async fn send(&mut self, sender: &str, recipients: &[String], message: &[u8]) -> Result<()> {
        (**self).send(sender, recipients, message).await
    }
}
