//! # SMTP send port
//!
//! Module dedicated to the SMTP implementation of the [`SendPort`].
//! A new connection is opened for every message.

use std::{fmt, result, str::FromStr};

use async_trait::async_trait;
use mail_send::{
    smtp::message::{Address as SmtpAddress, Message as SmtpMessage},
    Credentials, SmtpClientBuilder,
};
use thiserror::Error;
use tracing::{debug, info};

use super::{Result, SendPort};
use crate::message::header;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse smtp security {0:?}: expected Never, SSL/TLS, STARTTLS or PLAIN")]
    ParseSecurityError(String),
    #[error("cannot use smtp security {0}: missing username")]
    MissingUsernameError(SmtpSecurity),
    #[error("cannot use smtp security {0}: missing password")]
    MissingPasswordError(SmtpSecurity),
    #[error("cannot send message without recipient")]
    MissingRecipientError,
    #[error("cannot connect to smtp server {1}:{2} using tcp")]
    ConnectTcpError(#[source] mail_send::Error, String, u16),
    #[error("cannot connect to smtp server {1}:{2} using tls")]
    ConnectTlsError(#[source] mail_send::Error, String, u16),
}

/// The SMTP configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct SmtpConfig {
    /// The SMTP server host name.
    pub host: String,

    /// The SMTP server host port.
    pub port: u16,

    /// The SMTP security protocol to use.
    #[cfg_attr(feature = "derive", serde(default))]
    pub security: SmtpSecurity,

    /// The SMTP server login.
    ///
    /// Required by any security other than [`SmtpSecurity::None`].
    #[cfg_attr(feature = "derive", serde(default))]
    pub username: Option<String>,
}

impl SmtpConfig {
    /// Check that the configuration is usable.
    pub fn validate(&self) -> result::Result<(), Error> {
        if self.security.requires_login() && self.username.is_none() {
            return Err(Error::MissingUsernameError(self.security.clone()));
        }

        Ok(())
    }
}

/// The SMTP security protocol.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum SmtpSecurity {
    /// No security, no authentication.
    #[default]
    #[cfg_attr(feature = "derive", serde(alias = "never"))]
    None,
    #[cfg_attr(feature = "derive", serde(alias = "ssl"))]
    SslTls,
    #[cfg_attr(feature = "derive", serde(alias = "starttls"))]
    StartTls,
    /// Authentication over an unencrypted connection.
    Plain,
}

impl SmtpSecurity {
    pub fn requires_login(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn is_encryption_enabled(&self) -> bool {
        matches!(self, Self::SslTls | Self::StartTls)
    }
}

impl fmt::Display for SmtpSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "Never"),
            Self::SslTls => write!(f, "SSL/TLS"),
            Self::StartTls => write!(f, "STARTTLS"),
            Self::Plain => write!(f, "PLAIN"),
        }
    }
}

impl FromStr for SmtpSecurity {
    type Err = Error;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.trim() {
            "" | "Never" => Ok(Self::None),
            "SSL/TLS" => Ok(Self::SslTls),
            "STARTTLS" => Ok(Self::StartTls),
            "PLAIN" => Ok(Self::Plain),
            unknown => Err(Error::ParseSecurityError(unknown.to_owned())),
        }
    }
}

/// The SMTP send port.
///
/// The password is given once at construction, then kept for the
/// whole run.
#[derive(Clone)]
pub struct SmtpSender {
    config: SmtpConfig,
    password: Option<String>,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig, password: Option<String>) -> result::Result<Self, Error> {
        config.validate()?;

        if config.security.requires_login() && password.is_none() {
            return Err(Error::MissingPasswordError(config.security));
        }

        Ok(Self { config, password })
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    fn client_builder(&self) -> SmtpClientBuilder<String> {
        let mut builder = SmtpClientBuilder::new(self.config.host.clone(), self.config.port)
            .implicit_tls(matches!(self.config.security, SmtpSecurity::SslTls));

        if let (true, Some(username), Some(password)) = (
            self.config.security.requires_login(),
            &self.config.username,
            &self.password,
        ) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        builder
    }
}

impl fmt::Debug for SmtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSender")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SendPort for SmtpSender {
    async fn send(&mut self, sender: &str, recipients: &[String], message: &[u8]) -> Result<()> {
        if recipients.is_empty() {
            return Err(Error::MissingRecipientError.into());
        }

        // the envelope needs the bare address
        let mail_from = header::parse_addresses(sender)
            .into_iter()
            .next()
            .unwrap_or_else(|| sender.trim().to_owned());

        let msg = SmtpMessage {
            mail_from: mail_from.into(),
            rcpt_to: recipients
                .iter()
                .map(|email| SmtpAddress {
                    email: email.as_str().into(),
                    ..Default::default()
                })
                .collect(),
            body: message.into(),
        };

        let host = &self.config.host;
        let port = self.config.port;
        let builder = self.client_builder();

        info!(%host, port, security = %self.config.security, "sending message over smtp");

        let res = if self.config.security.is_encryption_enabled() {
            builder
                .connect()
                .await
                .map_err(|err| Error::ConnectTlsError(err, host.clone(), port))?
                .send(msg)
                .await
        } else {
            builder
                .connect_plain()
                .await
                .map_err(|err| Error::ConnectTcpError(err, host.clone(), port))?
                .send(msg)
                .await
        };

        res.map_err(|err| {
            debug!("smtp server rejected message: {err:?}");
            super::Error::SendRejectedError(err.to_string())
        })
    }
}
