//! # Attachment resolution
//!
//! Module dedicated to attachment paths. Paths coming from templates
//! are shell expanded (home directory only), made absolute against
//! the template directory and canonicalized.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    result,
};

use thiserror::Error;
use tracing::debug;

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Empty attachment header")]
    EmptyAttachmentHeaderError,
    #[error("Attachment not found: {}", .0.display())]
    AttachmentNotFoundError(PathBuf),
    #[error("cannot read attachment {}", .1.display())]
    ReadAttachmentError(#[source] io::Error, PathBuf),
}

/// Resolves attachment paths relative to a template directory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachmentResolver {
    template_dir: PathBuf,
}

impl AttachmentResolver {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Resolve the given raw path to an absolute, canonical and
    /// existing path.
    pub fn resolve(&self, raw_path: impl AsRef<str>) -> Result<PathBuf> {
        resolve(raw_path, &self.template_dir)
    }

    /// Resolve the given raw path then read the file it points to.
    pub fn read(&self, raw_path: impl AsRef<str>) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.resolve(raw_path)?;
        let contents =
            fs::read(&path).map_err(|err| Error::ReadAttachmentError(err, path.clone()))?;
        Ok((path, contents))
    }
}

/// Resolve the given raw path against the given template directory.
///
/// Rules, applied in order: reject blank input, trim, expand a
/// leading `~`, join relative paths onto the template directory,
/// canonicalize, check existence.
pub fn resolve(raw_path: impl AsRef<str>, template_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let raw_path = raw_path.as_ref().trim();

    if raw_path.is_empty() {
        return Err(Error::EmptyAttachmentHeaderError);
    }

    let path = PathBuf::from(shellexpand::tilde(raw_path).as_ref());

    let path = if path.is_absolute() {
        path
    } else {
        template_dir.as_ref().join(path)
    };

    match path.canonicalize() {
        Ok(path) => {
            debug!(?path, "resolved attachment path");
            Ok(path)
        }
        Err(err) => {
            debug!(?path, "cannot canonicalize attachment path: {err}");
            Err(Error::AttachmentNotFoundError(normalize(&path)))
        }
    }
}

/// Lexically resolve `.` and `..` components of the given path.
///
/// Used to report paths that cannot be canonicalized because they do
/// not exist.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = match path.is_absolute() {
        true => PathBuf::new(),
        false => std::env::current_dir().unwrap_or_default(),
    };

    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => {
                normalized.pop();
            }
            component => normalized.push(component),
        }
    }

    normalized
}
