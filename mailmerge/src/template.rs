//! # Template engine
//!
//! Module dedicated to template rendering. The engine is consumed
//! through the [`TemplateEngine`] trait: given a row, it produces the
//! raw text of a message (headers, blank line, body). The
//! [`JinjaTemplate`] implementation relies on [minijinja] with strict
//! undefined variables.

use std::{
    fs, io,
    path::{Path, PathBuf},
    result,
};

use minijinja::{Environment, UndefinedBehavior, Value};
use thiserror::Error;
use tracing::debug;

use crate::row::Row;

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read template {1:?}")]
    ReadTemplateError(#[source] io::Error, PathBuf),
    #[error("cannot render template {1:?}")]
    RenderTemplateError(#[source] minijinja::Error, PathBuf),
}

/// The template engine interface.
pub trait TemplateEngine {
    /// Render the template using the given row as context.
    ///
    /// Referencing a field missing from the row is an error.
    fn render(&self, row: &Row) -> Result<String>;
}

/// Named capabilities exposed to templates.
///
/// Every entry is registered as a global of the template environment
/// before rendering begins. Functions can be built using
/// [`Value::from_function`].
#[derive(Clone, Debug, Default)]
pub struct TemplateFunctions {
    entries: Vec<(String, Value)>,
}

impl TemplateFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl ToString, value: impl Into<Value>) {
        let name = name.to_string();
        let value = value.into();

        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl ToString, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The Jinja-like template engine.
#[derive(Debug)]
pub struct JinjaTemplate {
    path: PathBuf,
    source: String,
    env: Environment<'static>,
}

impl JinjaTemplate {
    /// Read the template located at the given path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let source =
            fs::read_to_string(&path).map_err(|err| Error::ReadTemplateError(err, path.clone()))?;
        Ok(Self::new(path, source))
    }

    /// Build a template from its source.
    ///
    /// The path is used to locate the template directory and to
    /// identify the template in errors.
    pub fn new(path: impl Into<PathBuf>, source: impl ToString) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        Self {
            path: path.into(),
            source: source.to_string(),
            env,
        }
    }

    pub fn with_functions(mut self, functions: TemplateFunctions) -> Self {
        for (name, value) in functions.entries {
            debug!(%name, "registering template function");
            self.env.add_global(name, value);
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the directory containing the template.
    ///
    /// Relative attachment paths are resolved against it.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}

impl TemplateEngine for JinjaTemplate {
    fn render(&self, row: &Row) -> Result<String> {
        self.env
            .render_str(&self.source, row)
            .map_err(|err| Error::RenderTemplateError(err, self.path.clone()))
    }
}
