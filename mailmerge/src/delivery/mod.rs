//! # Delivery
//!
//! Module dedicated to the delivery of a whole merge. The
//! [`DeliveryController`] processes rows one at a time, in source
//! order: it renders the message of each row, waits for the rate
//! window, then hands the message over to the [`SendPort`].

pub mod log;

use std::{borrow::Cow, error, fmt, result, time::Duration};

use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{
    attachment,
    message::{self, MessageBuilder, RenderedMessage},
    row::{self, Row},
    sender::{self, SendPort},
    template::{self, TemplateEngine},
};

#[doc(inline)]
pub use self::log::{CsvLog, DeliveryLog};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot process row {number}{}", resume_hint(.resume))]
    ProcessMessageError {
        number: usize,
        resume: Option<usize>,
        #[source]
        source: Box<crate::Error>,
    },
    #[error("cannot write delivery log of row {1}")]
    WriteLogError(#[source] std::io::Error, usize),
}

impl Error {
    /// Return the 1-based number of the row at which the run
    /// stopped.
    pub fn row_number(&self) -> usize {
        match self {
            Self::ProcessMessageError { number, .. } => *number,
            Self::WriteLogError(_, number) => *number,
        }
    }

    /// Return the row number to resume from, if any row was processed
    /// before the failing one.
    pub fn resume(&self) -> Option<usize> {
        match self {
            Self::ProcessMessageError { resume, .. } => *resume,
            Self::WriteLogError(..) => None,
        }
    }
}

fn resume_hint(resume: &Option<usize>) -> String {
    match resume {
        Some(number) => format!(" (hint: restart with --resume {number})"),
        None => String::new(),
    }
}

/// Join the given error and all its sources into a single line.
pub fn error_chain(err: &dyn error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();

    while let Some(err) = source {
        text.push_str(": ");
        text.push_str(&err.to_string());
        source = err.source();
    }

    text
}

/// Return the message of the innermost error raised by this library
/// in the chain of the given error, followed by its own sources.
///
/// Errors wrapping another error of this library are skipped, so
/// that only the root cause remains.
pub fn root_cause(err: &(dyn error::Error + 'static)) -> String {
    let mut cause = err;
    let mut source = err.source();

    while let Some(err) = source {
        if is_own_error(err) {
            cause = err;
        }
        source = err.source();
    }

    error_chain(cause)
}

fn is_own_error(err: &(dyn error::Error + 'static)) -> bool {
    #[cfg(feature = "smtp")]
    let smtp = err.is::<sender::smtp::Error>();
    #[cfg(not(feature = "smtp"))]
    let smtp = false;

    smtp || err.is::<attachment::Error>()
        || err.is::<message::Error>()
        || err.is::<template::Error>()
        || err.is::<sender::Error>()
        || err.is::<row::Error>()
}

/// The delivery configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct DeliveryConfig {
    /// Render messages without sending them.
    pub dry_run: bool,

    /// Maximum amount of rows to process, after resume.
    pub limit: Option<usize>,

    /// The 1-based number of the first row to process.
    pub resume: usize,

    /// Log errors and go on with the next row instead of stopping.
    pub continue_on_error: bool,

    /// Maximum amount of messages sent per minute, 0 meaning
    /// unlimited.
    pub ratelimit: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            limit: None,
            resume: 1,
            continue_on_error: false,
            ratelimit: 0,
        }
    }
}

impl DeliveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_resume(mut self, resume: usize) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_ratelimit(mut self, ratelimit: u32) -> Self {
        self.ratelimit = ratelimit;
        self
    }

    /// Return the first row to process, rows being 1-based.
    pub fn first_row(&self) -> usize {
        self.resume.max(1)
    }
}

/// The rate limit state.
///
/// The window is measured from the previous send attempt, whether it
/// succeeded or not.
#[derive(Clone, Debug, Default)]
pub struct RateWindow {
    interval: Option<Duration>,
    last_attempt: Option<Instant>,
}

impl RateWindow {
    /// Create a window allowing the given amount of messages per
    /// minute, 0 meaning unlimited.
    pub fn new(ratelimit: u32) -> Self {
        Self {
            interval: match ratelimit {
                0 => None,
                n => Some(Duration::from_secs(60) / n),
            },
            last_attempt: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Return the earliest instant of the next send attempt.
    pub fn next_attempt(&self) -> Option<Instant> {
        Some(self.last_attempt? + self.interval?)
    }

    /// Wait until the next send attempt is allowed, then record it.
    pub async fn acquire(&mut self) {
        if let Some(deadline) = self.next_attempt() {
            let now = Instant::now();
            if deadline > now {
                debug!(wait = ?(deadline - now), "waiting for rate limit window");
                time::sleep_until(deadline).await;
            }
        }

        self.last_attempt = Some(Instant::now());
    }
}

/// The outcome of a row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Sent,
    DryRun,
    /// The row failed but the run went on, with the error chain.
    Failed(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Return the text of the outcome, as written in delivery logs.
    pub fn log_text(&self) -> Cow<'_, str> {
        match self {
            Self::Sent => Cow::Borrowed("OK"),
            Self::DryRun => Cow::Borrowed("OK, not sent"),
            Self::Failed(err) => Cow::Borrowed(err),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.log_text())
    }
}

/// The outcome of a processed row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowOutcome {
    /// The 1-based number of the row.
    pub number: usize,

    /// The recipients of the message, empty if the message could not
    /// be rendered.
    pub recipients: Vec<String>,

    /// The rendered message, if any.
    pub message: Option<RenderedMessage>,

    pub outcome: Outcome,
}

/// The outcomes of all processed rows of a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeliveryReport {
    outcomes: Vec<RowOutcome>,
}

impl DeliveryReport {
    pub fn outcomes(&self) -> &[RowOutcome] {
        &self.outcomes
    }

    pub fn iter(&self) -> impl Iterator<Item = &RowOutcome> {
        self.outcomes.iter()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn sent(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Sent))
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::is_failed)
    }

    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.outcome)).count()
    }
}

impl IntoIterator for DeliveryReport {
    type Item = RowOutcome;
    type IntoIter = std::vec::IntoIter<RowOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

/// The delivery controller.
///
/// The controller owns the send port and the rate window for the
/// whole run.
pub struct DeliveryController<E, S> {
    engine: E,
    builder: MessageBuilder,
    sender: S,
    config: DeliveryConfig,
    window: RateWindow,
    log: Option<Box<dyn DeliveryLog + Send>>,
}

impl<E: TemplateEngine, S: SendPort> DeliveryController<E, S> {
    pub fn new(engine: E, builder: MessageBuilder, sender: S, config: DeliveryConfig) -> Self {
        Self {
            window: RateWindow::new(config.ratelimit),
            engine,
            builder,
            sender,
            config,
            log: None,
        }
    }

    /// Write the outcome of every processed row to the given log.
    pub fn with_log(mut self, log: impl DeliveryLog + Send + 'static) -> Self {
        self.log = Some(Box::new(log));
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn into_sender(self) -> S {
        self.sender
    }

    /// Process the given rows.
    ///
    /// Rows before the resume point are skipped without being
    /// rendered, and the run stops cleanly once the limit is reached.
    /// Errors reading rows always stop the run, other errors stop it
    /// unless `continue_on_error` is set.
    pub async fn run(
        &mut self,
        rows: impl IntoIterator<Item = row::Result<Row>>,
    ) -> Result<DeliveryReport> {
        let first = self.config.first_row();
        let mut report = DeliveryReport::default();
        let mut processed = 0;

        info!(
            first,
            limit = ?self.config.limit,
            dry_run = self.config.dry_run,
            "starting delivery",
        );

        for (i, row) in rows.into_iter().enumerate() {
            let number = i + 1;

            if self.config.limit.is_some_and(|limit| processed >= limit) {
                debug!(number, "limit reached, stopping delivery");
                break;
            }

            let row = row.map_err(|err| fatal(number, first, err.into()))?;

            if number < first {
                debug!(number, "skipping row before resume point");
                continue;
            }

            processed += 1;

            let outcome = self.process(number, &row).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err((err, recipients)) if self.config.continue_on_error => {
                    warn!(number, "cannot process row, continuing: {}", error_chain(&err));
                    let err = root_cause(&err);
                    RowOutcome {
                        number,
                        recipients,
                        message: None,
                        outcome: Outcome::Failed(err),
                    }
                }
                Err((err, _)) => return Err(fatal(number, first, err)),
            };

            info!(number, recipients = ?outcome.recipients, outcome = %outcome.outcome, "processed row");

            if let Some(log) = self.log.as_mut() {
                log.record(&outcome)
                    .map_err(|err| Error::WriteLogError(err, number))?;
            }

            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    /// Render and send the message of the given row.
    ///
    /// On error, the recipients are returned as well when they are
    /// known.
    async fn process(
        &mut self,
        number: usize,
        row: &Row,
    ) -> result::Result<RowOutcome, (crate::Error, Vec<String>)> {
        let message = self
            .engine
            .render(row)
            .map_err(crate::Error::from)
            .and_then(|raw| Ok(self.builder.render(&raw)?))
            .map_err(|err| (err, Vec::new()))?;

        let recipients = message.recipients().to_vec();

        let outcome = if self.config.dry_run {
            Outcome::DryRun
        } else {
            self.window.acquire().await;

            let bytes = message
                .to_vec()
                .map_err(|err| (err.into(), recipients.clone()))?;

            self.sender
                .send(message.sender(), &recipients, &bytes)
                .await
                .map_err(|err| (err.into(), recipients.clone()))?;

            Outcome::Sent
        };

        Ok(RowOutcome {
            number,
            recipients,
            message: Some(message),
            outcome,
        })
    }
}

fn fatal(number: usize, first: usize, err: crate::Error) -> Error {
    Error::ProcessMessageError {
        number,
        resume: (number > first).then_some(number),
        source: Box::new(err),
    }
}

impl<E, S: fmt::Debug> fmt::Debug for DeliveryController<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryController")
            .field("builder", &self.builder)
            .field("sender", &self.sender)
            .field("config", &self.config)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
