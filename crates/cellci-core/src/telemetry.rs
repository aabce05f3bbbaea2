//! Centralised tracing initialisation for cellci binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! (the global subscriber can only be set once per process).
//!
//! Every formatted log line passes through a [`Redactor`] before it reaches
//! stderr, so a token that ends up in an error message or a command line is
//! never written out verbatim. Stdout is left to command output.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::redact::Redactor;

/// Crates whose events follow the requested level. Everything else
/// (HTTP stack, database engine) is held at `warn`.
const CELLCI_TARGETS: &[&str] = &[
    "cellci",
    "cellci_cli",
    "cellci_core",
    "cellci_state",
    "conda_env_manager",
];

/// Filter directives used when `RUST_LOG` is not set.
pub fn default_directives(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        CELLCI_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str().to_lowercase())),
    );
    directives.join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: verbosity of cellci's own crates when `RUST_LOG` is not set.
/// * `redactor`: scrubs every line before it is written.
pub fn init_tracing(json: bool, level: Level, redactor: Redactor) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let writer = RedactingMakeWriter::new(io::stderr, redactor);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json().with_writer(writer))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(writer))
            .try_init()
            .ok();
    }
}

/// [`MakeWriter`] that wraps another and scrubs what is written through it.
#[derive(Debug, Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Arc<Redactor>,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Redactor) -> Self {
        Self {
            inner,
            redactor: Arc::new(redactor),
        }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: Arc::clone(&self.redactor),
        }
    }
}

/// Writer produced by [`RedactingMakeWriter`].
///
/// The fmt layer hands over one whole formatted event per write, so
/// secrets are never split across calls.
#[derive(Debug)]
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Arc<Redactor>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner
            .write_all(self.redactor.scrub(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
