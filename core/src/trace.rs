//! Tracing subscriber setup shared by harness runs, tests and the command line tools.

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use tracing_log::LogTracer;
use tracing_subscriber::{filter::ParseError, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Errors from initializing trace subscriber.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tracing error: {0}")]
    SetGlobalTracingSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("logging error: {0}")]
    SetGlobalLogger(#[from] tracing_log::log_tracer::SetLoggerError),
    #[error("invalid filter directives: {0}")]
    Filter(#[from] ParseError),
}

/// Stream formatted trace events are written to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceWriter {
    #[default]
    Stdout,
    /// Keeps stdout free for a tool's own output.
    Stderr,
}

impl TraceWriter {
    fn is_terminal(self) -> bool {
        match self {
            Self::Stdout => std::io::stdout().is_terminal(),
            Self::Stderr => std::io::stderr().is_terminal(),
        }
    }
}

/// Configuration for the tracing subscriber, read from the `logging_config` section of the
/// harness configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfiguration {
    /// If true, uses a [`tracing_subscriber::fmt::TestWriter`] so events are captured per test.
    #[serde(default)]
    pub use_test_writer: bool,
    /// If true OR if the writer is not a tty, trace events are output as JSON. Otherwise they are
    /// pretty-printed.
    #[serde(default)]
    pub force_json_output: bool,
    #[serde(default)]
    pub writer: TraceWriter,
    /// Filter directives used when `RUST_LOG` is unset, e.g.
    /// `dtest_integration_tests=debug,info`. Without them only errors are shown.
    #[serde(default)]
    pub default_directives: Option<String>,
}

impl TraceConfiguration {
    /// Settings for command line tools: human-readable events on stderr.
    pub fn for_tools() -> Self {
        Self {
            writer: TraceWriter::Stderr,
            ..Default::default()
        }
    }

    /// Builds the filter from `RUST_LOG`, given as `env_directives`, falling back to
    /// [`Self::default_directives`].
    fn env_filter(&self, env_directives: Option<&str>) -> Result<EnvFilter, ParseError> {
        let directives = env_directives
            .or(self.default_directives.as_deref())
            .unwrap_or("error");
        EnvFilter::try_new(directives)
    }
}

/// Create a base tracing layer with configuration used in all subscribers
fn base_layer<S>() -> tracing_subscriber::fmt::Layer<S> {
    tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_level(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

/// Configures and installs a tracing subscriber, to capture events logged with
/// [`tracing::info`] and the like, and routes `log` records into it.
pub fn install_trace_subscriber(config: &TraceConfiguration) -> Result<(), Error> {
    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = config.env_filter(env_directives.as_deref())?;
    let output_json = !config.writer.is_terminal() || config.force_json_output;

    let layer = match (config.use_test_writer, output_json, config.writer) {
        (true, _, _) => base_layer()
            .pretty()
            .with_test_writer()
            .with_filter(filter)
            .boxed(),
        (false, true, TraceWriter::Stdout) => base_layer()
            .json()
            .with_current_span(false)
            .with_filter(filter)
            .boxed(),
        (false, true, TraceWriter::Stderr) => base_layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        (false, false, TraceWriter::Stdout) => base_layer().pretty().with_filter(filter).boxed(),
        (false, false, TraceWriter::Stderr) => base_layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber)?;

    LogTracer::init()?;

    Ok(())
}
