//! Errors raised by the harness while driving or verifying a cluster.

use std::{fmt::Debug, time::Duration};

/// Failures that end the current test. None of these are retried transparently: a caller that
/// wants a retry has to ask for it explicitly and count it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lifecycle transition, log watch or status poll exceeded its deadline.
    #[error(
        "timed out after {timeout:?} waiting for {what}{}",
        last_observation.as_ref().map(|o| format!(" (last observed: {o})")).unwrap_or_default()
    )]
    ConvergenceTimeout {
        what: String,
        timeout: Duration,
        last_observation: Option<String>,
    },
    /// Something the harness computed disagreed with what the cluster reported.
    #[error(
        "verification mismatch for {what}: expected {expected}, observed {observed}{}",
        raw_output.as_ref().map(|raw| format!("\nraw output:\n{raw}")).unwrap_or_default()
    )]
    VerificationMismatch {
        what: String,
        expected: String,
        observed: String,
        /// Output of the external tool the observation was taken from, if any.
        raw_output: Option<String>,
    },
    /// Unsupported replication strategy, malformed topology input or bad harness configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A topology that can never satisfy the declared replication.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// A command run against a node exited unsuccessfully or wrote to stderr.
    #[error(
        "`{command}` failed (exit status {status:?})\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    ExternalTool {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Output from an external tool could not be interpreted.
    #[error("could not parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a [`Error::VerificationMismatch`] from any pair of debuggable values.
    pub fn mismatch<E: Debug + ?Sized, O: Debug + ?Sized>(
        what: impl Into<String>,
        expected: &E,
        observed: &O,
    ) -> Self {
        Self::VerificationMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            observed: format!("{observed:?}"),
            raw_output: None,
        }
    }

    /// Attaches the raw tool output an observation came from. Has no effect on other variants.
    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        if let Self::VerificationMismatch { raw_output, .. } = &mut self {
            *raw_output = Some(raw.into());
        }
        self
    }

    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse {
            what,
            detail: detail.into(),
        }
    }

    /// True for errors caused by the system under test rather than by the harness itself.
    pub fn is_cluster_failure(&self) -> bool {
        matches!(
            self,
            Self::ConvergenceTimeout { .. }
                | Self::VerificationMismatch { .. }
                | Self::ExternalTool { .. }
        )
    }
}
