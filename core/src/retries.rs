//! Bounded polling, used wherever the harness has to observe convergence without a push-based API.

use crate::error::Error;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, future::Future, time::Duration};
use tokio::time::timeout;
use tracing::debug;

/// How long to keep polling, and how long to sleep between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollParameters {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl PollParameters {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// A fixed-delay backoff with enough attempts to cover `timeout`.
    pub fn backoff(&self) -> ConstantBuilder {
        let interval_ms = self.interval.as_millis().max(1);
        let attempts = usize::try_from(self.timeout.as_millis() / interval_ms).unwrap_or(usize::MAX);
        ConstantBuilder::default()
            .with_delay(self.interval)
            .with_max_times(attempts.max(1))
    }
}

enum Attempt<T> {
    /// The fetch worked but the predicate does not hold yet.
    NotYet(T),
    /// The fetch itself failed. Not retried.
    Failed(Error),
}

/// Repeatedly runs `fetch` until `predicate` holds for its result, returning that result.
///
/// Errors from `fetch` end the poll immediately. If the deadline passes first, a
/// [`Error::ConvergenceTimeout`] naming `what` is returned, carrying the last value observed.
pub async fn poll_until<T, F, Fut, P>(
    what: &str,
    parameters: PollParameters,
    mut fetch: F,
    predicate: P,
) -> Result<T, Error>
where
    T: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&T) -> bool,
{
    let predicate = &predicate;
    let attempt = move || {
        let fetched = fetch();
        async move {
            match fetched.await {
                Ok(value) if predicate(&value) => Ok(value),
                Ok(value) => Err(Attempt::NotYet(value)),
                Err(error) => Err(Attempt::Failed(error)),
            }
        }
    };

    let polled = attempt
        .retry(parameters.backoff())
        .when(|attempt| matches!(attempt, Attempt::NotYet(_)))
        .notify(|attempt, delay| {
            if let Attempt::NotYet(value) = attempt {
                debug!(what, ?value, ?delay, "not converged yet");
            }
        });

    // A single fetch that hangs must not outlive the deadline either.
    match timeout(parameters.timeout + parameters.interval, polled).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(Attempt::Failed(error))) => Err(error),
        Ok(Err(Attempt::NotYet(value))) => Err(Error::ConvergenceTimeout {
            what: what.to_owned(),
            timeout: parameters.timeout,
            last_observation: Some(format!("{value:?}")),
        }),
        Err(_) => Err(Error::ConvergenceTimeout {
            what: what.to_owned(),
            timeout: parameters.timeout,
            last_observation: None,
        }),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util {
    use super::PollParameters;
    use std::time::Duration;

    /// Poll parameters for tests against simulated clusters, where nothing should take long.
    pub fn test_poll_parameters() -> PollParameters {
        PollParameters::new(Duration::from_millis(500), Duration::from_millis(5))
    }
}
