//! Configuration for harness runs.

use crate::{error::Error, retries::PollParameters, trace::TraceConfiguration};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, path::Path, path::PathBuf, time::Duration};

/// Configuration shared by every scenario in a harness run. Produced once at process start and
/// passed down by reference.
///
/// # Examples
///
/// ```
/// use dtest_core::config::HarnessConfig;
///
/// let yaml_config = r#"
/// ---
/// cluster:
///   server_version: "4.1.5"
/// timeouts:
///   binary_protocol_secs: 90
/// log_overrides:
///   - target_class: org.apache.cassandra.service.StorageProxy
///     level: TRACE
///     applies_to: [replication::simple]
/// "#;
///
/// let _decoded: HarnessConfig = serde_yaml::from_str(yaml_config).unwrap();
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Logging configuration for the harness process itself.
    #[serde(default)]
    pub logging_config: TraceConfiguration,

    /// How clusters are provisioned.
    #[serde(default)]
    pub cluster: ClusterDefaults,

    /// Deadlines for every convergence wait.
    #[serde(default)]
    pub timeouts: ConvergenceTimeouts,

    /// Server-side logging level overrides, applied per test after the cluster starts.
    #[serde(default)]
    pub log_overrides: Vec<LogOverride>,
}

impl HarnessConfig {
    /// Reads a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|err| {
            Error::Configuration(format!("couldn't parse {}: {err}", path.display()))
        })
    }

    /// The overrides that apply to the test identified by `test_id`, in file order.
    pub fn log_overrides_for<'a>(&'a self, test_id: &'a str) -> impl Iterator<Item = &'a LogOverride> {
        self.log_overrides
            .iter()
            .filter(move |log_override| log_override.applies_to_test(test_id))
    }
}

/// How the cluster-management tool provisions clusters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDefaults {
    /// Path or name of the `ccm` executable.
    #[serde(default = "ClusterDefaults::default_ccm_executable")]
    pub ccm_executable: PathBuf,
    /// Prefix for generated cluster names. Each test appends its own suffix.
    #[serde(default = "ClusterDefaults::default_cluster_name_prefix")]
    pub cluster_name_prefix: String,
    /// Server version to install, e.g. `4.1.5`. Ignored if `install_dir` is set.
    #[serde(default)]
    pub server_version: Option<String>,
    /// A local server checkout or tarball directory.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    /// Where `ccm` keeps its clusters. Defaults to `ccm`'s own default, `~/.ccm`.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
}

impl ClusterDefaults {
    fn default_ccm_executable() -> PathBuf {
        PathBuf::from("ccm")
    }

    fn default_cluster_name_prefix() -> String {
        "dtest".to_string()
    }
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        Self {
            ccm_executable: Self::default_ccm_executable(),
            cluster_name_prefix: Self::default_cluster_name_prefix(),
            server_version: None,
            install_dir: None,
            config_dir: None,
        }
    }
}

/// Deadlines for convergence waits, in seconds unless noted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceTimeouts {
    /// How long a started node may take to accept binary-protocol connections.
    #[serde(default = "ConvergenceTimeouts::default_binary_protocol_secs")]
    pub binary_protocol_secs: u64,
    /// How long to wait for a line to appear in a node's log.
    #[serde(default = "ConvergenceTimeouts::default_log_watch_secs")]
    pub log_watch_secs: u64,
    /// How long to poll `nodetool` output for an expected state.
    #[serde(default = "ConvergenceTimeouts::default_status_poll_secs")]
    pub status_poll_secs: u64,
    /// How long to wait for a query trace to become complete.
    #[serde(default = "ConvergenceTimeouts::default_trace_fetch_secs")]
    pub trace_fetch_secs: u64,
    /// Delay between poll attempts, in milliseconds.
    #[serde(default = "ConvergenceTimeouts::default_poll_interval_millis")]
    pub poll_interval_millis: u64,
}

impl ConvergenceTimeouts {
    fn default_binary_protocol_secs() -> u64 {
        120
    }

    fn default_log_watch_secs() -> u64 {
        120
    }

    fn default_status_poll_secs() -> u64 {
        120
    }

    fn default_trace_fetch_secs() -> u64 {
        10
    }

    fn default_poll_interval_millis() -> u64 {
        500
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn binary_protocol(&self) -> PollParameters {
        PollParameters::new(Duration::from_secs(self.binary_protocol_secs), self.poll_interval())
    }

    pub fn log_watch(&self) -> PollParameters {
        PollParameters::new(Duration::from_secs(self.log_watch_secs), self.poll_interval())
    }

    pub fn status_poll(&self) -> PollParameters {
        PollParameters::new(Duration::from_secs(self.status_poll_secs), self.poll_interval())
    }

    pub fn trace_fetch(&self) -> Duration {
        Duration::from_secs(self.trace_fetch_secs)
    }
}

impl Default for ConvergenceTimeouts {
    fn default() -> Self {
        Self {
            binary_protocol_secs: Self::default_binary_protocol_secs(),
            log_watch_secs: Self::default_log_watch_secs(),
            status_poll_secs: Self::default_status_poll_secs(),
            trace_fetch_secs: Self::default_trace_fetch_secs(),
            poll_interval_millis: Self::default_poll_interval_millis(),
        }
    }
}

/// Server logger levels understood by `nodetool setlogginglevel`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// Raise or lower one server logger for a set of tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOverride {
    /// Fully qualified logger name. `None` means the root logger.
    #[serde(default)]
    pub target_class: Option<String>,
    pub level: LogLevel,
    /// Test identifiers this override applies to. Empty means every test.
    #[serde(default)]
    pub applies_to: BTreeSet<String>,
}

impl LogOverride {
    pub const ROOT_LOGGER: &'static str = "ROOT";

    pub fn logger(&self) -> &str {
        self.target_class.as_deref().unwrap_or(Self::ROOT_LOGGER)
    }

    pub fn applies_to_test(&self, test_id: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(test_id)
    }

    /// Arguments for `nodetool` that put this override into effect.
    pub fn nodetool_args(&self) -> Vec<String> {
        Vec::from([
            "setlogginglevel".to_string(),
            self.logger().to_string(),
            self.level.to_string(),
        ])
    }
}

#[cfg(feature = "test-util")]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_util {
    use super::{ConvergenceTimeouts, HarnessConfig};

    /// Timeouts short enough for simulated clusters, which converge immediately or not at all.
    pub fn fast_timeouts() -> ConvergenceTimeouts {
        ConvergenceTimeouts {
            binary_protocol_secs: 2,
            log_watch_secs: 2,
            status_poll_secs: 2,
            trace_fetch_secs: 1,
            poll_interval_millis: 5,
        }
    }

    pub fn generate_harness_config() -> HarnessConfig {
        HarnessConfig {
            timeouts: fast_timeouts(),
            ..Default::default()
        }
    }
}
