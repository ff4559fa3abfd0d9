//! Seams to the cluster-management tool that creates, starts and stops database nodes.
//!
//! [`ClusterBackend`] and [`NodeHandle`] are the whole contract the controller relies on. The
//! [`crate::ccm`] module implements them by shelling out to `ccm`; tests substitute an in-process
//! simulation.

use crate::driver::Session;
use async_trait::async_trait;
use dtest_core::{error::Error, topology::Token};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

/// Port the binary protocol listens on unless a backend says otherwise.
pub const NATIVE_TRANSPORT_PORT: u16 = 9042;

/// Output of an external command run against a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// The command line, for error messages.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// Exit status, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Fails with [`Error::ExternalTool`] if the command exited unsuccessfully.
    pub fn check(self) -> Result<Self, Error> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    /// Like [`Self::check`], but also fails if anything was written to stderr.
    pub fn check_clean(self) -> Result<Self, Error> {
        if self.success() && self.stderr.trim().is_empty() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> Error {
        Error::ExternalTool {
            command: self.command,
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Log files a node writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogFile {
    System,
    Debug,
}

impl LogFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::System => "system.log",
            Self::Debug => "debug.log",
        }
    }
}

/// How many nodes to create in each datacenter. Datacenters are named `dc1`, `dc2`, ...
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterLayout {
    pub datacenters: Vec<usize>,
    /// Use virtual nodes instead of one balanced token per node.
    pub vnodes: bool,
}

impl ClusterLayout {
    pub fn single(nodes: usize) -> Self {
        Self::multi([nodes])
    }

    pub fn multi(datacenters: impl IntoIterator<Item = usize>) -> Self {
        Self {
            datacenters: datacenters.into_iter().collect(),
            vnodes: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.datacenters.iter().sum()
    }

    /// Datacenter name for each node, in node order.
    pub fn datacenter_names(&self) -> Vec<String> {
        self.datacenters
            .iter()
            .enumerate()
            .flat_map(|(index, count)| {
                std::iter::repeat_n(format!("dc{}", index + 1), *count)
            })
            .collect()
    }

    /// The argument `ccm populate -n` expects, e.g. `3` or `2:2`.
    pub fn populate_arg(&self) -> String {
        self.datacenters
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// A node to add to an existing cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    /// ccm's 1-based node number, which also picks the node's JMX port.
    pub index: u8,
    pub name: String,
    pub address: IpAddr,
    pub datacenter: String,
    pub initial_token: Option<Token>,
    pub seed: bool,
    /// Stream data from existing replicas when joining.
    pub auto_bootstrap: bool,
}

impl NodeSpec {
    /// The next node of a ccm-style cluster: `node<index>` on `127.0.0.<index>`.
    pub fn numbered(index: u8, datacenter: &str, initial_token: Option<Token>) -> Self {
        Self {
            index,
            name: format!("node{index}"),
            address: IpAddr::from([127, 0, 0, index]),
            datacenter: datacenter.to_owned(),
            initial_token,
            seed: false,
            auto_bootstrap: true,
        }
    }

    /// The JMX port ccm assigns node `index`: 7100 for node1, 7200 for node2, and so on.
    pub fn jmx_port(&self) -> u16 {
        7000 + 100 * u16::from(self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartOptions {
    /// Wait until the binary protocol port accepts connections.
    pub wait_for_binary_proto: bool,
    /// Wait until every other live node logs this node as up.
    pub wait_other_notice: bool,
    /// Take ownership of tokens. A node started with `false` coordinates queries but owns no
    /// range.
    pub join_ring: bool,
    pub jvm_args: Vec<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait_for_binary_proto: true,
            wait_other_notice: false,
            join_ring: true,
            jvm_args: Vec::new(),
        }
    }
}

impl StartOptions {
    /// JVM arguments implied by the options, followed by any explicit ones.
    pub fn effective_jvm_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.join_ring {
            args.push("-Dcassandra.join_ring=false".to_string());
        }
        args.extend(self.jvm_args.iter().cloned());
        args
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopOptions {
    /// Drain and shut down cleanly. `false` kills the process.
    pub gently: bool,
    /// Wait until every other live node logs this node as down.
    pub wait_other_notice: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            gently: true,
            wait_other_notice: false,
        }
    }
}

impl StopOptions {
    pub fn kill() -> Self {
        Self {
            gently: false,
            wait_other_notice: true,
        }
    }
}

/// One database node as exposed by the cluster-management tool.
#[async_trait]
pub trait NodeHandle: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn address(&self) -> IpAddr;

    fn datacenter(&self) -> &str;

    /// The token assigned when the node was created, if any.
    fn initial_token(&self) -> Option<Token>;

    /// The node's installation directory.
    fn path(&self) -> &Path;

    fn conf_dir(&self) -> PathBuf {
        self.path().join("conf")
    }

    /// Every configured data directory. More than one means JBOD.
    fn data_dirs(&self) -> Vec<PathBuf>;

    fn commitlog_dir(&self) -> PathBuf {
        self.path().join("commitlogs")
    }

    fn log_file(&self, log: LogFile) -> PathBuf {
        self.path().join("logs").join(log.file_name())
    }

    /// Where the binary protocol listens once the node is up.
    fn native_transport_address(&self) -> SocketAddr {
        SocketAddr::new(self.address(), NATIVE_TRANSPORT_PORT)
    }

    /// Launches the node process. Does not wait for it to become ready.
    async fn start(&self, options: &StartOptions) -> Result<(), Error>;

    async fn stop(&self, options: &StopOptions) -> Result<(), Error>;

    /// Runs `nodetool` against this node. The output is returned unchecked.
    async fn nodetool(&self, args: &[&str]) -> Result<ToolOutput, Error>;

    /// Streams the sstables in `dir` into the cluster through this node. The last two components
    /// of `dir` name the keyspace and table, as `sstableloader` expects.
    async fn bulk_load(&self, dir: &Path) -> Result<ToolOutput, Error>;

    async fn flush(&self) -> Result<(), Error> {
        self.nodetool(&["flush"]).await?.check().map(drop)
    }

    async fn compact(&self) -> Result<(), Error> {
        self.nodetool(&["compact"]).await?.check().map(drop)
    }

    async fn drain(&self) -> Result<(), Error> {
        self.nodetool(&["drain"]).await?.check().map(drop)
    }

    async fn decommission(&self) -> Result<(), Error> {
        self.nodetool(&["decommission"]).await?.check().map(drop)
    }

    /// Loads sstables copied directly into the table's data directory.
    async fn refresh(&self, keyspace: &str, table: &str) -> Result<(), Error> {
        self.nodetool(&["refresh", keyspace, table])
            .await?
            .check_clean()
            .map(drop)
    }
}

/// Creates and destroys clusters, and hands out sessions to their nodes.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    type Node: NodeHandle;
    type Session: Session;

    /// Creates the nodes of `layout`. Configuration options and data directories set beforehand
    /// apply to every node created.
    async fn populate(&mut self, layout: &ClusterLayout) -> Result<Vec<Self::Node>, Error>;

    /// Sets `cassandra.yaml` options on every current and future node.
    async fn set_configuration_options(
        &mut self,
        options: &BTreeMap<String, serde_yaml::Value>,
    ) -> Result<(), Error>;

    /// Configures `count` data directories per node (`data0`, `data1`, ...).
    async fn set_data_dirs(&mut self, count: usize) -> Result<(), Error>;

    async fn add_node(&mut self, spec: &NodeSpec) -> Result<Self::Node, Error>;

    async fn connect(&self, node: &Self::Node) -> Result<Self::Session, Error>;

    /// Stops every node and deletes the cluster's files.
    async fn remove(&mut self) -> Result<(), Error>;

    /// Removes the cluster and creates an empty one in its place. Configuration options and data
    /// directories set earlier apply to the new cluster once it is populated.
    async fn reset(&mut self) -> Result<(), Error>;
}

/// Per-node lifecycle state as tracked by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Down,
    Starting,
    /// Up, but started with `join_ring: false`, so it owns no range.
    UpNotJoined,
    Joining,
    UpNormal,
    Moving,
    Leaving,
    Decommissioned,
}

impl NodeState {
    /// True if the node process is expected to be running.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Down | Self::Decommissioned)
    }

    /// True if the node owns tokens, whether or not it is currently running. A joining node's
    /// tokens are still pending.
    pub fn in_ring(&self) -> bool {
        !matches!(self, Self::UpNotJoined | Self::Joining | Self::Decommissioned)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::UpNotJoined => "up (not joined)",
            Self::Joining => "joining",
            Self::UpNormal => "up",
            Self::Moving => "moving",
            Self::Leaving => "leaving",
            Self::Decommissioned => "decommissioned",
        })
    }
}
