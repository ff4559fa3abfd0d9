//! Drives a cluster through lifecycle transitions and waits for each one to converge.
//!
//! Every wait is bounded by the harness's [`ConvergenceTimeouts`], and a wait that runs out fails
//! with [`Error::ConvergenceTimeout`] rather than leaving the cluster in an unknown state
//! silently. The controller also keeps the keyspaces a test declared, so the replication
//! invariants can be re-checked after each topology change.
//!
//! Nodes are addressed by their zero-based position: index 0 is `node1`.
//!
//! [`ConvergenceTimeouts`]: dtest_core::config::ConvergenceTimeouts

use crate::{
    cluster::{
        ClusterBackend, ClusterLayout, LogFile, NodeHandle, NodeSpec, NodeState, StartOptions,
        StopOptions, ToolOutput,
    },
    driver::{parse_cql_map, Consistency, Session},
    logs::{grep_log, mark_log, watch_log_for, LogMark, LogMatch},
    nodetool::{self, GetEndpoints, GetSsTables, Ring, RingEntry, RingState, ServerStatus, Status},
    snitch::{SnitchConfig, SnitchKind, ENDPOINT_SNITCH_OPTION},
};
use dtest_core::{
    config::HarnessConfig,
    error::Error,
    retries::poll_until,
    topology::{KeyspaceDefinition, ReplicationStrategy, RingMember, Token, TokenRing},
};
use regex::Regex;
use serde_yaml::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    path::PathBuf,
};
use tokio::{net::TcpStream, task::JoinHandle};
use tracing::{debug, info, warn};

/// Rack ccm's default snitch configuration puts every node in.
pub const DEFAULT_RACK: &str = "rack1";

/// Logged once a node serves client requests, which is the end of bootstrap.
const CQL_LISTENING: &str = "Starting listening for CQL clients";
/// Logged by a moving node after announcing the move, before it streams anything.
const MOVE_SLEEPING: &str = "Sleeping 30000 ms before start streaming/fetching ranges";

/// A node as the controller tracks it.
#[derive(Clone, Debug)]
pub struct NodeRecord<N> {
    pub handle: N,
    pub state: NodeState,
    pub rack: String,
    pub tokens: Vec<Token>,
}

struct PendingMove {
    token: Token,
    task: JoinHandle<Result<ToolOutput, Error>>,
}

pub struct ClusterController<B: ClusterBackend> {
    backend: B,
    config: HarnessConfig,
    layout: Option<ClusterLayout>,
    nodes: Vec<NodeRecord<B::Node>>,
    keyspaces: BTreeMap<String, KeyspaceDefinition>,
    moves: BTreeMap<usize, PendingMove>,
}

fn pattern(expression: &str) -> Result<Regex, Error> {
    Regex::new(expression)
        .map_err(|err| Error::Configuration(format!("bad log pattern {expression:?}: {err}")))
}

fn notice_pattern(address: IpAddr, state: &str) -> Result<Regex, Error> {
    pattern(&format!(
        "{}.* now {state}",
        regex::escape(&address.to_string())
    ))
}

impl<B: ClusterBackend> ClusterController<B> {
    pub fn new(backend: B, config: HarnessConfig) -> Self {
        Self {
            backend,
            config,
            layout: None,
            nodes: Vec::new(),
            keyspaces: BTreeMap::new(),
            moves: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates the nodes of `layout`. Nodes start out down.
    pub async fn populate(&mut self, layout: ClusterLayout) -> Result<(), Error> {
        info!(layout = layout.populate_arg(), vnodes = layout.vnodes, "populating cluster");
        let handles = self.backend.populate(&layout).await?;
        self.nodes = handles
            .into_iter()
            .map(|handle| NodeRecord {
                tokens: handle.initial_token().into_iter().collect(),
                handle,
                state: NodeState::Down,
                rack: DEFAULT_RACK.to_string(),
            })
            .collect();
        self.layout = Some(layout);
        Ok(())
    }

    pub async fn set_configuration_options(
        &mut self,
        options: &BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        debug!(?options, "setting configuration options");
        self.backend.set_configuration_options(options).await
    }

    /// Selects the snitch every node uses. Takes effect for nodes started afterwards.
    pub async fn use_snitch(&mut self, kind: SnitchKind) -> Result<(), Error> {
        self.set_configuration_options(&BTreeMap::from([(
            ENDPOINT_SNITCH_OPTION.to_string(),
            Value::String(kind.qualified_class_name()),
        )]))
        .await
    }

    /// Gives every node `count` data directories.
    pub async fn set_data_dirs(&mut self, count: usize) -> Result<(), Error> {
        self.backend.set_data_dirs(count).await
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord<B::Node>> {
        self.nodes.iter()
    }

    fn record(&self, index: usize) -> Result<&NodeRecord<B::Node>, Error> {
        self.nodes.get(index).ok_or_else(|| {
            Error::Configuration(format!(
                "no node at index {index}, cluster has {}",
                self.nodes.len()
            ))
        })
    }

    fn record_mut(&mut self, index: usize) -> Result<&mut NodeRecord<B::Node>, Error> {
        let count = self.nodes.len();
        self.nodes.get_mut(index).ok_or_else(|| {
            Error::Configuration(format!("no node at index {index}, cluster has {count}"))
        })
    }

    pub fn node(&self, index: usize) -> Result<&B::Node, Error> {
        Ok(&self.record(index)?.handle)
    }

    pub fn state(&self, index: usize) -> Result<NodeState, Error> {
        Ok(self.record(index)?.state)
    }

    fn set_state(&mut self, index: usize, state: NodeState) -> Result<(), Error> {
        let record = self.record_mut(index)?;
        debug!(node = record.handle.name(), from = %record.state, to = %state, "node state");
        record.state = state;
        Ok(())
    }

    fn index_of(&self, address: IpAddr) -> Option<usize> {
        self.nodes
            .iter()
            .position(|record| record.handle.address() == address)
    }

    /// Live nodes other than `index`, each with a mark at the end of its `log`.
    async fn mark_other_live_logs(
        &self,
        index: usize,
        log: LogFile,
    ) -> Result<Vec<(B::Node, LogMark)>, Error> {
        let mut marks = Vec::new();
        for (other, record) in self.nodes.iter().enumerate() {
            if other != index && record.state.is_live() {
                let mark = mark_log(&record.handle.log_file(log)).await?;
                marks.push((record.handle.clone(), mark));
            }
        }
        Ok(marks)
    }

    async fn wait_for_notices(
        &self,
        marks: Vec<(B::Node, LogMark)>,
        notice: &Regex,
    ) -> Result<(), Error> {
        for (observer, mark) in marks {
            watch_log_for(
                &observer.log_file(LogFile::System),
                notice,
                mark,
                self.config.timeouts.log_watch(),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn connect(&self, index: usize) -> Result<B::Session, Error> {
        self.backend.connect(self.node(index)?).await
    }

    /// Polls the node's binary protocol port until it accepts a connection.
    async fn wait_for_binary_proto(&self, node: &B::Node) -> Result<(), Error> {
        let address = node.native_transport_address();
        poll_until(
            &format!("binary protocol on {} ({address})", node.name()),
            self.config.timeouts.binary_protocol(),
            || async move { Ok(TcpStream::connect(address).await.is_ok()) },
            |listening| *listening,
        )
        .await
        .map(drop)
    }

    pub async fn start_node(&mut self, index: usize, options: &StartOptions) -> Result<(), Error> {
        let record = self.record(index)?;
        match record.state {
            NodeState::Down => {}
            NodeState::Decommissioned => {
                return Err(Error::Configuration(format!(
                    "{} was decommissioned and cannot be restarted",
                    record.handle.name()
                )));
            }
            state => {
                debug!(node = record.handle.name(), %state, "node already running");
                return Ok(());
            }
        }
        let node = record.handle.clone();
        let marks = if options.wait_other_notice {
            self.mark_other_live_logs(index, LogFile::System).await?
        } else {
            Vec::new()
        };

        info!(node = node.name(), join_ring = options.join_ring, "starting node");
        self.set_state(index, NodeState::Starting)?;
        if let Err(error) = node.start(options).await {
            self.set_state(index, NodeState::Down)?;
            return Err(error);
        }
        if options.wait_for_binary_proto {
            if let Err(error) = self.wait_for_binary_proto(&node).await {
                warn!(node = node.name(), %error, "binary protocol never came up, killing node");
                let kill = StopOptions {
                    gently: false,
                    wait_other_notice: false,
                };
                if let Err(stop_error) = node.stop(&kill).await {
                    warn!(node = node.name(), error = %stop_error, "couldn't kill node");
                }
                self.set_state(index, NodeState::Down)?;
                return Err(error);
            }
        }
        self.set_state(
            index,
            if options.join_ring {
                NodeState::UpNormal
            } else {
                NodeState::UpNotJoined
            },
        )?;
        self.wait_for_notices(marks, &notice_pattern(node.address(), "UP")?)
            .await
    }

    /// Starts every node that is down, in order.
    pub async fn start_all(&mut self, options: &StartOptions) -> Result<(), Error> {
        for index in 0..self.nodes.len() {
            if self.nodes[index].state == NodeState::Down {
                self.start_node(index, options).await?;
            }
        }
        Ok(())
    }

    /// Starts a node that is expected to fail, and waits for the log line saying why. The node is
    /// considered down afterwards.
    pub async fn start_node_expecting(
        &mut self,
        index: usize,
        expected: &str,
    ) -> Result<LogMatch, Error> {
        let node = self.node(index)?.clone();
        let expected = pattern(expected)?;
        let log = node.log_file(LogFile::System);
        let mark = mark_log(&log).await?;

        info!(node = node.name(), %expected, "starting node, expecting failure");
        let options = StartOptions {
            wait_for_binary_proto: false,
            ..Default::default()
        };
        node.start(&options).await?;
        let found = watch_log_for(&log, &expected, mark, self.config.timeouts.log_watch()).await;
        self.set_state(index, NodeState::Down)?;
        found
    }

    async fn stop_with(
        &mut self,
        index: usize,
        options: &StopOptions,
        final_state: NodeState,
    ) -> Result<(), Error> {
        let node = self.node(index)?.clone();
        let marks = if options.wait_other_notice {
            self.mark_other_live_logs(index, LogFile::System).await?
        } else {
            Vec::new()
        };

        info!(node = node.name(), gently = options.gently, "stopping node");
        node.stop(options).await?;
        self.set_state(index, final_state)?;
        self.wait_for_notices(marks, &notice_pattern(node.address(), "DOWN")?)
            .await
    }

    pub async fn stop_node(&mut self, index: usize, options: &StopOptions) -> Result<(), Error> {
        self.stop_with(index, options, NodeState::Down).await
    }

    /// Kills the node process and waits for every other live node to notice.
    pub async fn kill_node(&mut self, index: usize) -> Result<(), Error> {
        self.stop_node(index, &StopOptions::kill()).await
    }

    pub async fn stop_all(&mut self, options: &StopOptions) -> Result<(), Error> {
        for index in 0..self.nodes.len() {
            if self.nodes[index].state.is_live() {
                self.stop_node(index, options).await?;
            }
        }
        Ok(())
    }

    /// Starts moving a node to `token` in the background, and returns once the node has announced
    /// the move and every other live node has seen it. The move itself completes (or fails) in
    /// [`Self::finish_move`].
    pub async fn begin_move(&mut self, index: usize, token: Token) -> Result<(), Error> {
        if self.moves.contains_key(&index) {
            return Err(Error::Configuration(format!(
                "node at index {index} is already moving"
            )));
        }
        let node = self.node(index)?.clone();
        let log = node.log_file(LogFile::System);
        let mark = mark_log(&log).await?;
        let observers = self.mark_other_live_logs(index, LogFile::Debug).await?;

        info!(node = node.name(), token, "moving node");
        let task_node = node.clone();
        let task = tokio::spawn(async move {
            let token = token.to_string();
            task_node.nodetool(&["move", &token]).await
        });
        self.moves.insert(index, PendingMove { token, task });
        self.set_state(index, NodeState::Moving)?;

        let parameters = self.config.timeouts.log_watch();
        watch_log_for(&log, &pattern(&format!("Moving .* to {token}"))?, mark, parameters).await?;
        watch_log_for(&log, &pattern(MOVE_SLEEPING)?, mark, parameters).await?;

        let moving = pattern(&format!(
            "{} state moving",
            regex::escape(&node.address().to_string())
        ))?;
        for (observer, mark) in observers {
            watch_log_for(&observer.log_file(LogFile::Debug), &moving, mark, parameters).await?;
        }
        Ok(())
    }

    /// Waits for the background move of a node to end, returning the raw `nodetool move` output.
    /// A successful move takes the new token; a move that failed, e.g. because the node was
    /// killed, leaves the node's tokens unchanged.
    pub async fn finish_move(&mut self, index: usize) -> Result<ToolOutput, Error> {
        let PendingMove { token, task } = self.moves.remove(&index).ok_or_else(|| {
            Error::Configuration(format!("node at index {index} is not moving"))
        })?;
        let output = task.await.map_err(|err| Error::Io(std::io::Error::other(err)))??;

        let record = self.record_mut(index)?;
        if output.success() {
            record.tokens = Vec::from([token]);
            if record.state == NodeState::Moving {
                record.state = NodeState::UpNormal;
            }
            info!(node = record.handle.name(), token, "move complete");
        } else {
            warn!(node = record.handle.name(), stderr = %output.stderr, "move did not complete");
        }
        Ok(output)
    }

    /// Polls `nodetool ring` on `observer` until it reports `address` with the given status and
    /// state.
    pub async fn wait_for_ring_state(
        &self,
        observer: usize,
        address: IpAddr,
        status: ServerStatus,
        state: RingState,
    ) -> Result<RingEntry, Error> {
        let node = self.node(observer)?;
        let command = Ring::default();
        let entries = poll_until(
            &format!("{address} to be {status:?}/{state:?} on {}", node.name()),
            self.config.timeouts.status_poll(),
            || async { Ok(nodetool::run(node, &command).await?.0) },
            |entries: &Vec<RingEntry>| {
                entries
                    .iter()
                    .any(|e| e.address == address && e.status == status && e.state == state)
            },
        )
        .await?;
        entries
            .into_iter()
            .find(|entry| entry.address == address)
            .ok_or_else(|| Error::parse("nodetool ring", format!("{address} vanished")))
    }

    /// Decommissions a node, then stops it once every other node has seen it leave.
    pub async fn decommission_node(&mut self, index: usize) -> Result<(), Error> {
        let node = self.node(index)?.clone();
        info!(node = node.name(), "decommissioning node");
        self.set_state(index, NodeState::Leaving)?;
        node.decommission().await?;
        self.record_mut(index)?.tokens.clear();
        self.stop_with(
            index,
            &StopOptions {
                gently: true,
                wait_other_notice: true,
            },
            NodeState::Decommissioned,
        )
        .await
    }

    /// Keyspace groups a node computed pending ranges for, from its debug log. Keyspaces with the
    /// same replication settings are expected to be grouped into one calculation.
    pub async fn pending_range_groups(&self, observer: usize) -> Result<Vec<BTreeSet<String>>, Error> {
        let log = self.node(observer)?.log_file(LogFile::Debug);
        let matches = grep_log(
            &log,
            &pattern(r"Starting pending range calculation for \[([^]]+)\]")?,
        )
        .await?;
        Ok(matches
            .into_iter()
            .filter_map(|found| found.captures.into_iter().next().flatten())
            .map(|group| group.split(',').map(|ks| ks.trim().to_string()).collect())
            .collect())
    }

    /// Adds a node and bootstraps it into the ring, returning its index.
    pub async fn bootstrap_node(&mut self, spec: &NodeSpec) -> Result<usize, Error> {
        info!(node = %spec.name, address = %spec.address, "bootstrapping node");
        let node = self.backend.add_node(spec).await?;
        let log = node.log_file(LogFile::System);
        let mark = mark_log(&log).await?;
        self.nodes.push(NodeRecord {
            tokens: node.initial_token().into_iter().collect(),
            handle: node.clone(),
            state: NodeState::Joining,
            rack: DEFAULT_RACK.to_string(),
        });
        let index = self.nodes.len() - 1;

        node.start(&StartOptions {
            wait_for_binary_proto: false,
            ..Default::default()
        })
        .await?;
        watch_log_for(&log, &pattern(CQL_LISTENING)?, mark, self.config.timeouts.log_watch()).await?;
        self.set_state(index, NodeState::UpNormal)?;
        Ok(index)
    }

    /// The controller's view of the ring: every node that owns tokens, up or not.
    pub fn ring(&self) -> Result<TokenRing, Error> {
        TokenRing::new(
            self.nodes
                .iter()
                .filter(|record| record.state.in_ring())
                .map(|record| {
                    RingMember::new(
                        record.handle.address(),
                        record.handle.datacenter(),
                        &record.rack,
                        record.tokens.clone(),
                    )
                }),
        )
    }

    /// Replaces the tracked tokens and racks with what `nodetool ring` on `observer` reports.
    /// Needed with virtual nodes, whose tokens are chosen by the server.
    pub async fn refresh_tokens(&mut self, observer: usize) -> Result<(), Error> {
        let (entries, _) = nodetool::run(self.node(observer)?, &Ring::default()).await?;
        let mut owned: BTreeMap<IpAddr, (String, Vec<Token>)> = BTreeMap::new();
        for entry in entries {
            let (rack, tokens) = owned.entry(entry.address).or_default();
            *rack = entry.rack;
            tokens.push(entry.token);
        }
        for record in &mut self.nodes {
            match owned.remove(&record.handle.address()) {
                Some((rack, tokens)) => {
                    record.rack = rack;
                    record.tokens = tokens;
                }
                None => record.tokens.clear(),
            }
        }
        Ok(())
    }

    /// Registers a keyspace after checking the current ring can satisfy its replication.
    pub fn define_keyspace(&mut self, definition: KeyspaceDefinition) -> Result<(), Error> {
        definition.strategy.validate(&self.ring()?)?;
        debug!(keyspace = %definition.name, strategy = %definition.strategy, "defining keyspace");
        self.keyspaces.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn keyspace(&self, name: &str) -> Result<&KeyspaceDefinition, Error> {
        self.keyspaces
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("keyspace {name} was never defined")))
    }

    /// Re-checks every registered keyspace against the current ring.
    pub fn verify_replication_invariants(&self) -> Result<(), Error> {
        let ring = self.ring()?;
        self.keyspaces
            .values()
            .try_for_each(|definition| definition.strategy.validate(&ring))
    }

    /// Defines a keyspace and creates it through `session`.
    pub async fn create_keyspace(
        &mut self,
        session: &B::Session,
        definition: KeyspaceDefinition,
    ) -> Result<(), Error> {
        let statement = definition.create_statement();
        self.define_keyspace(definition)?;
        session.execute(&statement, Consistency::All).await.map(drop)
    }

    /// Fetches a keyspace's settings from the server's schema tables.
    pub async fn current_keyspace(
        &self,
        session: &B::Session,
        name: &str,
    ) -> Result<KeyspaceDefinition, Error> {
        let rows = session
            .execute(
                &format!(
                    "SELECT keyspace_name, durable_writes, replication FROM system_schema.keyspaces \
                     WHERE keyspace_name = '{name}'"
                ),
                Consistency::One,
            )
            .await?;
        let replication = rows
            .first_value("replication")
            .ok_or_else(|| Error::mismatch(format!("schema of keyspace {name}"), "one row", &rows))?;
        let durable_writes = rows
            .first_value("durable_writes")
            .is_none_or(|value| value.eq_ignore_ascii_case("true"));
        Ok(KeyspaceDefinition {
            name: name.to_owned(),
            strategy: ReplicationStrategy::from_options(&parse_cql_map(replication)?)?,
            durable_writes,
        })
    }

    /// Applies the configured server log-level overrides for `test_id` to every live node.
    pub async fn apply_log_overrides(&self, test_id: &str) -> Result<(), Error> {
        for log_override in self.config.log_overrides_for(test_id) {
            let args = log_override.nodetool_args();
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            for record in self.nodes.iter().filter(|record| record.state.is_live()) {
                debug!(node = record.handle.name(), ?args, "overriding log level");
                record.handle.nodetool(&args).await?.check()?;
            }
        }
        Ok(())
    }

    /// Replaces the cluster with a fresh one of the same layout, and starts it. Keyspace
    /// definitions are forgotten along with the data.
    pub async fn rebuild(&mut self) -> Result<(), Error> {
        let layout = self
            .layout
            .clone()
            .ok_or_else(|| Error::Configuration("cluster was never populated".into()))?;
        info!("rebuilding cluster");
        for (_, pending) in std::mem::take(&mut self.moves) {
            pending.task.abort();
        }
        self.backend.reset().await?;
        self.keyspaces.clear();
        self.populate(layout).await?;
        self.start_all(&StartOptions::default()).await
    }

    pub async fn write_snitch_config(&self, index: usize, config: &SnitchConfig) -> Result<(), Error> {
        config.write_to(&self.node(index)?.conf_dir()).await
    }

    /// Polls `nodetool status` on every live node until the racks of its up/normal rows are
    /// `expected`, in order. Tracked racks are updated from the final observation.
    pub async fn wait_for_racks(&mut self, expected: &[&str]) -> Result<(), Error> {
        let mut observed = Vec::new();
        for record in self.nodes.iter().filter(|record| record.state.is_live()) {
            let node = &record.handle;
            let entries = poll_until(
                &format!("racks {expected:?} on {}", node.name()),
                self.config.timeouts.status_poll(),
                || async { Ok(nodetool::run(node, &Status).await?.0) },
                |entries: &Vec<_>| {
                    entries
                        .iter()
                        .filter(|entry| entry.is_up_normal())
                        .map(|entry| entry.rack.as_str())
                        .eq(expected.iter().copied())
                },
            )
            .await?;
            info!(node = node.name(), "racks converged");
            observed = entries;
        }
        for entry in observed {
            if let Some(index) = self.index_of(entry.address) {
                self.nodes[index].rack = entry.rack;
            }
        }
        Ok(())
    }

    /// Checks that every live node reports as many replicas for a key of `keyspace.table` as the
    /// keyspace's replication factors add up to.
    pub async fn check_endpoint_count(&self, keyspace: &str, table: &str) -> Result<(), Error> {
        let expected = self.keyspace(keyspace)?.strategy.total_replicas();
        let command = GetEndpoints {
            keyspace: keyspace.to_owned(),
            table: table.to_owned(),
            key: "dummy".to_owned(),
        };
        for record in self.nodes.iter().filter(|record| record.state.is_live()) {
            let (endpoints, output) = nodetool::run(&record.handle, &command).await?;
            debug!(node = record.handle.name(), expected, ?endpoints, "endpoints");
            if endpoints.len() != expected {
                return Err(Error::mismatch(
                    format!("endpoint count of {keyspace}.{table} on {}", record.handle.name()),
                    &expected,
                    &endpoints.len(),
                )
                .with_raw_output(output.stdout));
            }
        }
        Ok(())
    }

    /// Reassigns racks by rewriting each node's snitch file without restarting anything. The
    /// endpoint count of `keyspace.table` must be right both before the change and once the new
    /// racks have converged.
    pub async fn reconfigure_snitch(
        &mut self,
        keyspace: &str,
        table: &str,
        configs: &[SnitchConfig],
        expected_racks: &[&str],
    ) -> Result<(), Error> {
        if configs.len() != self.nodes.len() {
            return Err(Error::Configuration(format!(
                "{} snitch files for {} nodes",
                configs.len(),
                self.nodes.len()
            )));
        }
        self.check_endpoint_count(keyspace, table).await?;
        for (index, config) in configs.iter().enumerate() {
            self.write_snitch_config(index, config).await?;
        }
        self.wait_for_racks(expected_racks).await?;
        self.check_endpoint_count(keyspace, table).await
    }

    /// The data directories holding sstables for `key`, as `nodetool getsstables` reports them.
    pub async fn sstable_data_dirs(
        &self,
        index: usize,
        keyspace: &str,
        table: &str,
        key: &str,
    ) -> Result<BTreeSet<PathBuf>, Error> {
        let node = self.node(index)?;
        let command = GetSsTables {
            keyspace: keyspace.to_owned(),
            table: table.to_owned(),
            key: key.to_owned(),
        };
        let (sstables, output) = nodetool::run(node, &command).await?;
        let data_dirs = node.data_dirs();
        sstables
            .iter()
            .map(|sstable| {
                data_dirs
                    .iter()
                    .find(|dir| sstable.starts_with(dir))
                    .cloned()
                    .ok_or_else(|| {
                        Error::mismatch("data directory of sstable", &data_dirs, sstable)
                            .with_raw_output(output.stdout.clone())
                    })
            })
            .collect()
    }

    pub async fn flush_all(&self) -> Result<(), Error> {
        for record in self.nodes.iter().filter(|record| record.state.is_live()) {
            record.handle.flush().await?;
        }
        Ok(())
    }

    pub async fn compact_all(&self) -> Result<(), Error> {
        for record in self.nodes.iter().filter(|record| record.state.is_live()) {
            record.handle.compact().await?;
        }
        Ok(())
    }

    /// Removes the cluster. Moves still running are abandoned.
    pub async fn teardown(mut self) -> Result<(), Error> {
        for (_, pending) in std::mem::take(&mut self.moves) {
            pending.task.abort();
        }
        self.backend.remove().await
    }
}
