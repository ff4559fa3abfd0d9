//! Reconstruction of a write's path through the cluster from its query trace.
//!
//! The server records a trace as an ordered list of events, each with the node that produced it,
//! the time elapsed on that node, a free-text description and a thread name. The descriptions are
//! not a stable interface, so the phrasing the analyzer looks for lives in a [`TracePatterns`]
//! table that can be swapped per server release. Each event is classified once into a
//! [`TraceEventKind`], and the [`ReplicaVerdict`] is folded from those classifications.
//!
//! Parsing is best-effort: events the table does not recognize are ignored, and a trace without a
//! coordinator marker yields empty coordinator-scoped sets instead of an error. Strictness belongs
//! to the assertions made on the verdict.

use crate::error::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    net::IpAddr,
    str::FromStr,
    time::Duration,
};
use tracing::debug;

/// One event of a query trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Node that recorded the event.
    pub source: IpAddr,
    /// Time since the request arrived at `source`.
    pub source_elapsed: Duration,
    pub description: String,
    pub thread: String,
}

impl TraceEvent {
    pub fn new(source: IpAddr, source_elapsed_micros: u64, description: &str, thread: &str) -> Self {
        Self {
            source,
            source_elapsed: Duration::from_micros(source_elapsed_micros),
            description: description.to_owned(),
            thread: thread.to_owned(),
        }
    }
}

impl Display for TraceEvent {
    /// Tab-separated `source elapsed_us description thread`, the format [`parse_trace_dump`]
    /// reads back.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.source,
            self.source_elapsed.as_micros(),
            self.description,
            self.thread
        )
    }
}

impl FromStr for TraceEvent {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.splitn(4, '\t');
        let (Some(source), Some(elapsed), Some(description)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::parse("trace event", format!("too few fields in {line:?}")));
        };
        Ok(Self {
            source: source
                .trim()
                .parse()
                .map_err(|_| Error::parse("trace event source", source))?,
            source_elapsed: Duration::from_micros(
                elapsed
                    .trim()
                    .parse()
                    .map_err(|_| Error::parse("trace event elapsed time", elapsed))?,
            ),
            description: description.to_owned(),
            thread: fields.next().unwrap_or_default().trim_end().to_owned(),
        })
    }
}

/// Parses a trace dump, one tab-separated event per line. Blank lines and lines starting with `#`
/// are skipped.
pub fn parse_trace_dump(dump: &str) -> Result<Vec<TraceEvent>, Error> {
    dump.lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(str::parse)
        .collect()
}

/// The role an event plays in a distributed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEventKind {
    /// The node computed the replica set for a mutation, i.e. it is coordinating.
    CoordinatorDetermined,
    MessageSent { peer: IpAddr },
    MessageReceived { peer: IpAddr },
    /// The node relays a write to `peer`, a replica in its own datacenter.
    ForwardedWrite { peer: IpAddr },
    /// The node durably logged the write.
    CommitLogAppend,
    Other,
}

/// Description patterns for one generation of server trace messages. Patterns with a peer must
/// have exactly one capture group holding the peer's address.
#[derive(Clone, Debug)]
pub struct TracePatterns {
    pub version: &'static str,
    pub coordinator_determined: Regex,
    pub message_sent: Regex,
    pub message_received: Regex,
    pub forwarded_write: Regex,
    pub commit_log_append: Regex,
}

const IPV4: &str = r"([0-9]+\.[0-9]+\.[0-9]+\.[0-9]+)";

impl TracePatterns {
    /// Phrasing used by the 2.x and 3.x server lines.
    pub fn cassandra_2x() -> Self {
        Self::from_parts(
            "2.x",
            r"^Determining replicas for mutation",
            &format!(r"Sending message to /{IPV4}"),
            &format!(r"Message received from /{IPV4}"),
            &format!(r"Enqueuing forwarded write to /{IPV4}"),
            r"Appending to commitlog",
        )
        .expect("built-in trace patterns are valid")
    }

    /// Phrasing used from 4.0 on, where messages name the verb and the peer carries a port.
    pub fn cassandra_4x() -> Self {
        Self::from_parts(
            "4.x",
            r"^Determining replicas for mutation",
            &format!(r"Sending \S+ message to /{IPV4}(?::[0-9]+)?"),
            &format!(r"\S+ message received from /{IPV4}(?::[0-9]+)?"),
            &format!(r"Enqueuing forwarded write to /{IPV4}(?::[0-9]+)?"),
            r"Appending to commitlog",
        )
        .expect("built-in trace patterns are valid")
    }

    /// Looks up a built-in table by version label.
    pub fn for_version(version: &str) -> Result<Self, Error> {
        match version {
            "2.x" | "3.x" => Ok(Self::cassandra_2x()),
            "4.x" | "5.x" => Ok(Self::cassandra_4x()),
            other => Err(Error::Configuration(format!(
                "no trace patterns for server version {other}"
            ))),
        }
    }

    /// Builds a table from raw pattern strings.
    pub fn from_parts(
        version: &'static str,
        coordinator_determined: &str,
        message_sent: &str,
        message_received: &str,
        forwarded_write: &str,
        commit_log_append: &str,
    ) -> Result<Self, Error> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| Error::Configuration(format!("bad trace pattern {pattern:?}: {err}")))
        };
        Ok(Self {
            version,
            coordinator_determined: compile(coordinator_determined)?,
            message_sent: compile(message_sent)?,
            message_received: compile(message_received)?,
            forwarded_write: compile(forwarded_write)?,
            commit_log_append: compile(commit_log_append)?,
        })
    }

    /// Classifies one event description. The first matching pattern wins, in the order coordinator,
    /// sent, received, forwarded, commit log.
    pub fn classify(&self, description: &str) -> TraceEventKind {
        let peer = |regex: &Regex| {
            regex
                .captures(description)
                .and_then(|captures| captures.get(1))
                .and_then(|m| m.as_str().parse::<IpAddr>().ok())
        };

        if self.coordinator_determined.is_match(description) {
            TraceEventKind::CoordinatorDetermined
        } else if let Some(peer) = peer(&self.message_sent) {
            TraceEventKind::MessageSent { peer }
        } else if let Some(peer) = peer(&self.message_received) {
            TraceEventKind::MessageReceived { peer }
        } else if let Some(peer) = peer(&self.forwarded_write) {
            TraceEventKind::ForwardedWrite { peer }
        } else if self.commit_log_append.is_match(description) {
            TraceEventKind::CommitLogAppend
        } else {
            TraceEventKind::Other
        }
    }
}

impl Default for TracePatterns {
    fn default() -> Self {
        Self::cassandra_2x()
    }
}

/// Who did what for one write, as reconstructed from its trace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaVerdict {
    pub coordinator: Option<IpAddr>,
    /// Nodes a remote-datacenter write was forwarded to.
    pub forwarders: BTreeSet<IpAddr>,
    /// Nodes that appended the write to their commit log.
    pub replicas: BTreeSet<IpAddr>,
    /// Nodes the coordinator sent the write to, plus forwarding targets.
    pub nodes_sent_write: BTreeSet<IpAddr>,
    /// Nodes the coordinator received a response from.
    pub nodes_responded_write: BTreeSet<IpAddr>,
    /// For each event source, the peers it sent messages to.
    pub nodes_contacted: BTreeMap<IpAddr, BTreeSet<IpAddr>>,
}

impl ReplicaVerdict {
    /// Peers the coordinator sent messages to directly.
    pub fn contacted_by_coordinator(&self) -> BTreeSet<IpAddr> {
        self.coordinator
            .and_then(|coordinator| self.nodes_contacted.get(&coordinator))
            .cloned()
            .unwrap_or_default()
    }
}

impl Display for ReplicaVerdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn join(set: &BTreeSet<IpAddr>) -> String {
            format!(
                "[{}]",
                set.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            )
        }

        match self.coordinator {
            Some(coordinator) => writeln!(f, "coordinator: {coordinator}")?,
            None => writeln!(f, "coordinator: none")?,
        }
        writeln!(f, "replicas: {}", join(&self.replicas))?;
        writeln!(f, "forwarders: {}", join(&self.forwarders))?;
        writeln!(f, "sent: {}", join(&self.nodes_sent_write))?;
        writeln!(f, "responded: {}", join(&self.nodes_responded_write))?;
        for (source, peers) in &self.nodes_contacted {
            writeln!(f, "contacted by {source}: {}", join(peers))?;
        }
        Ok(())
    }
}

/// Turns a trace into a [`ReplicaVerdict`] using one pattern table.
#[derive(Clone, Debug, Default)]
pub struct TraceAnalyzer {
    patterns: TracePatterns,
}

impl TraceAnalyzer {
    pub fn new(patterns: TracePatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &TracePatterns {
        &self.patterns
    }

    /// Analyzes `events`, which must already be in the order the server recorded them.
    pub fn analyze(&self, events: &[TraceEvent]) -> ReplicaVerdict {
        let classified: Vec<_> = events
            .iter()
            .map(|event| (event, self.patterns.classify(&event.description)))
            .collect();

        // The first marker anywhere in the trace fixes the coordinator.
        let coordinator = classified
            .iter()
            .find(|(_, kind)| *kind == TraceEventKind::CoordinatorDetermined)
            .map(|(event, _)| event.source);

        let mut verdict = ReplicaVerdict {
            coordinator,
            ..Default::default()
        };

        for (event, kind) in classified {
            let from_coordinator = Some(event.source) == coordinator;
            match kind {
                TraceEventKind::MessageSent { peer } => {
                    if from_coordinator {
                        verdict.nodes_sent_write.insert(peer);
                    }
                    verdict
                        .nodes_contacted
                        .entry(event.source)
                        .or_default()
                        .insert(peer);
                }
                TraceEventKind::MessageReceived { peer } => {
                    if from_coordinator {
                        verdict.nodes_responded_write.insert(peer);
                    }
                }
                TraceEventKind::ForwardedWrite { peer } if !from_coordinator => {
                    verdict.forwarders.insert(peer);
                    verdict.nodes_sent_write.insert(peer);
                }
                TraceEventKind::CommitLogAppend => {
                    verdict.replicas.insert(event.source);
                }
                TraceEventKind::ForwardedWrite { .. }
                | TraceEventKind::CoordinatorDetermined
                | TraceEventKind::Other => {}
            }
        }

        verdict
    }

    /// Logs every event of a trace at debug level.
    pub fn log_trace(events: &[TraceEvent]) {
        for event in events {
            debug!(
                source = %event.source,
                elapsed = ?event.source_elapsed,
                thread = %event.thread,
                "{}",
                event.description
            );
        }
    }
}
