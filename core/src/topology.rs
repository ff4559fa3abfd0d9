//! The harness's own model of replica placement.
//!
//! Given the ring positions of every node that has joined the ring and a keyspace's replication
//! strategy, [`TokenRing::replicas`] computes which nodes should hold a replica of a token. This is
//! computed independently of the cluster, so that it can be compared against what a query trace
//! shows the cluster actually did.

use crate::error::Error;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    net::IpAddr,
};

/// A position on the Murmur3 partitioner's hash ring.
pub type Token = i64;

/// Replication option key naming the strategy class.
const CLASS_OPTION: &str = "class";
/// Replication option key carrying the SimpleStrategy factor.
const REPLICATION_FACTOR_OPTION: &str = "replication_factor";
const STRATEGY_PACKAGE: &str = "org.apache.cassandra.locator.";

/// A node as far as placement is concerned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingMember {
    pub address: IpAddr,
    pub datacenter: String,
    pub rack: String,
    /// Tokens owned by this node. Empty for nodes that are not part of the ring, such as nodes
    /// started with `join_ring: false`.
    pub tokens: Vec<Token>,
}

impl RingMember {
    pub fn new(address: IpAddr, datacenter: &str, rack: &str, tokens: Vec<Token>) -> Self {
        Self {
            address,
            datacenter: datacenter.to_owned(),
            rack: rack.to_owned(),
            tokens,
        }
    }
}

/// Ring positions sorted by token. Each position points at the member owning it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRing {
    positions: Vec<(Token, usize)>,
    members: Vec<RingMember>,
}

impl TokenRing {
    /// Builds a ring from its members. Members without tokens are dropped. Two positions with the
    /// same token are a malformed topology.
    pub fn new(members: impl IntoIterator<Item = RingMember>) -> Result<Self, Error> {
        let members: Vec<_> = members
            .into_iter()
            .filter(|member| !member.tokens.is_empty())
            .collect();

        if let Some(address) = members.iter().map(|m| m.address).duplicates().next() {
            return Err(Error::Configuration(format!(
                "node {address} appears more than once in the ring"
            )));
        }

        let positions: Vec<_> = members
            .iter()
            .enumerate()
            .flat_map(|(index, member)| member.tokens.iter().map(move |token| (*token, index)))
            .sorted()
            .collect();

        if let Some(((token, first), (_, second))) = positions
            .iter()
            .tuple_windows()
            .find(|((a, _), (b, _))| a == b)
        {
            return Err(Error::Configuration(format!(
                "token {token} is claimed by both {} and {}",
                members[*first].address, members[*second].address
            )));
        }

        Ok(Self { positions, members })
    }

    pub fn members(&self) -> &[RingMember] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn member(&self, address: IpAddr) -> Option<&RingMember> {
        self.members.iter().find(|member| member.address == address)
    }

    /// Datacenters present in the ring, in name order.
    pub fn datacenters(&self) -> BTreeSet<&str> {
        self.members.iter().map(|m| m.datacenter.as_str()).collect()
    }

    /// Number of ring members in `datacenter`.
    pub fn node_count(&self, datacenter: &str) -> usize {
        self.members
            .iter()
            .filter(|member| member.datacenter == datacenter)
            .count()
    }

    /// Map from member address to datacenter.
    pub fn datacenter_by_address(&self) -> BTreeMap<IpAddr, String> {
        self.members
            .iter()
            .map(|member| (member.address, member.datacenter.clone()))
            .collect()
    }

    /// The sub-ring made up of only the members in `datacenter`.
    pub fn datacenter_ring(&self, datacenter: &str) -> TokenRing {
        let members: Vec<_> = self
            .members
            .iter()
            .filter(|member| member.datacenter == datacenter)
            .cloned()
            .collect();
        // Positions of a subset of a valid ring are still unique.
        let positions = members
            .iter()
            .enumerate()
            .flat_map(|(index, member)| member.tokens.iter().map(move |token| (*token, index)))
            .sorted()
            .collect();
        TokenRing { positions, members }
    }

    /// Index into the sorted positions of the first position whose token is at or after `token`,
    /// wrapping to the start of the ring.
    fn first_position(&self, token: Token) -> Option<usize> {
        if self.positions.is_empty() {
            return None;
        }
        let index = self.positions.partition_point(|(t, _)| *t < token);
        Some(if index == self.positions.len() { 0 } else { index })
    }

    /// The node owning the range `token` falls in.
    pub fn primary(&self, token: Token) -> Option<&RingMember> {
        self.first_position(token)
            .map(|index| &self.members[self.positions[index].1])
    }

    /// Distinct members in ring order, starting from the owner of `token` and wrapping once.
    pub fn walk(&self, token: Token) -> impl Iterator<Item = &RingMember> + '_ {
        let start = self.first_position(token).unwrap_or(0);
        let len = self.positions.len();
        let mut seen = BTreeSet::new();
        (0..len)
            .map(move |offset| self.positions[(start + offset) % len].1)
            .filter(move |index| seen.insert(*index))
            .map(|index| &self.members[index])
    }

    /// The ordered list of nodes that should hold a replica of `token`.
    pub fn replicas(
        &self,
        token: Token,
        strategy: &ReplicationStrategy,
    ) -> Result<Vec<IpAddr>, Error> {
        strategy.validate(self)?;
        Ok(match strategy {
            ReplicationStrategy::Simple { replication_factor } => self
                .walk(token)
                .take(*replication_factor)
                .map(|member| member.address)
                .collect(),
            ReplicationStrategy::NetworkTopology { datacenter_factors } => datacenter_factors
                .iter()
                .flat_map(|(datacenter, factor)| {
                    self.datacenter_ring(datacenter)
                        .walk(token)
                        .take(*factor)
                        .map(|member| member.address)
                        .collect::<Vec<_>>()
                })
                .collect(),
        })
    }
}

/// How a keyspace spreads replicas over the ring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStrategy {
    /// One global factor, replicas placed by walking the whole ring.
    Simple { replication_factor: usize },
    /// A factor per datacenter, each datacenter's replicas placed by walking its own sub-ring.
    NetworkTopology {
        datacenter_factors: BTreeMap<String, usize>,
    },
}

impl ReplicationStrategy {
    pub fn simple(replication_factor: usize) -> Self {
        Self::Simple { replication_factor }
    }

    pub fn network_topology<'a>(factors: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        Self::NetworkTopology {
            datacenter_factors: factors
                .into_iter()
                .map(|(datacenter, factor)| (datacenter.to_owned(), factor))
                .collect(),
        }
    }

    /// Parses a CQL replication map, e.g. `{'class': 'SimpleStrategy', 'replication_factor': '3'}`
    /// given as key/value pairs. The class may be fully qualified.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, Error> {
        let class = options
            .get(CLASS_OPTION)
            .ok_or_else(|| Error::Configuration("replication options have no class".into()))?;
        let parse_factor = |key: &str, value: &str| {
            value.trim().parse::<usize>().map_err(|_| {
                Error::Configuration(format!("replication factor for {key} is not a count: {value}"))
            })
        };

        match class.strip_prefix(STRATEGY_PACKAGE).unwrap_or(class) {
            "SimpleStrategy" => {
                let factor = options.get(REPLICATION_FACTOR_OPTION).ok_or_else(|| {
                    Error::Configuration("SimpleStrategy requires replication_factor".into())
                })?;
                Ok(Self::simple(parse_factor(REPLICATION_FACTOR_OPTION, factor)?))
            }
            "NetworkTopologyStrategy" => Ok(Self::NetworkTopology {
                datacenter_factors: options
                    .iter()
                    .filter(|(key, _)| key.as_str() != CLASS_OPTION)
                    .map(|(datacenter, factor)| {
                        Ok((datacenter.clone(), parse_factor(datacenter, factor)?))
                    })
                    .collect::<Result<_, Error>>()?,
            }),
            other => Err(Error::Configuration(format!(
                "replication strategy not implemented: {other}"
            ))),
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "SimpleStrategy",
            Self::NetworkTopology { .. } => "NetworkTopologyStrategy",
        }
    }

    /// Number of replicas every token should have: the global factor, or the sum of the
    /// per-datacenter factors.
    pub fn total_replicas(&self) -> usize {
        match self {
            Self::Simple { replication_factor } => *replication_factor,
            Self::NetworkTopology { datacenter_factors } => datacenter_factors.values().sum(),
        }
    }

    /// Checks that `ring` has enough nodes to satisfy every factor.
    pub fn validate(&self, ring: &TokenRing) -> Result<(), Error> {
        match self {
            Self::Simple { replication_factor } => {
                if *replication_factor > ring.members().len() {
                    return Err(Error::InvariantViolation(format!(
                        "replication factor {replication_factor} exceeds the {} nodes in the ring",
                        ring.members().len()
                    )));
                }
            }
            Self::NetworkTopology { datacenter_factors } => {
                for (datacenter, factor) in datacenter_factors {
                    let nodes = ring.node_count(datacenter);
                    if *factor > nodes {
                        return Err(Error::InvariantViolation(format!(
                            "replication factor {factor} for {datacenter} exceeds the {nodes} \
                             nodes in that datacenter"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Display for ReplicationStrategy {
    /// Renders the CQL replication map.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{'{CLASS_OPTION}': '{}'", self.class_name())?;
        match self {
            Self::Simple { replication_factor } => {
                write!(f, ", '{REPLICATION_FACTOR_OPTION}': {replication_factor}")?
            }
            Self::NetworkTopology { datacenter_factors } => {
                for (datacenter, factor) in datacenter_factors {
                    write!(f, ", '{datacenter}': {factor}")?;
                }
            }
        }
        f.write_str("}")
    }
}

/// A keyspace as the harness expects it to exist on the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceDefinition {
    pub name: String,
    pub strategy: ReplicationStrategy,
    #[serde(default = "default_durable_writes")]
    pub durable_writes: bool,
}

fn default_durable_writes() -> bool {
    true
}

impl KeyspaceDefinition {
    pub fn new(name: &str, strategy: ReplicationStrategy) -> Self {
        Self {
            name: name.to_owned(),
            strategy,
            durable_writes: true,
        }
    }

    pub fn create_statement(&self) -> String {
        format!(
            "CREATE KEYSPACE {} WITH replication = {} AND durable_writes = {}",
            self.name, self.strategy, self.durable_writes
        )
    }
}
