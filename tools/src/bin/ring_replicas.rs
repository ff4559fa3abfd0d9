use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dtest_core::{
    topology::{ReplicationStrategy, RingMember, Token, TokenRing},
    trace::{install_trace_subscriber, TraceConfiguration},
};
use std::{
    collections::BTreeMap,
    io::{stdout, Write},
    net::IpAddr,
    str::FromStr,
};
use tracing::debug;

const DEFAULT_DATACENTER: &str = "dc1";
const DEFAULT_RACK: &str = "rack1";

fn main() -> Result<()> {
    install_trace_subscriber(&TraceConfiguration::for_tools())?;
    let options = Options::parse();

    let replicas = expected_replicas(&options)?;
    let mut writer = stdout().lock();
    for replica in replicas {
        writeln!(writer, "{replica}")?;
    }

    Ok(())
}

/// Builds the ring from the `--node` arguments and places `--token` on it.
fn expected_replicas(options: &Options) -> Result<Vec<IpAddr>> {
    let mut members: BTreeMap<IpAddr, (String, Vec<Token>)> = BTreeMap::new();
    for node in &options.nodes {
        let (datacenter, tokens) = members
            .entry(node.address)
            .or_insert_with(|| (node.datacenter.clone(), Vec::new()));
        if *datacenter != node.datacenter {
            return Err(anyhow!(
                "{} is given in both {datacenter} and {}",
                node.address,
                node.datacenter
            ));
        }
        tokens.push(node.token);
    }
    let ring = TokenRing::new(members.into_iter().map(|(address, (datacenter, tokens))| {
        RingMember::new(address, &datacenter, DEFAULT_RACK, tokens)
    }))?;
    debug!(?ring, "built ring");

    let strategy = match (options.replication_factor, options.datacenters.as_slice()) {
        (Some(replication_factor), []) => ReplicationStrategy::simple(replication_factor),
        (None, factors) if !factors.is_empty() => ReplicationStrategy::network_topology(
            factors
                .iter()
                .map(|factor| (factor.datacenter.as_str(), factor.replication_factor)),
        ),
        _ => {
            return Err(anyhow!(
                "exactly one of --replication-factor or --dc must be given"
            ));
        }
    };
    Ok(ring.replicas(options.token, &strategy)?)
}

/// One `--node` argument: `<address>=<token>[@<datacenter>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeArg {
    address: IpAddr,
    token: Token,
    datacenter: String,
}

impl FromStr for NodeArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, rest) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected <address>=<token>[@<datacenter>]"))?;
        let (token, datacenter) = rest.split_once('@').unwrap_or((rest, DEFAULT_DATACENTER));
        Ok(Self {
            address: address
                .parse()
                .with_context(|| format!("invalid address {address:?}"))?,
            token: token
                .parse()
                .with_context(|| format!("invalid token {token:?}"))?,
            datacenter: datacenter.to_string(),
        })
    }
}

/// One `--dc` argument: `<datacenter>=<replication factor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DatacenterFactor {
    datacenter: String,
    replication_factor: usize,
}

impl FromStr for DatacenterFactor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (datacenter, factor) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected <datacenter>=<replication factor>"))?;
        Ok(Self {
            datacenter: datacenter.to_string(),
            replication_factor: factor
                .parse()
                .with_context(|| format!("invalid replication factor {factor:?}"))?,
        })
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ring_replicas",
    about = "Lists the nodes expected to hold replicas of a token",
    version,
    rename_all = "kebab-case"
)]
struct Options {
    /// A ring member, as <address>=<token>[@<datacenter>]. Repeat an address to give it more
    /// tokens.
    #[arg(long = "node", required = true)]
    nodes: Vec<NodeArg>,

    /// Token to place
    #[arg(long, allow_negative_numbers = true)]
    token: Token,

    /// Replication factor of a SimpleStrategy keyspace
    #[arg(long, conflicts_with = "datacenters")]
    replication_factor: Option<usize>,

    /// Per-datacenter replication factor of a NetworkTopologyStrategy keyspace, as
    /// <datacenter>=<factor>
    #[arg(long = "dc")]
    datacenters: Vec<DatacenterFactor>,
}
