//! Typed `nodetool` commands and parsers for their tabular output.

use crate::cluster::{NodeHandle, ToolOutput};
use dtest_core::{error::Error, topology::Token};
use std::{fmt::Debug, net::IpAddr, path::PathBuf, str::FromStr};
use tracing::debug;

/// A `nodetool` invocation whose stdout has a known shape.
pub trait NodetoolCommand {
    type Output: Debug;

    fn args(&self) -> Vec<String>;

    fn parse(&self, stdout: &str) -> Result<Self::Output, Error>;

    /// Whether anything on stderr means the command failed, even with a zero exit status.
    fn requires_clean_stderr(&self) -> bool {
        false
    }
}

/// Runs `command` on `node`, returning the parsed output along with the raw output it came from.
pub async fn run<N: NodeHandle, C: NodetoolCommand>(
    node: &N,
    command: &C,
) -> Result<(C::Output, ToolOutput), Error> {
    let args = command.args();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = node.nodetool(&args).await?;
    let output = if command.requires_clean_stderr() {
        output.check_clean()?
    } else {
        output.check()?
    };
    let parsed = command.parse(&output.stdout)?;
    debug!(node = node.name(), ?args, ?parsed, "nodetool");
    Ok((parsed, output))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Up,
    Down,
}

/// A node's position in the ring lifecycle, as gossip reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RingState {
    Normal,
    Leaving,
    Joining,
    Moving,
}

impl FromStr for ServerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "U" | "Up" => Ok(Self::Up),
            "D" | "Down" => Ok(Self::Down),
            _ => Err(Error::parse("server status", s)),
        }
    }
}

impl FromStr for RingState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "N" | "Normal" => Ok(Self::Normal),
            "L" | "Leaving" => Ok(Self::Leaving),
            "J" | "Joining" => Ok(Self::Joining),
            "M" | "Moving" => Ok(Self::Moving),
            _ => Err(Error::parse("ring state", s)),
        }
    }
}

/// One node row of `nodetool status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    pub datacenter: String,
    pub status: ServerStatus,
    pub state: RingState,
    pub address: IpAddr,
    pub rack: String,
}

impl StatusEntry {
    pub fn is_up_normal(&self) -> bool {
        self.status == ServerStatus::Up && self.state == RingState::Normal
    }
}

/// `nodetool status`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Status;

impl NodetoolCommand for Status {
    type Output = Vec<StatusEntry>;

    fn args(&self) -> Vec<String> {
        Vec::from(["status".to_string()])
    }

    /// Node rows start with a two-letter status/state code such as `UN`. The load column contains
    /// a space, so only the address (second column) and the rack (last column) are read by
    /// position.
    fn parse(&self, stdout: &str) -> Result<Self::Output, Error> {
        let mut datacenter = None;
        let mut entries = Vec::new();
        for line in stdout.lines() {
            if let Some(name) = line.strip_prefix("Datacenter:") {
                datacenter = Some(name.trim().to_string());
                continue;
            }
            let columns: Vec<&str> = line.split_whitespace().collect();
            let Some(code) = columns.first().filter(|code| is_status_code(code)) else {
                continue;
            };
            let (Some(address), Some(rack)) = (columns.get(1), columns.last()) else {
                return Err(Error::parse("nodetool status", line));
            };
            entries.push(StatusEntry {
                datacenter: datacenter
                    .clone()
                    .ok_or_else(|| Error::parse("nodetool status", "node row before datacenter"))?,
                status: code[..1].parse()?,
                state: code[1..].parse()?,
                address: parse_address(address)?,
                rack: rack.to_string(),
            });
        }
        Ok(entries)
    }
}

fn is_status_code(column: &str) -> bool {
    let mut chars = column.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some('U' | 'D'), Some('N' | 'L' | 'J' | 'M'), None)
    )
}

fn parse_address(column: &str) -> Result<IpAddr, Error> {
    // 4.x prints addresses with a leading slash in some tables.
    column
        .trim_start_matches('/')
        .parse()
        .map_err(|_| Error::parse("node address", column))
}

/// One token row of `nodetool ring`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingEntry {
    pub address: IpAddr,
    pub rack: String,
    pub status: ServerStatus,
    pub state: RingState,
    pub token: Token,
}

/// `nodetool ring`, optionally restricted to a keyspace.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    pub keyspace: Option<String>,
}

impl NodetoolCommand for Ring {
    type Output = Vec<RingEntry>;

    fn args(&self) -> Vec<String> {
        std::iter::once("ring".to_string())
            .chain(self.keyspace.clone())
            .collect()
    }

    /// Rows that start with an address are token rows; the token is the last column.
    fn parse(&self, stdout: &str) -> Result<Self::Output, Error> {
        stdout
            .lines()
            .filter_map(|line| {
                let columns: Vec<&str> = line.split_whitespace().collect();
                parse_address(columns.first()?).ok()?;
                Some((line, columns))
            })
            .map(|(line, columns)| {
                let invalid = || Error::parse("nodetool ring", line);
                if columns.len() < 5 {
                    return Err(invalid());
                }
                Ok(RingEntry {
                    address: parse_address(columns[0])?,
                    rack: columns[1].to_string(),
                    status: columns[2].parse()?,
                    state: columns[3].parse()?,
                    token: columns
                        .last()
                        .and_then(|token| token.parse().ok())
                        .ok_or_else(invalid)?,
                })
            })
            .collect()
    }
}

/// `nodetool getendpoints <keyspace> <table> <key>`: the replicas of a partition key. Anything on
/// stderr is a failure, since the tool warns there instead of exiting non-zero.
#[derive(Clone, Debug)]
pub struct GetEndpoints {
    pub keyspace: String,
    pub table: String,
    pub key: String,
}

impl NodetoolCommand for GetEndpoints {
    type Output = Vec<IpAddr>;

    fn args(&self) -> Vec<String> {
        Vec::from([
            "getendpoints".to_string(),
            self.keyspace.clone(),
            self.table.clone(),
            self.key.clone(),
        ])
    }

    fn parse(&self, stdout: &str) -> Result<Self::Output, Error> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse_address)
            .collect()
    }

    fn requires_clean_stderr(&self) -> bool {
        true
    }
}

/// `nodetool getsstables <keyspace> <table> <key>`: the sstable files holding a partition key.
#[derive(Clone, Debug)]
pub struct GetSsTables {
    pub keyspace: String,
    pub table: String,
    pub key: String,
}

impl NodetoolCommand for GetSsTables {
    type Output = Vec<PathBuf>;

    fn args(&self) -> Vec<String> {
        Vec::from([
            "getsstables".to_string(),
            self.keyspace.clone(),
            self.table.clone(),
            self.key.clone(),
        ])
    }

    fn parse(&self, stdout: &str) -> Result<Self::Output, Error> {
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}
