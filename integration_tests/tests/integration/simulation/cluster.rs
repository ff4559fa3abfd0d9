use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dtest_core::{
    cli::ServerGeneration,
    config::LogLevel,
    error::Error,
    time::{Clock, MockClock},
    topology::{ReplicationStrategy, Token},
};
use dtest_integration_tests::{
    cluster::{
        ClusterBackend, ClusterLayout, LogFile, NodeHandle, NodeSpec, StartOptions, StopOptions,
    },
    controller::DEFAULT_RACK,
    logs::CopyLogs,
    nodetool::RingState,
    replication::MURMUR3_TOKENS,
    snapshot::{CommitLogArchiving, COMMITLOG_ARCHIVING_FILE},
    snitch::{Placement, SnitchConfig, SnitchKind, ENDPOINT_SNITCH_OPTION},
};
use serde_yaml::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::simulation::{node::FakeNode, session::FakeSession};

/// Tokens per node when the layout asks for virtual nodes.
const VNODE_TOKENS: u64 = 4;

/// The JVM flag that lets a node start in a datacenter other than the one it recorded.
const IGNORE_DC: &str = "-Dcassandra.ignore_dc=true";

const DEFAULT_ARCHIVING: &str = "\
# Commit-log archiving. Commands are run once per segment.
archive_command=
restore_command=
restore_directories=
restore_point_in_time=
";

/// Ways the simulated cluster can be made to misbehave.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Fault {
    /// `nodetool move` keeps streaming until the moving node is stopped.
    StalledMoves,
    /// Once any live node's snitch file puts it in a rack other than the one it started in,
    /// `getendpoints` reports one replica fewer than placement yields.
    RackChangeLosesReplica,
    /// Nodes keep reporting the placement they started with, ignoring snitch file changes.
    StaleRacks,
    /// Coordinators send writes to every remote replica themselves instead of through one
    /// forwarder per datacenter.
    DirectRemoteWrites,
    /// Started nodes run but never open their native transport port.
    HungStartup,
}

/// A request the simulated server refused or could not carry out.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ServerError {
    #[error("{0}")]
    Rejected(String),
    #[error("java.io.IOException: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] Error),
}

pub(crate) type SharedWorld = Arc<Mutex<World>>;

pub(crate) fn lock(world: &SharedWorld) -> MutexGuard<'_, World> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The token a partition key hashes to. Keys of [`MURMUR3_TOKENS`] get their real tokens, so
/// placement matches what a real cluster would do for them.
pub(crate) fn token_of_key(key: &str) -> Token {
    if let Ok(key) = key.parse::<i32>() {
        if let Some((_, token)) = MURMUR3_TOKENS.iter().find(|(known, _)| *known == key) {
            return *token;
        }
    }
    // FNV-1a, then a finalizer to spread consecutive keys over the ring.
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    });
    mix(hash) as Token
}

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Evenly spaced tokens within each datacenter, offset per datacenter so no two collide.
fn balanced_token(datacenter: usize, position: usize, count: usize) -> Token {
    let step = (1_i128 << 64) / count as i128;
    (i128::from(Token::MIN) + position as i128 * step + 100 * datacenter as i128) as Token
}

fn vnode_tokens(number: u8) -> Vec<Token> {
    let mut tokens: Vec<Token> = (0..VNODE_TOKENS)
        .map(|vnode| mix((u64::from(number) << 8) | vnode) as Token)
        .collect();
    tokens.sort_unstable();
    tokens
}

/// Which of `disks` data directories holds a partition: the token range is split evenly.
fn disk_for(token: Token, disks: usize) -> usize {
    let offset = i128::from(token) - i128::from(Token::MIN);
    ((offset * disks as i128) >> 64) as usize
}

fn table_dir(data_dir: &Path, keyspace: &str, table: &str, id: u64) -> PathBuf {
    data_dir.join(keyspace).join(format!("{table}-{id:032x}"))
}

fn is_data_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().ends_with("-Data.db"))
}

fn read_keys(path: &Path) -> Result<BTreeSet<i64>, ServerError> {
    fs::read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim().parse().map_err(|_| {
                ServerError::Rejected(format!("corrupt sstable {}", path.display()))
            })
        })
        .collect()
}

fn append(path: &Path, text: &str) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(text.as_bytes())
}

/// One line of a commit-log segment: `keyspace table key micros`, tab separated.
fn parse_mutation(line: &str) -> Option<(&str, &str, i64, DateTime<Utc>)> {
    let mut fields = line.split('\t');
    let (keyspace, table, key, micros) =
        (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
    Some((
        keyspace,
        table,
        key.parse().ok()?,
        DateTime::from_timestamp_micros(micros.parse().ok()?)?,
    ))
}

#[derive(Debug)]
pub(crate) struct SsTable {
    pub(crate) path: PathBuf,
    pub(crate) keys: BTreeSet<i64>,
}

/// One table's data on one node.
#[derive(Debug, Default)]
pub(crate) struct TableData {
    /// Unflushed keys, with the time they were written.
    pub(crate) memtable: BTreeMap<i64, DateTime<Utc>>,
    pub(crate) sstables: Vec<SsTable>,
}

impl TableData {
    fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.memtable
            .keys()
            .copied()
            .chain(self.sstables.iter().flat_map(|sstable| sstable.keys.iter().copied()))
    }
}

#[derive(Debug)]
pub(crate) struct SimNode {
    pub(crate) name: String,
    pub(crate) address: IpAddr,
    pub(crate) datacenter: String,
    pub(crate) path: PathBuf,
    pub(crate) data_dirs: Vec<PathBuf>,
    pub(crate) tokens: Vec<Token>,
    /// Announce a bootstrap on first start.
    pub(crate) bootstrap: bool,
    pub(crate) running: bool,
    pub(crate) joined: bool,
    pub(crate) decommissioned: bool,
    pub(crate) ring_state: RingState,
    /// Datacenter recorded on first start. Later starts refuse to change it.
    pub(crate) saved_datacenter: Option<String>,
    pub(crate) placement_at_start: Option<Placement>,
    pub(crate) native_transport: Option<(TcpListener, SocketAddr)>,
    pub(crate) segment: Option<PathBuf>,
    pub(crate) tables: BTreeMap<u64, TableData>,
    pub(crate) log_levels: BTreeMap<String, LogLevel>,
}

impl SimNode {
    fn owns_tokens(&self) -> bool {
        self.joined && !self.decommissioned && !self.tokens.is_empty()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SimTable {
    pub(crate) id: u64,
    pub(crate) key_column: String,
    pub(crate) value_column: String,
}

#[derive(Debug)]
pub(crate) struct SimKeyspace {
    pub(crate) strategy: ReplicationStrategy,
    pub(crate) tables: BTreeMap<String, SimTable>,
}

/// Outcome of one look at a move in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MoveProgress {
    Streaming,
    Done,
    /// The moving node went down.
    Interrupted,
}

/// Everything the simulated cluster knows: schema, nodes, and each node's data.
#[derive(Debug)]
pub(crate) struct World {
    pub(crate) clock: MockClock,
    pub(crate) generation: ServerGeneration,
    pub(crate) cluster_dir: PathBuf,
    pub(crate) options: BTreeMap<String, Value>,
    pub(crate) data_dir_count: usize,
    pub(crate) nodes: Vec<SimNode>,
    pub(crate) keyspaces: BTreeMap<String, SimKeyspace>,
    pub(crate) faults: BTreeSet<Fault>,
    next_id: u64,
}

impl World {
    /// Ids for tables, segments and sstable generations. Unique for the world's lifetime, so
    /// archived segments of a removed cluster never collide with new ones.
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn log(
        &self,
        index: usize,
        level: LogLevel,
        thread: &str,
        source: &str,
        message: &str,
    ) {
        let node = &self.nodes[index];
        let line = format!(
            "{:<5} [{thread}] {} {source} - {message}\n",
            level.to_string(),
            self.clock.now().format("%Y-%m-%d %H:%M:%S,%3f"),
        );
        let files: &[LogFile] = if level == LogLevel::Debug {
            &[LogFile::Debug]
        } else {
            &[LogFile::System, LogFile::Debug]
        };
        for file in files {
            let path = node.path.join("logs").join(file.file_name());
            if let Err(error) = append(&path, &line) {
                warn!(node = %node.name, %error, "couldn't write simulated log");
            }
        }
    }

    /// Logs `message` on every running node other than `about`.
    fn gossip(&self, about: usize, level: LogLevel, source: &str, message: &str) {
        for (index, node) in self.nodes.iter().enumerate() {
            if index != about && node.running {
                self.log(index, level, "GossipStage:1", source, message);
            }
        }
    }

    fn snitch_kind(&self) -> Option<SnitchKind> {
        self.options
            .get(ENDPOINT_SNITCH_OPTION)
            .and_then(Value::as_str)
            .and_then(|name| SnitchKind::from_class_name(name).ok())
    }

    /// Where the node's snitch file places it right now.
    fn configured_placement(&self, index: usize) -> Placement {
        let node = &self.nodes[index];
        let fallback = || Placement::new(&node.datacenter, DEFAULT_RACK);
        let Some(kind) = self.snitch_kind() else {
            return fallback();
        };
        fs::read_to_string(node.path.join("conf").join(kind.file_name()))
            .ok()
            .and_then(|body| SnitchConfig::parse(kind, &body).ok())
            .and_then(|config| config.placement(node.address))
            .unwrap_or_else(fallback)
    }

    pub(crate) fn placement(&self, index: usize) -> Placement {
        match &self.nodes[index].placement_at_start {
            Some(placement) if self.faults.contains(&Fault::StaleRacks) => placement.clone(),
            _ => self.configured_placement(index),
        }
    }

    fn racks_changed(&self) -> bool {
        self.nodes.iter().enumerate().any(|(index, node)| {
            node.running
                && node
                    .placement_at_start
                    .as_ref()
                    .is_some_and(|at_start| at_start.rack != self.configured_placement(index).rack)
        })
    }

    /// Token positions of the nodes owning ranges, sorted by token.
    fn positions(&self) -> Vec<(Token, usize)> {
        let mut positions: Vec<_> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.owns_tokens())
            .flat_map(|(index, node)| node.tokens.iter().map(move |token| (*token, index)))
            .collect();
        positions.sort_unstable();
        positions
    }

    /// Nodes holding `token` under `strategy`: walk the ring from the first position at or after
    /// the token, skipping nodes already taken, and take each factor's worth of nodes.
    pub(crate) fn replicas(&self, token: Token, strategy: &ReplicationStrategy) -> Vec<usize> {
        let positions = self.positions();
        let start = positions.partition_point(|(position, _)| *position < token);
        let mut walk = Vec::new();
        for offset in 0..positions.len() {
            let (_, index) = positions[(start + offset) % positions.len()];
            if !walk.contains(&index) {
                walk.push(index);
            }
        }
        match strategy {
            ReplicationStrategy::Simple { replication_factor } => {
                walk.truncate(*replication_factor);
                walk
            }
            ReplicationStrategy::NetworkTopology { datacenter_factors } => datacenter_factors
                .iter()
                .flat_map(|(datacenter, factor)| {
                    walk.iter()
                        .copied()
                        .filter(|index| self.nodes[*index].datacenter == *datacenter)
                        .take(*factor)
                        .collect::<Vec<_>>()
                })
                .collect(),
        }
    }

    /// Midpoint of the widest gap between owned tokens.
    fn free_token(&self) -> Token {
        let tokens: Vec<i128> = self
            .positions()
            .into_iter()
            .map(|(token, _)| i128::from(token))
            .collect();
        let Some(first) = tokens.first() else {
            return 0;
        };
        let ring = 1_i128 << 64;
        let (mut widest, mut from) = (0, *first);
        for (position, token) in tokens.iter().enumerate() {
            let next = tokens.get(position + 1).copied().unwrap_or(first + ring);
            if next - token > widest {
                (widest, from) = (next - token, *token);
            }
        }
        let middle = from + widest / 2;
        (if middle > i128::from(Token::MAX) { middle - ring } else { middle }) as Token
    }

    pub(crate) fn table(&self, keyspace: &str, table: &str) -> Result<&SimTable, ServerError> {
        self.keyspaces
            .get(keyspace)
            .ok_or_else(|| ServerError::Rejected(format!("Keyspace {keyspace} does not exist")))?
            .tables
            .get(table)
            .ok_or_else(|| {
                ServerError::Rejected(format!("unconfigured table {table} in keyspace {keyspace}"))
            })
    }

    fn table_name(&self, id: u64) -> Option<(String, String)> {
        self.keyspaces.iter().find_map(|(keyspace, definition)| {
            definition
                .tables
                .iter()
                .find(|(_, table)| table.id == id)
                .map(|(table, _)| (keyspace.clone(), table.clone()))
        })
    }

    /// Forgets tables that no longer exist on every node. Their files stay on disk.
    pub(crate) fn drop_tables(&mut self, ids: &BTreeSet<u64>) {
        for node in &mut self.nodes {
            node.tables.retain(|id, _| !ids.contains(id));
        }
    }

    /// Distinct keys of a table across the cluster.
    pub(crate) fn count(&self, id: u64) -> u64 {
        self.nodes
            .iter()
            .filter_map(|node| node.tables.get(&id))
            .flat_map(TableData::keys)
            .collect::<BTreeSet<_>>()
            .len() as u64
    }

    fn archiving(&self, index: usize) -> Result<CommitLogArchiving, ServerError> {
        let path = self.nodes[index].path.join("conf").join(COMMITLOG_ARCHIVING_FILE);
        match fs::read_to_string(path) {
            Ok(body) => Ok(CommitLogArchiving::parse(&body)?),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(CommitLogArchiving::default()),
            Err(error) => Err(error.into()),
        }
    }

    fn active_segment(&mut self, index: usize) -> Result<PathBuf, ServerError> {
        if let Some(segment) = &self.nodes[index].segment {
            return Ok(segment.clone());
        }
        let id = self.next_id();
        let dir = self.nodes[index].path.join("commitlogs");
        fs::create_dir_all(&dir)?;
        let segment = dir.join(format!("CommitLog-7-{id}.log"));
        fs::File::create(&segment)?;
        self.nodes[index].segment = Some(segment.clone());
        Ok(segment)
    }

    /// Runs the node's `archive_command` on a finished segment. Only `cp`-style commands, whose
    /// last two words are the source and the target, are understood.
    fn archive_segment(&self, index: usize, segment: &Path) -> Result<(), ServerError> {
        let Some(command) = self.archiving(index)?.archive_command else {
            return Ok(());
        };
        let name = segment
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let command = command
            .replace("%path", &segment.display().to_string())
            .replace("%name", &name);
        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            [program, .., from, to] if program.ends_with("cp") => {
                fs::copy(from, to)?;
            }
            _ => {
                return Err(ServerError::Rejected(format!(
                    "cannot run archive_command {command}"
                )));
            }
        }
        debug!(node = %self.nodes[index].name, %command, "archived segment");
        Ok(())
    }

    /// Finishes the active segment, archiving it if anything was written to it.
    fn roll_segment(&mut self, index: usize) -> Result<(), ServerError> {
        let Some(segment) = self.nodes[index].segment.take() else {
            return Ok(());
        };
        if fs::metadata(&segment)?.len() > 0 {
            self.archive_segment(index, &segment)?;
        }
        fs::remove_file(&segment)?;
        if self.nodes[index].running {
            self.active_segment(index)?;
        }
        Ok(())
    }

    fn replay_archived_segments(&mut self, index: usize) -> Result<(), ServerError> {
        let settings = self.archiving(index)?;
        let (Some(_), Some(dir)) = (&settings.restore_command, &settings.restore_directories)
        else {
            return Ok(());
        };
        let mut segments = fs::read_dir(dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        segments.sort();

        let mut replayed = 0;
        for segment in &segments {
            for line in fs::read_to_string(segment)?.lines() {
                let Some((keyspace, table, key, at)) = parse_mutation(line) else {
                    continue;
                };
                if settings
                    .restore_point_in_time
                    .is_some_and(|cutoff| !cutoff.includes(&at))
                {
                    continue;
                }
                let Ok(SimTable { id, .. }) = self.table(keyspace, table).cloned() else {
                    continue;
                };
                self.nodes[index]
                    .tables
                    .entry(id)
                    .or_default()
                    .memtable
                    .insert(key, at);
                replayed += 1;
            }
        }
        self.log(
            index,
            LogLevel::Info,
            "main",
            "CommitLog.java:197",
            &format!(
                "Replayed {replayed} mutations from {} archived segments",
                segments.len()
            ),
        );
        Ok(())
    }

    pub(crate) fn apply_mutation(
        &mut self,
        index: usize,
        keyspace: &str,
        table: &str,
        id: u64,
        key: i64,
    ) -> Result<(), ServerError> {
        let at = self.clock.now();
        let segment = self.active_segment(index)?;
        append(
            &segment,
            &format!("{keyspace}\t{table}\t{key}\t{}\n", at.timestamp_micros()),
        )?;
        self.nodes[index]
            .tables
            .entry(id)
            .or_default()
            .memtable
            .insert(key, at);
        Ok(())
    }

    fn write_sstable(
        &mut self,
        index: usize,
        disk: usize,
        (keyspace, table, id): (&str, &str, u64),
        keys: BTreeSet<i64>,
    ) -> Result<(), ServerError> {
        let generation = self.next_id();
        let dir = table_dir(&self.nodes[index].data_dirs[disk], keyspace, table, id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("nb-{generation}-big-Data.db"));
        fs::write(&path, keys.iter().map(|key| format!("{key}\n")).collect::<String>())?;
        self.nodes[index]
            .tables
            .entry(id)
            .or_default()
            .sstables
            .push(SsTable { path, keys });
        Ok(())
    }

    /// Writes `keys` into new sstables on `index`, one per data directory they map to.
    fn write_keys(
        &mut self,
        index: usize,
        table: (&str, &str, u64),
        keys: impl IntoIterator<Item = i64>,
    ) -> Result<(), ServerError> {
        let disks = self.nodes[index].data_dirs.len();
        let mut by_disk: BTreeMap<usize, BTreeSet<i64>> = BTreeMap::new();
        for key in keys {
            by_disk
                .entry(disk_for(token_of_key(&key.to_string()), disks))
                .or_default()
                .insert(key);
        }
        for (disk, keys) in by_disk {
            self.write_sstable(index, disk, table, keys)?;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, index: usize) -> Result<(), ServerError> {
        let ids: Vec<u64> = self.nodes[index].tables.keys().copied().collect();
        for id in ids {
            let Some((keyspace, table)) = self.table_name(id) else {
                continue;
            };
            let memtable = std::mem::take(
                &mut self.nodes[index].tables.entry(id).or_default().memtable,
            );
            if !memtable.is_empty() {
                self.write_keys(index, (&keyspace, &table, id), memtable.into_keys())?;
            }
        }
        self.roll_segment(index)
    }

    /// Merges the sstables of each table within each data directory.
    pub(crate) fn compact(&mut self, index: usize) -> Result<(), ServerError> {
        let data_dirs = self.nodes[index].data_dirs.clone();
        let ids: Vec<u64> = self.nodes[index].tables.keys().copied().collect();
        for id in ids {
            let Some((keyspace, table)) = self.table_name(id) else {
                continue;
            };
            let sstables = std::mem::take(
                &mut self.nodes[index].tables.entry(id).or_default().sstables,
            );
            let mut by_disk: BTreeMap<usize, Vec<SsTable>> = BTreeMap::new();
            for sstable in sstables {
                let disk = data_dirs
                    .iter()
                    .position(|dir| sstable.path.starts_with(dir))
                    .unwrap_or_default();
                by_disk.entry(disk).or_default().push(sstable);
            }
            for (disk, group) in by_disk {
                if group.len() < 2 {
                    self.nodes[index]
                        .tables
                        .entry(id)
                        .or_default()
                        .sstables
                        .extend(group);
                    continue;
                }
                let keys = group.iter().flat_map(|sstable| sstable.keys.iter().copied()).collect();
                for sstable in &group {
                    fs::remove_file(&sstable.path)?;
                }
                self.write_sstable(index, disk, (&keyspace, &table, id), keys)?;
            }
        }
        Ok(())
    }

    pub(crate) fn snapshot(
        &mut self,
        index: usize,
        keyspace: &str,
        table: &str,
        tag: &str,
    ) -> Result<String, ServerError> {
        let id = self.table(keyspace, table)?.id;
        self.flush(index)?;
        let node = &self.nodes[index];
        fs::create_dir_all(
            table_dir(&node.data_dirs[0], keyspace, table, id)
                .join("snapshots")
                .join(tag),
        )?;
        for sstable in node.tables.get(&id).into_iter().flat_map(|data| &data.sstables) {
            let (Some(dir), Some(name)) = (sstable.path.parent(), sstable.path.file_name()) else {
                continue;
            };
            let target = dir.join("snapshots").join(tag);
            fs::create_dir_all(&target)?;
            fs::copy(&sstable.path, target.join(name))?;
        }
        Ok(format!(
            "Requested creating snapshot(s) for [{keyspace}] with snapshot name [{tag}]\n\
             Snapshot directory: {tag}\n"
        ))
    }

    pub(crate) fn clear_snapshot(&self, index: usize, tag: &str) -> Result<(), ServerError> {
        for data_dir in &self.nodes[index].data_dirs {
            let Ok(keyspaces) = fs::read_dir(data_dir) else {
                continue;
            };
            for keyspace in keyspaces {
                let Ok(tables) = fs::read_dir(keyspace?.path()) else {
                    continue;
                };
                for table in tables {
                    let snapshot = table?.path().join("snapshots").join(tag);
                    if snapshot.is_dir() {
                        fs::remove_dir_all(snapshot)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads sstable files that appeared in the table's directories behind the node's back.
    pub(crate) fn refresh(
        &mut self,
        index: usize,
        keyspace: &str,
        table: &str,
    ) -> Result<(), ServerError> {
        let id = self.table(keyspace, table)?.id;
        let node = &mut self.nodes[index];
        let data = node.tables.entry(id).or_default();
        let known: BTreeSet<PathBuf> =
            data.sstables.iter().map(|sstable| sstable.path.clone()).collect();
        let mut loaded = Vec::new();
        for data_dir in &node.data_dirs {
            let Ok(entries) = fs::read_dir(table_dir(data_dir, keyspace, table, id)) else {
                continue;
            };
            for entry in entries {
                let path = entry?.path();
                if is_data_file(&path) && !known.contains(&path) {
                    loaded.push(SsTable {
                        keys: read_keys(&path)?,
                        path,
                    });
                }
            }
        }
        let message = format!(
            "Loading new SSTables for {keyspace}/{table}: {} found",
            loaded.len()
        );
        data.sstables.extend(loaded);
        self.log(
            index,
            LogLevel::Info,
            "RMI TCP Connection(4)-127.0.0.1",
            "ColumnFamilyStore.java:878",
            &message,
        );
        Ok(())
    }

    /// Streams the keys of every sstable in `dir` to their replicas.
    pub(crate) fn bulk_load(&mut self, dir: &Path) -> Result<String, ServerError> {
        let name = |path: Option<&Path>| {
            path.and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| ServerError::Rejected(format!("cannot load {}", dir.display())))
        };
        let table = name(Some(dir))?;
        let keyspace = name(dir.parent())?;
        let id = self.table(&keyspace, &table)?.id;
        let strategy = self.keyspaces[&keyspace].strategy.clone();

        let mut files = 0;
        let mut per_node: BTreeMap<usize, BTreeSet<i64>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !is_data_file(&path) {
                continue;
            }
            files += 1;
            for key in read_keys(&path)? {
                for replica in self.replicas(token_of_key(&key.to_string()), &strategy) {
                    per_node.entry(replica).or_default().insert(key);
                }
            }
        }
        for (replica, keys) in per_node {
            if !self.nodes[replica].running {
                return Err(ServerError::Rejected(format!(
                    "Failed to connect to /{} while streaming",
                    self.nodes[replica].address
                )));
            }
            self.write_keys(replica, (&keyspace, &table, id), keys)?;
        }
        Ok(format!(
            "Summary statistics:\n   Connections per host    : 1\n   Total files transferred : {files}\n"
        ))
    }

    pub(crate) fn sstables_for(
        &self,
        index: usize,
        keyspace: &str,
        table: &str,
        key: &str,
    ) -> Result<String, ServerError> {
        let id = self.table(keyspace, table)?.id;
        let key: i64 = key
            .parse()
            .map_err(|_| ServerError::Rejected(format!("Invalid key {key}")))?;
        Ok(self.nodes[index]
            .tables
            .get(&id)
            .into_iter()
            .flat_map(|data| &data.sstables)
            .filter(|sstable| sstable.keys.contains(&key))
            .map(|sstable| format!("{}\n", sstable.path.display()))
            .collect())
    }

    pub(crate) fn endpoints(
        &self,
        keyspace: &str,
        table: &str,
        key: &str,
    ) -> Result<String, ServerError> {
        self.table(keyspace, table)?;
        let strategy = &self.keyspaces[keyspace].strategy;
        let mut replicas = self.replicas(token_of_key(key), strategy);
        if self.faults.contains(&Fault::RackChangeLosesReplica) && self.racks_changed() {
            replicas.pop();
        }
        Ok(replicas
            .into_iter()
            .map(|index| format!("{}\n", self.nodes[index].address))
            .collect())
    }

    pub(crate) fn status(&self) -> String {
        let mut by_datacenter: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.joined || node.decommissioned {
                continue;
            }
            let placement = self.placement(index);
            let row = format!(
                "{}{}  {:<10} {:<10} {:<12} {:<17} {:08x}-0000-4000-8000-{:012x}  {}",
                if node.running { 'U' } else { 'D' },
                state_code(node.ring_state),
                node.address.to_string(),
                "47.66 KiB",
                node.tokens.len(),
                "?",
                index + 1,
                index + 1,
                placement.rack,
            );
            by_datacenter.entry(placement.datacenter).or_default().push(row);
        }

        let mut out = String::new();
        for (datacenter, rows) in by_datacenter {
            let header = format!("Datacenter: {datacenter}");
            out.push_str(&format!(
                "{header}\n{}\nStatus=Up/Down\n|/ State=Normal/Leaving/Joining/Moving\n\
                 --  Address    Load       Tokens       Owns (effective)  Host ID                               Rack\n",
                "=".repeat(header.len())
            ));
            for row in rows {
                out.push_str(&row);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }

    pub(crate) fn ring(&self) -> String {
        let mut by_datacenter: BTreeMap<String, Vec<(Token, String)>> = BTreeMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.owns_tokens() {
                continue;
            }
            let placement = self.placement(index);
            let rows = by_datacenter.entry(placement.datacenter).or_default();
            for token in &node.tokens {
                rows.push((
                    *token,
                    format!(
                        "{:<11}{:<12}{:<7}{:<8}{:<16}{:<20}{token}",
                        node.address.to_string(),
                        placement.rack,
                        if node.running { "Up" } else { "Down" },
                        format!("{:?}", node.ring_state),
                        "47.66 KiB",
                        "33.33%",
                    ),
                ));
            }
        }

        let mut out = String::new();
        for (datacenter, mut rows) in by_datacenter {
            rows.sort();
            let last = rows.last().map(|(token, _)| *token).unwrap_or_default();
            out.push_str(&format!(
                "\nDatacenter: {datacenter}\n==========\n\
                 Address    Rack        Status State   Load            Owns                Token\n\
                 {last:>94}\n"
            ));
            for (_, row) in rows {
                out.push_str(&row);
                out.push('\n');
            }
        }
        out
    }

    pub(crate) fn logging_levels(&self, index: usize) -> String {
        let mut out = format!("\n{:<50}{:>10}\n", "Logger Name", "Log Level");
        let mut levels = self.nodes[index].log_levels.clone();
        levels.entry("ROOT".to_string()).or_insert(LogLevel::Info);
        for (logger, level) in levels {
            out.push_str(&format!("{logger:<50}{:>10}\n", level.to_string()));
        }
        out
    }

    pub(crate) fn start(
        &mut self,
        index: usize,
        options: &StartOptions,
    ) -> Result<(), ServerError> {
        if self.nodes[index].running {
            return Err(ServerError::Rejected(format!(
                "{} is already running",
                self.nodes[index].name
            )));
        }
        let placement = self.configured_placement(index);
        let jvm_args = options.effective_jvm_args();
        if let Some(saved) = &self.nodes[index].saved_datacenter {
            if *saved != placement.datacenter && !jvm_args.iter().any(|arg| arg == IGNORE_DC) {
                let message = format!(
                    "Fatal configuration error: Cannot start node if snitch's data center ({}) \
                     differs from previous data center ({saved}). Please fix the snitch \
                     configuration, decommission and rebootstrap this node or use the flag \
                     {IGNORE_DC}.",
                    placement.datacenter
                );
                self.log(index, LogLevel::Error, "main", "CassandraDaemon.java:759", &message);
                return Ok(());
            }
        }
        self.log(
            index,
            LogLevel::Info,
            "main",
            "CassandraDaemon.java:507",
            &format!("JVM Arguments: {jvm_args:?}"),
        );

        self.replay_archived_segments(index)?;
        self.active_segment(index)?;
        if self.nodes[index].tokens.is_empty() && options.join_ring {
            let token = self.free_token();
            self.nodes[index].tokens = Vec::from([token]);
        }
        if self.nodes[index].bootstrap {
            self.log(
                index,
                LogLevel::Info,
                "main",
                "StorageService.java:1562",
                "JOINING: Starting to bootstrap...",
            );
        }
        if !options.join_ring {
            self.log(
                index,
                LogLevel::Info,
                "main",
                "StorageService.java:723",
                "Not joining ring as requested. Use JMX (StorageService->joinRing()) to initiate \
                 ring joining",
            );
        }

        let hung = self.faults.contains(&Fault::HungStartup);
        let node = &mut self.nodes[index];
        node.running = true;
        node.joined = options.join_ring;
        node.bootstrap = false;
        node.ring_state = RingState::Normal;
        node.saved_datacenter = Some(placement.datacenter.clone());
        node.placement_at_start = Some(placement);
        if hung {
            warn!(node = %node.name, "simulated node hung during startup");
            return Ok(());
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let native_address = listener.local_addr()?;
        let node = &mut self.nodes[index];
        node.native_transport = Some((listener, native_address));
        let address = node.address;
        info!(node = %node.name, %native_address, "simulated node started");

        self.log(
            index,
            LogLevel::Info,
            "main",
            "Server.java:159",
            &format!("Starting listening for CQL clients on /{address}:9042 (unencrypted)..."),
        );
        self.gossip(
            index,
            LogLevel::Info,
            "Gossiper.java:1011",
            &format!("InetAddress /{address} is now UP"),
        );
        Ok(())
    }

    pub(crate) fn stop(&mut self, index: usize, options: &StopOptions) {
        let node = &mut self.nodes[index];
        if !node.running {
            return;
        }
        node.running = false;
        node.native_transport = None;
        let address = node.address;
        if options.gently {
            self.log(
                index,
                LogLevel::Info,
                "StorageServiceShutdownHook",
                "Gossiper.java:1559",
                "Announcing shutdown",
            );
        }
        self.gossip(
            index,
            LogLevel::Info,
            "Gossiper.java:1026",
            &format!("InetAddress /{address} is now DOWN"),
        );
    }

    /// Leaves the ring. Every other node recomputes pending ranges once per distinct replication
    /// setting, naming all keyspaces that share it.
    pub(crate) fn decommission(&mut self, index: usize) -> Result<(), ServerError> {
        if !self.nodes[index].owns_tokens() {
            return Err(ServerError::Rejected("Node is not a member of the token ring".into()));
        }
        let thread = "RMI TCP Connection(2)-127.0.0.1";
        self.nodes[index].ring_state = RingState::Leaving;
        let address = self.nodes[index].address;
        self.log(index, LogLevel::Info, thread, "StorageService.java:1521", "DECOMMISSIONING");
        self.gossip(
            index,
            LogLevel::Debug,
            "StorageService.java:2297",
            &format!("Node /{address} state leaving"),
        );

        let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (name, keyspace) in &self.keyspaces {
            groups
                .entry(keyspace.strategy.to_string())
                .or_default()
                .push(name);
        }
        for keyspaces in groups.values() {
            self.gossip(
                index,
                LogLevel::Debug,
                "PendingRangeCalculatorService.java:66",
                &format!(
                    "Starting pending range calculation for [{}]",
                    keyspaces.join(", ")
                ),
            );
        }

        let node = &mut self.nodes[index];
        node.tokens.clear();
        node.joined = false;
        node.decommissioned = true;
        node.ring_state = RingState::Normal;
        self.log(index, LogLevel::Info, thread, "StorageService.java:3925", "DECOMMISSIONED");
        Ok(())
    }

    pub(crate) fn announce_move(&mut self, index: usize, token: Token) -> Result<(), ServerError> {
        let node = &mut self.nodes[index];
        if !node.running || !node.owns_tokens() {
            return Err(ServerError::Rejected(format!(
                "Node /{} cannot move while it is not in the ring",
                node.address
            )));
        }
        let old = node.tokens.first().copied().unwrap_or_default();
        node.ring_state = RingState::Moving;
        let address = node.address;

        let thread = "RMI TCP Connection(2)-127.0.0.1";
        self.log(
            index,
            LogLevel::Info,
            thread,
            "StorageService.java:4178",
            &format!("Moving /{address} from {old} to {token}."),
        );
        self.log(
            index,
            LogLevel::Info,
            thread,
            "StorageService.java:4231",
            "Sleeping 30000 ms before start streaming/fetching ranges",
        );
        self.gossip(
            index,
            LogLevel::Debug,
            "StorageService.java:2417",
            &format!("Node /{address} state moving, new token {token}"),
        );
        Ok(())
    }

    pub(crate) fn move_progress(&mut self, index: usize, token: Token) -> MoveProgress {
        if !self.nodes[index].running {
            return MoveProgress::Interrupted;
        }
        if self.faults.contains(&Fault::StalledMoves) {
            return MoveProgress::Streaming;
        }
        let node = &mut self.nodes[index];
        node.tokens = Vec::from([token]);
        node.ring_state = RingState::Normal;
        self.log(
            index,
            LogLevel::Info,
            "RMI TCP Connection(2)-127.0.0.1",
            "StorageService.java:4290",
            &format!("Move to new token {token} complete"),
        );
        MoveProgress::Done
    }

    fn write_configuration(&self, path: &Path) -> Result<(), Error> {
        let body = serde_yaml::to_string(&self.options)
            .map_err(|err| Error::Configuration(format!("cannot render cassandra.yaml: {err}")))?;
        fs::write(path.join("conf").join("cassandra.yaml"), body)?;
        Ok(())
    }

    /// Stops every node and deletes the cluster's files. Options, faults and the clock survive.
    fn clear(&mut self) -> Result<(), Error> {
        for node in &mut self.nodes {
            node.running = false;
            node.native_transport = None;
        }
        self.nodes.clear();
        self.keyspaces.clear();
        match fs::remove_dir_all(&self.cluster_dir) {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }
}

fn state_code(state: RingState) -> char {
    match state {
        RingState::Normal => 'N',
        RingState::Leaving => 'L',
        RingState::Joining => 'J',
        RingState::Moving => 'M',
    }
}

/// A simulated cluster. See the [module documentation](super) for what is simulated.
#[derive(Debug)]
pub(crate) struct FakeCluster {
    world: SharedWorld,
    root: TempDir,
}

impl FakeCluster {
    pub(crate) fn new(clock: MockClock) -> Self {
        let root = tempfile::tempdir().expect("couldn't create cluster root");
        let world = World {
            clock,
            generation: ServerGeneration::default(),
            cluster_dir: root.path().join("test-1"),
            options: BTreeMap::new(),
            data_dir_count: 1,
            nodes: Vec::new(),
            keyspaces: BTreeMap::new(),
            faults: BTreeSet::new(),
            next_id: 1,
        };
        Self {
            world: Arc::new(Mutex::new(world)),
            root,
        }
    }

    /// Phrase trace events the way servers of `generation` do.
    pub(crate) fn with_generation(self, generation: ServerGeneration) -> Self {
        lock(&self.world).generation = generation;
        self
    }

    pub(crate) fn inject(&self, fault: Fault) {
        info!(?fault, "injecting fault");
        lock(&self.world).faults.insert(fault);
    }

    pub(crate) fn heal(&self, fault: Fault) {
        lock(&self.world).faults.remove(&fault);
    }

    fn create_node(
        &self,
        spec: &NodeSpec,
        tokens: Vec<Token>,
        bootstrap: bool,
    ) -> Result<FakeNode, Error> {
        let mut world = lock(&self.world);
        if world
            .nodes
            .iter()
            .any(|node| node.name == spec.name || node.address == spec.address)
        {
            return Err(Error::Configuration(format!(
                "{} ({}) is already part of the cluster",
                spec.name, spec.address
            )));
        }
        let path = world.cluster_dir.join(&spec.name);
        let data_dirs: Vec<PathBuf> = if world.data_dir_count <= 1 {
            Vec::from([path.join("data")])
        } else {
            (0..world.data_dir_count)
                .map(|disk| path.join(format!("data{disk}")))
                .collect()
        };
        for dir in ["conf", "logs", "commitlogs"]
            .iter()
            .map(|name| path.join(name))
            .chain(data_dirs.iter().cloned())
        {
            fs::create_dir_all(dir)?;
        }
        fs::write(path.join("conf").join(COMMITLOG_ARCHIVING_FILE), DEFAULT_ARCHIVING)?;
        world.write_configuration(&path)?;

        world.nodes.push(SimNode {
            name: spec.name.clone(),
            address: spec.address,
            datacenter: spec.datacenter.clone(),
            path: path.clone(),
            data_dirs: data_dirs.clone(),
            tokens,
            bootstrap,
            running: false,
            joined: false,
            decommissioned: false,
            ring_state: RingState::Normal,
            saved_datacenter: None,
            placement_at_start: None,
            native_transport: None,
            segment: None,
            tables: BTreeMap::new(),
            log_levels: BTreeMap::new(),
        });
        debug!(node = %spec.name, path = %path.display(), "created simulated node");
        Ok(FakeNode::new(
            Arc::clone(&self.world),
            world.nodes.len() - 1,
            spec,
            path,
            data_dirs,
        ))
    }
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    type Node = FakeNode;
    type Session = FakeSession;

    async fn populate(&mut self, layout: &ClusterLayout) -> Result<Vec<FakeNode>, Error> {
        if !lock(&self.world).nodes.is_empty() {
            return Err(Error::Configuration("cluster is already populated".into()));
        }
        let mut nodes = Vec::new();
        let mut number = 0;
        for (datacenter, count) in layout.datacenters.iter().enumerate() {
            for position in 0..*count {
                number += 1;
                let token = (!layout.vnodes).then(|| balanced_token(datacenter, position, *count));
                let spec = NodeSpec::numbered(number, &format!("dc{}", datacenter + 1), token);
                let tokens = if layout.vnodes {
                    vnode_tokens(number)
                } else {
                    token.into_iter().collect()
                };
                nodes.push(self.create_node(&spec, tokens, false)?);
            }
        }
        Ok(nodes)
    }

    async fn set_configuration_options(
        &mut self,
        options: &BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        let mut world = lock(&self.world);
        world.options.extend(options.clone());
        for node in &world.nodes {
            world.write_configuration(&node.path)?;
        }
        Ok(())
    }

    async fn set_data_dirs(&mut self, count: usize) -> Result<(), Error> {
        lock(&self.world).data_dir_count = count;
        Ok(())
    }

    async fn add_node(&mut self, spec: &NodeSpec) -> Result<FakeNode, Error> {
        self.create_node(spec, spec.initial_token.into_iter().collect(), spec.auto_bootstrap)
    }

    async fn connect(&self, node: &FakeNode) -> Result<FakeSession, Error> {
        let world = lock(&self.world);
        if !world.nodes[node.index()].running {
            return Err(Error::ExternalTool {
                command: format!("connect {}", node.address()),
                status: None,
                stdout: String::new(),
                stderr: format!(
                    "NoHostAvailable: ('Unable to connect to any servers', \
                     {{'{}:9042': ConnectionRefusedError(111, 'Connection refused')}})",
                    node.address()
                ),
            });
        }
        Ok(FakeSession::new(Arc::clone(&self.world), node.index()))
    }

    async fn remove(&mut self) -> Result<(), Error> {
        lock(&self.world).clear()
    }

    async fn reset(&mut self) -> Result<(), Error> {
        let mut world = lock(&self.world);
        world.clear()?;
        let id = world.next_id();
        world.cluster_dir = self.root.path().join(format!("test-{id}"));
        Ok(())
    }
}

impl CopyLogs for FakeCluster {
    fn logs<P: AsRef<Path>>(&self, destination: &P) -> Result<(), Error> {
        let world = lock(&self.world);
        let cluster_name = world
            .cluster_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        for node in &world.nodes {
            let target = destination.as_ref().join(&cluster_name).join(&node.name);
            fs::create_dir_all(&target)?;
            for log in fs::read_dir(node.path.join("logs"))? {
                let log = log?.path();
                if let Some(file_name) = log.file_name() {
                    fs::copy(&log, target.join(file_name))?;
                }
            }
        }
        Ok(())
    }
}
