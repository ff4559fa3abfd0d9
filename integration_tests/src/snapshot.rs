//! Snapshot, commit-log archive and point-in-time restore.
//!
//! A restore combines a snapshot's sstables with commit-log segments archived after the snapshot
//! was taken. Which archived writes come back depends on the [`RestorePolicy`], and
//! [`WriteCheckpoints::expected_rows`] computes the row count each policy should yield from what
//! was written and when.

use crate::{
    assertions::assert_row_count,
    cluster::{ClusterBackend, NodeHandle, StartOptions, StopOptions},
    controller::ClusterController,
    driver::{Consistency, Session},
};
use chrono::{DateTime, Utc};
use dtest_core::{
    error::Error,
    time::{Clock, RealClock, RestorePointInTime},
    topology::{KeyspaceDefinition, ReplicationStrategy},
};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    ops::Range,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};

/// File in a node's `conf` directory holding the commit-log archiving settings.
pub const COMMITLOG_ARCHIVING_FILE: &str = "commitlog_archiving.properties";

/// A copy of one table's snapshot, taken off the node. The copy is deleted on drop.
#[derive(Debug)]
pub struct SnapshotArtifact {
    dir: TempDir,
    pub keyspace: String,
    pub table: String,
    pub tag: String,
}

impl SnapshotArtifact {
    /// `<copy>/<keyspace>/<table>`, the directory holding the sstables.
    pub fn table_dir(&self) -> PathBuf {
        self.dir.path().join(&self.keyspace).join(&self.table)
    }

    pub async fn files(&self) -> Result<BTreeSet<String>, Error> {
        file_names(&self.table_dir()).await
    }
}

/// Names of the regular files directly in `dir`. A missing directory has none.
async fn file_names(dir: &Path) -> Result<BTreeSet<String>, Error> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(error) => return Err(error.into()),
    };
    let mut names = BTreeSet::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

async fn copy_files(from: &Path, to: &Path) -> Result<usize, Error> {
    let names = file_names(from).await?;
    for name in &names {
        fs::copy(from.join(name), to.join(name)).await?;
    }
    Ok(names.len())
}

/// Every snapshot directory for `tag` of `keyspace.table` across the node's data directories.
/// Older servers keep a table's files in `<ks>/<table>`, newer ones in `<ks>/<table>-<id>`.
async fn snapshot_dirs(
    data_dirs: &[PathBuf],
    keyspace: &str,
    table: &str,
    tag: &str,
) -> Result<Vec<PathBuf>, Error> {
    let table_prefix = format!("{table}-");
    let mut found = Vec::new();
    for data_dir in data_dirs {
        let mut entries = match fs::read_dir(data_dir.join(keyspace)).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == table || name.starts_with(&table_prefix) {
                let dir = entry.path().join("snapshots").join(tag);
                if fs::metadata(&dir).await.is_ok_and(|metadata| metadata.is_dir()) {
                    found.push(dir);
                }
            }
        }
    }
    Ok(found)
}

/// Flushes the node, snapshots one table under `tag`, and copies the snapshot off the node.
pub async fn take_snapshot<N: NodeHandle>(
    node: &N,
    keyspace: &str,
    table: &str,
    tag: &str,
) -> Result<SnapshotArtifact, Error> {
    info!(node = node.name(), keyspace, table, tag, "taking snapshot");
    node.flush().await?;
    node.nodetool(&["snapshot", keyspace, "-cf", table, "-t", tag])
        .await?
        .check()?;

    let data_dirs = node.data_dirs();
    let sources = snapshot_dirs(&data_dirs, keyspace, table, tag).await?;
    if sources.is_empty() {
        return Err(Error::mismatch(
            format!("snapshot {tag} of {keyspace}.{table} on {}", node.name()),
            "a snapshot directory",
            &data_dirs,
        ));
    }

    let artifact = SnapshotArtifact {
        dir: tempfile::tempdir()?,
        keyspace: keyspace.to_owned(),
        table: table.to_owned(),
        tag: tag.to_owned(),
    };
    let target = artifact.table_dir();
    fs::create_dir_all(&target).await?;
    for source in &sources {
        let copied = copy_files(source, &target).await?;
        debug!(source = %source.display(), copied, "copied snapshot files");
    }
    Ok(artifact)
}

/// Removes the server-side snapshot `tag`.
pub async fn clear_snapshot<N: NodeHandle>(node: &N, tag: &str) -> Result<(), Error> {
    debug!(node = node.name(), tag, "clearing snapshot");
    node.nodetool(&["clearsnapshot", "-t", tag])
        .await?
        .check()
        .map(drop)
}

/// Streams a snapshot copy back into the cluster through `node`.
pub async fn restore_snapshot<N: NodeHandle>(
    artifact: &SnapshotArtifact,
    node: &N,
) -> Result<(), Error> {
    info!(node = node.name(), keyspace = %artifact.keyspace, table = %artifact.table, "restoring snapshot");
    node.bulk_load(&artifact.table_dir()).await?.check().map(drop)
}

/// A directory commit-log segments are archived into. Deleted on drop.
#[derive(Debug)]
pub struct CommitLogArchive {
    dir: TempDir,
}

impl CommitLogArchive {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The `archive_command` copying each finished segment into this archive.
    pub fn archive_command(&self) -> String {
        format!("/bin/cp %path {}/%name", self.path().display())
    }

    /// Deletes every archived segment.
    pub async fn clear(&self) -> Result<(), Error> {
        for name in self.segments().await? {
            fs::remove_file(self.path().join(name)).await?;
        }
        Ok(())
    }

    pub async fn segments(&self) -> Result<BTreeSet<String>, Error> {
        file_names(self.path()).await
    }

    /// Copies the segments still active in `commitlog_dir` into the archive.
    pub async fn copy_active_segments(&self, commitlog_dir: &Path) -> Result<usize, Error> {
        copy_files(commitlog_dir, self.path()).await
    }

    /// Archived segments that are no longer in `commitlog_dir`.
    pub async fn segments_not_in(&self, commitlog_dir: &Path) -> Result<BTreeSet<String>, Error> {
        let active = file_names(commitlog_dir).await?;
        Ok(self
            .segments()
            .await?
            .into_iter()
            .filter(|segment| !active.contains(segment))
            .collect())
    }
}

/// Rewrites every line of `path` matching one of the patterns with that pattern's replacement.
/// A replacement whose pattern matched no line is appended.
pub async fn replace_in_file(path: &Path, replacements: &[(Regex, String)]) -> Result<(), Error> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(error) if error.kind() == ErrorKind::NotFound => String::new(),
        Err(error) => return Err(error.into()),
    };
    let mut used = vec![false; replacements.len()];
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            match replacements
                .iter()
                .position(|(pattern, _)| pattern.is_match(line))
            {
                Some(index) => {
                    used[index] = true;
                    replacements[index].1.clone()
                }
                None => line.to_string(),
            }
        })
        .collect();
    lines.extend(
        replacements
            .iter()
            .zip(&used)
            .filter(|(_, used)| !**used)
            .map(|((_, replacement), _)| replacement.clone()),
    );
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body).await?;
    Ok(())
}

/// The settings of `commitlog_archiving.properties`. An unset command disables that step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitLogArchiving {
    pub archive_command: Option<String>,
    pub restore_command: Option<String>,
    pub restore_directories: Option<PathBuf>,
    pub restore_point_in_time: Option<RestorePointInTime>,
}

impl CommitLogArchiving {
    const KEYS: [&'static str; 4] = [
        "archive_command",
        "restore_command",
        "restore_directories",
        "restore_point_in_time",
    ];

    /// Archive finished segments into `archive`.
    pub fn archiving_to(archive: &CommitLogArchive) -> Self {
        Self {
            archive_command: Some(archive.archive_command()),
            ..Default::default()
        }
    }

    /// Replay segments from `archive` on the next start, up to `point_in_time` if given.
    pub fn restoring_from(
        archive: &CommitLogArchive,
        point_in_time: Option<RestorePointInTime>,
    ) -> Self {
        Self {
            archive_command: None,
            restore_command: Some("cp -f %from %to".to_string()),
            restore_directories: Some(archive.path().to_path_buf()),
            restore_point_in_time: point_in_time,
        }
    }

    pub fn parse(body: &str) -> Result<Self, Error> {
        let mut values: BTreeMap<&str, &str> = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(_, value)| !value.is_empty())
            .collect();
        Ok(Self {
            archive_command: values.remove("archive_command").map(str::to_string),
            restore_command: values.remove("restore_command").map(str::to_string),
            restore_directories: values.remove("restore_directories").map(PathBuf::from),
            restore_point_in_time: values
                .remove("restore_point_in_time")
                .map(str::parse::<RestorePointInTime>)
                .transpose()?,
        })
    }

    pub async fn read(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path).await?)
    }

    /// Writes every setting into `path`, keeping the file's other lines.
    pub async fn write(&self, path: &Path) -> Result<(), Error> {
        let values = [
            self.archive_command.clone(),
            self.restore_command.clone(),
            self.restore_directories
                .as_ref()
                .map(|dir| dir.display().to_string()),
            self.restore_point_in_time.map(|cutoff| cutoff.to_string()),
        ];
        let replacements = Self::KEYS
            .iter()
            .zip(values)
            .map(|(key, value)| {
                let pattern = Regex::new(&format!("^{key}=.*$"))
                    .map_err(|err| Error::Configuration(err.to_string()))?;
                Ok((pattern, format!("{key}={}", value.unwrap_or_default())))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        debug!(path = %path.display(), settings = ?self, "writing commit-log archiving settings");
        replace_in_file(path, &replacements).await
    }
}

/// Which archived writes a restore replays on top of the snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestorePolicy {
    NoReplay,
    FullReplay,
    /// Replay only mutations from strictly before the cutoff.
    PointInTime(RestorePointInTime),
}

/// How an [`ArchiveRestoreScenario`] restores. The point-in-time cutoff is only known once the
/// writes have happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplayMode {
    #[default]
    None,
    Full,
    PointInTime,
}

/// Rows written after a snapshot, and when the last of them was acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    pub rows: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteCheckpoints {
    /// Rows contained in the snapshot.
    pub snapshot_rows: u64,
    /// Batches written after the snapshot, in order.
    pub batches: Vec<WriteBatch>,
}

impl WriteCheckpoints {
    /// The row count a restore under `policy` should produce. Keys are distinct across batches.
    pub fn expected_rows(&self, policy: &RestorePolicy) -> u64 {
        match policy {
            RestorePolicy::NoReplay => self.snapshot_rows,
            RestorePolicy::FullReplay => {
                self.snapshot_rows + self.batches.iter().map(|batch| batch.rows).sum::<u64>()
            }
            RestorePolicy::PointInTime(cutoff) => {
                self.snapshot_rows
                    + self
                        .batches
                        .iter()
                        .filter(|batch| cutoff.includes(&batch.completed_at))
                        .map(|batch| batch.rows)
                        .sum::<u64>()
            }
        }
    }
}

fn insert_statements(keyspace: &str, table: &str, keys: Range<u64>) -> Vec<String> {
    keys.map(|key| format!("INSERT INTO {keyspace}.{table} (key, val) VALUES ({key}, 'asdf')"))
        .collect()
}

async fn count_rows<S: Session>(session: &S, keyspace: &str, table: &str) -> Result<u64, Error> {
    session
        .execute(&format!("SELECT count(*) FROM {keyspace}.{table}"), Consistency::One)
        .await?
        .count()
}

async fn create_schema<B: ClusterBackend>(
    controller: &mut ClusterController<B>,
    session: &B::Session,
    keyspace: &str,
    table: &str,
    key_type: &str,
) -> Result<(), Error> {
    controller
        .create_keyspace(
            session,
            KeyspaceDefinition::new(keyspace, ReplicationStrategy::simple(1)),
        )
        .await?;
    session
        .execute(
            &format!("CREATE TABLE {keyspace}.{table} ( key {key_type} PRIMARY KEY, val text)"),
            Consistency::All,
        )
        .await
        .map(drop)
}

/// Writes rows, snapshots them, writes more, recreates the keyspace and restores the snapshot,
/// checking that exactly the snapshotted rows come back. Runs on the first node of a populated,
/// single-node cluster.
pub async fn basic_snapshot_round_trip<B: ClusterBackend>(
    controller: &mut ClusterController<B>,
) -> Result<(), Error> {
    let (keyspace, table) = ("ks", "cf");
    controller.start_all(&StartOptions::default()).await?;
    let node = controller.node(0)?.clone();
    let session = controller.connect(0).await?;
    create_schema(controller, &session, keyspace, table, "int").await?;

    session
        .execute_all(&insert_statements(keyspace, table, 0..100), Consistency::One)
        .await?;
    let snapshot = take_snapshot(&node, keyspace, table, "basic").await?;
    clear_snapshot(&node, &snapshot.tag).await?;

    session
        .execute_all(&insert_statements(keyspace, table, 100..200), Consistency::One)
        .await?;
    assert_row_count("rows before drop", 200, count_rows(&session, keyspace, table).await?)?;

    session
        .execute(&format!("DROP KEYSPACE {keyspace}"), Consistency::All)
        .await?;
    create_schema(controller, &session, keyspace, table, "int").await?;
    assert_row_count("rows after recreate", 0, count_rows(&session, keyspace, table).await?)?;

    restore_snapshot(&snapshot, &node).await?;
    node.refresh(keyspace, table).await?;
    assert_row_count("rows after restore", 100, count_rows(&session, keyspace, table).await?)
}

/// What an [`ArchiveRestoreScenario`] observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRestoreReport {
    pub checkpoints: WriteCheckpoints,
    pub policy: RestorePolicy,
    /// Segments archived while the node ran that were no longer active at the end.
    pub archived_only_segments: BTreeSet<String>,
    pub restored_rows: u64,
}

/// Snapshot plus commit-log archive, restored into a rebuilt cluster.
///
/// The first batch is written before the snapshot and the archive is cleared, so the archive
/// only ever holds writes from later batches. The point-in-time cutoff is taken `settle` after the
/// second batch, so the second batch falls before it and the third after.
#[derive(Clone, Debug)]
pub struct ArchiveRestoreScenario<C: Clock = RealClock> {
    pub keyspace: String,
    pub table: String,
    /// Rows in the snapshotted batch and in each batch after it.
    pub batch_sizes: [u64; 3],
    /// Copy the segments still active after draining into the archive before restoring.
    pub archive_active_segments: bool,
    pub replay: ReplayMode,
    pub settle: Duration,
    pub clock: C,
}

impl Default for ArchiveRestoreScenario<RealClock> {
    fn default() -> Self {
        Self {
            keyspace: "ks".to_string(),
            table: "cf".to_string(),
            batch_sizes: [30_000, 30_000, 5_000],
            archive_active_segments: false,
            replay: ReplayMode::Full,
            settle: Duration::from_secs(10),
            clock: RealClock::default(),
        }
    }
}

impl<C: Clock> ArchiveRestoreScenario<C> {
    /// Runs the scenario on the first node of a populated, stopped, single-node cluster.
    pub async fn run<B: ClusterBackend>(
        &self,
        controller: &mut ClusterController<B>,
    ) -> Result<ArchiveRestoreReport, Error> {
        let (keyspace, table) = (self.keyspace.as_str(), self.table.as_str());
        let [first, second, third] = self.batch_sizes;
        let archive = CommitLogArchive::new()?;
        let node = controller.node(0)?.clone();
        CommitLogArchiving::archiving_to(&archive)
            .write(&node.conf_dir().join(COMMITLOG_ARCHIVING_FILE))
            .await?;

        controller.start_all(&StartOptions::default()).await?;
        let session = controller.connect(0).await?;
        create_schema(controller, &session, keyspace, table, "bigint").await?;

        info!(rows = first, "writing snapshot batch");
        session
            .execute_all(&insert_statements(keyspace, table, 0..first), Consistency::One)
            .await?;
        archive.clear().await?;
        let snapshot = take_snapshot(&node, keyspace, table, "basic").await?;
        clear_snapshot(&node, &snapshot.tag).await?;

        let mut checkpoints = WriteCheckpoints {
            snapshot_rows: first,
            batches: Vec::new(),
        };
        info!(rows = second, "writing second batch");
        session
            .execute_all(
                &insert_statements(keyspace, table, first..first + second),
                Consistency::One,
            )
            .await?;
        node.flush().await?;
        checkpoints.batches.push(WriteBatch {
            rows: second,
            completed_at: self.clock.now(),
        });
        self.clock.sleep(self.settle).await;
        let cutoff = RestorePointInTime::at(self.clock.now());

        info!(rows = third, "writing third batch");
        let total = first + second + third;
        session
            .execute_all(
                &insert_statements(keyspace, table, first + second..total),
                Consistency::One,
            )
            .await?;
        checkpoints.batches.push(WriteBatch {
            rows: third,
            completed_at: self.clock.now(),
        });
        assert_row_count("rows written", total, count_rows(&session, keyspace, table).await?)?;

        let archived_only_segments = archive.segments_not_in(&node.commitlog_dir()).await?;
        if archived_only_segments.is_empty() {
            return Err(Error::mismatch(
                "segments archived but no longer active",
                "at least one",
                &archived_only_segments,
            ));
        }

        controller.flush_all().await?;
        controller.compact_all().await?;
        node.drain().await?;
        if self.archive_active_segments {
            let copied = archive.copy_active_segments(&node.commitlog_dir()).await?;
            debug!(copied, "archived active segments");
        }

        controller.stop_all(&StopOptions::default()).await?;
        controller.rebuild().await?;
        let node = controller.node(0)?.clone();
        let session = controller.connect(0).await?;
        create_schema(controller, &session, keyspace, table, "bigint").await?;
        restore_snapshot(&snapshot, &node).await?;
        assert_row_count(
            "rows restored from snapshot",
            first,
            count_rows(&session, keyspace, table).await?,
        )?;

        let policy = match self.replay {
            ReplayMode::None => RestorePolicy::NoReplay,
            ReplayMode::Full => RestorePolicy::FullReplay,
            ReplayMode::PointInTime => RestorePolicy::PointInTime(cutoff),
        };
        let point_in_time = match policy {
            RestorePolicy::PointInTime(cutoff) => Some(cutoff),
            _ => None,
        };
        if policy != RestorePolicy::NoReplay {
            CommitLogArchiving::restoring_from(&archive, point_in_time)
                .write(&node.conf_dir().join(COMMITLOG_ARCHIVING_FILE))
                .await?;
        }

        info!(?policy, "restarting to replay archived segments");
        controller.stop_node(0, &StopOptions::default()).await?;
        controller.start_node(0, &StartOptions::default()).await?;
        node.flush().await?;
        node.compact().await?;

        let session = controller.connect(0).await?;
        let restored_rows = count_rows(&session, keyspace, table).await?;
        assert_row_count(
            &format!("rows after {policy:?} restore"),
            checkpoints.expected_rows(&policy),
            restored_rows,
        )?;
        Ok(ArchiveRestoreReport {
            checkpoints,
            policy,
            archived_only_segments,
            restored_rows,
        })
    }
}
