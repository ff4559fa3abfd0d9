//! Watching node log files, and copying them out for later analysis.
//!
//! A watch only considers lines written after a [`LogMark`]. Take the mark before triggering
//! whatever is expected to log, and take a fresh one before each lifecycle transition that is
//! watched again, so earlier matches are never mistaken for new ones.

use dtest_core::{
    error::Error,
    retries::{poll_until, PollParameters},
};
use regex::Regex;
use std::{
    convert::AsRef,
    io::{ErrorKind, SeekFrom},
    path::Path,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::debug;

pub trait CopyLogs {
    /// Copies log files into the host filesystem for later analysis. Log files are written to a
    /// directory named after the cluster, created under `destination`.
    fn logs<P: AsRef<Path>>(&self, destination: &P) -> Result<(), Error>;
}

/// A byte offset into a log file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogMark(u64);

impl LogMark {
    /// The beginning of the file: watching from here considers everything ever logged.
    pub const START: LogMark = LogMark(0);

    pub fn offset(&self) -> u64 {
        self.0
    }
}

/// A log line that matched a watched pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMatch {
    pub line: String,
    /// Capture groups of the pattern, excluding the whole match.
    pub captures: Vec<Option<String>>,
    /// Mark just past the matched line.
    pub mark: LogMark,
}

/// The current end of the log. A log that does not exist yet is marked at its start.
pub async fn mark_log(path: &Path) -> Result<LogMark, Error> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(LogMark(metadata.len())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(LogMark::START),
        Err(error) => Err(error.into()),
    }
}

/// Complete lines written after `from`, each with the mark just past it. A trailing partial line
/// is left for the next read.
async fn read_lines_from(path: &Path, from: LogMark) -> Result<Vec<(String, LogMark)>, Error> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error.into()),
    };
    file.seek(SeekFrom::Start(from.0)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let mut lines = Vec::new();
    let mut offset = from.0;
    let mut rest = buf.as_slice();
    while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
        let (line, tail) = rest.split_at(newline + 1);
        offset += line.len() as u64;
        lines.push((
            String::from_utf8_lossy(&line[..newline]).into_owned(),
            LogMark(offset),
        ));
        rest = tail;
    }
    Ok(lines)
}

fn to_match(pattern: &Regex, line: String, mark: LogMark) -> Option<LogMatch> {
    let captures = pattern.captures(&line)?;
    let groups = captures
        .iter()
        .skip(1)
        .map(|group| group.map(|m| m.as_str().to_string()))
        .collect();
    Some(LogMatch {
        line,
        captures: groups,
        mark,
    })
}

/// Waits for a line matching `pattern` to be written after `from`.
pub async fn watch_log_for(
    path: &Path,
    pattern: &Regex,
    from: LogMark,
    parameters: PollParameters,
) -> Result<LogMatch, Error> {
    debug!(path = %path.display(), %pattern, ?from, "watching log");
    let found = poll_until(
        &format!("/{pattern}/ in {}", path.display()),
        parameters,
        || async move {
            Ok(read_lines_from(path, from)
                .await?
                .into_iter()
                .find_map(|(line, mark)| to_match(pattern, line, mark)))
        },
        Option::is_some,
    )
    .await?;
    found.ok_or_else(|| Error::parse("log watch", "matched without a line"))
}

/// Every line of the log matching `pattern`.
pub async fn grep_log(path: &Path, pattern: &Regex) -> Result<Vec<LogMatch>, Error> {
    Ok(read_lines_from(path, LogMark::START)
        .await?
        .into_iter()
        .filter_map(|(line, mark)| to_match(pattern, line, mark))
        .collect())
}
