//! Running queries against a node, with and without execution traces.

use crate::ccm::CcmCommand;
use async_trait::async_trait;
use dtest_core::{error::Error, query_trace::TraceEvent};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    net::IpAddr,
    time::Duration,
};
use tokio::time::timeout;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Consistency {
    Any,
    #[default]
    One,
    Two,
    Quorum,
    LocalQuorum,
    EachQuorum,
    All,
}

impl Display for Consistency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "ANY",
            Self::One => "ONE",
            Self::Two => "TWO",
            Self::Quorum => "QUORUM",
            Self::LocalQuorum => "LOCAL_QUORUM",
            Self::EachQuorum => "EACH_QUORUM",
            Self::All => "ALL",
        })
    }
}

/// A result set, with every value in its textual form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Rows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The value of `column` in the first row.
    pub fn first_value(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.first()?.get(index).map(String::as_str)
    }

    /// Interprets a `SELECT count(*)` result.
    pub fn count(&self) -> Result<u64, Error> {
        let value = self
            .rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| Error::parse("row count", "empty result set"))?;
        value
            .trim()
            .parse()
            .map_err(|_| Error::parse("row count", format!("{value:?} is not a count")))
    }
}

/// A client connection to one node.
#[async_trait]
pub trait Session: Send + Sync {
    async fn execute(&self, query: &str, consistency: Consistency) -> Result<Rows, Error>;

    /// Executes `query` with tracing on and returns the trace once it is complete. Waiting for the
    /// trace to be complete is bounded by `max_trace_wait`.
    async fn execute_traced(
        &self,
        query: &str,
        consistency: Consistency,
        max_trace_wait: Duration,
    ) -> Result<(Rows, Vec<TraceEvent>), Error>;

    /// Executes each statement in order, stopping at the first failure.
    async fn execute_all(&self, statements: &[String], consistency: Consistency) -> Result<(), Error> {
        for statement in statements {
            self.execute(statement, consistency).await?;
        }
        Ok(())
    }
}

/// Parses the tables `cqlsh` prints: a header row, a dashed separator, and rows up to a blank line
/// or a `(N rows)` footer.
pub fn parse_cqlsh_tables(output: &str) -> Vec<Rows> {
    let lines: Vec<&str> = output.lines().collect();
    let mut tables = Vec::new();
    let mut index = 1;
    while index < lines.len() {
        if !is_separator(lines[index]) {
            index += 1;
            continue;
        }
        let columns = split_row(lines[index - 1]);
        let mut rows = Vec::new();
        index += 1;
        while index < lines.len() {
            let line = lines[index];
            if line.trim().is_empty() || is_footer(line) {
                break;
            }
            rows.push(split_row(line));
            index += 1;
        }
        tables.push(Rows { columns, rows });
    }
    tables
}

fn is_separator(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('-') && line.chars().all(|c| c == '-' || c == '+')
}

fn is_footer(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('(') && (line.ends_with(" rows)") || line.ends_with(" row)"))
}

fn split_row(line: &str) -> Vec<String> {
    line.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Turns a `cqlsh` trace table (`activity | timestamp | source | source_elapsed | client`) into
/// trace events. `cqlsh` does not show thread names, so those are left empty.
pub fn trace_events_from_table(table: &Rows) -> Result<Vec<TraceEvent>, Error> {
    let column = |name: &str| {
        table
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::parse("trace table", format!("missing column {name:?}")))
    };
    let (activity, source, elapsed) = (column("activity")?, column("source")?, column("source_elapsed")?);

    table
        .rows
        .iter()
        .map(|row| {
            let cell = |i: usize| row.get(i).map(String::as_str).unwrap_or_default();
            let source: IpAddr = cell(source)
                .parse()
                .map_err(|_| Error::parse("trace source", cell(source).to_string()))?;
            // The first event of a session has no elapsed time.
            let elapsed = cell(elapsed).parse().unwrap_or(0);
            Ok(TraceEvent::new(source, elapsed, cell(activity), ""))
        })
        .collect()
}

/// Parses a CQL map literal as `cqlsh` prints it, e.g.
/// `{'class': 'org.apache.cassandra.locator.SimpleStrategy', 'replication_factor': '1'}`.
pub fn parse_cql_map(text: &str) -> Result<BTreeMap<String, String>, Error> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| Error::parse("CQL map", text.to_string()))?;
    let unquote = |s: &str| s.trim().trim_matches('\'').to_string();

    inner
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| Error::parse("CQL map entry", entry.to_string()))?;
            Ok((unquote(key), unquote(value)))
        })
        .collect()
}

/// A [`Session`] that runs each request through `ccm <node> cqlsh -x`.
#[derive(Clone, Debug)]
pub struct CqlshSession {
    ccm: CcmCommand,
    node_name: String,
    request_timeout: Duration,
}

impl CqlshSession {
    pub(crate) fn new(ccm: CcmCommand, node_name: &str, request_timeout: Duration) -> Self {
        Self {
            ccm,
            node_name: node_name.to_owned(),
            request_timeout,
        }
    }

    async fn run(&self, script: &str, limit: Duration) -> Result<Vec<Rows>, Error> {
        debug!(node = %self.node_name, script, "running cqlsh");
        let output = timeout(
            limit,
            self.ccm.run(&[&self.node_name, "cqlsh", "-x", script]),
        )
        .await
        .map_err(|_| Error::ConvergenceTimeout {
            what: format!("cqlsh on {}", self.node_name),
            timeout: limit,
            last_observation: None,
        })??
        .check()?;
        Ok(parse_cqlsh_tables(&output.stdout))
    }
}

#[async_trait]
impl Session for CqlshSession {
    async fn execute(&self, query: &str, consistency: Consistency) -> Result<Rows, Error> {
        let tables = self
            .run(&format!("CONSISTENCY {consistency}; {query};"), self.request_timeout)
            .await?;
        Ok(tables.into_iter().next().unwrap_or_default())
    }

    async fn execute_traced(
        &self,
        query: &str,
        consistency: Consistency,
        max_trace_wait: Duration,
    ) -> Result<(Rows, Vec<TraceEvent>), Error> {
        let tables = self
            .run(
                &format!("CONSISTENCY {consistency}; TRACING ON; {query};"),
                self.request_timeout + max_trace_wait,
            )
            .await?;
        let (traces, results): (Vec<_>, Vec<_>) = tables
            .into_iter()
            .partition(|table| table.columns.first().is_some_and(|c| c == "activity"));
        let events = match traces.first() {
            Some(trace) => trace_events_from_table(trace)?,
            None => Vec::new(),
        };
        Ok((results.into_iter().next().unwrap_or_default(), events))
    }

    async fn execute_all(&self, statements: &[String], consistency: Consistency) -> Result<(), Error> {
        // One cqlsh process per chunk rather than per statement.
        for chunk in statements.chunks(500) {
            let script = format!("CONSISTENCY {consistency}; {};", chunk.join("; "));
            self.run(&script, self.request_timeout * 10).await?;
        }
        Ok(())
    }
}
