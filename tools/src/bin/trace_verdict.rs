use anyhow::{Context, Result};
use clap::Parser;
use dtest_core::{
    cli::ServerGeneration,
    query_trace::{parse_trace_dump, ReplicaVerdict, TraceAnalyzer},
    trace::{install_trace_subscriber, TraceConfiguration},
};
use std::{
    fs::File,
    io::{stdin, stdout, Read, Write},
};
use tracing::debug;

fn main() -> Result<()> {
    install_trace_subscriber(&TraceConfiguration::for_tools())?;
    let options = Options::parse();

    let verdict = analyze_trace_file(&options.trace_file, options.server_version)?;
    write!(stdout().lock(), "{verdict}")?;

    Ok(())
}

/// Reads a tab-separated trace dump from `trace_file` and reconstructs who handled the write.
fn analyze_trace_file(trace_file: &str, server_version: ServerGeneration) -> Result<ReplicaVerdict> {
    let mut reader = if trace_file.eq("-") {
        Box::new(stdin()) as Box<dyn Read>
    } else {
        Box::new(File::open(trace_file).with_context(|| format!("couldn't open {trace_file}"))?)
            as Box<dyn Read>
    };

    let mut dump = String::new();
    reader.read_to_string(&mut dump)?;
    let events = parse_trace_dump(&dump)?;
    debug!(events = events.len(), %server_version, "parsed trace dump");

    Ok(TraceAnalyzer::new(server_version.into()).analyze(&events))
}

#[derive(Debug, Parser)]
#[command(
    name = "trace_verdict",
    about = "Summarizes which nodes coordinated, forwarded and stored a traced write",
    version,
    rename_all = "kebab-case"
)]
struct Options {
    /// Path to a trace dump, one `source<TAB>elapsed_us<TAB>description<TAB>thread` event per
    /// line.
    ///
    /// Pass "-" to read from stdin.
    trace_file: String,

    /// Release line of the server that recorded the trace
    #[arg(long, short = 's', value_enum, default_value_t)]
    server_version: ServerGeneration,
}
