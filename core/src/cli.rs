//! Types useful for creating CLI tools.
use std::fmt::Display;

use clap::ValueEnum;

use crate::query_trace::TracePatterns;

/// Server release line, selecting which table of trace phrasings to classify events with.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ValueEnum)]
#[value()]
pub enum ServerGeneration {
    /// 2.x and 3.x servers
    #[default]
    #[value(name = "3.x", alias = "2.x")]
    Legacy,

    /// 4.x and later servers, whose messages carry a verb and a port
    #[value(name = "4.x", alias = "5.x")]
    Modern,
}

impl From<ServerGeneration> for TracePatterns {
    fn from(value: ServerGeneration) -> Self {
        match value {
            ServerGeneration::Legacy => TracePatterns::cassandra_2x(),
            ServerGeneration::Modern => TracePatterns::cassandra_4x(),
        }
    }
}

impl Display for ServerGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Every variant has a possible value, since none are skipped.
        match self.to_possible_value() {
            Some(possible_value) => f.write_str(possible_value.get_name()),
            None => Ok(()),
        }
    }
}
