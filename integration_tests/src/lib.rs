//! Drives a local database cluster through its lifecycle and checks what it reports against what
//! the harness expects.
//!
//! [`controller::ClusterController`] owns the cluster. It talks to the outside world only through
//! the [`cluster::ClusterBackend`], [`cluster::NodeHandle`] and [`driver::Session`] traits, with
//! [`ccm`] providing the implementation used against real servers.

pub mod assertions;
pub mod ccm;
pub mod cluster;
pub mod controller;
pub mod driver;
pub mod logs;
pub mod nodetool;
pub mod replication;
pub mod snapshot;
pub mod snitch;
