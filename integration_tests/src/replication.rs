//! Write-path placement checks: every traced write must land on exactly the replicas the ring
//! predicts, and be acknowledged by every node it was sent to.

use crate::{
    assertions::{assert_acknowledged, assert_replicas, assert_single_forwarder_per_remote_dc},
    cluster::{ClusterBackend, StartOptions},
    controller::ClusterController,
    driver::{Consistency, Session},
};
use dtest_core::{
    error::Error,
    query_trace::{TraceAnalyzer, TracePatterns},
    topology::{KeyspaceDefinition, ReplicationStrategy, Token},
};
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, info};

/// Integer partition keys and their Murmur3 tokens, sorted by token.
pub const MURMUR3_TOKENS: [(i32, Token); 20] = [
    (5, -7509452495886106294),
    (10, -6715243485458697746),
    (16, -5477287129830487822),
    (13, -5034495173465742853),
    (11, -4156302194539278891),
    (1, -4069959284402364209),
    (19, -3974532302236993209),
    (8, -3799847372828181882),
    (2, -3248873570005575792),
    (4, -2729420104000364805),
    (18, -2695747960476065067),
    (15, -1191135763843456182),
    (20, 1388667306199997068),
    (7, 1634052884888577606),
    (6, 2705480034054113608),
    (9, 3728482343045213994),
    (14, 4279681877540623768),
    (17, 5467144456125416399),
    (12, 8582886034424406875),
    (3, 9010454139840013625),
];

/// Picks trace phrasing from a release number such as `4.1.5`. Without one, 2.x phrasing is assumed.
pub fn analyzer_for_server(version: Option<&str>) -> Result<TraceAnalyzer, Error> {
    let Some(version) = version else {
        return Ok(TraceAnalyzer::default());
    };
    let major = version.split('.').next().unwrap_or(version);
    TracePatterns::for_version(&format!("{major}.x")).map(TraceAnalyzer::new)
}

/// Inserts every key of [`MURMUR3_TOKENS`] into `keyspace.table` at `ALL` with tracing on, and
/// checks each trace against the controller's ring. Returns every node that forwarded a write.
///
/// The table must have an `int` key column `id` and a `text` column `value`.
pub async fn verify_replication<B: ClusterBackend>(
    controller: &ClusterController<B>,
    session: &B::Session,
    analyzer: &TraceAnalyzer,
    keyspace: &str,
    table: &str,
) -> Result<BTreeSet<IpAddr>, Error> {
    let strategy = &controller.keyspace(keyspace)?.strategy;
    let ring = controller.ring()?;
    let datacenter_of = ring.datacenter_by_address();
    let trace_wait = controller.config().timeouts.trace_fetch();
    let mut forwarders = BTreeSet::new();

    for (key, token) in MURMUR3_TOKENS {
        let query = format!("INSERT INTO {keyspace}.{table} (id, value) VALUES ({key}, 'asdf')");
        let (_, events) = session
            .execute_traced(&query, Consistency::All, trace_wait)
            .await?;
        TraceAnalyzer::log_trace(&events);

        let verdict = analyzer.analyze(&events);
        let expected = ring.replicas(token, strategy)?;
        debug!(key, token, ?expected, %verdict, "checking write placement");

        let key = key.to_string();
        assert_replicas(&key, &expected, &verdict)?;
        assert_acknowledged(&key, &verdict)?;
        if matches!(strategy, ReplicationStrategy::NetworkTopology { .. }) {
            assert_single_forwarder_per_remote_dc(&key, &verdict, &expected, &datacenter_of)?;
        }
        forwarders.extend(verdict.forwarders.iter().copied());
    }

    info!(keyspace, ?forwarders, "write placement verified");
    Ok(forwarders)
}

/// Starts a populated cluster, creates keyspace `test` with `strategy` and table `test.test`, then
/// runs [`verify_replication`] through the first node.
pub async fn run_replication_scenario<B: ClusterBackend>(
    controller: &mut ClusterController<B>,
    strategy: ReplicationStrategy,
) -> Result<BTreeSet<IpAddr>, Error> {
    let analyzer =
        analyzer_for_server(controller.config().cluster.server_version.as_deref())?;
    controller.start_all(&StartOptions::default()).await?;
    let session = controller.connect(0).await?;

    controller
        .create_keyspace(&session, KeyspaceDefinition::new("test", strategy))
        .await?;
    session
        .execute(
            "CREATE TABLE test.test (id int PRIMARY KEY, value text)",
            Consistency::All,
        )
        .await?;

    verify_replication(controller, &session, &analyzer, "test", "test").await
}
