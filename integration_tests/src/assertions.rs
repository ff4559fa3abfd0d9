//! Comparisons between what the harness computed and what the cluster reported.
//!
//! Each check fails with [`Error::VerificationMismatch`] carrying both sides, so a failed test
//! shows the expectation next to the observation without re-running anything.

use dtest_core::{error::Error, query_trace::ReplicaVerdict};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    net::IpAddr,
};

/// Fails unless `observed` has exactly the members of `expected`.
pub fn assert_sets_equal<T: Ord + Debug>(
    what: &str,
    expected: &BTreeSet<T>,
    observed: &BTreeSet<T>,
) -> Result<(), Error> {
    if expected == observed {
        Ok(())
    } else {
        Err(Error::mismatch(what, expected, observed))
    }
}

pub fn assert_row_count(what: &str, expected: u64, observed: u64) -> Result<(), Error> {
    if expected == observed {
        Ok(())
    } else {
        Err(Error::mismatch(what, &expected, &observed))
    }
}

/// The nodes that appended the write must be exactly the expected replicas.
pub fn assert_replicas(
    key: &str,
    expected: &[IpAddr],
    verdict: &ReplicaVerdict,
) -> Result<(), Error> {
    let expected: BTreeSet<_> = expected.iter().copied().collect();
    assert_sets_equal(
        &format!("replicas of key {key}"),
        &expected,
        &verdict.replicas,
    )
    .map_err(|error| error.with_raw_output(verdict.to_string()))
}

/// Every node sent the write must have acknowledged it.
pub fn assert_acknowledged(key: &str, verdict: &ReplicaVerdict) -> Result<(), Error> {
    assert_sets_equal(
        &format!("acknowledgements of key {key}"),
        &verdict.nodes_sent_write,
        &verdict.nodes_responded_write,
    )
    .map_err(|error| error.with_raw_output(verdict.to_string()))
}

/// The coordinator must contact exactly one node in each remote datacenter that holds replicas,
/// and no node outside the replica set.
pub fn assert_single_forwarder_per_remote_dc(
    key: &str,
    verdict: &ReplicaVerdict,
    expected_replicas: &[IpAddr],
    datacenter_of: &BTreeMap<IpAddr, String>,
) -> Result<(), Error> {
    let coordinator = verdict
        .coordinator
        .ok_or_else(|| Error::mismatch(format!("coordinator of key {key}"), "a coordinator", "none"))?;
    let local_dc = datacenter_of.get(&coordinator);
    let contacted = verdict.contacted_by_coordinator();

    let remote_replica_dcs: BTreeSet<&String> = expected_replicas
        .iter()
        .filter_map(|replica| datacenter_of.get(replica))
        .filter(|datacenter| Some(*datacenter) != local_dc)
        .collect();

    for datacenter in remote_replica_dcs {
        let contacted_in_dc: BTreeSet<_> = contacted
            .iter()
            .filter(|node| datacenter_of.get(*node) == Some(datacenter))
            .collect();
        if contacted_in_dc.len() != 1 {
            return Err(Error::mismatch(
                format!("nodes in {datacenter} contacted by coordinator {coordinator} for key {key}"),
                &1,
                &contacted_in_dc,
            )
            .with_raw_output(verdict.to_string()));
        }
    }

    let replicas: BTreeSet<_> = expected_replicas.iter().copied().collect();
    let outside: BTreeSet<_> = contacted.difference(&replicas).collect();
    if !outside.is_empty() {
        return Err(Error::mismatch(
            format!("non-replicas contacted by coordinator {coordinator} for key {key}"),
            &BTreeSet::<IpAddr>::new(),
            &outside,
        )
        .with_raw_output(verdict.to_string()));
    }
    Ok(())
}
