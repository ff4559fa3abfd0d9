use crate::{
    query_trace::TraceEvent,
    trace::{install_trace_subscriber, TraceConfiguration},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, net::IpAddr, sync::Once};

/// Encodes the given value to YAML, then decodes it again, and checks that the
/// resulting value is equal to the given value.
pub fn roundtrip_encoding<T: Serialize + DeserializeOwned + Debug + Eq>(value: T) {
    let encoded = serde_yaml::to_string(&value).unwrap();
    let decoded = serde_yaml::from_str(&encoded).unwrap();
    assert_eq!(value, decoded);
}

/// Install a tracing subscriber for use in tests. This should be called at the beginning of any
/// test that requires a tracing subscriber.
pub fn install_test_trace_subscriber() {
    install_configured_test_trace_subscriber(&TraceConfiguration::default())
}

/// Like [`install_test_trace_subscriber`], but honoring a harness configuration's
/// `logging_config`. Events always go to the test writer. The first call in a process wins.
pub fn install_configured_test_trace_subscriber(config: &TraceConfiguration) {
    static INSTALL_TRACE_SUBSCRIBER: Once = Once::new();
    INSTALL_TRACE_SUBSCRIBER.call_once(|| {
        let config = TraceConfiguration {
            use_test_writer: true,
            ..config.clone()
        };
        install_trace_subscriber(&config).unwrap();
    })
}

/// The loopback address ccm gives the node with the given 1-based index.
pub fn node_address(index: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, index])
}

/// Builds traces in the 2.x phrasing, with elapsed times increasing by 10µs per event.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    events: Vec<TraceEvent>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, source: IpAddr, description: String, thread: &str) -> Self {
        let elapsed = 10 * (self.events.len() as u64 + 1);
        self.events
            .push(TraceEvent::new(source, elapsed, &description, thread));
        self
    }

    pub fn coordinator(self, source: IpAddr) -> Self {
        self.push(
            source,
            "Determining replicas for mutation".to_string(),
            "Native-Transport-Requests-1",
        )
    }

    pub fn send(self, source: IpAddr, peer: IpAddr) -> Self {
        self.push(
            source,
            format!("Sending message to /{peer}"),
            "WRITE-/127.0.0.1",
        )
    }

    pub fn receive(self, source: IpAddr, peer: IpAddr) -> Self {
        self.push(
            source,
            format!("Message received from /{peer}"),
            "Thread-5",
        )
    }

    pub fn forward(self, source: IpAddr, peer: IpAddr) -> Self {
        self.push(
            source,
            format!("Enqueuing forwarded write to /{peer}"),
            "MutationStage:1",
        )
    }

    pub fn append(self, source: IpAddr) -> Self {
        self.push(source, "Appending to commitlog".to_string(), "MutationStage:2")
    }

    pub fn note(self, source: IpAddr, description: &str) -> Self {
        self.push(source, description.to_string(), "SharedPool-Worker-1")
    }

    pub fn build(self) -> Vec<TraceEvent> {
        self.events
    }
}
