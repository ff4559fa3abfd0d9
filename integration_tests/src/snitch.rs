//! Snitch configuration files: which datacenter and rack each node believes it is in.
//!
//! Every snitch reads its placement from a file in the node's `conf` directory. File-based snitches
//! reload that file while the node runs, which is how racks get reassigned without a restart.

use dtest_core::error::Error;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    net::IpAddr,
    path::{Path, PathBuf},
};
use tracing::debug;

const SNITCH_PACKAGE: &str = "org.apache.cassandra.locator.";

/// The `cassandra.yaml` option selecting the snitch.
pub const ENDPOINT_SNITCH_OPTION: &str = "endpoint_snitch";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnitchKind {
    GossipingPropertyFile,
    PropertyFile,
    YamlFile,
}

impl SnitchKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::GossipingPropertyFile => "GossipingPropertyFileSnitch",
            Self::PropertyFile => "PropertyFileSnitch",
            Self::YamlFile => "YamlFileNetworkTopologySnitch",
        }
    }

    pub fn qualified_class_name(&self) -> String {
        format!("{SNITCH_PACKAGE}{}", self.class_name())
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::GossipingPropertyFile => "cassandra-rackdc.properties",
            Self::PropertyFile => "cassandra-topology.properties",
            Self::YamlFile => "cassandra-topology.yaml",
        }
    }

    /// Recognizes both the short and the fully qualified class name.
    pub fn from_class_name(name: &str) -> Result<Self, Error> {
        match name.strip_prefix(SNITCH_PACKAGE).unwrap_or(name) {
            "GossipingPropertyFileSnitch" => Ok(Self::GossipingPropertyFile),
            "PropertyFileSnitch" => Ok(Self::PropertyFile),
            "YamlFileNetworkTopologySnitch" => Ok(Self::YamlFile),
            other => Err(Error::Configuration(format!("unsupported snitch: {other}"))),
        }
    }
}

/// A datacenter and rack pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placement {
    pub datacenter: String,
    pub rack: String,
}

impl Placement {
    pub fn new(datacenter: &str, rack: &str) -> Self {
        Self {
            datacenter: datacenter.to_owned(),
            rack: rack.to_owned(),
        }
    }
}

impl Display for Placement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datacenter, self.rack)
    }
}

/// `cassandra-topology.yaml`, as read by the YAML file snitch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YamlTopology {
    pub topology: Vec<YamlDatacenter>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YamlDatacenter {
    pub dc_name: String,
    pub racks: Vec<YamlRack>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YamlRack {
    pub rack_name: String,
    pub nodes: Vec<YamlNode>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YamlNode {
    pub broadcast_address: IpAddr,
}

impl YamlTopology {
    /// A single-datacenter topology from `(rack, addresses)` pairs.
    pub fn single_datacenter<'a>(
        datacenter: &str,
        racks: impl IntoIterator<Item = (&'a str, Vec<IpAddr>)>,
    ) -> Self {
        Self {
            topology: Vec::from([YamlDatacenter {
                dc_name: datacenter.to_owned(),
                racks: racks
                    .into_iter()
                    .map(|(rack, addresses)| YamlRack {
                        rack_name: rack.to_owned(),
                        nodes: addresses
                            .into_iter()
                            .map(|broadcast_address| YamlNode { broadcast_address })
                            .collect(),
                    })
                    .collect(),
            }]),
        }
    }

    fn placement(&self, address: IpAddr) -> Option<Placement> {
        self.topology.iter().find_map(|datacenter| {
            datacenter.racks.iter().find_map(|rack| {
                rack.nodes
                    .iter()
                    .any(|node| node.broadcast_address == address)
                    .then(|| Placement::new(&datacenter.dc_name, &rack.rack_name))
            })
        })
    }
}

/// The contents of one node's snitch file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnitchConfig {
    /// The node's own placement, gossiped to the rest of the cluster.
    GossipingPropertyFile(Placement),
    /// Every node's placement, with a fallback for nodes not listed.
    PropertyFile {
        entries: BTreeMap<IpAddr, Placement>,
        default: Option<Placement>,
    },
    YamlFile(YamlTopology),
}

impl SnitchConfig {
    pub fn gossiping(datacenter: &str, rack: &str) -> Self {
        Self::GossipingPropertyFile(Placement::new(datacenter, rack))
    }

    pub fn kind(&self) -> SnitchKind {
        match self {
            Self::GossipingPropertyFile(_) => SnitchKind::GossipingPropertyFile,
            Self::PropertyFile { .. } => SnitchKind::PropertyFile,
            Self::YamlFile(_) => SnitchKind::YamlFile,
        }
    }

    /// Renders the file body.
    pub fn render(&self) -> Result<String, Error> {
        Ok(match self {
            Self::GossipingPropertyFile(placement) => {
                format!("dc={}\nrack={}\n", placement.datacenter, placement.rack)
            }
            Self::PropertyFile { entries, default } => {
                let mut body: String = entries
                    .iter()
                    .map(|(address, placement)| format!("{address}={placement}\n"))
                    .collect();
                if let Some(default) = default {
                    body.push_str(&format!("default={default}\n"));
                }
                body
            }
            Self::YamlFile(topology) => serde_yaml::to_string(topology)
                .map_err(|err| Error::Configuration(format!("cannot render topology: {err}")))?,
        })
    }

    /// Parses a file body written for a snitch of type `kind`.
    pub fn parse(kind: SnitchKind, body: &str) -> Result<Self, Error> {
        match kind {
            SnitchKind::GossipingPropertyFile => {
                let properties = parse_properties(body);
                let get = |key: &str| {
                    properties
                        .get(key)
                        .ok_or_else(|| Error::parse("rackdc properties", format!("missing {key}")))
                };
                Ok(Self::GossipingPropertyFile(Placement::new(
                    get("dc")?,
                    get("rack")?,
                )))
            }
            SnitchKind::PropertyFile => {
                let mut entries = BTreeMap::new();
                let mut default = None;
                for (key, value) in parse_properties(body) {
                    let (datacenter, rack) = value.split_once(':').ok_or_else(|| {
                        Error::parse("topology properties", format!("{key}={value}"))
                    })?;
                    let placement = Placement::new(datacenter, rack);
                    if key == "default" {
                        default = Some(placement);
                    } else {
                        let address = key
                            .parse()
                            .map_err(|_| Error::parse("topology properties", key.clone()))?;
                        entries.insert(address, placement);
                    }
                }
                Ok(Self::PropertyFile { entries, default })
            }
            SnitchKind::YamlFile => serde_yaml::from_str(body)
                .map(Self::YamlFile)
                .map_err(|err| Error::parse("topology yaml", err.to_string())),
        }
    }

    /// Where this file places `address`. A gossiping file only describes the node it is on.
    pub fn placement(&self, address: IpAddr) -> Option<Placement> {
        match self {
            Self::GossipingPropertyFile(placement) => Some(placement.clone()),
            Self::PropertyFile { entries, default } => {
                entries.get(&address).or(default.as_ref()).cloned()
            }
            Self::YamlFile(topology) => topology.placement(address),
        }
    }

    pub fn path_in(&self, conf_dir: &Path) -> PathBuf {
        conf_dir.join(self.kind().file_name())
    }

    /// Replaces the snitch file in `conf_dir`.
    pub async fn write_to(&self, conf_dir: &Path) -> Result<(), Error> {
        let path = self.path_in(conf_dir);
        debug!(path = %path.display(), snitch = self.kind().class_name(), "writing snitch file");
        tokio::fs::write(&path, self.render()?).await?;
        Ok(())
    }

    pub async fn read_from(kind: SnitchKind, conf_dir: &Path) -> Result<Self, Error> {
        let body = tokio::fs::read_to_string(conf_dir.join(kind.file_name())).await?;
        Self::parse(kind, &body)
    }
}

/// `key=value` lines, ignoring blanks and `#` comments.
fn parse_properties(body: &str) -> BTreeMap<String, String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}
