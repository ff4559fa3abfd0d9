//! Cluster management through the `ccm` command-line tool.

use crate::{
    cluster::{ClusterBackend, ClusterLayout, NodeHandle, NodeSpec, StartOptions, StopOptions, ToolOutput},
    driver::CqlshSession,
    logs::CopyLogs,
};
use async_trait::async_trait;
use dtest_core::{config::ClusterDefaults, error::Error, topology::Token};
use rand::random;
use serde_yaml::{Mapping, Value};
use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
    process::{Command as StdCommand, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs `ccm` subcommands, optionally against a non-default configuration directory.
#[derive(Clone, Debug)]
pub(crate) struct CcmCommand {
    executable: PathBuf,
    config_dir: Option<PathBuf>,
}

impl CcmCommand {
    fn new(defaults: &ClusterDefaults) -> Self {
        Self {
            executable: defaults.ccm_executable.clone(),
            config_dir: defaults.config_dir.clone(),
        }
    }

    pub(crate) async fn run(&self, args: &[&str]) -> Result<ToolOutput, Error> {
        debug!(?args, "invoking ccm");
        let mut command = Command::new(&self.executable);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(config_dir) = &self.config_dir {
            command.env("CCM_CONFIG_DIR", config_dir);
        }
        let output = command.output().await?;
        Ok(ToolOutput {
            command: format!("{} {}", self.executable.display(), args.join(" ")),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }

    /// Where ccm keeps its clusters.
    fn root(&self) -> PathBuf {
        match &self.config_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(std::env::var_os("HOME").unwrap_or_default()).join(".ccm"),
        }
    }
}

/// A cluster created with `ccm create`. Dropping a `Ccm` removes the cluster.
pub struct Ccm {
    ccm: CcmCommand,
    defaults: ClusterDefaults,
    name: String,
    options: BTreeMap<String, Value>,
    data_dir_count: usize,
    request_timeout: Duration,
    removed: bool,
}

impl Ccm {
    /// Creates a new, empty cluster named after `defaults.cluster_name_prefix` and a random
    /// suffix.
    pub async fn create(defaults: &ClusterDefaults, request_timeout: Duration) -> Result<Self, Error> {
        let ccm = CcmCommand::new(defaults);
        let name = create_cluster(&ccm, defaults).await?;
        Ok(Self {
            ccm,
            defaults: defaults.clone(),
            name,
            options: BTreeMap::new(),
            data_dir_count: 1,
            request_timeout,
            removed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn cluster_dir(&self) -> PathBuf {
        self.ccm.root().join(&self.name)
    }

    fn node(&self, name: &str, datacenter: &str) -> Result<CcmNode, Error> {
        let path = self.cluster_dir().join(name);
        let conf = read_node_conf(&path)?;
        let address: IpAddr = conf
            .get("listen_address")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::parse("cassandra.yaml", format!("{name} has no listen_address")))?
            .parse()
            .map_err(|_| Error::parse("cassandra.yaml", format!("{name} has a bad listen_address")))?;
        let initial_token = match conf.get("initial_token") {
            Some(Value::Number(token)) => token.as_i64(),
            Some(Value::String(token)) => token.parse().ok(),
            _ => None,
        };
        let data_dirs = match conf.get("data_file_directories").and_then(Value::as_sequence) {
            Some(dirs) => dirs.iter().filter_map(Value::as_str).map(PathBuf::from).collect(),
            None => Vec::from([path.join("data")]),
        };

        Ok(CcmNode(Arc::new(CcmNodeInner {
            ccm: self.ccm.clone(),
            name: name.to_owned(),
            address,
            datacenter: datacenter.to_owned(),
            initial_token,
            path,
            data_dirs,
        })))
    }

    async fn apply_data_dirs(&self, node_name: &str) -> Result<(), Error> {
        if self.data_dir_count <= 1 {
            return Ok(());
        }
        let path = self.cluster_dir().join(node_name);
        let dirs: Vec<Value> = (0..self.data_dir_count)
            .map(|i| Value::String(path.join(format!("data{i}")).display().to_string()))
            .collect();
        for dir in &dirs {
            if let Some(dir) = dir.as_str() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        update_node_conf(&path, "data_file_directories", Value::Sequence(dirs))
    }
}

#[async_trait]
impl ClusterBackend for Ccm {
    type Node = CcmNode;
    type Session = CqlshSession;

    async fn populate(&mut self, layout: &ClusterLayout) -> Result<Vec<CcmNode>, Error> {
        let populate = layout.populate_arg();
        let mut args = Vec::from(["populate", "-n", populate.as_str()]);
        if layout.vnodes {
            args.push("--vnodes");
        }
        self.ccm.run(&args).await?.check()?;
        if !self.options.is_empty() {
            let options = self.options.clone();
            self.set_configuration_options(&options).await?;
        }

        let mut nodes = Vec::new();
        for (index, datacenter) in layout.datacenter_names().iter().enumerate() {
            let name = format!("node{}", index + 1);
            self.apply_data_dirs(&name).await?;
            nodes.push(self.node(&name, datacenter)?);
        }
        Ok(nodes)
    }

    async fn set_configuration_options(
        &mut self,
        options: &BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        let settings = options
            .iter()
            .map(|(key, value)| {
                let value = serde_yaml::to_string(value)
                    .map_err(|err| Error::Configuration(format!("option {key}: {err}")))?;
                Ok(format!("{key}:{}", value.trim_end()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let mut args = Vec::from(["updateconf"]);
        args.extend(settings.iter().map(String::as_str));
        self.ccm.run(&args).await?.check()?;
        self.options
            .extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn set_data_dirs(&mut self, count: usize) -> Result<(), Error> {
        self.data_dir_count = count;
        Ok(())
    }

    async fn add_node(&mut self, spec: &NodeSpec) -> Result<CcmNode, Error> {
        let args = add_node_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.ccm.run(&args).await?.check()?;
        self.apply_data_dirs(&spec.name).await?;
        self.node(&spec.name, &spec.datacenter)
    }

    async fn connect(&self, node: &CcmNode) -> Result<CqlshSession, Error> {
        Ok(CqlshSession::new(self.ccm.clone(), node.name(), self.request_timeout))
    }

    async fn remove(&mut self) -> Result<(), Error> {
        if self.removed {
            return Ok(());
        }
        self.ccm.run(&["remove", &self.name]).await?.check()?;
        self.removed = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), Error> {
        self.remove().await?;
        self.name = create_cluster(&self.ccm, &self.defaults).await?;
        self.removed = false;
        Ok(())
    }
}

async fn create_cluster(ccm: &CcmCommand, defaults: &ClusterDefaults) -> Result<String, Error> {
    let name = format!(
        "{}-{}",
        defaults.cluster_name_prefix,
        hex::encode(random::<[u8; 4]>())
    );

    let mut args = Vec::from(["create".to_string(), name.clone()]);
    match (&defaults.install_dir, &defaults.server_version) {
        (Some(install_dir), _) => args.push(format!("--install-dir={}", install_dir.display())),
        (None, Some(version)) => args.extend(["-v".to_string(), version.clone()]),
        (None, None) => {
            return Err(Error::Configuration(
                "either cluster.install_dir or cluster.server_version must be set".into(),
            ));
        }
    }
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    ccm.run(&args).await?.check()?;
    Ok(name)
}

impl Drop for Ccm {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let args = ["remove", self.name.as_str()];
        debug!(?args, "invoking ccm");
        let mut command = StdCommand::new(&self.ccm.executable);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(config_dir) = &self.ccm.config_dir {
            command.env("CCM_CONFIG_DIR", config_dir);
        }
        match command.status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(cluster = %self.name, ?status, "ccm remove failed"),
            Err(error) => warn!(cluster = %self.name, %error, "couldn't run ccm remove"),
        }
    }
}

impl CopyLogs for Ccm {
    fn logs<P: AsRef<Path>>(&self, destination: &P) -> Result<(), Error> {
        let cluster_dir = self.cluster_dir();
        for entry in std::fs::read_dir(&cluster_dir)? {
            let node_dir = entry?.path();
            let logs = node_dir.join("logs");
            if !logs.is_dir() {
                continue;
            }
            let Some(node_name) = node_dir.file_name() else {
                continue;
            };
            let target = destination.as_ref().join(&self.name).join(node_name);
            std::fs::create_dir_all(&target)?;
            for log in std::fs::read_dir(&logs)? {
                let log = log?.path();
                if let Some(file_name) = log.file_name() {
                    std::fs::copy(&log, target.join(file_name))?;
                }
            }
        }
        Ok(())
    }
}

/// A node of a [`Ccm`] cluster.
#[derive(Clone, Debug)]
pub struct CcmNode(Arc<CcmNodeInner>);

#[derive(Debug)]
struct CcmNodeInner {
    ccm: CcmCommand,
    name: String,
    address: IpAddr,
    datacenter: String,
    initial_token: Option<Token>,
    path: PathBuf,
    data_dirs: Vec<PathBuf>,
}

#[async_trait]
impl NodeHandle for CcmNode {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn address(&self) -> IpAddr {
        self.0.address
    }

    fn datacenter(&self) -> &str {
        &self.0.datacenter
    }

    fn initial_token(&self) -> Option<Token> {
        self.0.initial_token
    }

    fn path(&self) -> &Path {
        &self.0.path
    }

    fn data_dirs(&self) -> Vec<PathBuf> {
        self.0.data_dirs.clone()
    }

    async fn start(&self, options: &StartOptions) -> Result<(), Error> {
        let jvm_args: Vec<String> = options
            .effective_jvm_args()
            .into_iter()
            .map(|arg| format!("--jvm_arg={arg}"))
            .collect();
        let mut args = Vec::from([self.name(), "start", "--no-wait"]);
        args.extend(jvm_args.iter().map(String::as_str));
        self.0.ccm.run(&args).await?.check().map(drop)
    }

    async fn stop(&self, options: &StopOptions) -> Result<(), Error> {
        let mut args = Vec::from([self.name(), "stop"]);
        if !options.gently {
            args.push("--not-gently");
        }
        self.0.ccm.run(&args).await?.check().map(drop)
    }

    async fn nodetool(&self, args: &[&str]) -> Result<ToolOutput, Error> {
        let mut full_args = Vec::from([self.name(), "nodetool"]);
        full_args.extend_from_slice(args);
        self.0.ccm.run(&full_args).await
    }

    async fn bulk_load(&self, dir: &Path) -> Result<ToolOutput, Error> {
        let address = self.address().to_string();
        let dir = dir.display().to_string();
        self.0
            .ccm
            .run(&[self.name(), "bulkload", "-d", &address, &dir])
            .await
    }
}

fn node_conf_path(node_path: &Path) -> PathBuf {
    node_path.join("conf").join("cassandra.yaml")
}

fn read_node_conf(node_path: &Path) -> Result<Mapping, Error> {
    let path = node_conf_path(node_path);
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents)
        .map_err(|err| Error::parse("cassandra.yaml", format!("{}: {err}", path.display())))
}

fn update_node_conf(node_path: &Path, key: &str, value: Value) -> Result<(), Error> {
    let mut conf = read_node_conf(node_path)?;
    conf.insert(Value::String(key.to_owned()), value);
    let contents = serde_yaml::to_string(&conf)
        .map_err(|err| Error::Configuration(format!("couldn't render cassandra.yaml: {err}")))?;
    std::fs::write(node_conf_path(node_path), contents)?;
    Ok(())
}

/// Arguments of `ccm add` for `spec`.
fn add_node_args(spec: &NodeSpec) -> Vec<String> {
    let mut args = Vec::from([
        "add".to_string(),
        spec.name.clone(),
        "-i".to_string(),
        spec.address.to_string(),
        "-j".to_string(),
        spec.jmx_port().to_string(),
        format!("--data-center={}", spec.datacenter),
    ]);
    if spec.auto_bootstrap {
        args.push("-b".to_string());
    }
    if spec.seed {
        args.push("-s".to_string());
    }
    if let Some(token) = spec.initial_token {
        args.extend(["-t".to_string(), token.to_string()]);
    }
    args
}
