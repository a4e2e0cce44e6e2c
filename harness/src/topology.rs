// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster topology and distributing its configuration to every node.
//!
//! A configuration that reached only some nodes is reported as
//! [`ApplyOutcome::Partial`] and must not be treated as ready: the lifecycle
//! controller refuses to restart on it unless the operator says otherwise.

use crate::executor::BoxedExecutor;
use crate::executor::Host;
use crate::fanout::fan_out;
use crate::fanout::FanOutLimits;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

pub const BLOCK_SIZE_KEY: &str = "dfs.blocksize";
pub const DATA_DIR_KEY: &str = "dfs.datanode.data.dir";
pub const NAME_DIR_KEY: &str = "dfs.namenode.name.dir";
pub const REPLICATION_KEY: &str = "dfs.replication";
pub const RPC_ADDRESS_KEY: &str = "dfs.namenode.rpc-address";
pub const FAILED_VOLUMES_TOLERATED_KEY: &str =
    "dfs.datanode.failed.volumes.tolerated";
pub const HEARTBEAT_RECHECK_KEY: &str =
    "dfs.namenode.heartbeat.recheck-interval";

const SITE_FILE: &str = "hdfs-site.xml";
const WORKERS_FILE: &str = "workers";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("a topology needs at least one node")]
    NoNodes,
    #[error("node {0:?} appears more than once")]
    DuplicateNode(String),
    #[error("each node needs at least one storage unit")]
    NoStorageUnits,
    #[error("block size {0} is not a power of two")]
    BlockSizeNotPowerOfTwo(u64),
    #[error("block size {block_size} is below the minimum of {minimum}")]
    BlockSizeTooSmall { block_size: u64, minimum: u64 },
}

/// The shape of the cluster for one sweep point.
///
/// The first node is always the control plane.  With more than one node,
/// the remaining nodes are the workers; a single node is both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Topology {
    nodes: Vec<String>,
    storage_units_per_node: u32,
    block_size: u64,
}

impl Topology {
    pub fn new(
        nodes: Vec<String>,
        storage_units_per_node: u32,
        block_size: u64,
        min_block_size: u64,
    ) -> Result<Topology, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::NoNodes);
        }
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.as_str()) {
                return Err(TopologyError::DuplicateNode(node.clone()));
            }
        }
        if storage_units_per_node == 0 {
            return Err(TopologyError::NoStorageUnits);
        }
        if !block_size.is_power_of_two() {
            return Err(TopologyError::BlockSizeNotPowerOfTwo(block_size));
        }
        if block_size < min_block_size {
            return Err(TopologyError::BlockSizeTooSmall {
                block_size,
                minimum: min_block_size,
            });
        }
        Ok(Topology { nodes, storage_units_per_node, block_size })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn control_plane(&self) -> &str {
        &self.nodes[0]
    }

    pub fn workers(&self) -> &[String] {
        if self.nodes.len() == 1 {
            &self.nodes
        } else {
            &self.nodes[1..]
        }
    }

    pub fn storage_units_per_node(&self) -> u32 {
        self.storage_units_per_node
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.nodes.iter().map(|node| Host::from_name(node)).collect()
    }

    pub fn worker_hosts(&self) -> Vec<Host> {
        self.workers().iter().map(|node| Host::from_name(node)).collect()
    }
}

/// Where configuration and persisted state live on every node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterLayout {
    pub conf_dir: Utf8PathBuf,
    pub data_root: Utf8PathBuf,
    pub name_dir: Utf8PathBuf,
    pub rpc_port: u16,
    pub replication: u32,
    pub heartbeat_recheck_ms: u64,
}

impl ClusterLayout {
    /// The directory backing storage unit `unit` on every worker.
    pub fn unit_dir(&self, unit: u32) -> Utf8PathBuf {
        self.data_root.join(format!("unit{unit}"))
    }

    pub fn unit_dirs(&self, units: u32) -> Vec<Utf8PathBuf> {
        (0..units).map(|unit| self.unit_dir(unit)).collect()
    }

    pub fn site_path(&self) -> Utf8PathBuf {
        self.conf_dir.join(SITE_FILE)
    }

    pub fn workers_path(&self) -> Utf8PathBuf {
        self.conf_dir.join(WORKERS_FILE)
    }
}

/// The property list rendered from a topology, in rendering order.
pub fn properties(
    topology: &Topology,
    layout: &ClusterLayout,
) -> Vec<(&'static str, String)> {
    let data_dirs = layout
        .unit_dirs(topology.storage_units_per_node())
        .iter()
        .map(|dir| dir.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let replication = layout
        .replication
        .min(u32::try_from(topology.workers().len()).unwrap_or(u32::MAX))
        .max(1);
    vec![
        (BLOCK_SIZE_KEY, topology.block_size().to_string()),
        (DATA_DIR_KEY, data_dirs),
        (NAME_DIR_KEY, layout.name_dir.to_string()),
        (REPLICATION_KEY, replication.to_string()),
        (
            RPC_ADDRESS_KEY,
            format!("{}:{}", topology.control_plane(), layout.rpc_port),
        ),
        (
            FAILED_VOLUMES_TOLERATED_KEY,
            (topology.storage_units_per_node() - 1).to_string(),
        ),
        (HEARTBEAT_RECHECK_KEY, layout.heartbeat_recheck_ms.to_string()),
    ]
}

/// Renders the site configuration document for `topology`.
pub fn render_site_config(topology: &Topology, layout: &ClusterLayout) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <?xml-stylesheet type=\"text/xsl\" href=\"configuration.xsl\"?>\n\
         <configuration>\n",
    );
    for (name, value) in properties(topology, layout) {
        out.push_str(&format!(
            "  <property>\n    <name>{}</name>\n    <value>{}</value>\n  </property>\n",
            escape(name),
            escape(value.as_str()),
        ));
    }
    out.push_str("</configuration>\n");
    out
}

/// Renders the list of worker hosts, one per line.
pub fn render_workers(topology: &Topology) -> String {
    let mut out = topology.workers().join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Error)]
#[error("malformed configuration document: {0}")]
pub struct ParseError(String);

/// Parses a property-list document into its name/value pairs.
pub fn parse_site_config(
    text: &str,
) -> Result<BTreeMap<String, String>, ParseError> {
    enum Field {
        None,
        Name,
        Value,
    }

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut properties = BTreeMap::new();
    let mut field = Field::None;
    let mut name: Option<String> = None;
    let mut value: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"property" => {
                    name = None;
                    value = None;
                }
                b"name" => field = Field::Name,
                b"value" => field = Field::Value,
                _ => field = Field::None,
            },
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| ParseError(err.to_string()))?
                    .into_owned();
                match field {
                    Field::Name => name = Some(text),
                    Field::Value => value = Some(text),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"property" => match name.take() {
                    Some(name) => {
                        properties.insert(name, value.take().unwrap_or_default());
                    }
                    None => {
                        return Err(ParseError(String::from(
                            "property without a name",
                        )))
                    }
                },
                _ => field = Field::None,
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(ParseError(err.to_string())),
            _ => {}
        }
    }
    Ok(properties)
}

/// What a node says its configuration is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbedConfig {
    pub block_size: Option<u64>,
    pub storage_units: usize,
    pub properties: BTreeMap<String, String>,
}

impl ProbedConfig {
    fn from_properties(properties: BTreeMap<String, String>) -> ProbedConfig {
        let block_size = properties
            .get(BLOCK_SIZE_KEY)
            .and_then(|value| value.trim().parse().ok());
        let storage_units = properties
            .get(DATA_DIR_KEY)
            .map(|dirs| {
                dirs.split(',').filter(|dir| !dir.trim().is_empty()).count()
            })
            .unwrap_or(0);
        ProbedConfig { block_size, storage_units, properties }
    }

    /// Whether this node declares the block size and unit count of
    /// `topology`.
    pub fn matches(&self, topology: &Topology) -> bool {
        self.block_size == Some(topology.block_size())
            && self.storage_units
                == usize::try_from(topology.storage_units_per_node())
                    .unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("reading configuration from {host} failed: {reason}")]
    Command { host: Host, reason: String },
    #[error("configuration on {host} is unreadable")]
    Parse {
        host: Host,
        #[source]
        err: ParseError,
    },
}

/// One node that did not receive the configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub host: Host,
    pub exit_code: i32,
    pub reason: String,
}

/// How far a configuration push got.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Every node has the new configuration.
    Success,
    /// Some, but not all, nodes have it.
    Partial { failed: Vec<NodeFailure> },
    /// No node has it.
    Failure { failed: Vec<NodeFailure> },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Success)
    }

    pub fn failed_hosts(&self) -> Vec<Host> {
        match self {
            ApplyOutcome::Success => Vec::new(),
            ApplyOutcome::Partial { failed } | ApplyOutcome::Failure { failed } => {
                failed.iter().map(|failure| failure.host.clone()).collect()
            }
        }
    }
}

/// Pushes topology configuration to every node.
pub struct TopologyConfigurator {
    log: Logger,
    executor: BoxedExecutor,
    layout: ClusterLayout,
    limits: FanOutLimits,
}

impl TopologyConfigurator {
    pub fn new(
        log: &Logger,
        executor: BoxedExecutor,
        layout: ClusterLayout,
        limits: FanOutLimits,
    ) -> TopologyConfigurator {
        TopologyConfigurator {
            log: log.new(slog::o!("component" => "TopologyConfigurator")),
            executor,
            layout,
            limits,
        }
    }

    pub fn layout(&self) -> &ClusterLayout {
        &self.layout
    }

    /// Writes the configuration for `topology` to every node, in parallel.
    pub async fn apply(&self, topology: &Topology) -> ApplyOutcome {
        let site = render_site_config(topology, &self.layout);
        let workers = render_workers(topology);
        let command = push_command(&self.layout, &site, &workers);

        info!(
            self.log,
            "distributing configuration";
            "nodes" => topology.nodes().len(),
            "storage_units_per_node" => topology.storage_units_per_node(),
            "block_size" => topology.block_size(),
        );
        let hosts = topology.hosts();
        let outcomes =
            fan_out(&self.executor, &hosts, self.limits, |_| command.clone())
                .await;
        outcomes.log_failures(&self.log, "configure");

        let failed: Vec<NodeFailure> = outcomes
            .failures()
            .map(|result| NodeFailure {
                host: result.host.clone(),
                exit_code: result.exit_code,
                reason: result.failure_reason(),
            })
            .collect();
        let outcome = if failed.is_empty() {
            ApplyOutcome::Success
        } else if failed.len() == hosts.len() {
            ApplyOutcome::Failure { failed }
        } else {
            ApplyOutcome::Partial { failed }
        };
        if !outcome.is_success() {
            warn!(
                self.log,
                "configuration did not reach every node";
                "failed" => ?outcome.failed_hosts(),
            );
        }
        outcome
    }

    /// Reads back the configuration a node currently has.
    pub async fn probe(&self, node: &Host) -> Result<ProbedConfig, ProbeError> {
        let command = format!("cat {}", quote(&self.layout.site_path()));
        let result =
            self.executor.execute(node, &command, self.limits.timeout).await;
        if !result.success() {
            return Err(ProbeError::Command {
                host: node.clone(),
                reason: result.failure_reason(),
            });
        }
        let properties = parse_site_config(&result.stdout)
            .map_err(|err| ProbeError::Parse { host: node.clone(), err })?;
        Ok(ProbedConfig::from_properties(properties))
    }
}

/// Quotes a path for the remote shell.
pub(crate) fn quote(path: &Utf8Path) -> String {
    shell_words::quote(path.as_str()).into_owned()
}

/// The shell command that writes both documents into place.  Each file is
/// written beside its destination and renamed over it.
fn push_command(layout: &ClusterLayout, site: &str, workers: &str) -> String {
    let site_path = layout.site_path();
    let workers_path = layout.workers_path();
    let site_tmp = Utf8PathBuf::from(format!("{site_path}.tmp"));
    let workers_tmp = Utf8PathBuf::from(format!("{workers_path}.tmp"));
    format!(
        "mkdir -p {dir} && printf '%s' {site} > {site_tmp} && \
         mv {site_tmp} {site_path} && printf '%s' {workers} > {workers_tmp} && \
         mv {workers_tmp} {workers_path}",
        dir = quote(&layout.conf_dir),
        site = shell_words::quote(site),
        site_tmp = quote(&site_tmp),
        site_path = quote(&site_path),
        workers = shell_words::quote(workers),
        workers_tmp = quote(&workers_tmp),
        workers_path = quote(&workers_path),
    )
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::executor::FakeExecutor;
    use crate::executor::FakeResponse;
    use crate::executor::HostExecutor;
    use crate::executor::SshOptions;
    use camino_tempfile::Utf8TempDir;
    use dfs_harness_test_utils::dev::test_setup_log;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) fn layout(root: &Utf8Path) -> ClusterLayout {
        ClusterLayout {
            conf_dir: root.join("conf"),
            data_root: root.join("data"),
            name_dir: root.join("name"),
            rpc_port: 8020,
            replication: 3,
            heartbeat_recheck_ms: 15_000,
        }
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    /// A fake in which every node keeps the last configuration pushed to it,
    /// so `cat` returns what was written.
    fn remembering_executor(
        log: &Logger,
        unreachable: &'static [&'static str],
    ) -> Arc<FakeExecutor> {
        let fake = FakeExecutor::new(log);
        let files: Arc<Mutex<HashMap<Host, String>>> = Arc::default();
        fake.set_handler(move |host, command| {
            if unreachable.iter().any(|name| *name == host.address()) {
                return FakeResponse::failure(255, "ssh: connect to host: No route to host");
            }
            let mut files = files.lock().unwrap();
            if command.starts_with("cat ") {
                match files.get(host) {
                    Some(site) => FakeResponse::stdout(site.clone()),
                    None => FakeResponse::failure(1, "No such file or directory"),
                }
            } else {
                // Recover the site document from the quoted `printf` argument.
                let words = shell_words::split(command).expect("valid quoting");
                let site = words
                    .iter()
                    .skip_while(|word| *word != "%s")
                    .nth(1)
                    .expect("push command carries the document")
                    .clone();
                files.insert(host.clone(), site);
                FakeResponse::success()
            }
        });
        fake
    }

    #[test]
    fn test_topology_validation() {
        let ok = Topology::new(nodes(&["nn", "dn1"]), 4, 131072, 65536);
        assert!(ok.is_ok());

        assert_eq!(
            Topology::new(Vec::new(), 1, 131072, 65536),
            Err(TopologyError::NoNodes)
        );
        assert_eq!(
            Topology::new(nodes(&["nn", "dn1", "nn"]), 1, 131072, 65536),
            Err(TopologyError::DuplicateNode(String::from("nn")))
        );
        assert_eq!(
            Topology::new(nodes(&["nn"]), 0, 131072, 65536),
            Err(TopologyError::NoStorageUnits)
        );
        assert_eq!(
            Topology::new(nodes(&["nn"]), 1, 100_000, 65536),
            Err(TopologyError::BlockSizeNotPowerOfTwo(100_000))
        );
        assert_eq!(
            Topology::new(nodes(&["nn"]), 1, 32768, 65536),
            Err(TopologyError::BlockSizeTooSmall {
                block_size: 32768,
                minimum: 65536
            })
        );
    }

    #[test]
    fn test_workers() {
        let single = Topology::new(nodes(&["nn"]), 1, 65536, 1).unwrap();
        assert_eq!(single.control_plane(), "nn");
        assert_eq!(single.workers(), ["nn"]);

        let three = Topology::new(nodes(&["nn", "a", "b"]), 1, 65536, 1).unwrap();
        assert_eq!(three.control_plane(), "nn");
        assert_eq!(three.workers(), ["a", "b"]);
    }

    #[test]
    fn test_render_and_parse() {
        let topology =
            Topology::new(nodes(&["nn", "dn1", "dn2"]), 3, 1 << 20, 1).unwrap();
        let layout = layout(Utf8Path::new("/srv/dfs"));
        let rendered = render_site_config(&topology, &layout);
        let parsed = parse_site_config(&rendered).unwrap();

        assert_eq!(parsed[BLOCK_SIZE_KEY], "1048576");
        assert_eq!(
            parsed[DATA_DIR_KEY],
            "/srv/dfs/data/unit0,/srv/dfs/data/unit1,/srv/dfs/data/unit2"
        );
        // Replication can't exceed the number of workers.
        assert_eq!(parsed[REPLICATION_KEY], "2");
        assert_eq!(parsed[RPC_ADDRESS_KEY], "nn:8020");
        assert_eq!(parsed[FAILED_VOLUMES_TOLERATED_KEY], "2");
        assert_eq!(parsed.len(), properties(&topology, &layout).len());

        assert_eq!(render_workers(&topology), "dn1\ndn2\n");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_site_config("<configuration><property><value>1</value></property></configuration>").is_err());
        let escaped = parse_site_config(
            "<configuration><property><name>a</name><value>x &amp; y</value></property></configuration>",
        )
        .unwrap();
        assert_eq!(escaped["a"], "x & y");
    }

    #[tokio::test]
    async fn test_apply_success_and_probe_round_trip() {
        let logctx = test_setup_log("test_apply_success_and_probe_round_trip");
        let fake = remembering_executor(&logctx.log, &[]);
        let configurator = TopologyConfigurator::new(
            &logctx.log,
            fake.clone().as_executor(),
            layout(Utf8Path::new("/srv/dfs")),
            FanOutLimits::new(4, Duration::from_secs(5)),
        );

        let topology =
            Topology::new(nodes(&["A", "B"]), 4, 131072, 65536).unwrap();
        let outcome = configurator.apply(&topology).await;
        assert_eq!(outcome, ApplyOutcome::Success);

        for host in topology.hosts() {
            let probed = configurator.probe(&host).await.unwrap();
            assert_eq!(probed.block_size, Some(131072));
            assert_eq!(probed.storage_units, 4);
            assert!(probed.matches(&topology));
        }

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_apply_partial_lists_failed_node() {
        let logctx = test_setup_log("test_apply_partial_lists_failed_node");
        let fake = remembering_executor(&logctx.log, &["B"]);
        let configurator = TopologyConfigurator::new(
            &logctx.log,
            fake.as_executor(),
            layout(Utf8Path::new("/srv/dfs")),
            FanOutLimits::new(4, Duration::from_secs(5)),
        );

        let topology =
            Topology::new(nodes(&["A", "B"]), 4, 131072, 65536).unwrap();
        let outcome = configurator.apply(&topology).await;
        match &outcome {
            ApplyOutcome::Partial { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].host, Host::from_name("B"));
                assert_eq!(failed[0].exit_code, 255);
            }
            other => panic!("expected a partial outcome, got {other:?}"),
        }
        assert_eq!(outcome.failed_hosts(), vec![Host::from_name("B")]);

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_apply_failure_when_no_node_accepts() {
        let logctx = test_setup_log("test_apply_failure_when_no_node_accepts");
        let fake = remembering_executor(&logctx.log, &["A", "B"]);
        let configurator = TopologyConfigurator::new(
            &logctx.log,
            fake.as_executor(),
            layout(Utf8Path::new("/srv/dfs")),
            FanOutLimits::new(4, Duration::from_secs(5)),
        );
        let topology =
            Topology::new(nodes(&["A", "B"]), 4, 131072, 65536).unwrap();
        assert!(matches!(
            configurator.apply(&topology).await,
            ApplyOutcome::Failure { ref failed } if failed.len() == 2
        ));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_push_command_writes_files_locally() {
        let logctx = test_setup_log("test_push_command_writes_files_locally");
        let dir = Utf8TempDir::new().unwrap();
        let configurator = TopologyConfigurator::new(
            &logctx.log,
            HostExecutor::new(&logctx.log, SshOptions::default()).as_executor(),
            layout(dir.path()),
            FanOutLimits::new(4, Duration::from_secs(10)),
        );

        let topology =
            Topology::new(nodes(&["localhost"]), 2, 1 << 17, 1).unwrap();
        assert!(configurator.apply(&topology).await.is_success());
        let probed = configurator.probe(&Host::Local).await.unwrap();
        assert!(probed.matches(&topology));
        let workers =
            std::fs::read_to_string(configurator.layout().workers_path())
                .unwrap();
        assert_eq!(workers, "localhost\n");

        logctx.cleanup_successful();
    }
}
