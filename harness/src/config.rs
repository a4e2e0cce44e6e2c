// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the harness configuration file

use crate::executor::SshOptions;
use crate::failure::FailureMode;
use crate::fanout::FanOutLimits;
use crate::fanout::DEFAULT_MAX_PARALLELISM;
use crate::lifecycle::PartialPolicy;
use crate::lifecycle::VerifyPolicy;
use crate::topology::ClusterLayout;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the harness
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Which nodes make up the cluster and how to reach them.
    pub cluster: ClusterConfig,
    /// Where the storage software lives on every node.
    pub hadoop: HadoopConfig,
    /// Management endpoints.
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub results: ResultsConfig,
    /// The workload submitted during the load phase, if any.
    #[serde(default)]
    pub workload: Option<WorkloadConfig>,
    #[serde(default)]
    pub experiment: ExperimentConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed = Config::from_toml(&file_contents)
            .map_err(|err| match err {
                ParseOrInvalid::Parse(err) => {
                    LoadError::Parse { path: path.into(), err }
                }
                ParseOrInvalid::Invalid(err) => {
                    LoadError::Invalid { path: path.into(), err }
                }
            })?;
        Ok(config_parsed)
    }

    fn from_toml(contents: &str) -> Result<Config, ParseOrInvalid> {
        let config: Config =
            toml::from_str(contents).map_err(ParseOrInvalid::Parse)?;
        config.validate().map_err(ParseOrInvalid::Invalid)?;
        Ok(config)
    }

    /// Checks constraints that the TOML schema can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        let mut seen = BTreeSet::new();
        for node in &self.cluster.nodes {
            if !seen.insert(node) {
                return Err(ConfigError::DuplicateNode(node.clone()));
            }
        }
        if !self.telemetry.datanode_url.contains(DATANODE_HOST_PLACEHOLDER) {
            return Err(ConfigError::DatanodeUrlTemplate(
                self.telemetry.datanode_url.clone(),
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.lifecycle.verify_attempts == 0 {
            return Err(ConfigError::ZeroVerifyAttempts);
        }
        Ok(())
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            user: self.cluster.ssh_user.clone(),
            connect_timeout: Duration::from_secs(
                self.cluster.ssh_connect_timeout_secs,
            ),
            extra_args: self.cluster.ssh_extra_args.clone(),
        }
    }

    pub fn fan_out_limits(&self) -> FanOutLimits {
        FanOutLimits::new(
            self.cluster.max_parallelism,
            Duration::from_secs(self.cluster.command_timeout_secs),
        )
    }

    pub fn layout(&self) -> ClusterLayout {
        ClusterLayout {
            conf_dir: self.hadoop.conf_dir(),
            data_root: self.hadoop.data_root.clone(),
            name_dir: self.hadoop.name_dir.clone(),
            rpc_port: self.hadoop.rpc_port,
            replication: self.hadoop.replication,
            heartbeat_recheck_ms: self.hadoop.heartbeat_recheck_ms,
        }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            attempts: self.lifecycle.verify_attempts,
            interval: Duration::from_secs(self.lifecycle.verify_interval_secs),
        }
    }

    pub fn partial_policy(&self) -> PartialPolicy {
        if self.lifecycle.accept_partial {
            PartialPolicy::Accept
        } else {
            PartialPolicy::Refuse
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    pub fn poll_max_wait(&self) -> Duration {
        Duration::from_secs(self.poll.max_wait_secs)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry.timeout_secs)
    }
}

const DATANODE_HOST_PLACEHOLDER: &str = "{host}";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Every node, control plane first.
    pub nodes: Vec<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,
    #[serde(default)]
    pub ssh_extra_args: Vec<String>,
    /// Upper bound on any single remote command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default = "default_min_block_size")]
    pub min_block_size: u64,
}

fn default_ssh_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

fn default_min_block_size() -> u64 {
    65536
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HadoopConfig {
    /// Installation prefix; `bin/` and `sbin/` live beneath it.
    pub home: Utf8PathBuf,
    /// Defaults to `<home>/etc/hadoop`.
    #[serde(default)]
    pub conf_dir: Option<Utf8PathBuf>,
    /// Storage units are `<data_root>/unit<i>`.
    pub data_root: Utf8PathBuf,
    pub name_dir: Utf8PathBuf,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_datanode_ipc_port")]
    pub datanode_ipc_port: u16,
    #[serde(default = "default_replication")]
    pub replication: u32,
    #[serde(default = "default_heartbeat_recheck_ms")]
    pub heartbeat_recheck_ms: u64,
}

impl HadoopConfig {
    pub fn conf_dir(&self) -> Utf8PathBuf {
        self.conf_dir
            .clone()
            .unwrap_or_else(|| self.home.join("etc").join("hadoop"))
    }
}

fn default_rpc_port() -> u16 {
    8020
}

fn default_datanode_ipc_port() -> u16 {
    9867
}

fn default_replication() -> u32 {
    3
}

fn default_heartbeat_recheck_ms() -> u64 {
    15_000
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// The control plane's JMX endpoint, e.g. `http://nn:9870/jmx`.
    pub namenode_url: String,
    /// A worker's JMX endpoint, with `{host}` standing for the worker.
    pub datanode_url: String,
    #[serde(default = "default_telemetry_timeout_secs")]
    pub timeout_secs: u64,
}

impl TelemetryConfig {
    pub fn datanode_url_for(&self, host: &str) -> String {
        self.datanode_url.replace(DATANODE_HOST_PLACEHOLDER, host)
    }
}

fn default_telemetry_timeout_secs() -> u64 {
    5
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    /// Restart even when configuration reached only some nodes.
    #[serde(default)]
    pub accept_partial: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            verify_attempts: default_verify_attempts(),
            verify_interval_secs: default_verify_interval_secs(),
            accept_partial: false,
        }
    }
}

fn default_verify_attempts() -> u32 {
    30
}

fn default_verify_interval_secs() -> u64 {
    2
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_poll_max_wait_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_max_wait_secs() -> u64 {
    600
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResultsConfig {
    pub root: Utf8PathBuf,
}

impl ResultsConfig {
    pub fn monitor_pid_file(&self) -> Utf8PathBuf {
        self.root.join("monitor.pid")
    }

    /// Where the background monitor appends its samples.
    pub fn monitor_csv(&self) -> Utf8PathBuf {
        self.root.join("monitor.csv")
    }
}

/// A black-box job run on the control plane.  `{input}` and `{output}` in
/// `command` are replaced with the configured paths.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub command: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default = "default_workload_timeout_secs")]
    pub timeout_secs: u64,
}

impl WorkloadConfig {
    pub fn render(&self) -> String {
        let mut command = self.command.clone();
        if let Some(input) = &self.input {
            command = command.replace("{input}", input);
        }
        if let Some(output) = &self.output {
            command = command.replace("{output}", output);
        }
        command
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_workload_timeout_secs() -> u64 {
    3600
}

/// Sweep bounds and knobs for the experiment kinds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub block_size_start: u64,
    pub block_size_max: u64,
    pub units_start: u32,
    pub units_max: u32,
    /// Held fixed while another parameter is swept.
    pub default_block_size: u64,
    pub default_units: u32,
    /// Samples taken during the measure phase.
    pub measure_samples: u32,
    pub measure_interval_secs: u64,
    pub failure_mode: FailureMode,
    pub failure_count: u32,
    /// Ask the worker to reload its volumes after recovery.
    pub reconfigure_on_recover: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            block_size_start: 1 << 20,
            block_size_max: 128 << 20,
            units_start: 1,
            units_max: 8,
            default_block_size: 128 << 20,
            default_units: 1,
            measure_samples: 3,
            measure_interval_secs: 5,
            failure_mode: FailureMode::Soft,
            failure_count: 1,
            reconfigure_on_recover: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster.nodes must name at least one node")]
    NoNodes,
    #[error("node {0:?} is listed more than once")]
    DuplicateNode(String),
    #[error("telemetry.datanode_url {0:?} must contain \"{{host}}\"")]
    DatanodeUrlTemplate(String),
    #[error("poll.interval_ms must be positive")]
    ZeroPollInterval,
    #[error("lifecycle.verify_attempts must be positive")]
    ZeroVerifyAttempts,
}

enum ParseOrInvalid {
    Parse(toml::de::Error),
    Invalid(ConfigError),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration in \"{path}\": {err}")]
    Invalid {
        path: Utf8PathBuf,
        #[source]
        err: ConfigError,
    },
}
