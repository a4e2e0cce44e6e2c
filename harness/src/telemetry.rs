// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sampling the cluster's management endpoint.
//!
//! The endpoint serves a JMX dump shaped like `{"beans": [{"name": ...}]}`.
//! Which beans exist, and which fields they carry, has changed across
//! releases, so every metric is looked up through an ordered list of
//! candidate sources.  A metric whose sources are all missing is recorded as
//! unavailable; it never fails the sample as a whole.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use slog::debug;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// The metrics extracted from every sample.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeapUsed,
    HeapMax,
    BlockCount,
    FileCount,
    CapacityTotal,
    CapacityUsed,
    UnderReplicatedCount,
    StorageCount,
    LiveNodeCount,
    VolumeFailures,
}

impl Metric {
    pub const ALL: [Metric; 10] = [
        Metric::HeapUsed,
        Metric::HeapMax,
        Metric::BlockCount,
        Metric::FileCount,
        Metric::CapacityTotal,
        Metric::CapacityUsed,
        Metric::UnderReplicatedCount,
        Metric::StorageCount,
        Metric::LiveNodeCount,
        Metric::VolumeFailures,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HeapUsed => "heap_used",
            Metric::HeapMax => "heap_max",
            Metric::BlockCount => "block_count",
            Metric::FileCount => "file_count",
            Metric::CapacityTotal => "capacity_total",
            Metric::CapacityUsed => "capacity_used",
            Metric::UnderReplicatedCount => "under_replicated_count",
            Metric::StorageCount => "storage_count",
            Metric::LiveNodeCount => "live_node_count",
            Metric::VolumeFailures => "volume_failures",
        }
    }

    fn sources(&self) -> &'static [Source] {
        match self {
            Metric::HeapUsed => HEAP_USED,
            Metric::HeapMax => HEAP_MAX,
            Metric::BlockCount => BLOCK_COUNT,
            Metric::FileCount => FILE_COUNT,
            Metric::CapacityTotal => CAPACITY_TOTAL,
            Metric::CapacityUsed => CAPACITY_USED,
            Metric::UnderReplicatedCount => UNDER_REPLICATED,
            Metric::StorageCount => STORAGE_COUNT,
            Metric::LiveNodeCount => LIVE_NODE_COUNT,
            Metric::VolumeFailures => VOLUME_FAILURES,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown metric {0:?}")]
pub struct UnknownMetric(String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Metric, UnknownMetric> {
        Metric::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_owned()))
    }
}

/// One metric's value within a sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Available(f64),
    Unavailable,
}

/// One poll of the management endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    values: BTreeMap<Metric, MetricValue>,
    software_version: Option<String>,
    malformed: bool,
}

impl TelemetrySample {
    /// The metric's value, or zero if it was unavailable.
    pub fn get(&self, metric: Metric) -> f64 {
        self.value(metric).unwrap_or(0.0)
    }

    /// The metric's value, if the endpoint reported it.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match self.values.get(&metric) {
            Some(MetricValue::Available(value)) => Some(*value),
            Some(MetricValue::Unavailable) | None => None,
        }
    }

    pub fn is_available(&self, metric: Metric) -> bool {
        self.value(metric).is_some()
    }

    pub fn unavailable_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .into_iter()
            .filter(|metric| !self.is_available(*metric))
            .collect()
    }

    pub fn software_version(&self) -> Option<&str> {
        self.software_version.as_deref()
    }

    /// Whether the body could not be read as a bean document at all.
    pub fn is_malformed(&self) -> bool {
        self.malformed
    }
}

/// The endpoint could not be reached, as opposed to reporting zeros.
#[derive(Debug, Error)]
pub enum TelemetryUnavailable {
    #[error("failed to fetch telemetry from {url}")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("telemetry endpoint {url} responded with status {status}")]
    Status { url: String, status: reqwest::StatusCode },
}

/// Fetches samples over HTTP.
#[derive(Clone)]
pub struct TelemetryClient {
    log: Logger,
    client: reqwest::Client,
}

impl TelemetryClient {
    pub fn new(log: &Logger) -> TelemetryClient {
        TelemetryClient {
            log: log.new(slog::o!("component" => "TelemetryClient")),
            client: reqwest::Client::new(),
        }
    }

    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<TelemetrySample, TelemetryUnavailable> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| TelemetryUnavailable::Request {
                url: url.to_owned(),
                err,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryUnavailable::Status {
                url: url.to_owned(),
                status,
            });
        }
        let body = response.text().await.map_err(|err| {
            TelemetryUnavailable::Request { url: url.to_owned(), err }
        })?;

        let sample = parse_sample(&body, Utc::now());
        if sample.is_malformed() {
            warn!(
                self.log,
                "telemetry body is not a bean document";
                "url" => url,
                "body_len" => body.len(),
            );
        } else {
            let missing = sample.unavailable_metrics();
            if !missing.is_empty() {
                debug!(
                    self.log,
                    "some metrics unavailable";
                    "url" => url,
                    "missing" => ?missing,
                );
            }
        }
        Ok(sample)
    }

    /// A [`SampleSource`] that polls `url`.
    pub fn source(&self, url: impl Into<String>, timeout: Duration) -> EndpointSource {
        EndpointSource { client: self.clone(), url: url.into(), timeout }
    }
}

/// Anything that can produce a fresh [`TelemetrySample`] on demand.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn sample(&self) -> Result<TelemetrySample, TelemetryUnavailable>;

    /// A short description for log lines.
    fn describe(&self) -> String;
}

/// Samples one management endpoint.
#[derive(Clone)]
pub struct EndpointSource {
    client: TelemetryClient,
    url: String,
    timeout: Duration,
}

impl EndpointSource {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SampleSource for EndpointSource {
    async fn sample(&self) -> Result<TelemetrySample, TelemetryUnavailable> {
        self.client.fetch(&self.url, self.timeout).await
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Parses a management-endpoint body taken at `timestamp`.
pub fn parse_sample(body: &str, timestamp: DateTime<Utc>) -> TelemetrySample {
    let (beans, malformed) = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut document)) => match document.remove("beans") {
            Some(Value::Array(beans)) => (
                beans
                    .into_iter()
                    .filter_map(|bean| match bean {
                        Value::Object(fields) => Some(Bean::new(fields)),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
                false,
            ),
            _ => (Vec::new(), true),
        },
        _ => (Vec::new(), true),
    };

    let values = Metric::ALL
        .into_iter()
        .map(|metric| {
            let value = metric
                .sources()
                .iter()
                .find_map(|source| source.extract(&beans))
                .map_or(MetricValue::Unavailable, MetricValue::Available);
            (metric, value)
        })
        .collect();

    let software_version = VERSION_SOURCES.iter().find_map(|(pattern, field)| {
        beans
            .iter()
            .filter(|bean| bean.matches(pattern))
            .find_map(|bean| bean.fields.get(*field)?.as_str())
            .map(str::to_owned)
    });

    TelemetrySample { timestamp, values, software_version, malformed }
}

/// A bean's object name, split into its domain and key properties, e.g.
/// `Hadoop:service=NameNode,name=FSNamesystemState`.
struct Bean {
    domain: String,
    properties: BTreeMap<String, String>,
    fields: Map<String, Value>,
}

impl Bean {
    fn new(fields: Map<String, Value>) -> Bean {
        let name = fields.get("name").and_then(Value::as_str).unwrap_or("");
        let (domain, keys) = name.split_once(':').unwrap_or((name, ""));
        let domain = domain.to_owned();
        let properties = keys
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
            .collect();
        Bean { domain, properties, fields }
    }

    fn matches(&self, pattern: &BeanPattern) -> bool {
        self.domain == pattern.domain
            && pattern.properties.iter().all(|(key, value)| {
                self.properties.get(*key).map(String::as_str) == Some(*value)
            })
    }
}

struct BeanPattern {
    domain: &'static str,
    properties: &'static [(&'static str, &'static str)],
}

const MEMORY: BeanPattern =
    BeanPattern { domain: "java.lang", properties: &[("type", "Memory")] };
const JVM_METRICS: BeanPattern =
    BeanPattern { domain: "Hadoop", properties: &[("name", "JvmMetrics")] };
const NAMESYSTEM_STATE: BeanPattern = BeanPattern {
    domain: "Hadoop",
    properties: &[("name", "FSNamesystemState")],
};
const NAMESYSTEM: BeanPattern =
    BeanPattern { domain: "Hadoop", properties: &[("name", "FSNamesystem")] };
const DATANODE_INFO: BeanPattern =
    BeanPattern { domain: "Hadoop", properties: &[("name", "DataNodeInfo")] };
const NAMENODE_INFO: BeanPattern =
    BeanPattern { domain: "Hadoop", properties: &[("name", "NameNodeInfo")] };

const MIB: f64 = 1024.0 * 1024.0;

enum Extract {
    /// A number (or numeric string) at `path`, multiplied by `scale`.
    Number { path: &'static [&'static str], scale: f64 },
    /// The number of entries in an object, possibly JSON-encoded in a string.
    EntryCount { field: &'static str },
    /// The sum of `inner` across every entry of an object, possibly
    /// JSON-encoded in a string.
    EntrySum { field: &'static str, inner: &'static str },
}

struct Source {
    bean: BeanPattern,
    extract: Extract,
}

impl Source {
    const fn number(bean: BeanPattern, path: &'static [&'static str]) -> Source {
        Source { bean, extract: Extract::Number { path, scale: 1.0 } }
    }

    const fn mebibytes(bean: BeanPattern, field: &'static [&'static str]) -> Source {
        Source { bean, extract: Extract::Number { path: field, scale: MIB } }
    }

    fn extract(&self, beans: &[Bean]) -> Option<f64> {
        beans
            .iter()
            .filter(|bean| bean.matches(&self.bean))
            .find_map(|bean| match &self.extract {
                Extract::Number { path, scale } => {
                    let (first, rest) = path.split_first()?;
                    let value = rest
                        .iter()
                        .try_fold(bean.fields.get(*first)?, |value, key| {
                            value.get(*key)
                        })?;
                    Some(as_number(value)? * scale)
                }
                Extract::EntryCount { field } => {
                    let entries = as_object(bean.fields.get(*field)?)?;
                    Some(entries.len() as f64)
                }
                Extract::EntrySum { field, inner } => {
                    let entries = as_object(bean.fields.get(*field)?)?;
                    let values: Vec<f64> = entries
                        .values()
                        .filter_map(|entry| as_number(entry.get(*inner)?))
                        .collect();
                    if values.is_empty() && !entries.is_empty() {
                        None
                    } else {
                        Some(values.iter().sum())
                    }
                }
            })
    }
}

const HEAP_USED: &[Source] = &[
    Source::number(MEMORY, &["HeapMemoryUsage", "used"]),
    Source::mebibytes(JVM_METRICS, &["MemHeapUsedM"]),
];
const HEAP_MAX: &[Source] = &[
    Source::number(MEMORY, &["HeapMemoryUsage", "max"]),
    Source::mebibytes(JVM_METRICS, &["MemHeapMaxM"]),
];
const BLOCK_COUNT: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["BlocksTotal"]),
    Source::number(NAMESYSTEM, &["BlocksTotal"]),
];
const FILE_COUNT: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["FilesTotal"]),
    Source::number(NAMESYSTEM, &["FilesTotal"]),
];
const CAPACITY_TOTAL: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["CapacityTotal"]),
    Source::number(NAMESYSTEM, &["CapacityTotal"]),
];
const CAPACITY_USED: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["CapacityUsed"]),
    Source::number(NAMESYSTEM, &["CapacityUsed"]),
];
const UNDER_REPLICATED: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["UnderReplicatedBlocks"]),
    Source::number(NAMESYSTEM, &["UnderReplicatedBlocks"]),
    Source::number(NAMESYSTEM, &["LowRedundancyBlocks"]),
];
const STORAGE_COUNT: &[Source] = &[
    Source {
        bean: DATANODE_INFO,
        extract: Extract::EntryCount { field: "VolumeInfo" },
    },
    Source {
        bean: NAMENODE_INFO,
        extract: Extract::EntrySum { field: "LiveNodes", inner: "numVolumes" },
    },
];
const LIVE_NODE_COUNT: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["NumLiveDataNodes"]),
    Source::number(NAMESYSTEM, &["NumLiveDataNodes"]),
    Source {
        bean: NAMENODE_INFO,
        extract: Extract::EntryCount { field: "LiveNodes" },
    },
];
const VOLUME_FAILURES: &[Source] = &[
    Source::number(NAMESYSTEM_STATE, &["VolumeFailuresTotal"]),
    Source::number(NAMESYSTEM, &["VolumeFailuresTotal"]),
];

const VERSION_SOURCES: &[(BeanPattern, &str)] =
    &[(NAMENODE_INFO, "SoftwareVersion"), (DATANODE_INFO, "Version")];

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(entries) => Some(entries.clone()),
        Value::String(text) => match serde_json::from_str(text).ok()? {
            Value::Object(entries) => Some(entries),
            _ => None,
        },
        _ => None,
    }
}
