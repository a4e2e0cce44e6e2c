// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders for management-endpoint (`/jmx`) response bodies.

use serde_json::json;
use serde_json::Value;

/// Values reported by the NameNode's `FSNamesystemState` bean.
#[derive(Clone, Debug, Default)]
pub struct NamesystemState {
    pub blocks: u64,
    pub files: u64,
    pub capacity_total: u64,
    pub capacity_used: u64,
    pub under_replicated: u64,
    pub live_datanodes: u64,
    pub volume_failures: u64,
}

/// Accumulates beans and renders a `{"beans": [...]}` document.
#[derive(Clone, Debug, Default)]
pub struct BeansBuilder {
    beans: Vec<Value>,
}

impl BeansBuilder {
    pub fn new() -> BeansBuilder {
        BeansBuilder::default()
    }

    /// The platform memory bean, reporting bytes.
    pub fn memory(mut self, heap_used: u64, heap_max: u64) -> BeansBuilder {
        self.beans.push(json!({
            "name": "java.lang:type=Memory",
            "modelerType": "sun.management.MemoryImpl",
            "HeapMemoryUsage": {
                "committed": heap_max,
                "init": heap_max / 4,
                "max": heap_max,
                "used": heap_used,
            },
            "ObjectPendingFinalizationCount": 0,
        }));
        self
    }

    /// The older `JvmMetrics` bean, reporting mebibytes.
    pub fn jvm_metrics(mut self, used_mb: f64, max_mb: f64) -> BeansBuilder {
        self.beans.push(json!({
            "name": "Hadoop:service=NameNode,name=JvmMetrics",
            "modelerType": "JvmMetrics",
            "MemHeapUsedM": used_mb,
            "MemHeapMaxM": max_mb,
        }));
        self
    }

    pub fn namesystem_state(mut self, state: &NamesystemState) -> BeansBuilder {
        self.beans.push(json!({
            "name": "Hadoop:service=NameNode,name=FSNamesystemState",
            "modelerType": "org.apache.hadoop.hdfs.server.namenode.FSNamesystem",
            "BlocksTotal": state.blocks,
            "FilesTotal": state.files,
            "CapacityTotal": state.capacity_total,
            "CapacityUsed": state.capacity_used,
            "UnderReplicatedBlocks": state.under_replicated,
            "NumLiveDataNodes": state.live_datanodes,
            "NumDeadDataNodes": 0,
            "VolumeFailuresTotal": state.volume_failures,
            "FSState": "Operational",
        }));
        self
    }

    /// The `FSNamesystem` bean as reported by newer releases, where
    /// under-replication is called "low redundancy" and counters are strings.
    pub fn namesystem(mut self, state: &NamesystemState) -> BeansBuilder {
        self.beans.push(json!({
            "name": "Hadoop:service=NameNode,name=FSNamesystem",
            "modelerType": "FSNamesystem",
            "tag.HAState": "active",
            "BlocksTotal": state.blocks.to_string(),
            "FilesTotal": state.files.to_string(),
            "CapacityTotal": state.capacity_total.to_string(),
            "CapacityUsed": state.capacity_used.to_string(),
            "LowRedundancyBlocks": state.under_replicated.to_string(),
        }));
        self
    }

    /// A DataNode's `DataNodeInfo` bean; `VolumeInfo` is a JSON-encoded
    /// string keyed by volume directory.
    pub fn datanode_volumes(mut self, volumes: &[&str]) -> BeansBuilder {
        let info: serde_json::Map<String, Value> = volumes
            .iter()
            .map(|volume| {
                (
                    volume.to_string(),
                    json!({
                        "usedSpace": 4096,
                        "freeSpace": 1 << 30,
                        "reservedSpace": 0,
                        "numBlocks": 1,
                    }),
                )
            })
            .collect();
        self.beans.push(json!({
            "name": "Hadoop:service=DataNode,name=DataNodeInfo",
            "modelerType": "org.apache.hadoop.hdfs.server.datanode.DataNode",
            "Version": "3.3.6",
            "VolumeInfo": Value::Object(info).to_string(),
        }));
        self
    }

    /// The NameNode's `NameNodeInfo` bean with a `LiveNodes` entry per
    /// worker, each reporting `numVolumes`.
    pub fn live_nodes(mut self, nodes: &[(&str, u64)]) -> BeansBuilder {
        let live: serde_json::Map<String, Value> = nodes
            .iter()
            .map(|(node, volumes)| {
                (
                    format!("{node}:9866"),
                    json!({
                        "infoAddr": format!("{node}:9864"),
                        "adminState": "In Service",
                        "numVolumes": volumes,
                        "volfails": 0,
                    }),
                )
            })
            .collect();
        self.beans.push(json!({
            "name": "Hadoop:service=NameNode,name=NameNodeInfo",
            "modelerType": "org.apache.hadoop.hdfs.server.namenode.FSNamesystem",
            "SoftwareVersion": "3.3.6",
            "LiveNodes": Value::Object(live).to_string(),
        }));
        self
    }

    pub fn bean(mut self, bean: Value) -> BeansBuilder {
        self.beans.push(bean);
        self
    }

    pub fn build(&self) -> Value {
        json!({ "beans": self.beans })
    }

    pub fn to_body(&self) -> String {
        self.build().to_string()
    }
}
