//! Cluster → node → file index correlating container and compute metrics.
//!
//! Container records tell us which cluster an instance belongs to; compute
//! records tell us the instance's name and which staged files hold its node
//! metrics. The two families are read in independent passes, in either order,
//! so per-node data is collected in a [`NodeStageList`] and only attached to
//! its cluster by [`IndexBuilder::finish`] once both passes are complete.

use crate::record::{
    MetricKind, MetricRecord, CLUSTER_NAME_LABEL, INSTANCE_ID_LABEL, INSTANCE_NAME_LABEL,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Errors raised while correlating records
#[derive(Error, Debug, PartialEq)]
pub enum IndexError {
    #[error("Unable to find {label} in {kind} metric {metric_type}")]
    MissingLabel {
        label: &'static str,
        kind: MetricKind,
        metric_type: String,
    },

    #[error("Node {instance_id} claims cluster {cluster} which has no container metrics")]
    UnknownCluster {
        cluster: String,
        instance_id: String,
    },
}

/// Everything known about one compute instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub instance_name: String,
    pub cluster_name: String,
    /// Staged files holding this node's compute metrics, in processing order
    pub node_files: Vec<String>,
}

/// Files and nodes of one cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMapping {
    pub container_files: Vec<String>,
    /// Keyed by instance id
    pub node_infos: BTreeMap<String, NodeInfo>,
}

/// The persisted index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub clusters: BTreeMap<String, ClusterMapping>,
}

impl Index {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Look up a node by cluster and instance id
    pub fn node(&self, cluster: &str, instance_id: &str) -> Option<&NodeInfo> {
        self.clusters.get(cluster)?.node_infos.get(instance_id)
    }
}

/// Nodes seen so far, keyed by instance id, not yet attached to a cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStageList {
    pub nodes: BTreeMap<String, NodeInfo>,
}

/// Incrementally builds the [`Index`] from staged records
#[derive(Debug, Default)]
pub struct IndexBuilder {
    index: Index,
    staged: NodeStageList,
}

/// Outcome of the merge step
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedIndex {
    pub index: Index,
    /// Instance ids dropped because no cluster was ever observed for them
    pub unassigned: Vec<String>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `record` was staged as `file_name`
    pub fn observe(
        &mut self,
        kind: MetricKind,
        record: &MetricRecord,
        file_name: &str,
    ) -> Result<(), IndexError> {
        match kind {
            MetricKind::Container => self.observe_container(record, file_name),
            MetricKind::Compute => self.observe_compute(record, file_name),
        }
    }

    fn observe_container(
        &mut self,
        record: &MetricRecord,
        file_name: &str,
    ) -> Result<(), IndexError> {
        let cluster_name = required(
            record.resource_label(CLUSTER_NAME_LABEL),
            CLUSTER_NAME_LABEL,
            MetricKind::Container,
            record,
        )?;
        let instance_id = required(
            record.resource_label(INSTANCE_ID_LABEL),
            INSTANCE_ID_LABEL,
            MetricKind::Container,
            record,
        )?;

        self.index
            .clusters
            .entry(cluster_name.to_string())
            .or_default()
            .container_files
            .push(file_name.to_string());

        self.staged
            .nodes
            .entry(instance_id.to_string())
            .or_default()
            .cluster_name = cluster_name.to_string();

        Ok(())
    }

    fn observe_compute(
        &mut self,
        record: &MetricRecord,
        file_name: &str,
    ) -> Result<(), IndexError> {
        let instance_name = required(
            record.metric_label(INSTANCE_NAME_LABEL),
            INSTANCE_NAME_LABEL,
            MetricKind::Compute,
            record,
        )?;
        let instance_id = required(
            record.resource_label(INSTANCE_ID_LABEL),
            INSTANCE_ID_LABEL,
            MetricKind::Compute,
            record,
        )?;

        let node = self.staged.nodes.entry(instance_id.to_string()).or_default();
        node.instance_name = instance_name.to_string();
        node.node_files.push(file_name.to_string());

        Ok(())
    }

    /// Nodes collected so far
    pub fn staged_nodes(&self) -> &NodeStageList {
        &self.staged
    }

    /// Attach every staged node to its cluster and return the final index.
    ///
    /// Nodes without a cluster are dropped with a warning. A node naming a
    /// cluster that never appeared in container metrics is an error.
    pub fn finish(self) -> Result<FinishedIndex, IndexError> {
        let IndexBuilder { mut index, staged } = self;
        let mut unassigned = Vec::new();

        for (instance_id, node) in staged.nodes {
            if node.cluster_name.is_empty() {
                warn!(
                    instance_id = %instance_id,
                    instance_name = %node.instance_name,
                    "Node found not belonging to any cluster"
                );
                unassigned.push(instance_id);
                continue;
            }

            let cluster = index.clusters.get_mut(&node.cluster_name).ok_or_else(|| {
                IndexError::UnknownCluster {
                    cluster: node.cluster_name.clone(),
                    instance_id: instance_id.clone(),
                }
            })?;
            cluster.node_infos.insert(instance_id, node);
        }

        Ok(FinishedIndex { index, unassigned })
    }
}

fn required<'r>(
    value: Option<&'r str>,
    label: &'static str,
    kind: MetricKind,
    record: &MetricRecord,
) -> Result<&'r str, IndexError> {
    value.ok_or_else(|| IndexError::MissingLabel {
        label,
        kind,
        metric_type: record.metric.metric_type.clone(),
    })
}
