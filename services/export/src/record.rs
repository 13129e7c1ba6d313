//! Metric records and the naming rules derived from them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource label carrying the instance id (compute and container records)
pub const INSTANCE_ID_LABEL: &str = "instance_id";
/// Metric label carrying the instance name (compute records)
pub const INSTANCE_NAME_LABEL: &str = "instance_name";
/// Resource label carrying the cluster name (container records)
pub const CLUSTER_NAME_LABEL: &str = "cluster_name";

const COMPUTE_METRIC_PREFIX: &str = "compute.googleapis.com/instance";
const CONTAINER_METRIC_PREFIX: &str = "container.googleapis.com/container";

/// One time series as returned by the metrics source.
///
/// The field layout follows the Cloud Monitoring `TimeSeries` JSON so a staged
/// record file can be read back by anything that understands that format.
/// Label maps are ordered, which keeps the serialized form canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    /// Metric type and metric labels
    pub metric: Metric,
    /// Monitored resource type and resource labels
    pub resource: MonitoredResource,
    /// GAUGE, DELTA or CUMULATIVE
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metric_kind: String,
    /// BOOL, INT64, DOUBLE, STRING or DISTRIBUTION
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value_type: String,
    /// Data points, newest first
    #[serde(default)]
    pub points: Vec<Point>,
    /// Every other field of the series (`metadata`, `unit`, `description`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub interval: PointInterval,
    /// Typed value, kept opaque (`{"doubleValue": 0.5}`, `{"int64Value": "3"}`, ...)
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointInterval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    pub end_time: String,
}

impl MetricRecord {
    /// Look up a resource label
    pub fn resource_label(&self, key: &str) -> Option<&str> {
        self.resource.labels.get(key).map(String::as_str)
    }

    /// Look up a metric label
    pub fn metric_label(&self, key: &str) -> Option<&str> {
        self.metric.labels.get(key).map(String::as_str)
    }

    /// Canonical serialized form, as written to the staging file
    pub fn to_canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Which of the two correlated metric families a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Per-instance metrics (`compute.googleapis.com/instance/...`)
    Compute,
    /// Per-container metrics (`container.googleapis.com/container/...`)
    Container,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Compute => "compute",
            MetricKind::Container => "container",
        }
    }

    /// Classify a metric type; metrics of any other family are not exported
    pub fn classify(metric_type: &str) -> Option<Self> {
        if metric_type.contains(COMPUTE_METRIC_PREFIX) {
            Some(MetricKind::Compute)
        } else if metric_type.contains(CONTAINER_METRIC_PREFIX) {
            Some(MetricKind::Container)
        } else {
            None
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric descriptor as listed by the metrics source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    /// Full resource name (`projects/{p}/metricDescriptors/{type}`)
    #[serde(default)]
    pub name: String,
    /// Metric type (`compute.googleapis.com/instance/cpu/utilization`)
    #[serde(rename = "type")]
    pub metric_type: String,
}

/// Query window shared by every metric of one export run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TimeInterval {
    /// Window ending at `end` and reaching back `lookback`
    pub fn lookback(end: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start_time: end - lookback,
            end_time: end,
        }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_time.to_rfc3339(), self.end_time.to_rfc3339())
    }
}

/// Metric type made safe for object and file names (`/` becomes `_`)
pub fn normalize_metric_name(metric_type: &str) -> String {
    metric_type.replace('/', "_")
}

/// Name of the `object_count`-th archive object of a metric
///
/// Format: `{kind}-{normalized metric type}{object_count}`
pub fn object_name(kind: MetricKind, metric_type: &str, object_count: u64) -> String {
    format!(
        "{}-{}{}",
        kind.as_str(),
        normalize_metric_name(metric_type),
        object_count
    )
}

/// Name of the `count`-th staged record file of a metric
pub fn staged_file_name(metric_type: &str, count: u64) -> String {
    format!("{}-{}", normalize_metric_name(metric_type), count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deserialize_time_series() {
        let json = r#"{
            "metric": {
                "type": "compute.googleapis.com/instance/cpu/utilization",
                "labels": {"instance_name": "node-a"}
            },
            "resource": {
                "type": "gce_instance",
                "labels": {"instance_id": "vm-1", "zone": "us-central1-a"}
            },
            "metricKind": "GAUGE",
            "valueType": "DOUBLE",
            "points": [{
                "interval": {"endTime": "2024-01-15T10:30:00Z"},
                "value": {"doubleValue": 0.25}
            }]
        }"#;

        let record: MetricRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.metric_label(INSTANCE_NAME_LABEL), Some("node-a"));
        assert_eq!(record.resource_label(INSTANCE_ID_LABEL), Some("vm-1"));
        assert_eq!(record.resource_label(CLUSTER_NAME_LABEL), None);
        assert_eq!(record.points.len(), 1);
        assert_eq!(record.metric_kind, "GAUGE");
    }

    #[test]
    fn test_unmodelled_fields_survive_staging() {
        let json = r#"{
            "metric": {"type": "compute.googleapis.com/instance/cpu/utilization",
                       "labels": {"instance_name": "node-a"}},
            "resource": {"type": "gce_instance", "labels": {"instance_id": "vm-1"}},
            "metadata": {
                "systemLabels": {"machine_type": "n1-standard-4", "spot": false},
                "userLabels": {"team": "infra"}
            },
            "metricKind": "GAUGE",
            "valueType": "DOUBLE",
            "unit": "10^2.%",
            "description": "CPU utilization",
            "points": [{"interval": {"endTime": "2024-01-15T10:30:00Z"},
                        "value": {"doubleValue": 0.5}}]
        }"#;

        let record: MetricRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra["unit"], "10^2.%");

        let staged: serde_json::Value =
            serde_json::from_slice(&record.to_canonical_json().unwrap()).unwrap();
        let original: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(staged, original);
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let mut record = MetricRecord {
            metric: Metric {
                metric_type: "m".to_string(),
                labels: BTreeMap::new(),
            },
            resource: MonitoredResource::default(),
            metric_kind: String::new(),
            value_type: String::new(),
            points: vec![],
            extra: BTreeMap::new(),
        };
        record.resource.labels.insert("b".to_string(), "2".to_string());
        record.resource.labels.insert("a".to_string(), "1".to_string());

        let first = record.to_canonical_json().unwrap();
        let second = record.clone().to_canonical_json().unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());
    }

    #[test]
    fn test_classify_metric_kind() {
        assert_eq!(
            MetricKind::classify("compute.googleapis.com/instance/cpu/utilization"),
            Some(MetricKind::Compute)
        );
        assert_eq!(
            MetricKind::classify("container.googleapis.com/container/memory/bytes_used"),
            Some(MetricKind::Container)
        );
        assert_eq!(MetricKind::classify("pubsub.googleapis.com/topic/send_message_operation_count"), None);
        assert_eq!(MetricKind::classify("compute.googleapis.com/firewall/dropped_packets_count"), None);
    }

    #[test]
    fn test_object_name() {
        assert_eq!(
            object_name(
                MetricKind::Compute,
                "compute.googleapis.com/instance/cpu/utilization",
                1
            ),
            "compute-compute.googleapis.com_instance_cpu_utilization1"
        );
        assert_eq!(
            object_name(MetricKind::Container, "container.googleapis.com/container/uptime", 12),
            "container-container.googleapis.com_container_uptime12"
        );
    }

    #[test]
    fn test_staged_file_name() {
        assert_eq!(
            staged_file_name("compute.googleapis.com/instance/cpu/utilization", 3),
            "compute.googleapis.com_instance_cpu_utilization-3"
        );
    }

    #[test]
    fn test_lookback_interval() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let interval = TimeInterval::lookback(end, Duration::days(42));
        assert_eq!(interval.end_time, end);
        assert_eq!(
            interval.start_time,
            Utc.with_ymd_and_hms(2024, 1, 19, 0, 0, 0).unwrap()
        );
    }
}
