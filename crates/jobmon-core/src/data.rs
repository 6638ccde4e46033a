//! Datasets served to clients.

use crate::config::MetricConfig;
use crate::job::Job;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed cell of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FluxValue {
    Null,
    Bool(bool),
    Long(i64),
    UnsignedLong(u64),
    Double(f64),
    Time(DateTime<Utc>),
    String(String),
}

impl FluxValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Long(v) => Some(*v as f64),
            Self::UnsignedLong(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FluxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::UnsignedLong(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// One record of a query result, column name to value.
pub type QueryResult = BTreeMap<String, FluxValue>;

/// Records grouped by entity (host, cpu, quantile, ...).
pub type SeriesMap = BTreeMap<String, Vec<QueryResult>>;

/// Time series of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricData {
    pub config: MetricConfig,
    /// Parsed series, set unless raw data was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SeriesMap>,
    /// Annotated CSV as returned by the backend, set for raw requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

impl MetricData {
    pub fn parsed(config: MetricConfig, data: SeriesMap) -> Self {
        Self {
            config,
            data: Some(data),
            raw_data: None,
        }
    }

    pub fn raw(config: MetricConfig, raw: String) -> Self {
        Self {
            config,
            data: None,
            raw_data: Some(raw),
        }
    }
}

/// Quantile series of one metric across all of a job's nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QuantileData {
    pub config: MetricConfig,
    pub quantiles: Vec<String>,
    pub data: SeriesMap,
}

/// Everything served for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobData {
    pub metadata: Job,
    pub metric_data: Vec<MetricData>,
    pub quantile_data: Vec<QuantileData>,
    /// Seconds
    pub sample_interval: f64,
    /// Selectable intervals in seconds
    pub sample_intervals: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flux_value_accessors() {
        assert_eq!(FluxValue::Double(1.5).as_f64(), Some(1.5));
        assert_eq!(FluxValue::Long(-2).as_f64(), Some(-2.0));
        assert_eq!(FluxValue::String("x".into()).as_f64(), None);
        assert_eq!(FluxValue::String("n01".into()).as_str(), Some("n01"));
        assert_eq!(FluxValue::Null.to_string(), "");
    }

    #[test]
    fn test_metric_data_omits_unset_payload() {
        let md = MetricData::raw(MetricConfig::default(), "#datatype,string".to_string());
        let value = serde_json::to_value(&md).unwrap();
        assert_eq!(value["RawData"], "#datatype,string");
        assert!(value.get("Data").is_none());
    }
}
