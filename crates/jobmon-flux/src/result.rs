//! Grouping of parsed records into per-entity series.

use crate::error::FluxError;
use jobmon_core::{FluxValue, QueryResult, SeriesMap};

/// Group records by the value of `key`, keeping record order per group.
///
/// Fails if a record lacks the column.
pub fn group_by_key(records: Vec<QueryResult>, key: &str) -> Result<SeriesMap, FluxError> {
    let mut series = SeriesMap::new();
    for record in records {
        let group = match record.get(key) {
            Some(FluxValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(FluxError::MissingColumn(key.to_string())),
        };
        series.entry(group).or_default().push(record);
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, value: f64) -> QueryResult {
        let mut r = QueryResult::new();
        r.insert("hostname".to_string(), FluxValue::String(host.to_string()));
        r.insert("_value".to_string(), FluxValue::Double(value));
        r
    }

    #[test]
    fn test_group_by_hostname() {
        let records = vec![
            record("n01", 1.0),
            record("n02", 2.0),
            record("n01", 3.0),
        ];
        let series = group_by_key(records, "hostname").unwrap();
        assert_eq!(series.len(), 2);
        let n01: Vec<_> = series["n01"].iter().map(|r| r["_value"].as_f64()).collect();
        assert_eq!(n01, vec![Some(1.0), Some(3.0)]);
        assert_eq!(series["n02"].len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let err = group_by_key(vec![record("n01", 1.0)], "cpu").unwrap_err();
        assert!(matches!(err, FluxError::MissingColumn(k) if k == "cpu"));
    }
}
