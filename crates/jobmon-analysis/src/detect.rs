//! Change points over the series of a job dataset.

use crate::changepoint::non_parametric;
use chrono::{DateTime, Utc};
use jobmon_core::{JobData, QueryResult};
use std::collections::{BTreeSet, HashMap};

/// Change point timestamps keyed by measurement.
pub type ChangePoints = HashMap<String, Vec<DateTime<Utc>>>;

const MIN_DISTANCE: usize = 1;
const QUANTILES: usize = 5;

/// `(time, value)` pairs of records that carry both.
fn points(records: &[QueryResult]) -> (Vec<DateTime<Utc>>, Vec<f64>) {
    records
        .iter()
        .filter_map(|r| {
            let time = r.get("_time")?.as_time()?;
            let value = r.get("_value")?.as_f64()?;
            Some((time, value))
        })
        .unzip()
}

/// Run change-point detection on every series of `data`.
///
/// Change points of all series of a metric are merged, sorted and
/// deduplicated. Records without a numeric value are skipped.
pub fn detect_change_points(data: &JobData) -> ChangePoints {
    let mut out = ChangePoints::new();
    for metric in &data.metric_data {
        let Some(series) = &metric.data else {
            continue;
        };
        let mut merged = BTreeSet::new();
        for records in series.values() {
            let (times, values) = points(records);
            for idx in non_parametric(&values, MIN_DISTANCE, QUANTILES) {
                merged.insert(times[idx]);
            }
        }
        tracing::debug!(
            measurement = %metric.config.measurement,
            change_points = merged.len(),
            "Detected change points"
        );
        out.entry(metric.config.measurement.clone())
            .or_default()
            .extend(merged);
    }
    for times in out.values_mut() {
        times.sort();
        times.dedup();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobmon_core::{FluxValue, Job, MetricConfig, MetricData, SeriesMap};

    fn series(start: i64, values: &[f64]) -> Vec<QueryResult> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut r = QueryResult::new();
                let t = Utc.timestamp_opt(start + 30 * i as i64, 0).unwrap();
                r.insert("_time".to_string(), FluxValue::Time(t));
                r.insert("_value".to_string(), FluxValue::Double(*v));
                r
            })
            .collect()
    }

    fn job_data(measurement: &str, map: SeriesMap) -> JobData {
        JobData {
            metadata: Job::default(),
            metric_data: vec![MetricData::parsed(
                MetricConfig {
                    measurement: measurement.to_string(),
                    ..Default::default()
                },
                map,
            )],
            quantile_data: Vec::new(),
            sample_interval: 30.0,
            sample_intervals: vec![30.0],
        }
    }

    #[test]
    fn test_step_series() {
        let mut values = vec![1.0; 20];
        values.extend(vec![50.0; 20]);
        let mut map = SeriesMap::new();
        map.insert("n01".to_string(), series(0, &values));

        let cps = detect_change_points(&job_data("cpu_usage", map));
        let expected = Utc.timestamp_opt(19 * 30, 0).unwrap();
        assert_eq!(cps["cpu_usage"], vec![expected]);
    }

    #[test]
    fn test_series_are_merged() {
        let mut a = vec![1.0; 20];
        a.extend(vec![50.0; 20]);
        let mut map = SeriesMap::new();
        map.insert("n01".to_string(), series(0, &a));
        map.insert("n02".to_string(), series(0, &a));

        let cps = detect_change_points(&job_data("cpu_usage", map));
        assert_eq!(cps["cpu_usage"].len(), 1);
    }

    #[test]
    fn test_null_values_are_skipped() {
        let mut records = series(0, &[1.0; 10]);
        records[3].insert("_value".to_string(), FluxValue::Null);
        let mut map = SeriesMap::new();
        map.insert("n01".to_string(), records);

        let cps = detect_change_points(&job_data("mem_used", map));
        assert!(cps["mem_used"].is_empty());
    }
}
