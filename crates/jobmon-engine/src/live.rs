//! Live monitoring sessions for running jobs.

use crate::engine::{TimeSeriesEngine, fan_out};
use crate::plan::{self, Scope};
use chrono::Utc;
use jobmon_core::{Job, MetricData};
use jobmon_flux::Clause;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Handle to a live session.
///
/// `data` yields the latest datapoint of every metric once per sample
/// interval. Sending `true` on `done`, or dropping either end, ends the
/// session; `data` then yields `None`.
pub struct LiveSession {
    pub data: mpsc::Receiver<Vec<MetricData>>,
    pub done: mpsc::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LiveSession {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl TimeSeriesEngine {
    /// Start a live session for `job`, ticking at the default sample
    /// interval.
    pub fn live_channel(&self, job: &Job) -> LiveSession {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let period = if self.settings.default_interval.is_zero() {
            Duration::from_secs(30)
        } else {
            self.settings.default_interval
        };

        let engine = self.clone();
        let job = job.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!(job_id = job.id, ?period, "Live session started");
            engine.run_live(&job, period, data_tx, done_rx).await;
            tracing::debug!(job_id = job.id, "Live session closed");
        });
        LiveSession {
            data: data_rx,
            done: done_tx,
            handle,
        }
    }

    async fn run_live(
        &self,
        job: &Job,
        period: Duration,
        data: mpsc::Sender<Vec<MetricData>>,
        mut done: mpsc::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        // Skip the first tick (fires immediately)
        ticker.tick().await;

        loop {
            tokio::select! {
                stop = done.recv() => match stop {
                    Some(false) => continue,
                    _ => break,
                },
                _ = data.closed() => break,
                _ = ticker.tick() => {
                    let points = self.last_datapoints(job).await;
                    tokio::select! {
                        sent = data.send(points) => if sent.is_err() {
                            break;
                        },
                        stop = done.recv() => if stop != Some(false) {
                            break;
                        },
                    }
                }
            }
        }
    }

    /// Latest datapoint of every metric of `job`.
    pub async fn last_datapoints(&self, job: &Job) -> Vec<MetricData> {
        let now = Utc::now().timestamp();
        let metrics = self.catalog.snapshot().metrics_for(job);
        let last = match Clause::new("|> last()") {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Invalid live clause: {}", e);
                return Vec::new();
            }
        };
        let scope = Scope::for_job(job, &[], Duration::ZERO, self.settings.default_interval, now)
            .with_post(last);

        let pending = metrics
            .iter()
            .filter_map(|metric| match plan::metric_plan(&self.builder, metric, &scope, false, false) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::error!(job_id = job.id, metric = %metric.guid, "Could not plan live query: {}", e);
                    None
                }
            })
            .map(|p| (p.metric.guid.clone(), crate::engine::run_metric(Arc::clone(&self.backend), p)))
            .collect();
        fan_out(job.id, pending).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::{engine, job};
    use jobmon_flux::testing::{MemoryBackend, series_csv};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn fast_engine(backend: MemoryBackend) -> crate::TimeSeriesEngine {
        let (mut engine, _) = engine(backend).await;
        engine.settings.default_interval = Duration::from_millis(20);
        engine
    }

    fn running() -> jobmon_core::Job {
        let mut j = job("n01|n02", 2);
        j.is_running = true;
        j.stop_time = 0;
        j
    }

    #[tokio::test]
    async fn test_live_data_then_done() {
        let csv = series_csv("hostname", &[("n01", "2023-11-14T22:13:30Z", 3.0)]);
        let engine = fast_engine(MemoryBackend::new().with_response("last()", csv)).await;
        let mut session = engine.live_channel(&running());

        let points = timeout(WAIT, session.data.recv()).await.unwrap().unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|m| m.data.is_some()));

        session.done.send(true).await.unwrap();
        while timeout(WAIT, session.data.recv()).await.unwrap().is_some() {}
        assert!(session.done.send(true).await.is_err());
    }

    #[tokio::test]
    async fn test_live_ends_when_done_dropped() {
        let engine = fast_engine(MemoryBackend::new()).await;
        let session = engine.live_channel(&running());
        let mut data = session.data;
        drop(session.done);
        while timeout(WAIT, data.recv()).await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn test_live_ends_when_receiver_dropped() {
        let engine = fast_engine(MemoryBackend::new()).await;
        let session = engine.live_channel(&running());
        let done = session.done;
        drop(session.data);
        timeout(WAIT, done.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_false_keeps_session_open() {
        let engine = fast_engine(MemoryBackend::new()).await;
        let mut session = engine.live_channel(&running());
        session.done.send(false).await.unwrap();
        assert!(timeout(WAIT, session.data.recv()).await.unwrap().is_some());
        assert!(!session.is_finished());
        session.done.send(true).await.unwrap();
    }
}
