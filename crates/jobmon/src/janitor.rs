//! Background janitor service: reaps expired jobs and finishes overtime
//! ones.

use crate::context::AppContext;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

pub struct JanitorService {
    ctx: Arc<AppContext>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl JanitorService {
    pub fn new(ctx: Arc<AppContext>, period: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            period,
            shutdown,
        }
    }

    /// Start the janitor in the background.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// One pass at startup, then one per period until shutdown.
    async fn run(mut self) {
        self.sweep().await;

        let mut ticker = interval(self.period);
        // Skip the first tick (fires immediately)
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::debug!("Janitor stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let report = self.ctx.run_janitors(Utc::now().timestamp()).await;
        tracing::info!(
            reaped = report.reaped.len(),
            finished = report.finished.len(),
            "Janitor pass complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, job};
    use jobmon_flux::testing::MemoryBackend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_startup_pass_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir, MemoryBackend::new()).await;
        let ctx = Arc::new(ctx);
        // the batch partition allows one hour
        let start = Utc::now().timestamp() - 7200;
        ctx.start_job(job(1, start)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = JanitorService::new(ctx.clone(), Duration::from_secs(3600), rx).start();

        let mut stopped = None;
        for _ in 0..100 {
            let job = ctx.store().get_job(1).await.unwrap();
            if !job.is_running {
                stopped = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stopped = stopped.unwrap();
        assert_eq!(stopped.stop_time, start + 3600);
        assert_eq!(stopped.exit_code, 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
