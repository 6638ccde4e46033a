//! Reconciliation of the backend's aggregation tasks with the catalog.

use crate::engine::TimeSeriesEngine;
use crate::error::EngineError;
use jobmon_core::MetricConfig;
use jobmon_flux::query::TASK_EVERY;
use jobmon_flux::{AggFn, Ident, Synthesized};
use std::collections::BTreeMap;

impl TimeSeriesEngine {
    /// Names of the tasks the current catalog needs, with the metric and
    /// aggregation function each one is built from.
    fn expected_tasks(&self) -> BTreeMap<String, (MetricConfig, AggFn)> {
        let catalog = self.catalog.snapshot();
        let mut expected = BTreeMap::new();
        for metric in catalog.metrics() {
            if Synthesized::from_unit(&metric.unit).is_some() {
                continue;
            }
            let measurement = match Ident::new(&metric.measurement) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(metric = %metric.guid, "Skipping aggregation tasks: {}", e);
                    continue;
                }
            };
            for name in &metric.available_agg_fns {
                match AggFn::new(name) {
                    Ok(agg_fn) => {
                        expected
                            .entry(self.builder.task_name(&measurement, &agg_fn))
                            .or_insert_with(|| (metric.clone(), agg_fn));
                    }
                    Err(e) => tracing::error!(metric = %metric.guid, "Skipping aggregation task: {}", e),
                }
            }
        }
        expected
    }

    /// Create every missing aggregation task and rebuild the registry.
    ///
    /// Returns the number of tasks created. Tasks that cannot be created
    /// are logged and left out of the registry.
    pub async fn reconcile_tasks(&self) -> Result<usize, EngineError> {
        let existing = self.backend.find_tasks().await?;
        let mut registry = Vec::new();
        let mut created = 0;

        for (name, (metric, agg_fn)) in self.expected_tasks() {
            if let Some(task) = existing.iter().find(|t| t.name == name) {
                registry.push(task.clone());
                continue;
            }

            let every = metric.interval_or(self.settings.default_interval);
            let (name, flux) = match self.builder.aggregation_task(&metric, &agg_fn, every) {
                Ok(task) => task,
                Err(e) => {
                    tracing::error!(task = %name, "Could not render aggregation task: {}", e);
                    continue;
                }
            };
            match self
                .backend
                .create_task(&name, &flux, TASK_EVERY, &self.org_id)
                .await
            {
                Ok(task) => {
                    tracing::info!(task = %task.name, "Created aggregation task");
                    registry.push(task);
                    created += 1;
                }
                Err(e) => tracing::error!(task = %name, "Could not create aggregation task: {}", e),
            }
        }

        tracing::debug!(registered = registry.len(), created, "Reconciled aggregation tasks");
        *self.tasks.lock().await = registry;
        Ok(created)
    }

    /// Names of the registered aggregation tasks.
    pub async fn task_names(&self) -> Vec<String> {
        self.tasks.lock().await.iter().map(|t| t.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::tests::{config, engine};
    use jobmon_core::MetricCatalog;
    use jobmon_flux::testing::MemoryBackend;

    #[tokio::test]
    async fn test_missing_tasks_are_created_once() {
        let (engine, backend) = engine(MemoryBackend::new().with_task("hpc_cpu_usage_mean")).await;
        assert_eq!(
            engine.task_names().await,
            vec!["hpc_cpu_usage_max", "hpc_cpu_usage_mean", "hpc_mem_used_max"]
        );
        assert_eq!(backend.tasks().await.len(), 3);

        assert_eq!(engine.reconcile_tasks().await.unwrap(), 0);
        assert_eq!(backend.tasks().await.len(), 3);
        assert_eq!(engine.task_names().await.len(), 3);
    }

    #[tokio::test]
    async fn test_reload_creates_tasks_for_new_metrics() {
        let (engine, backend) = engine(MemoryBackend::new()).await;
        let mut config = config();
        config.metrics[1].available_agg_fns.push("min".to_string());

        let created = engine.reload_catalog(MetricCatalog::from_config(&config)).await.unwrap();
        assert_eq!(created, 1);
        assert!(backend.tasks().await.iter().any(|t| t.name == "hpc_mem_used_min"));
    }

    #[tokio::test]
    async fn test_synthesized_metrics_have_no_tasks() {
        let (engine, backend) = engine(MemoryBackend::new()).await;
        let mut config = config();
        let mut iops = config.metrics[1].clone();
        iops.guid = "iops".to_string();
        iops.measurement = "gpfs_iops".to_string();
        iops.unit = "IOps".to_string();
        config.metrics.push(iops);

        let created = engine.reload_catalog(MetricCatalog::from_config(&config)).await.unwrap();
        assert_eq!(created, 0);
        assert!(!backend.tasks().await.iter().any(|t| t.name.contains("gpfs_iops")));
    }

    #[tokio::test]
    async fn test_run_aggregation_runs_every_task() {
        let (engine, backend) = engine(MemoryBackend::new()).await;
        engine.run_aggregation().await;
        for _ in 0..50 {
            if backend.runs().await.len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.runs().await.len(), 3);
    }
}
