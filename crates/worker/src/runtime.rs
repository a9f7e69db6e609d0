// Process wiring: store, queue, engine, sweeps and worker pool
// Decision: The scheduler enqueues resumes instead of running them inline,
// so every workflow step runs inside a pool slot under the job timeout

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dripline_durable::engine::{SweepDispatch, TriggerError};
use dripline_durable::prelude::*;
use dripline_durable::queue::InMemoryJobQueue;
use dripline_durable::InMemoryAutomationStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

/// Extra pool time after the executor's own run timeout, for recording the
/// timed-out execution
const JOB_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

/// Everything one worker process runs
pub struct AutomationRuntime {
    config: WorkerConfig,
    store: Arc<dyn AutomationStore>,
    queue: AutomationQueue,
    triggers: Arc<TriggerEvaluator>,
    scheduler: Arc<Scheduler>,
    service: Arc<AutomationService>,
    pool: WorkerPool,
}

impl AutomationRuntime {
    /// Wire the engine over in-memory backends
    pub fn in_memory(config: WorkerConfig) -> Self {
        let store: Arc<dyn AutomationStore> = Arc::new(InMemoryAutomationStore::new());
        let jobs: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        Self::new(config, store, jobs)
    }

    pub fn new(config: WorkerConfig, store: Arc<dyn AutomationStore>, jobs: Arc<dyn JobQueue>) -> Self {
        let queue = AutomationQueue::new(Arc::clone(&jobs));
        // The executor stops the step loop itself and records the failure;
        // the pool timeout only backs it up
        let executor = Arc::new(
            WorkflowExecutor::new(Arc::clone(&store))
                .with_config(ExecutorConfig::default().with_run_timeout(config.job_timeout)),
        );
        let triggers = Arc::new(TriggerEvaluator::new(Arc::clone(&store), queue.clone()));
        let scheduler = Arc::new(
            Scheduler::new(Arc::clone(&store), Arc::clone(&executor), queue.clone()).with_config(
                SchedulerConfig::default()
                    .with_interval(config.scheduler_interval)
                    .with_batch_size(config.schedule_batch_size)
                    .with_dispatch(SweepDispatch::Enqueue),
            ),
        );
        let service = Arc::new(AutomationService::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            Arc::clone(&triggers),
            queue.clone(),
        ));

        let handler = Arc::new(AutomationJobHandler::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&scheduler),
        ));
        let pool = WorkerPool::new(
            jobs,
            handler,
            WorkerPoolConfig::new()
                .with_worker_id(config.worker_id.clone())
                .with_max_concurrency(config.max_concurrent_jobs)
                .with_job_timeout(config.job_timeout + JOB_TIMEOUT_GRACE)
                .with_stall_threshold((config.job_timeout + JOB_TIMEOUT_GRACE) * 2),
        );

        Self {
            config,
            store,
            queue,
            triggers,
            scheduler,
            service,
            pool,
        }
    }

    pub fn store(&self) -> &Arc<dyn AutomationStore> {
        &self.store
    }

    pub fn queue(&self) -> &AutomationQueue {
        &self.queue
    }

    pub fn triggers(&self) -> &Arc<TriggerEvaluator> {
        &self.triggers
    }

    pub fn service(&self) -> &Arc<AutomationService> {
        &self.service
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run the pool and every sweep until `shutdown` flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.pool.start().context("failed to start worker pool")?;
        let events = self.spawn_event_log();

        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = shutdown.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let behavior = Arc::clone(&self.triggers);
        let behavior_task = tokio::spawn(sweep_every(
            "behavior",
            self.config.behavior_sweep_interval,
            shutdown.clone(),
            move || {
                let triggers = Arc::clone(&behavior);
                async move { triggers.evaluate_behavior_triggers().await }
            },
        ));

        let time_based = Arc::clone(&self.triggers);
        let time_task = tokio::spawn(sweep_every(
            "time_based",
            self.config.time_sweep_interval,
            shutdown.clone(),
            move || {
                let triggers = Arc::clone(&time_based);
                async move { triggers.evaluate_time_based_triggers().await }
            },
        ));

        info!(worker_id = %self.config.worker_id, "automation runtime started");

        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("stopping automation runtime");
        for task in [scheduler_task, behavior_task, time_task] {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        let result = self.pool.shutdown().await;
        events.abort();

        result.context("worker pool did not drain")?;
        Ok(())
    }

    fn spawn_event_log(&self) -> JoinHandle<()> {
        let mut events = self.pool.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::Progress {
                        job_id, progress, ..
                    }) => tracing::trace!(%job_id, progress, "job progress"),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "worker event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Call `sweep` every `period` until shutdown
async fn sweep_every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, TriggerError>>,
{
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep().await {
                    Ok(created) => info!(sweep = name, created, "trigger sweep finished"),
                    Err(e) => error!(sweep = name, error = %e, "trigger sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dripline_core::{ExecutionStatus, NewAutomation, Step, Subscriber, TriggerType};
    use serde_json::{json, Map};

    #[test_log::test(tokio::test)]
    async fn test_event_runs_through_pool() {
        let config = WorkerConfig {
            scheduler_interval: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let runtime = Arc::new(AutomationRuntime::in_memory(config));

        let subscriber = Subscriber::new("a@example.com");
        runtime.store().save_subscriber(&subscriber).await.unwrap();
        let automation = runtime
            .service()
            .create(
                NewAutomation::new(
                    "welcome",
                    TriggerType::Event,
                    json!({ "events": ["subscriber.created"] }),
                )
                .with_steps(vec![Step::send_message("s1", "Hi").then("s2"), Step::exit("s2")]),
            )
            .await
            .unwrap();
        runtime.service().activate(automation.id, false).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let running = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.run(rx).await })
        };

        runtime
            .triggers()
            .evaluate_event_trigger("subscriber.created", subscriber.id, Map::new())
            .await
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let page = runtime
                    .service()
                    .get_executions(
                        dripline_durable::engine::ExecutionQuery::for_automation(automation.id)
                            .with_status(ExecutionStatus::Completed),
                    )
                    .await
                    .unwrap();
                if page.total == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok());

        tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
