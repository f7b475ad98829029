//! Worker loop: pulls tickets off the queue, runs them with bounded
//! concurrency and re-queues jobs orphaned by dead workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use storage::{Delivery, JobTicket, WorkQueue};
use suit_common::{SuitError, SuitResult};

use crate::runner::{JobRunner, RunOutcome};

/// Backoff after the queue itself fails.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    runner: Arc<JobRunner>,
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    pub fn new(runner: Arc<JobRunner>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { runner, queue }
    }

    /// Reset RUNNING jobs with stale heartbeats to PENDING and queue them again.
    ///
    /// Returns the number of jobs reclaimed.
    pub async fn reap_once(&self) -> SuitResult<usize> {
        let ctx = self.runner.context();
        let threshold = chrono::Duration::from_std(ctx.config.stale_threshold)
            .map_err(|e| SuitError::InternalError(format!("invalid stale threshold: {}", e)))?;

        let reclaimed = ctx.store.reclaim_stale(Utc::now() - threshold).await?;
        for job_id in &reclaimed {
            let attempt = ctx
                .store
                .get(*job_id)
                .await?
                .map(|job| job.attempt)
                .unwrap_or_default();
            self.queue.enqueue(&JobTicket::new(*job_id, attempt)).await?;
            warn!(job_id = %job_id, attempt, "Reclaimed orphaned job");
        }
        if !reclaimed.is_empty() {
            metrics::counter!("analysis_jobs_reclaimed_total").increment(reclaimed.len() as u64);
        }
        Ok(reclaimed.len())
    }

    /// Run tickets until the queue stays empty for one poll, then wait for
    /// the jobs in flight. Returns the number of tickets processed.
    pub async fn run_until_idle(&self) -> SuitResult<usize> {
        let ctx = self.runner.context();
        let permits = Arc::new(Semaphore::new(ctx.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut processed = 0;

        loop {
            let permit = acquire(&permits).await?;
            let Some(delivery) = self
                .queue
                .dequeue(self.runner.worker_id(), ctx.config.poll_wait)
                .await?
            else {
                break;
            };
            processed += 1;
            tasks.spawn(process(self.runner.clone(), self.queue.clone(), delivery, permit));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        Ok(processed)
    }

    /// Serve the queue until `shutdown` flips to true (or its sender is
    /// dropped), then wait for jobs in flight.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SuitResult<()> {
        let ctx = self.runner.context();
        let concurrency = ctx.config.concurrency;
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut reap = tokio::time::interval(ctx.config.reap_interval);

        info!(
            worker = %self.runner.worker_id(),
            concurrency,
            "Dispatcher started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = reap.tick() => {
                    if let Err(e) = self.reap_once().await {
                        warn!(error = %e, "Reaper pass failed");
                    }
                }
                permit = acquire(&permits) => {
                    let permit = permit?;
                    match self.queue.dequeue(self.runner.worker_id(), ctx.config.poll_wait).await {
                        Ok(Some(delivery)) => {
                            tokio::spawn(process(
                                self.runner.clone(),
                                self.queue.clone(),
                                delivery,
                                permit,
                            ));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Dequeue failed");
                            tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!("Dispatcher stopping, waiting for running jobs");
        // Every job holds a permit until it finishes
        let _all = permits
            .acquire_many(concurrency as u32)
            .await
            .map_err(|e| SuitError::InternalError(e.to_string()))?;
        info!("Dispatcher stopped");
        Ok(())
    }
}

async fn acquire(permits: &Arc<Semaphore>) -> SuitResult<OwnedSemaphorePermit> {
    permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| SuitError::InternalError(e.to_string()))
}

/// Run one delivery and acknowledge it.
///
/// When the job store fails mid-run the ticket is queued again; a rerun of
/// a job that meanwhile left PENDING is skipped by the claim.
async fn process(
    runner: Arc<JobRunner>,
    queue: Arc<dyn WorkQueue>,
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = delivery.ticket.job_id;
    match runner.run(job_id).await {
        Ok(RunOutcome::Skipped) => debug!(job_id = %job_id, "Ticket skipped"),
        Ok(outcome) => debug!(job_id = %job_id, outcome = outcome.as_str(), "Ticket processed"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job store failed while running job");
            tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
            if let Err(e) = queue.enqueue(&delivery.ticket).await {
                error!(job_id = %job_id, error = %e, "Failed to requeue ticket");
            }
        }
    }

    if let Err(e) = queue.ack(&delivery).await {
        warn!(job_id = %job_id, error = %e, "Failed to acknowledge ticket");
    }
}
