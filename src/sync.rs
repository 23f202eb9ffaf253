//! Background replay of the pending-action queue.
//!
//! The engine drains the queue whenever it is kicked, a poll interval
//! elapses, or connectivity returns. Each drain fans replays out across
//! entries while the store keeps every entry's own lane strictly FIFO.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::DiaryError;
use crate::model::{FailureKind, FoodDiaryEntry, OfflineTask, TaskPayload};
use crate::remote::{Connectivity, DiaryApi, SharedApi};
use crate::store::DiaryStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Replays in flight at once, across distinct entries.
    pub fan_out: usize,
    /// Transient failures tolerated before a task is parked as failed.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Budget for a single remote call before it counts as transient.
    pub request_timeout: Duration,
    /// How often the engine drains without being kicked.
    pub poll_interval: Duration,
    /// Keep terminally failed tasks for inspection instead of dropping them.
    pub retain_failed: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fan_out: 4,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(900),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            retain_failed: true,
        }
    }
}

/// Wakes the engine out of its poll sleep after a local mutation.
#[derive(Clone, Default)]
pub struct SyncKick(Arc<Notify>);

impl SyncKick {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kick(&self) {
        self.0.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
}

enum ReplayOutcome {
    Created {
        local_id: String,
        confirmed: FoodDiaryEntry,
    },
    Updated {
        entry_id: String,
        confirmed: FoodDiaryEntry,
    },
    Deleted {
        entry_id: String,
    },
}

pub struct SyncEngine {
    store: Arc<DiaryStore>,
    api: SharedApi,
    connectivity: Connectivity,
    options: SyncOptions,
    kick: SyncKick,
}

impl SyncEngine {
    pub fn new(
        store: Arc<DiaryStore>,
        api: SharedApi,
        connectivity: Connectivity,
        options: SyncOptions,
        kick: SyncKick,
    ) -> Self {
        Self {
            store,
            api,
            connectivity,
            options,
            kick,
        }
    }

    /// Runs until every handle to the connectivity channel is gone.
    pub async fn run(&self) {
        let mut online_rx = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(fan_out = self.options.fan_out, "sync engine started");

        loop {
            if !self.connectivity.is_online() {
                debug!("offline; waiting for connectivity");
                if online_rx.wait_for(|online| *online).await.is_err() {
                    break;
                }
                ticker.reset();
            }

            let summary = self.drain().await;
            if summary != DrainSummary::default() {
                info!(
                    completed = summary.completed,
                    failed = summary.failed,
                    deferred = summary.deferred,
                    "drain finished"
                );
            }

            tokio::select! {
                _ = self.kick.notified() => {}
                _ = ticker.tick() => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// One drain pass: claims runnable tasks, replays them concurrently and
    /// settles each result. Returns once no runnable task is left.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> DrainSummary {
        let mut summary = DrainSummary::default();

        let stale = self.store.lock().await.reset_processing_tasks().await;
        if stale > 0 {
            warn!(stale, "re-queued tasks left processing by an earlier pass");
        }

        let fan_out = self.options.fan_out.max(1);
        let mut replays: JoinSet<(OfflineTask, Result<ReplayOutcome, DiaryError>)> =
            JoinSet::new();

        loop {
            while replays.len() < fan_out && self.connectivity.is_online() {
                let claimed = self.store.lock().await.claim_next_runnable(Utc::now()).await;
                let Some(task) = claimed else { break };
                debug!(task_id = %task.id, op = task.payload.kind(), entry_id = %task.entry_id(), "replaying task");
                let api = Arc::clone(&self.api);
                let request_timeout = self.options.request_timeout;
                replays.spawn(async move {
                    let outcome = replay(api.as_ref(), &task, request_timeout).await;
                    (task, outcome)
                });
            }

            match replays.join_next().await {
                Some(Ok((task, outcome))) => self.settle(task, outcome, &mut summary).await,
                // The claimed task stays processing; the next drain's reset
                // returns it to pending.
                Some(Err(err)) => error!(%err, "replay task aborted"),
                None => break,
            }
        }

        summary
    }

    async fn settle(
        &self,
        task: OfflineTask,
        outcome: Result<ReplayOutcome, DiaryError>,
        summary: &mut DrainSummary,
    ) {
        let mut store = self.store.lock().await;
        match outcome {
            Ok(ReplayOutcome::Created {
                local_id,
                confirmed,
            }) => {
                info!(task_id = %task.id, entry_id = %local_id, remote_id = %confirmed.id, "create confirmed");
                store.reconcile_create(task.id, &local_id, confirmed).await;
                summary.completed += 1;
            }
            Ok(ReplayOutcome::Updated {
                entry_id,
                confirmed,
            }) => {
                info!(task_id = %task.id, entry_id = %entry_id, "update confirmed");
                store.reconcile_update(task.id, &entry_id, confirmed).await;
                summary.completed += 1;
            }
            Ok(ReplayOutcome::Deleted { entry_id }) => {
                info!(task_id = %task.id, entry_id = %entry_id, "delete confirmed");
                store.reconcile_delete(task.id, &entry_id).await;
                summary.completed += 1;
            }
            Err(err) => match err.failure_kind() {
                Some(kind) => {
                    warn!(task_id = %task.id, kind = kind.as_str(), %err, "task failed");
                    store
                        .fail_task(task.id, kind, err.to_string(), self.options.retain_failed)
                        .await;
                    summary.failed += 1;
                }
                None if task.attempts + 1 >= self.options.max_attempts => {
                    warn!(task_id = %task.id, attempts = task.attempts + 1, %err, "retry budget exhausted");
                    store
                        .fail_task(
                            task.id,
                            FailureKind::Exhausted,
                            err.to_string(),
                            self.options.retain_failed,
                        )
                        .await;
                    summary.failed += 1;
                }
                None => {
                    let delay = backoff_delay(
                        task.attempts,
                        self.options.backoff_base,
                        self.options.max_backoff,
                    );
                    let due_at = Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
                    debug!(task_id = %task.id, attempts = task.attempts + 1, delay_secs = delay.as_secs(), %err, "transient failure; backing off");
                    store.release_task(task.id, task.attempts + 1, due_at).await;
                    summary.deferred += 1;
                }
            },
        }
    }
}

async fn replay(
    api: &dyn DiaryApi,
    task: &OfflineTask,
    request_timeout: Duration,
) -> Result<ReplayOutcome, DiaryError> {
    match &task.payload {
        TaskPayload::Create { entry } => {
            let confirmed = with_timeout(request_timeout, api.create_entry(entry)).await?;
            Ok(ReplayOutcome::Created {
                local_id: entry.id.clone(),
                confirmed,
            })
        }
        TaskPayload::Update {
            entry_id,
            patch,
            base_revision,
            force,
        } => {
            let confirmed = with_timeout(
                request_timeout,
                api.update_entry(entry_id, patch, base_revision.as_deref(), *force),
            )
            .await?;
            Ok(ReplayOutcome::Updated {
                entry_id: entry_id.clone(),
                confirmed,
            })
        }
        TaskPayload::Delete {
            entry_id,
            base_revision,
            force,
        } => {
            if base_revision.is_some() {
                with_timeout(
                    request_timeout,
                    api.delete_entry(entry_id, base_revision.as_deref(), *force),
                )
                .await?;
            } else {
                // The remote never confirmed this id, so there is nothing
                // to delete there.
                debug!(entry_id = %entry_id, "delete of an unconfirmed entry completes locally");
            }
            Ok(ReplayOutcome::Deleted {
                entry_id: entry_id.clone(),
            })
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, DiaryError>>,
) -> Result<T, DiaryError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DiaryError::Transient(format!(
            "remote call timed out after {}s",
            limit.as_secs()
        ))),
    }
}

fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    // Exponential with a shift cap so the multiplier cannot overflow.
    let delay = base.saturating_mul(1u32 << attempt.min(10));
    delay.min(cap)
}
