//! Offline-first facade over the cache, the queue and the remote API.
//!
//! Mutations land in the local store and enqueue replay work; they never
//! wait on the network. Reads serve the cache first and fold remote copies
//! in when connectivity allows, with local intent always winning.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::DiaryError;
use crate::model::{
    ConflictResolution, EntryPatch, EntryState, FoodDiaryEntry, NewEntry, OfflineTask,
    SearchOptions, SearchResult, TaskPayload,
};
use crate::remote::{Connectivity, SharedApi};
use crate::store::DiaryStore;
use crate::sync::SyncKick;

#[derive(Clone)]
pub struct FoodDiaryRepository {
    store: Arc<DiaryStore>,
    api: SharedApi,
    connectivity: Connectivity,
    kick: SyncKick,
}

impl FoodDiaryRepository {
    pub fn new(
        store: Arc<DiaryStore>,
        api: SharedApi,
        connectivity: Connectivity,
        kick: SyncKick,
    ) -> Self {
        Self {
            store,
            api,
            connectivity,
            kick,
        }
    }

    pub async fn ping_remote(&self) -> Result<(), DiaryError> {
        self.api.ping().await
    }

    /// Cache first; on a miss, asks the remote when online. A remote copy
    /// is folded into the cache before being returned.
    #[instrument(skip_all)]
    pub async fn get(&self, entry_id: &str) -> Result<Option<FoodDiaryEntry>, DiaryError> {
        {
            let store = self.store.lock().await;
            if let Some(entry) = store.entry(entry_id) {
                return Ok(Some(entry.clone()));
            }
        }
        if !self.connectivity.is_online() {
            return Ok(None);
        }
        match self.api.fetch_entry(entry_id).await? {
            Some(remote) => Ok(self.store.lock().await.absorb_remote_entry(remote).await),
            None => Ok(None),
        }
    }

    /// Local view of a day, immediately. When online, a background refresh
    /// folds the remote's copies into the cache for next time.
    #[instrument(skip_all)]
    pub async fn get_by_date(&self, date: NaiveDate) -> Vec<FoodDiaryEntry> {
        let local = self.store.lock().await.entries_for_date(date);
        if self.connectivity.is_online() {
            let repo = self.clone();
            tokio::spawn(async move {
                if let Err(err) = repo.refresh_date(date).await {
                    warn!(%date, %err, "background refresh failed");
                }
            });
        }
        local
    }

    /// Pulls every remote entry for a day into the cache. Returns how many
    /// remote copies were folded in.
    pub async fn refresh_date(&self, date: NaiveDate) -> Result<usize, DiaryError> {
        let mut absorbed = 0;
        let mut page = 1;
        loop {
            let options = SearchOptions {
                page: Some(page),
                limit: Some(50),
                date: Some(date),
                meal_type: None,
            };
            let result = self.api.search_entries(&options).await?;
            let has_more = result.has_more;
            {
                let mut store = self.store.lock().await;
                for entry in result.items {
                    if store.absorb_remote_entry(entry).await.is_some() {
                        absorbed += 1;
                    }
                }
            }
            // Page cap so a misbehaving remote cannot pin us here.
            if !has_more || page >= 20 {
                break;
            }
            page += 1;
        }
        Ok(absorbed)
    }

    /// Remote search when online, with each returned copy folded into the
    /// cache and local intent winning over it. Falls back to the cache when
    /// offline or when the remote fails transiently.
    #[instrument(skip_all)]
    pub async fn search(&self, options: &SearchOptions) -> Result<SearchResult, DiaryError> {
        if self.connectivity.is_online() {
            match self.api.search_entries(options).await {
                Ok(remote) => {
                    let SearchResult {
                        items,
                        total_count,
                        page,
                        limit,
                        has_more,
                    } = remote;
                    let mut winners = Vec::with_capacity(items.len());
                    {
                        let mut store = self.store.lock().await;
                        for entry in items {
                            if let Some(winner) = store.absorb_remote_entry(entry).await {
                                winners.push(winner);
                            }
                        }
                    }
                    return Ok(SearchResult {
                        items: winners,
                        total_count,
                        page,
                        limit,
                        has_more,
                    });
                }
                Err(err) if err.is_retriable() => {
                    warn!(%err, "remote search failed; serving the local cache");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.store.lock().await.search_local(options))
    }

    pub async fn get_all_local(&self) -> Vec<FoodDiaryEntry> {
        self.store.lock().await.all_entries()
    }

    /// Stores the entry locally and queues its upload. Always succeeds;
    /// the entry is readable immediately.
    #[instrument(skip_all)]
    pub async fn save(&self, new_entry: NewEntry) -> FoodDiaryEntry {
        let entry = new_entry.into_entry(Uuid::new_v4().to_string(), Utc::now());
        {
            let mut store = self.store.lock().await;
            store.upsert_entry(entry.clone()).await;
            store
                .enqueue_task(TaskPayload::Create {
                    entry: entry.clone(),
                })
                .await;
        }
        self.kick.kick();
        info!(entry_id = %entry.id, date = %entry.date, "entry saved locally");
        entry
    }

    /// Applies the patch to the cached entry and queues the remote update.
    /// An empty patch is a no-op.
    #[instrument(skip_all)]
    pub async fn update(
        &self,
        entry_id: &str,
        patch: EntryPatch,
    ) -> Result<FoodDiaryEntry, DiaryError> {
        let merged = {
            let mut store = self.store.lock().await;
            let current = store
                .entry(entry_id)
                .cloned()
                .ok_or_else(|| DiaryError::NotFound(entry_id.to_string()))?;
            if patch.is_empty() {
                return Ok(current);
            }
            let mut merged = patch
                .apply_to(&current)
                .map_err(|err| DiaryError::Validation(format!("invalid patch: {err}")))?;
            if merged.state == EntryState::Synced {
                merged.state = EntryState::LocallyModified;
            }
            store.upsert_entry(merged.clone()).await;
            store
                .enqueue_task(TaskPayload::Update {
                    entry_id: merged.id.clone(),
                    patch,
                    base_revision: current.revision.clone(),
                    force: false,
                })
                .await;
            merged
        };
        self.kick.kick();
        info!(entry_id = %merged.id, "entry updated locally");
        Ok(merged)
    }

    /// Drops the entry from the cache. A never-confirmed entry whose create
    /// is still queued just cancels that work; anything the remote may know
    /// about queues a delete. A create already in flight also queues the
    /// delete, since its confirmation may be about to land.
    #[instrument(skip_all)]
    pub async fn delete(&self, entry_id: &str) -> Result<(), DiaryError> {
        {
            let mut store = self.store.lock().await;
            let current = store
                .entry(entry_id)
                .cloned()
                .ok_or_else(|| DiaryError::NotFound(entry_id.to_string()))?;
            store.remove_entry(&current.id).await;

            let never_confirmed =
                current.state == EntryState::LocalOnly && current.revision.is_none();
            if never_confirmed && !store.has_processing_task(&current.id) {
                let cancelled = store.cancel_tasks_for_entry(&current.id).await;
                debug!(entry_id = %current.id, cancelled, "delete cancelled queued work");
            } else {
                store
                    .enqueue_task(TaskPayload::Delete {
                        entry_id: current.id.clone(),
                        base_revision: current.revision.clone(),
                        force: false,
                    })
                    .await;
            }
        }
        self.kick.kick();
        Ok(())
    }

    // ---- pending-task surface ----

    pub async fn tasks(&self) -> Vec<OfflineTask> {
        self.store.lock().await.tasks()
    }

    pub async fn failed_tasks(&self) -> Vec<OfflineTask> {
        self.store.lock().await.failed_tasks()
    }

    pub async fn queue_stats(&self) -> crate::store::QueueStats {
        self.store.lock().await.queue_stats()
    }

    /// Re-runs a failed task from a clean slate.
    #[instrument(skip_all)]
    pub async fn retry_task(&self, task_id: Uuid) -> Result<(), DiaryError> {
        self.store.lock().await.retry_task(task_id).await?;
        self.kick.kick();
        Ok(())
    }

    /// Drops a failed task. Discarding a failed create also abandons the
    /// local entry and anything else queued for it, since the entry can
    /// never reach the remote.
    #[instrument(skip_all)]
    pub async fn discard_task(&self, task_id: Uuid) -> Result<(), DiaryError> {
        let mut store = self.store.lock().await;
        let task = store.remove_failed_task(task_id).await?;
        match &task.payload {
            TaskPayload::Create { entry } => {
                store.cancel_tasks_for_entry(&entry.id).await;
                store.remove_entry(&entry.id).await;
                info!(%task_id, entry_id = %entry.id, "discarded failed create and its local entry");
            }
            _ => {
                info!(%task_id, "discarded failed task");
            }
        }
        Ok(())
    }

    /// Settles a failed task the caller has looked at: replay it without
    /// its precondition, or drop the local change and re-adopt the remote
    /// copy.
    #[instrument(skip_all)]
    pub async fn resolve_conflict(
        &self,
        task_id: Uuid,
        resolution: ConflictResolution,
    ) -> Result<(), DiaryError> {
        match resolution {
            ConflictResolution::ForceOverwrite => {
                self.store.lock().await.force_task(task_id).await?;
                self.kick.kick();
                info!(%task_id, "conflicted task will replay forced");
                Ok(())
            }
            ConflictResolution::DiscardLocal => {
                let mut store = self.store.lock().await;
                let task = store.remove_failed_task(task_id).await?;
                match &task.payload {
                    TaskPayload::Create { entry } => {
                        store.cancel_tasks_for_entry(&entry.id).await;
                        store.remove_entry(&entry.id).await;
                        info!(%task_id, entry_id = %entry.id, "discarded conflicted create");
                        Ok(())
                    }
                    TaskPayload::Update { entry_id, .. } | TaskPayload::Delete { entry_id, .. } => {
                        let entry_id = entry_id.clone();
                        if store.has_tasks_for(&entry_id) {
                            // Later queued changes carry their own view of
                            // the entry; leave the cache to them.
                            info!(%task_id, entry_id = %entry_id, "discarded conflicted task");
                            return Ok(());
                        }
                        drop(store);
                        if self.connectivity.is_online() {
                            match self.api.fetch_entry(&entry_id).await {
                                Ok(remote) => {
                                    self.store
                                        .lock()
                                        .await
                                        .restore_remote_entry(&entry_id, remote)
                                        .await;
                                    info!(%task_id, entry_id = %entry_id, "discarded local change and re-adopted the remote copy");
                                }
                                Err(err) => {
                                    warn!(entry_id = %entry_id, %err, "could not refetch after discarding; local copy may be stale");
                                }
                            }
                        } else {
                            warn!(entry_id = %entry_id, "offline; discarded the change but the local copy may be stale");
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}
