//! In-memory diary state with write-behind persistence.
//!
//! All reads and mutations go through [`DiaryStore::lock`], which hands out
//! the single coordinator handle. Because the key-value layer has no
//! transactions, holding that handle across a whole read-modify-write is
//! what keeps multi-key updates (record + manifest + queue) consistent.
//! The cache is authoritative: a failed storage write is logged and the
//! in-memory state stands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::DiaryError;
use crate::model::{
    EntryState, FailureKind, FoodDiaryEntry, OfflineTask, SearchOptions, SearchResult,
    TaskPayload, TaskStatus,
};
use crate::storage::Storage;

const KEY_MANIFEST: &str = "entries";
const KEY_ALIASES: &str = "aliases";
const KEY_TASKS: &str = "tasks";

fn entry_key(entry_id: &str) -> String {
    format!("entry:{entry_id}")
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, FoodDiaryEntry>,
    /// Entry ids in insertion order; also the persisted manifest.
    order: Vec<String>,
    by_date: HashMap<NaiveDate, Vec<String>>,
    /// Provisional local id to confirmed remote id.
    aliases: HashMap<String, String>,
    /// Pending-action queue, oldest first.
    tasks: Vec<OfflineTask>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

pub struct DiaryStore {
    storage: Arc<dyn Storage>,
    state: Mutex<StoreState>,
}

impl DiaryStore {
    /// Hydrates the cache from storage. Unreadable records are skipped with
    /// a warning rather than failing the open; tasks left `processing` by an
    /// interrupted run are returned to `pending`.
    pub async fn open(storage: Arc<dyn Storage>) -> Self {
        let mut state = StoreState::default();

        let ids: Vec<String> = load_json(storage.as_ref(), KEY_MANIFEST)
            .await
            .unwrap_or_default();
        for id in ids {
            if state.entries.contains_key(&id) {
                continue;
            }
            let key = entry_key(&id);
            match storage.get(&key).await {
                Ok(Some(Value::Null)) | Ok(None) => {}
                Ok(Some(value)) => match serde_json::from_value::<FoodDiaryEntry>(value) {
                    Ok(entry) => {
                        put_record(&mut state, entry);
                    }
                    Err(err) => warn!(key = %key, %err, "skipping corrupt cache record"),
                },
                Err(err) => warn!(key = %key, %err, "could not read cache record"),
            }
        }

        state.aliases = load_json(storage.as_ref(), KEY_ALIASES)
            .await
            .unwrap_or_default();
        state.tasks = load_json(storage.as_ref(), KEY_TASKS)
            .await
            .unwrap_or_default();

        let mut stale = 0;
        for task in &mut state.tasks {
            if task.status == TaskStatus::Processing {
                task.status = TaskStatus::Pending;
                stale += 1;
            }
        }

        let store = Self {
            storage,
            state: Mutex::new(state),
        };
        if stale > 0 {
            warn!(stale, "re-queued tasks interrupted by an earlier shutdown");
            store.lock().await.persist_tasks().await;
        }
        store
    }

    pub async fn lock(&self) -> StoreHandle<'_> {
        StoreHandle {
            storage: self.storage.as_ref(),
            state: self.state.lock().await,
        }
    }
}

/// Exclusive view over the store; see the module docs for why mutations
/// stay behind one of these.
pub struct StoreHandle<'a> {
    storage: &'a dyn Storage,
    state: MutexGuard<'a, StoreState>,
}

impl StoreHandle<'_> {
    fn resolve<'s>(&'s self, entry_id: &'s str) -> &'s str {
        self.state
            .aliases
            .get(entry_id)
            .map(String::as_str)
            .unwrap_or(entry_id)
    }

    /// Looks up an entry, following the alias left behind when a create
    /// confirmation renamed it.
    pub fn entry(&self, entry_id: &str) -> Option<&FoodDiaryEntry> {
        let canonical = self.resolve(entry_id);
        self.state.entries.get(canonical)
    }

    pub fn entries_for_date(&self, date: NaiveDate) -> Vec<FoodDiaryEntry> {
        let Some(bucket) = self.state.by_date.get(&date) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter_map(|id| self.state.entries.get(id))
            .cloned()
            .collect()
    }

    pub fn all_entries(&self) -> Vec<FoodDiaryEntry> {
        self.state
            .order
            .iter()
            .filter_map(|id| self.state.entries.get(id))
            .cloned()
            .collect()
    }

    pub fn search_local(&self, options: &SearchOptions) -> SearchResult {
        let (page, limit) = options.normalized();
        let matching: Vec<FoodDiaryEntry> = self
            .state
            .order
            .iter()
            .filter_map(|id| self.state.entries.get(id))
            .filter(|entry| options.matches(entry))
            .cloned()
            .collect();
        SearchResult::paginate(matching, page, limit)
    }

    pub async fn upsert_entry(&mut self, entry: FoodDiaryEntry) {
        let id = entry.id.clone();
        let inserted = put_record(&mut self.state, entry);
        self.persist_entry(&id).await;
        if inserted {
            self.persist_manifest().await;
        }
    }

    /// Drops an entry from the cache and tombstones its record. Pending
    /// tasks for it are untouched; callers decide whether to cancel them.
    pub async fn remove_entry(&mut self, entry_id: &str) -> Option<FoodDiaryEntry> {
        let canonical = self.resolve(entry_id).to_string();
        let removed = remove_record(&mut self.state, &canonical);
        if removed.is_some() {
            // Manifest first: a crash between the two writes leaves an
            // orphaned record that hydration will never look at.
            self.persist_manifest().await;
            self.persist_entry(&canonical).await;
        }
        removed
    }

    // ---- pending-action queue ----

    pub async fn enqueue_task(&mut self, payload: TaskPayload) -> OfflineTask {
        let task = OfflineTask::new(payload, Utc::now());
        self.state.tasks.push(task.clone());
        self.persist_tasks().await;
        task
    }

    pub fn tasks(&self) -> Vec<OfflineTask> {
        self.state.tasks.clone()
    }

    pub fn failed_tasks(&self) -> Vec<OfflineTask> {
        self.state
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn task(&self, task_id: Uuid) -> Option<&OfflineTask> {
        self.state.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in &self.state.tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn has_tasks_for(&self, entry_id: &str) -> bool {
        self.state
            .tasks
            .iter()
            .any(|task| task.entry_id() == entry_id)
    }

    pub fn has_processing_task(&self, entry_id: &str) -> bool {
        self.state
            .tasks
            .iter()
            .any(|task| task.entry_id() == entry_id && task.status == TaskStatus::Processing)
    }

    pub async fn cancel_tasks_for_entry(&mut self, entry_id: &str) -> usize {
        let before = self.state.tasks.len();
        self.state.tasks.retain(|task| task.entry_id() != entry_id);
        let cancelled = before - self.state.tasks.len();
        if cancelled > 0 {
            self.persist_tasks().await;
        }
        cancelled
    }

    /// Claims the oldest runnable task, if any, and marks it `processing`.
    ///
    /// Only the head of each entry's lane is eligible, so replay stays FIFO
    /// per entry. A head that is processing, failed, or not yet due freezes
    /// the whole lane. Non-forced updates and deletes get their base
    /// revision stamped from the cache at claim time, after any earlier
    /// confirmations have refreshed it.
    pub async fn claim_next_runnable(&mut self, now: DateTime<Utc>) -> Option<OfflineTask> {
        let claimed = {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut found = None;
            for (idx, task) in self.state.tasks.iter().enumerate() {
                if !seen.insert(task.entry_id()) {
                    continue;
                }
                match task.status {
                    TaskStatus::Processing | TaskStatus::Failed => {}
                    TaskStatus::Pending => {
                        if task.due_at <= now {
                            found = Some(idx);
                            break;
                        }
                    }
                }
            }
            found
        }?;

        {
            let state = &mut *self.state;
            let task = &mut state.tasks[claimed];
            task.status = TaskStatus::Processing;
            match &mut task.payload {
                TaskPayload::Update {
                    entry_id,
                    base_revision,
                    force,
                    ..
                }
                | TaskPayload::Delete {
                    entry_id,
                    base_revision,
                    force,
                } => {
                    if !*force {
                        if let Some(entry) = state.entries.get(entry_id.as_str()) {
                            *base_revision = entry.revision.clone();
                        }
                    }
                }
                TaskPayload::Create { .. } => {}
            }
        }
        let snapshot = self.state.tasks[claimed].clone();
        self.persist_tasks().await;
        Some(snapshot)
    }

    /// Returns a claimed task to `pending` after a transient failure.
    pub async fn release_task(&mut self, task_id: Uuid, attempts: u32, due_at: DateTime<Utc>) {
        if let Some(task) = self.state.tasks.iter_mut().find(|task| task.id == task_id) {
            task.status = TaskStatus::Pending;
            task.attempts = attempts;
            task.due_at = due_at;
        }
        self.persist_tasks().await;
    }

    /// Parks a task as failed, or drops it outright when `retain` is off.
    /// Dropping leaves the cached entry dirty with nothing left to replay.
    pub async fn fail_task(
        &mut self,
        task_id: Uuid,
        kind: FailureKind,
        detail: String,
        retain: bool,
    ) {
        if retain {
            if let Some(task) = self.state.tasks.iter_mut().find(|task| task.id == task_id) {
                task.status = TaskStatus::Failed;
                task.failure = Some(kind);
                task.error = Some(detail);
            }
        } else {
            error!(%task_id, kind = kind.as_str(), %detail, "dropping failed task; local change will not reach the remote");
            self.state.tasks.retain(|task| task.id != task_id);
        }
        self.persist_tasks().await;
    }

    /// Returns a failed task to `pending` with a fresh retry budget.
    pub async fn retry_task(&mut self, task_id: Uuid) -> Result<(), DiaryError> {
        let task = self
            .state
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id)
            .ok_or_else(|| DiaryError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Failed {
            return Err(DiaryError::Validation(format!(
                "task {task_id} is {}, only failed tasks can be retried",
                task.status.as_str()
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.due_at = Utc::now();
        task.error = None;
        task.failure = None;
        self.persist_tasks().await;
        Ok(())
    }

    /// Like [`Self::retry_task`], but also drops the revision precondition
    /// so the replay overwrites whatever the remote holds.
    pub async fn force_task(&mut self, task_id: Uuid) -> Result<(), DiaryError> {
        let task = self
            .state
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id)
            .ok_or_else(|| DiaryError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Failed {
            return Err(DiaryError::Validation(format!(
                "task {task_id} is {}, only failed tasks can be forced",
                task.status.as_str()
            )));
        }
        match &mut task.payload {
            TaskPayload::Update { force, .. } | TaskPayload::Delete { force, .. } => {
                *force = true;
            }
            TaskPayload::Create { .. } => {}
        }
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.due_at = Utc::now();
        task.error = None;
        task.failure = None;
        self.persist_tasks().await;
        Ok(())
    }

    /// Removes a failed task from the queue and returns it.
    pub async fn remove_failed_task(&mut self, task_id: Uuid) -> Result<OfflineTask, DiaryError> {
        let idx = self
            .state
            .tasks
            .iter()
            .position(|task| task.id == task_id)
            .ok_or_else(|| DiaryError::NotFound(task_id.to_string()))?;
        if self.state.tasks[idx].status != TaskStatus::Failed {
            return Err(DiaryError::Validation(format!(
                "task {task_id} is {}, only failed tasks can be discarded",
                self.state.tasks[idx].status.as_str()
            )));
        }
        let task = self.state.tasks.remove(idx);
        self.persist_tasks().await;
        Ok(task)
    }

    /// Returns every `processing` task to `pending`. Run before a drain so
    /// tasks orphaned by a crash or abort get another turn.
    pub async fn reset_processing_tasks(&mut self) -> usize {
        let mut reset = 0;
        for task in self.state.tasks.iter_mut() {
            if task.status == TaskStatus::Processing {
                task.status = TaskStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            self.persist_tasks().await;
        }
        reset
    }

    // ---- reconciliation after confirmed replays ----

    /// Settles a confirmed create. The remote may have assigned its own id;
    /// the record and every queued follow-up are renamed to it and an alias
    /// keeps the provisional id resolvable. Follow-ups also pick up the
    /// confirmed revision. If later local edits exist, their content wins
    /// and only identity fields are adopted.
    pub async fn reconcile_create(
        &mut self,
        task_id: Uuid,
        local_id: &str,
        confirmed: FoodDiaryEntry,
    ) {
        let confirmed_id = confirmed.id.clone();
        let confirmed_revision = confirmed.revision.clone();
        let moved = confirmed_id != local_id;

        {
            let state = &mut *self.state;
            state.tasks.retain(|task| task.id != task_id);

            for task in state.tasks.iter_mut() {
                match &mut task.payload {
                    TaskPayload::Update {
                        entry_id,
                        base_revision,
                        force,
                        ..
                    }
                    | TaskPayload::Delete {
                        entry_id,
                        base_revision,
                        force,
                    } if *entry_id == local_id => {
                        *entry_id = confirmed_id.clone();
                        if !*force {
                            *base_revision = confirmed_revision.clone();
                        }
                    }
                    _ => {}
                }
            }

            if moved {
                state
                    .aliases
                    .insert(local_id.to_string(), confirmed_id.clone());
            }

            let follow_ups = state
                .tasks
                .iter()
                .any(|task| task.entry_id() == confirmed_id);

            match state.entries.remove(local_id) {
                Some(local) => {
                    let local_date = local.date;
                    let record = if follow_ups {
                        // Later edits already queued; keep their content.
                        FoodDiaryEntry {
                            id: confirmed_id.clone(),
                            revision: confirmed_revision.clone(),
                            state: EntryState::LocallyModified,
                            ..local
                        }
                    } else {
                        confirmed
                    };
                    if moved {
                        for slot in state.order.iter_mut() {
                            if slot == local_id {
                                *slot = confirmed_id.clone();
                            }
                        }
                        dedupe_in_place(&mut state.order);
                        if let Some(bucket) = state.by_date.get_mut(&local_date) {
                            for slot in bucket.iter_mut() {
                                if slot == local_id {
                                    *slot = confirmed_id.clone();
                                }
                            }
                            dedupe_in_place(bucket);
                        }
                    }
                    if record.date != local_date {
                        if let Some(bucket) = state.by_date.get_mut(&local_date) {
                            bucket.retain(|id| id != &confirmed_id);
                        }
                        let bucket = state.by_date.entry(record.date).or_default();
                        if !bucket.contains(&confirmed_id) {
                            bucket.push(confirmed_id.clone());
                        }
                    }
                    state.entries.insert(confirmed_id.clone(), record);
                }
                // Deleted locally while the create was in flight; the queued
                // delete follow-up handles the remote copy.
                None => {}
            }
        }

        self.persist_tasks().await;
        if moved {
            self.persist_aliases().await;
            self.persist_manifest().await;
            self.storage_tombstone(local_id).await;
        }
        self.persist_entry(&confirmed_id).await;
    }

    /// Settles a confirmed update: adopt the confirmed copy unless later
    /// local edits exist, in which case only the revision advances.
    pub async fn reconcile_update(
        &mut self,
        task_id: Uuid,
        entry_id: &str,
        confirmed: FoodDiaryEntry,
    ) {
        let confirmed_revision = confirmed.revision.clone();
        let mut wrote_entry = false;

        {
            let state = &mut *self.state;
            state.tasks.retain(|task| task.id != task_id);

            for task in state.tasks.iter_mut() {
                match &mut task.payload {
                    TaskPayload::Update {
                        entry_id: target,
                        base_revision,
                        force,
                        ..
                    }
                    | TaskPayload::Delete {
                        entry_id: target,
                        base_revision,
                        force,
                    } if *target == entry_id => {
                        if !*force {
                            *base_revision = confirmed_revision.clone();
                        }
                    }
                    _ => {}
                }
            }

            let follow_ups = state.tasks.iter().any(|task| task.entry_id() == entry_id);

            if let Some(local) = state.entries.get_mut(entry_id) {
                if follow_ups {
                    local.revision = confirmed_revision;
                } else {
                    // Any dirt on the record is what this task just flushed;
                    // a later edit would have queued a follow-up.
                    *local = confirmed;
                }
                wrote_entry = true;
            }
            // A missing record means it was deleted locally in the meantime;
            // nothing to write back.
        }

        self.persist_tasks().await;
        if wrote_entry {
            self.persist_entry(entry_id).await;
        }
    }

    /// Settles a confirmed delete and drops any alias pointing at the id.
    pub async fn reconcile_delete(&mut self, task_id: Uuid, entry_id: &str) {
        let had_aliases = {
            let state = &mut *self.state;
            state.tasks.retain(|task| task.id != task_id);
            let before = state.aliases.len();
            state
                .aliases
                .retain(|local, remote| local != entry_id && remote != entry_id);
            before != state.aliases.len()
        };
        self.persist_tasks().await;
        if had_aliases {
            self.persist_aliases().await;
        }
    }

    // ---- remote snapshots ----

    /// Folds a remote copy into the cache and returns the record a caller
    /// should see, or `None` when local state suppresses the remote copy
    /// entirely. Local intent wins: a dirty record or any queued task for
    /// the id keeps the cached version.
    pub async fn absorb_remote_entry(
        &mut self,
        remote: FoodDiaryEntry,
    ) -> Option<FoodDiaryEntry> {
        let id = remote.id.clone();
        if self.has_tasks_for(&id) {
            return self.state.entries.get(&id).cloned();
        }
        if let Some(local) = self.state.entries.get(&id) {
            if local.is_dirty() {
                return Some(local.clone());
            }
        }
        let mut record = remote;
        record.state = EntryState::Synced;
        let inserted = put_record(&mut self.state, record.clone());
        self.persist_entry(&id).await;
        if inserted {
            self.persist_manifest().await;
        }
        Some(record)
    }

    /// Overwrites local state with the remote truth for one id, used when a
    /// conflicted change is discarded. `None` means the remote no longer
    /// has the entry.
    pub async fn restore_remote_entry(&mut self, entry_id: &str, remote: Option<FoodDiaryEntry>) {
        match remote {
            Some(mut record) => {
                record.state = EntryState::Synced;
                let id = record.id.clone();
                let inserted = put_record(&mut self.state, record);
                self.persist_entry(&id).await;
                if inserted {
                    self.persist_manifest().await;
                }
            }
            None => {
                let canonical = self.resolve(entry_id).to_string();
                if remove_record(&mut self.state, &canonical).is_some() {
                    self.persist_manifest().await;
                    self.persist_entry(&canonical).await;
                }
            }
        }
    }

    // ---- write-behind ----

    async fn persist_entry(&self, entry_id: &str) {
        let key = entry_key(entry_id);
        match self.state.entries.get(entry_id) {
            Some(entry) => self.persist_json(&key, entry).await,
            None => {
                if let Err(err) = self.storage.set(&key, Value::Null).await {
                    warn!(key = %key, %err, "write-behind failed; cache stays authoritative");
                }
            }
        }
    }

    async fn storage_tombstone(&self, entry_id: &str) {
        let key = entry_key(entry_id);
        if let Err(err) = self.storage.set(&key, Value::Null).await {
            warn!(key = %key, %err, "write-behind failed; cache stays authoritative");
        }
    }

    async fn persist_manifest(&self) {
        self.persist_json(KEY_MANIFEST, &self.state.order).await;
    }

    async fn persist_aliases(&self) {
        self.persist_json(KEY_ALIASES, &self.state.aliases).await;
    }

    pub(crate) async fn persist_tasks(&self) {
        self.persist_json(KEY_TASKS, &self.state.tasks).await;
    }

    async fn persist_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => {
                if let Err(err) = self.storage.set(key, value).await {
                    warn!(key = %key, %err, "write-behind failed; cache stays authoritative");
                }
            }
            Err(err) => warn!(key = %key, %err, "could not encode record for storage"),
        }
    }
}

async fn load_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Option<T> {
    match storage.get(key).await {
        Ok(Some(value)) if !value.is_null() => match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key = %key, %err, "skipping corrupt record");
                None
            }
        },
        Ok(_) => None,
        Err(err) => {
            warn!(key = %key, %err, "could not read record; starting without it");
            None
        }
    }
}

/// Inserts or replaces a record, keeping the order list and date index in
/// step. Returns true when the id is new to the cache.
fn put_record(state: &mut StoreState, entry: FoodDiaryEntry) -> bool {
    let id = entry.id.clone();
    let date = entry.date;
    let previous = state.entries.insert(id.clone(), entry);
    let inserted = previous.is_none();
    if inserted {
        state.order.push(id.clone());
    } else if let Some(previous) = previous {
        if previous.date != date {
            if let Some(bucket) = state.by_date.get_mut(&previous.date) {
                bucket.retain(|other| other != &id);
                if bucket.is_empty() {
                    state.by_date.remove(&previous.date);
                }
            }
        }
    }
    let bucket = state.by_date.entry(date).or_default();
    if !bucket.contains(&id) {
        bucket.push(id);
    }
    inserted
}

fn remove_record(state: &mut StoreState, entry_id: &str) -> Option<FoodDiaryEntry> {
    let removed = state.entries.remove(entry_id)?;
    state.order.retain(|other| other != entry_id);
    if let Some(bucket) = state.by_date.get_mut(&removed.date) {
        bucket.retain(|other| other != entry_id);
        if bucket.is_empty() {
            state.by_date.remove(&removed.date);
        }
    }
    Some(removed)
}

fn dedupe_in_place(ids: &mut Vec<String>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}
