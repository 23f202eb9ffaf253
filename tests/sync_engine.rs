//! Drain behavior end to end: ordering, retries, conflicts, recovery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Map};

use mealdiary::error::DiaryError;
use mealdiary::model::{
    ConflictResolution, EntryPatch, EntryState, FailureKind, FoodDiaryEntry, MealType, NewEntry,
    SearchOptions, SearchResult, TaskPayload, TaskStatus,
};
use mealdiary::remote::{Connectivity, DiaryApi};
use mealdiary::repo::FoodDiaryRepository;
use mealdiary::storage::MemoryStorage;
use mealdiary::store::DiaryStore;
use mealdiary::sync::{SyncEngine, SyncKick, SyncOptions};

/// In-process remote with real CRUD semantics: server-assigned ids,
/// revision bumps, precondition checks, scripted failures and optional
/// latency. Tracks overlapping calls per entry id.
#[derive(Default)]
struct FakeRemote {
    state: Mutex<HashMap<String, FoodDiaryEntry>>,
    next_id: AtomicU64,
    next_rev: AtomicU64,
    failures: Mutex<HashMap<String, VecDeque<DiaryError>>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: Mutex<HashMap<String, usize>>,
    busy: AtomicUsize,
    max_entry_overlap: AtomicUsize,
    max_overlap: AtomicUsize,
}

struct Flight<'a> {
    remote: &'a FakeRemote,
    key: String,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.remote.busy.fetch_sub(1, Ordering::SeqCst);
        if let Some(slot) = self.remote.in_flight.lock().unwrap().get_mut(&self.key) {
            *slot = slot.saturating_sub(1);
        }
    }
}

impl FakeRemote {
    fn seed(&self, entry: FoodDiaryEntry) {
        self.state.lock().unwrap().insert(entry.id.clone(), entry);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn fail_next(&self, entry_id: &str, err: DiaryError) {
        self.failures
            .lock()
            .unwrap()
            .entry(entry_id.to_string())
            .or_default()
            .push_back(err);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn entry(&self, id: &str) -> Option<FoodDiaryEntry> {
        self.state.lock().unwrap().get(id).cloned()
    }

    fn entry_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    fn max_entry_overlap(&self) -> usize {
        self.max_entry_overlap.load(Ordering::SeqCst)
    }

    fn begin(&self, entry_id: &str, call: String) -> Flight<'_> {
        self.calls.lock().unwrap().push(call);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let slot = in_flight.entry(entry_id.to_string()).or_insert(0);
            *slot += 1;
            self.max_entry_overlap.fetch_max(*slot, Ordering::SeqCst);
        }
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overlap.fetch_max(busy, Ordering::SeqCst);
        Flight {
            remote: self,
            key: entry_id.to_string(),
        }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn planned_failure(&self, entry_id: &str) -> Option<DiaryError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(entry_id)
            .and_then(|queue| queue.pop_front())
    }

    fn bump_rev(&self) -> String {
        format!("rev-{}", self.next_rev.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl DiaryApi for FakeRemote {
    async fn ping(&self) -> Result<(), DiaryError> {
        Ok(())
    }

    async fn fetch_entry(&self, entry_id: &str) -> Result<Option<FoodDiaryEntry>, DiaryError> {
        self.calls.lock().unwrap().push(format!("fetch {entry_id}"));
        Ok(self.entry(entry_id))
    }

    async fn search_entries(&self, options: &SearchOptions) -> Result<SearchResult, DiaryError> {
        self.calls.lock().unwrap().push("search".to_string());
        let mut all: Vec<FoodDiaryEntry> = self
            .state
            .lock()
            .unwrap()
            .values()
            .filter(|entry| options.matches(entry))
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let (page, limit) = options.normalized();
        Ok(SearchResult::paginate(all, page, limit))
    }

    async fn create_entry(&self, entry: &FoodDiaryEntry) -> Result<FoodDiaryEntry, DiaryError> {
        let _flight = self.begin(&entry.id, format!("create {}", entry.id));
        self.pause().await;
        if let Some(err) = self.planned_failure(&entry.id) {
            return Err(err);
        }
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut confirmed = entry.clone();
        confirmed.id = id.clone();
        confirmed.state = EntryState::Synced;
        confirmed.revision = Some(self.bump_rev());
        self.state.lock().unwrap().insert(id, confirmed.clone());
        Ok(confirmed)
    }

    async fn update_entry(
        &self,
        entry_id: &str,
        patch: &EntryPatch,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<FoodDiaryEntry, DiaryError> {
        let _flight = self.begin(entry_id, format!("update {entry_id}"));
        self.pause().await;
        if let Some(err) = self.planned_failure(entry_id) {
            return Err(err);
        }
        let current = self
            .entry(entry_id)
            .ok_or_else(|| DiaryError::Conflict(format!("entry {entry_id} no longer exists")))?;
        if !force {
            if let Some(base) = base_revision {
                if current.revision.as_deref() != Some(base) {
                    return Err(DiaryError::Conflict(format!(
                        "entry {entry_id} moved on from {base}"
                    )));
                }
            }
        }
        let mut confirmed = patch
            .apply_to(&current)
            .map_err(|err| DiaryError::Validation(err.to_string()))?;
        confirmed.revision = Some(self.bump_rev());
        self.state
            .lock()
            .unwrap()
            .insert(entry_id.to_string(), confirmed.clone());
        Ok(confirmed)
    }

    async fn delete_entry(
        &self,
        entry_id: &str,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<(), DiaryError> {
        let _flight = self.begin(entry_id, format!("delete {entry_id}"));
        self.pause().await;
        if let Some(err) = self.planned_failure(entry_id) {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.get(entry_id) else {
            return if force {
                Ok(())
            } else {
                Err(DiaryError::Conflict(format!(
                    "entry {entry_id} no longer exists"
                )))
            };
        };
        if !force {
            if let Some(base) = base_revision {
                if current.revision.as_deref() != Some(base) {
                    return Err(DiaryError::Conflict(format!(
                        "entry {entry_id} moved on from {base}"
                    )));
                }
            }
        }
        state.remove(entry_id);
        Ok(())
    }
}

struct Harness {
    repo: FoodDiaryRepository,
    engine: Arc<SyncEngine>,
    store: Arc<DiaryStore>,
    remote: Arc<FakeRemote>,
    connectivity: Connectivity,
}

async fn harness(options: SyncOptions) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let store = Arc::new(DiaryStore::open(storage).await);
    let remote = Arc::new(FakeRemote::default());
    let connectivity = Connectivity::new(true);
    let kick = SyncKick::new();
    let repo = FoodDiaryRepository::new(
        store.clone(),
        remote.clone(),
        connectivity.clone(),
        kick.clone(),
    );
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        remote.clone(),
        connectivity.clone(),
        options,
        kick,
    ));
    Harness {
        repo,
        engine,
        store,
        remote,
        connectivity,
    }
}

fn fast_options() -> SyncOptions {
    SyncOptions {
        backoff_base: Duration::ZERO,
        ..SyncOptions::default()
    }
}

fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn draft(name: &str, date: &str) -> NewEntry {
    NewEntry {
        date: day(date),
        meal_type: MealType::Lunch,
        name: name.to_string(),
        calories: Some(520.0),
        protein_g: None,
        carbs_g: None,
        fat_g: None,
        notes: None,
        extra: Map::new(),
    }
}

fn server_entry(id: &str, name: &str, date: &str, revision: &str) -> FoodDiaryEntry {
    FoodDiaryEntry {
        id: id.to_string(),
        date: day(date),
        meal_type: MealType::Dinner,
        name: name.to_string(),
        calories: None,
        protein_g: None,
        carbs_g: None,
        fat_g: None,
        notes: None,
        logged_at: Utc::now(),
        state: EntryState::Synced,
        revision: Some(revision.to_string()),
        extra: Map::new(),
    }
}

#[tokio::test]
async fn replays_offline_mutations_in_order() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("oatmeal", "2025-04-01")).await;
    h.repo
        .update(&saved.id, EntryPatch::new().set("name", json!("oatmeal + honey")))
        .await
        .unwrap();

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (2, 0, 0));
    assert_eq!(
        h.remote.calls(),
        vec![format!("create {}", saved.id), "update srv-1".to_string()]
    );

    // The provisional id still resolves to the confirmed record.
    let synced = h.repo.get(&saved.id).await.unwrap().unwrap();
    assert_eq!(synced.id, "srv-1");
    assert_eq!(synced.name, "oatmeal + honey");
    assert_eq!(synced.state, EntryState::Synced);
    assert_eq!(synced.revision.as_deref(), Some("rev-2"));
    assert!(h.repo.queue_stats().await.is_idle());
    assert_eq!(h.remote.entry("srv-1").unwrap().name, "oatmeal + honey");
}

#[tokio::test]
async fn a_second_drain_has_nothing_to_do() {
    let h = harness(fast_options()).await;
    h.repo.save(draft("soup", "2025-04-01")).await;
    h.engine.drain().await;
    let before = h.remote.calls().len();

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 0));
    assert_eq!(h.remote.calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn lanes_replay_serially_but_fan_out_across_entries() {
    let h = harness(SyncOptions {
        backoff_base: Duration::ZERO,
        fan_out: 8,
        ..SyncOptions::default()
    })
    .await;
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(h.repo.save(draft(name, "2025-04-02")).await.id);
    }
    h.engine.drain().await;

    h.remote.set_delay(Duration::from_millis(30));
    for id in &ids {
        h.repo
            .update(id, EntryPatch::new().set("name", json!(format!("{id} first"))))
            .await
            .unwrap();
        h.repo
            .update(id, EntryPatch::new().set("name", json!(format!("{id} final"))))
            .await
            .unwrap();
    }

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (6, 0, 0));
    // Tasks for one entry never overlap; different entries fan out.
    assert_eq!(h.remote.max_entry_overlap(), 1);
    assert!(h.remote.max_overlap() >= 2);
    for id in &ids {
        let synced = h.repo.get(id).await.unwrap().unwrap();
        assert!(synced.name.ends_with("final"));
        assert_eq!(synced.state, EntryState::Synced);
    }
}

#[tokio::test]
async fn transient_failures_retry_within_the_drain() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("flaky", "2025-04-03")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Transient("gateway hiccup".into()));
    h.remote
        .fail_next(&saved.id, DiaryError::Transient("gateway hiccup".into()));

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (1, 0, 2));
    assert_eq!(h.remote.calls().len(), 3);
    assert!(h.repo.queue_stats().await.is_idle());
    assert_eq!(
        h.repo.get(&saved.id).await.unwrap().unwrap().state,
        EntryState::Synced
    );
}

#[tokio::test]
async fn backoff_defers_retries_beyond_the_drain() {
    let h = harness(SyncOptions::default()).await;
    let saved = h.repo.save(draft("parked", "2025-04-03")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Transient("gateway hiccup".into()));

    let summary = h.engine.drain().await;
    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 1));

    let tasks = h.repo.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].attempts, 1);
    assert!(tasks[0].due_at > Utc::now());

    // Not due yet, so another pass claims nothing.
    let summary = h.engine.drain().await;
    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 0));
    assert_eq!(h.remote.calls().len(), 1);
}

#[tokio::test]
async fn retry_budget_exhaustion_parks_the_task() {
    let h = harness(SyncOptions {
        backoff_base: Duration::ZERO,
        max_attempts: 3,
        ..SyncOptions::default()
    })
    .await;
    let saved = h.repo.save(draft("doomed", "2025-04-04")).await;
    for _ in 0..3 {
        h.remote
            .fail_next(&saved.id, DiaryError::Transient("still down".into()));
    }

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 1, 2));
    assert_eq!(h.remote.calls().len(), 3);
    let failed = h.repo.failed_tasks().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure, Some(FailureKind::Exhausted));
    // The entry stays cached and dirty, awaiting retry or discard.
    assert_eq!(
        h.repo.get(&saved.id).await.unwrap().unwrap().state,
        EntryState::LocalOnly
    );
}

#[tokio::test]
async fn revision_conflict_fails_without_retry() {
    let h = harness(fast_options()).await;
    h.remote
        .seed(server_entry("srv-1", "server ramen", "2025-04-05", "rev-2"));
    {
        let mut handle = h.store.lock().await;
        handle
            .upsert_entry(server_entry("srv-1", "ramen", "2025-04-05", "rev-1"))
            .await;
    }
    h.repo
        .update("srv-1", EntryPatch::new().set("name", json!("my ramen")))
        .await
        .unwrap();

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 1, 0));
    assert_eq!(h.remote.calls(), vec!["update srv-1".to_string()]);
    let failed = h.repo.failed_tasks().await;
    assert_eq!(failed[0].failure, Some(FailureKind::Conflict));
    // Local intent is preserved for the caller to settle.
    let local = h.repo.get("srv-1").await.unwrap().unwrap();
    assert_eq!(local.name, "my ramen");
    assert_eq!(local.state, EntryState::LocallyModified);
}

#[tokio::test]
async fn validation_failure_is_terminal() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("rejected", "2025-04-05")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Validation("name too long".into()));

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 1, 0));
    assert_eq!(h.remote.calls().len(), 1);
    assert_eq!(
        h.repo.failed_tasks().await[0].failure,
        Some(FailureKind::Validation)
    );
}

#[tokio::test(start_paused = true)]
async fn slow_remote_calls_time_out_and_retry() {
    let h = harness(SyncOptions {
        request_timeout: Duration::from_millis(10),
        ..SyncOptions::default()
    })
    .await;
    h.remote.set_delay(Duration::from_millis(50));
    h.repo.save(draft("slow", "2025-04-06")).await;

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 1));
    assert_eq!(h.remote.calls().len(), 1);
    let tasks = h.repo.tasks().await;
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert!(h.repo.failed_tasks().await.is_empty());
}

#[tokio::test]
async fn failed_create_freezes_its_lane_only() {
    let h = harness(fast_options()).await;
    let a = h.repo.save(draft("blocked", "2025-04-07")).await;
    let b = h.repo.save(draft("fine", "2025-04-07")).await;
    h.remote
        .fail_next(&a.id, DiaryError::Validation("flagged".into()));

    let summary = h.engine.drain().await;
    assert_eq!((summary.completed, summary.failed, summary.deferred), (1, 1, 0));
    assert_eq!(h.repo.get(&b.id).await.unwrap().unwrap().state, EntryState::Synced);

    // Work queued behind the failed head stays frozen.
    h.repo
        .update(&a.id, EntryPatch::new().set("name", json!("second try")))
        .await
        .unwrap();
    let before = h.remote.calls().len();
    let summary = h.engine.drain().await;
    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 0));
    assert_eq!(h.remote.calls().len(), before);
}

#[tokio::test]
async fn retrying_a_failed_create_releases_its_lane() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("second chance", "2025-04-08")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Validation("flagged".into()));
    h.engine.drain().await;
    h.repo
        .update(&saved.id, EntryPatch::new().set("name", json!("approved")))
        .await
        .unwrap();

    let failed = h.repo.failed_tasks().await;
    h.repo.retry_task(failed[0].id).await.unwrap();
    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (2, 0, 0));
    let synced = h.repo.get(&saved.id).await.unwrap().unwrap();
    assert_eq!(synced.name, "approved");
    assert_eq!(synced.state, EntryState::Synced);
}

#[tokio::test]
async fn discarding_a_failed_create_drops_entry_and_follow_ups() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("abandoned", "2025-04-09")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Validation("flagged".into()));
    h.engine.drain().await;
    h.repo
        .update(&saved.id, EntryPatch::new().set("name", json!("still trying")))
        .await
        .unwrap();

    let failed = h.repo.failed_tasks().await;
    h.repo.discard_task(failed[0].id).await.unwrap();

    assert_eq!(h.repo.get(&saved.id).await.unwrap(), None);
    let stats = h.repo.queue_stats().await;
    assert_eq!((stats.pending, stats.processing, stats.failed), (0, 0, 0));
}

#[tokio::test]
async fn force_overwrite_replays_past_the_precondition() {
    let h = harness(fast_options()).await;
    h.remote
        .seed(server_entry("srv-1", "server ramen", "2025-04-10", "rev-2"));
    {
        let mut handle = h.store.lock().await;
        handle
            .upsert_entry(server_entry("srv-1", "ramen", "2025-04-10", "rev-1"))
            .await;
    }
    h.repo
        .update("srv-1", EntryPatch::new().set("name", json!("my ramen")))
        .await
        .unwrap();
    h.engine.drain().await;

    let failed = h.repo.failed_tasks().await;
    h.repo
        .resolve_conflict(failed[0].id, ConflictResolution::ForceOverwrite)
        .await
        .unwrap();
    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (1, 0, 0));
    let remote = h.remote.entry("srv-1").unwrap();
    assert_eq!(remote.name, "my ramen");
    let local = h.repo.get("srv-1").await.unwrap().unwrap();
    assert_eq!(local.state, EntryState::Synced);
    assert_eq!(local.revision, remote.revision);
}

#[tokio::test]
async fn discard_local_readopts_the_remote_copy() {
    let h = harness(fast_options()).await;
    h.remote
        .seed(server_entry("srv-1", "server ramen", "2025-04-11", "rev-2"));
    {
        let mut handle = h.store.lock().await;
        handle
            .upsert_entry(server_entry("srv-1", "ramen", "2025-04-11", "rev-1"))
            .await;
    }
    h.repo
        .update("srv-1", EntryPatch::new().set("name", json!("my ramen")))
        .await
        .unwrap();
    h.engine.drain().await;

    let failed = h.repo.failed_tasks().await;
    h.repo
        .resolve_conflict(failed[0].id, ConflictResolution::DiscardLocal)
        .await
        .unwrap();

    assert!(h.repo.failed_tasks().await.is_empty());
    let local = h.repo.get("srv-1").await.unwrap().unwrap();
    assert_eq!(local.name, "server ramen");
    assert_eq!(local.state, EntryState::Synced);
    assert_eq!(local.revision.as_deref(), Some("rev-2"));
    assert!(h.remote.calls().contains(&"fetch srv-1".to_string()));
}

#[tokio::test]
async fn unconfirmed_delete_never_touches_the_remote() {
    let h = harness(fast_options()).await;
    {
        let mut handle = h.store.lock().await;
        handle
            .enqueue_task(TaskPayload::Delete {
                entry_id: "local-ghost".into(),
                base_revision: None,
                force: false,
            })
            .await;
    }

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (1, 0, 0));
    assert!(h.remote.calls().is_empty());
    assert!(h.repo.queue_stats().await.is_idle());
}

#[tokio::test(start_paused = true)]
async fn delete_lands_behind_an_in_flight_create() {
    let h = harness(fast_options()).await;
    h.remote.set_delay(Duration::from_millis(50));
    let saved = h.repo.save(draft("ephemeral", "2025-04-12")).await;

    let drain = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.drain().await }
    });
    // The paused clock only advances once every task parks, so after this
    // sleep the create has been claimed and sits inside the remote call.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.remote.calls(), vec![format!("create {}", saved.id)]);

    h.repo.delete(&saved.id).await.unwrap();
    let summary = drain.await.unwrap();

    // The create confirmed, then the queued delete followed it out.
    assert_eq!((summary.completed, summary.failed, summary.deferred), (2, 0, 0));
    assert!(h.remote.calls().contains(&"delete srv-1".to_string()));
    assert_eq!(h.remote.entry_count(), 0);
    assert!(h.store.lock().await.entry(&saved.id).is_none());
    assert!(h.repo.queue_stats().await.is_idle());
}

#[tokio::test]
async fn stale_processing_tasks_requeue_on_drain() {
    let h = harness(fast_options()).await;
    let saved = h.repo.save(draft("recovered", "2025-04-13")).await;
    // Simulate a crash mid-replay: claim the task and never settle it.
    h.store
        .lock()
        .await
        .claim_next_runnable(Utc::now())
        .await
        .unwrap();
    assert_eq!(h.repo.queue_stats().await.processing, 1);

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (1, 0, 0));
    assert_eq!(
        h.repo.get(&saved.id).await.unwrap().unwrap().state,
        EntryState::Synced
    );
}

#[tokio::test]
async fn offline_drain_claims_nothing() {
    let h = harness(fast_options()).await;
    h.connectivity.set_online(false);
    h.repo.save(draft("waiting", "2025-04-14")).await;

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 0, 0));
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.repo.queue_stats().await.pending, 1);
}

#[tokio::test]
async fn unretained_failures_drop_the_task_and_keep_the_dirt() {
    let h = harness(SyncOptions {
        backoff_base: Duration::ZERO,
        retain_failed: false,
        ..SyncOptions::default()
    })
    .await;
    let saved = h.repo.save(draft("lost cause", "2025-04-15")).await;
    h.remote
        .fail_next(&saved.id, DiaryError::Validation("flagged".into()));

    let summary = h.engine.drain().await;

    assert_eq!((summary.completed, summary.failed, summary.deferred), (0, 1, 0));
    assert!(h.repo.failed_tasks().await.is_empty());
    assert!(h.repo.queue_stats().await.is_idle());
    // The entry is still cached, just with nothing left to replay.
    assert_eq!(
        h.repo.get(&saved.id).await.unwrap().unwrap().state,
        EntryState::LocalOnly
    );
}

#[tokio::test(start_paused = true)]
async fn engine_run_drains_on_kick() {
    let h = harness(fast_options()).await;
    let run = tokio::spawn({
        let engine = h.engine.clone();
        async move { engine.run().await }
    });

    let saved = h.repo.save(draft("kicked", "2025-04-16")).await;
    // The paused clock only advances once every task parks, so by the time
    // this sleep returns the engine has settled the queue.
    tokio::time::sleep(Duration::from_millis(1)).await;

    let synced = h.repo.get(&saved.id).await.unwrap().unwrap();
    assert_eq!(synced.state, EntryState::Synced);
    assert!(h.repo.queue_stats().await.is_idle());
    run.abort();
}
