//! Domain types for the diary cache and the pending-action queue.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Fields a patch is never allowed to touch.
pub(crate) const PROTECTED_FIELDS: &[&str] = &["id", "state", "revision"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealType::Breakfast => "breakfast",
            MealType::Lunch => "lunch",
            MealType::Dinner => "dinner",
            MealType::Snack => "snack",
        }
    }
}

impl std::str::FromStr for MealType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakfast" => Ok(MealType::Breakfast),
            "lunch" => Ok(MealType::Lunch),
            "dinner" => Ok(MealType::Dinner),
            "snack" => Ok(MealType::Snack),
            other => Err(format!(
                "unknown meal type '{other}' (expected breakfast, lunch, dinner or snack)"
            )),
        }
    }
}

/// Sync lifecycle of a cached entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Created locally, never confirmed by the remote.
    #[default]
    LocalOnly,
    /// Confirmed once, then changed locally.
    LocallyModified,
    /// Matches the last confirmed remote copy.
    Synced,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::LocalOnly => "local_only",
            EntryState::LocallyModified => "locally_modified",
            EntryState::Synced => "synced",
        }
    }
}

/// One logged meal. Unknown fields survive round-trips through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodDiaryEntry {
    pub id: String,
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub logged_at: DateTime<Utc>,
    #[serde(default)]
    pub state: EntryState,
    /// Opaque concurrency token from the last remote confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FoodDiaryEntry {
    /// Local copy diverges from the last remote confirmation.
    pub fn is_dirty(&self) -> bool {
        self.state != EntryState::Synced
    }
}

/// Caller-supplied draft for a new entry; the repository assigns the id
/// and the logged-at timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntry {
    pub date: NaiveDate,
    pub meal_type: MealType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NewEntry {
    pub fn into_entry(self, id: String, logged_at: DateTime<Utc>) -> FoodDiaryEntry {
        FoodDiaryEntry {
            id,
            date: self.date,
            meal_type: self.meal_type,
            name: self.name,
            calories: self.calories,
            protein_g: self.protein_g,
            carbs_g: self.carbs_g,
            fat_g: self.fat_g,
            notes: self.notes,
            logged_at,
            state: EntryState::LocalOnly,
            revision: None,
            extra: self.extra,
        }
    }
}

/// Partial update: field name to new value, `null` clears a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryPatch(Map<String, Value>);

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges the patch over `entry` field by field. Protected fields are
    /// skipped; a `null` removes the field, which clears optional or
    /// unknown ones and fails for required ones.
    pub fn apply_to(&self, entry: &FoodDiaryEntry) -> Result<FoodDiaryEntry, serde_json::Error> {
        let mut merged = serde_json::to_value(entry)?;
        if let Value::Object(fields) = &mut merged {
            for (key, patch_value) in &self.0 {
                if PROTECTED_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                if patch_value.is_null() {
                    fields.remove(key);
                } else {
                    fields.insert(key.clone(), patch_value.clone());
                }
            }
        }
        serde_json::from_value(merged)
    }
}

impl FromIterator<(String, Value)> for EntryPatch {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a queued task will do against the remote once replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskPayload {
    Create {
        entry: FoodDiaryEntry,
    },
    Update {
        entry_id: String,
        patch: EntryPatch,
        /// Revision the update must land on; refreshed when the task is
        /// claimed. `None` until the entry has a confirmed revision.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_revision: Option<String>,
        #[serde(default)]
        force: bool,
    },
    Delete {
        entry_id: String,
        /// `None` means the remote never confirmed this entry, so there is
        /// nothing to delete there.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_revision: Option<String>,
        #[serde(default)]
        force: bool,
    },
}

impl TaskPayload {
    pub fn entry_id(&self) -> &str {
        match self {
            TaskPayload::Create { entry } => &entry.id,
            TaskPayload::Update { entry_id, .. } => entry_id,
            TaskPayload::Delete { entry_id, .. } => entry_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Create { .. } => "create",
            TaskPayload::Update { .. } => "update",
            TaskPayload::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Why a task stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote copy moved under the task's base revision.
    Conflict,
    /// The remote rejected the payload outright.
    Validation,
    /// Retry budget spent on transient errors.
    Exhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Conflict => "conflict",
            FailureKind::Validation => "validation",
            FailureKind::Exhausted => "exhausted",
        }
    }
}

/// One deferred remote mutation, persisted until confirmed or discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineTask {
    pub id: Uuid,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Earliest time the task may run again; pushed out by backoff.
    pub due_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl OfflineTask {
    pub fn new(payload: TaskPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: now,
            status: TaskStatus::Pending,
            attempts: 0,
            due_at: now,
            error: None,
            failure: None,
        }
    }

    pub fn entry_id(&self) -> &str {
        self.payload.entry_id()
    }
}

/// Caller's answer to a conflicted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Drop the local change and re-adopt the remote copy.
    DiscardLocal,
    /// Replay the change without its revision precondition.
    ForceOverwrite,
}

impl std::str::FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" | "discard-local" => Ok(ConflictResolution::DiscardLocal),
            "force" | "force-overwrite" => Ok(ConflictResolution::ForceOverwrite),
            other => Err(format!(
                "unknown resolution '{other}' (expected discard-local or force-overwrite)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meal_type: Option<MealType>,
}

impl SearchOptions {
    /// Page and limit with defaults applied and out-of-range values clamped.
    pub fn normalized(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(20).clamp(1, 100);
        (page, limit)
    }

    pub fn matches(&self, entry: &FoodDiaryEntry) -> bool {
        if let Some(date) = self.date {
            if entry.date != date {
                return false;
            }
        }
        if let Some(meal_type) = self.meal_type {
            if entry.meal_type != meal_type {
                return false;
            }
        }
        true
    }
}

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub items: Vec<FoodDiaryEntry>,
    pub total_count: usize,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

impl SearchResult {
    /// Slices an already-filtered list into the requested page.
    pub fn paginate(all: Vec<FoodDiaryEntry>, page: u32, limit: u32) -> Self {
        let total_count = all.len();
        let start = (page as usize - 1).saturating_mul(limit as usize);
        let items: Vec<FoodDiaryEntry> =
            all.into_iter().skip(start).take(limit as usize).collect();
        let has_more = (page as usize) * (limit as usize) < total_count;
        Self {
            items,
            total_count,
            page,
            limit,
            has_more,
        }
    }
}
