//! Remote diary API client and the connectivity signal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::info;

use crate::error::DiaryError;
use crate::model::{
    EntryPatch, EntryState, FoodDiaryEntry, MealType, SearchOptions, SearchResult,
    PROTECTED_FIELDS,
};

const USER_AGENT: &str = "mealdiary/0.1";

/// Remote CRUD surface the sync engine replays against.
///
/// Contract for implementations: returned entries carry the remote's
/// revision and are marked synced. Updating or deleting an id the remote
/// does not have is a conflict, except that a forced delete of a missing
/// id succeeds. A `base_revision` is a precondition: when given and not
/// forced, a mismatch must fail with a conflict rather than apply.
#[async_trait]
pub trait DiaryApi: Send + Sync {
    async fn ping(&self) -> Result<(), DiaryError>;
    async fn fetch_entry(&self, entry_id: &str) -> Result<Option<FoodDiaryEntry>, DiaryError>;
    async fn search_entries(&self, options: &SearchOptions) -> Result<SearchResult, DiaryError>;
    async fn create_entry(&self, entry: &FoodDiaryEntry) -> Result<FoodDiaryEntry, DiaryError>;
    async fn update_entry(
        &self,
        entry_id: &str,
        patch: &EntryPatch,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<FoodDiaryEntry, DiaryError>;
    async fn delete_entry(
        &self,
        entry_id: &str,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<(), DiaryError>;
}

pub type SharedApi = Arc<dyn DiaryApi>;

/// HTTP implementation of [`DiaryApi`].
#[derive(Clone)]
pub struct HttpDiaryApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpDiaryApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDiaryApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpDiaryApi {
    /// `base_url` must end with a slash so endpoint joins append to it.
    pub fn new(base_url: Url, token: String, request_timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, DiaryError> {
        self.base_url
            .join(path)
            .map_err(|err| DiaryError::Validation(format!("invalid API url: {err}")))
    }

    fn ping_request(&self) -> Result<reqwest::Request, DiaryError> {
        let endpoint = self.endpoint("v1/ping")?;
        self.bearer(self.http.get(endpoint)).build().map_err(wire_error)
    }

    fn fetch_request(&self, entry_id: &str) -> Result<reqwest::Request, DiaryError> {
        let endpoint = self.endpoint(&format!("v1/entries/{entry_id}"))?;
        self.bearer(self.http.get(endpoint)).build().map_err(wire_error)
    }

    fn search_request(&self, options: &SearchOptions) -> Result<reqwest::Request, DiaryError> {
        let mut endpoint = self.endpoint("v1/entries")?;
        {
            let mut query = endpoint.query_pairs_mut();
            let (page, limit) = options.normalized();
            query.append_pair("page", &page.to_string());
            query.append_pair("limit", &limit.to_string());
            if let Some(date) = options.date {
                query.append_pair("date", &date.to_string());
            }
            if let Some(meal_type) = options.meal_type {
                query.append_pair("meal_type", meal_type.as_str());
            }
        }
        self.bearer(self.http.get(endpoint)).build().map_err(wire_error)
    }

    fn create_request(&self, entry: &FoodDiaryEntry) -> Result<reqwest::Request, DiaryError> {
        let endpoint = self.endpoint("v1/entries")?;
        let body = entry_body(entry)?;
        self.bearer(self.http.post(endpoint))
            .json(&body)
            .build()
            .map_err(wire_error)
    }

    fn update_request(
        &self,
        entry_id: &str,
        patch: &EntryPatch,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<reqwest::Request, DiaryError> {
        let endpoint = self.endpoint(&format!("v1/entries/{entry_id}"))?;
        let body = patch_body(patch)?;
        let mut builder = self.bearer(self.http.patch(endpoint)).json(&body);
        if let (Some(revision), false) = (base_revision, force) {
            builder = builder.header("If-Match", revision);
        }
        builder.build().map_err(wire_error)
    }

    fn delete_request(
        &self,
        entry_id: &str,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<reqwest::Request, DiaryError> {
        let endpoint = self.endpoint(&format!("v1/entries/{entry_id}"))?;
        let mut builder = self.bearer(self.http.delete(endpoint));
        if let (Some(revision), false) = (base_revision, force) {
            builder = builder.header("If-Match", revision);
        }
        builder.build().map_err(wire_error)
    }

    fn bearer(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl DiaryApi for HttpDiaryApi {
    async fn ping(&self) -> Result<(), DiaryError> {
        let response = self.http.execute(self.ping_request()?).await?;
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        Ok(())
    }

    async fn fetch_entry(&self, entry_id: &str) -> Result<Option<FoodDiaryEntry>, DiaryError> {
        let response = self.http.execute(self.fetch_request(entry_id)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        let wire: WireEntry = response.json().await?;
        Ok(Some(wire.into_entry()))
    }

    async fn search_entries(&self, options: &SearchOptions) -> Result<SearchResult, DiaryError> {
        let response = self.http.execute(self.search_request(options)?).await?;
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        let wire: WireSearchResult = response.json().await?;
        Ok(wire.into_result())
    }

    async fn create_entry(&self, entry: &FoodDiaryEntry) -> Result<FoodDiaryEntry, DiaryError> {
        let response = self.http.execute(self.create_request(entry)?).await?;
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        let wire: WireEntry = response.json().await?;
        Ok(wire.into_entry())
    }

    async fn update_entry(
        &self,
        entry_id: &str,
        patch: &EntryPatch,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<FoodDiaryEntry, DiaryError> {
        let request = self.update_request(entry_id, patch, base_revision, force)?;
        let response = self.http.execute(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DiaryError::Conflict(format!(
                "entry {entry_id} no longer exists on the remote"
            )));
        }
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        let wire: WireEntry = response.json().await?;
        Ok(wire.into_entry())
    }

    async fn delete_entry(
        &self,
        entry_id: &str,
        base_revision: Option<&str>,
        force: bool,
    ) -> Result<(), DiaryError> {
        let request = self.delete_request(entry_id, base_revision, force)?;
        let response = self.http.execute(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            if force {
                return Ok(());
            }
            return Err(DiaryError::Conflict(format!(
                "entry {entry_id} no longer exists on the remote"
            )));
        }
        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }
        Ok(())
    }
}

impl From<reqwest::Error> for DiaryError {
    fn from(err: reqwest::Error) -> Self {
        DiaryError::Transient(err.to_string())
    }
}

fn wire_error(err: reqwest::Error) -> DiaryError {
    DiaryError::Validation(format!("failed to build request: {err}"))
}

async fn classify_failure(response: reqwest::Response) -> DiaryError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body)
}

fn classify_status(status: StatusCode, body: &str) -> DiaryError {
    let detail = if body.is_empty() {
        format!("remote returned {status}")
    } else {
        format!("remote returned {status}: {body}")
    };
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => DiaryError::Conflict(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DiaryError::Transient(detail)
        }
        s if s.is_server_error() => DiaryError::Transient(detail),
        s if s.is_client_error() => DiaryError::Validation(detail),
        _ => DiaryError::Transient(detail),
    }
}

/// Full entry as the remote ships it. No sync state, and the revision is
/// mandatory: every confirmed copy has one.
#[derive(Debug, Deserialize)]
struct WireEntry {
    id: String,
    date: NaiveDate,
    meal_type: MealType,
    name: String,
    #[serde(default)]
    calories: Option<f64>,
    #[serde(default)]
    protein_g: Option<f64>,
    #[serde(default)]
    carbs_g: Option<f64>,
    #[serde(default)]
    fat_g: Option<f64>,
    #[serde(default)]
    notes: Option<String>,
    logged_at: DateTime<Utc>,
    revision: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl WireEntry {
    fn into_entry(self) -> FoodDiaryEntry {
        FoodDiaryEntry {
            id: self.id,
            date: self.date,
            meal_type: self.meal_type,
            name: self.name,
            calories: self.calories,
            protein_g: self.protein_g,
            carbs_g: self.carbs_g,
            fat_g: self.fat_g,
            notes: self.notes,
            logged_at: self.logged_at,
            state: EntryState::Synced,
            revision: Some(self.revision),
            extra: self.extra,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireSearchResult {
    items: Vec<WireEntry>,
    total_count: usize,
    page: u32,
    limit: u32,
    has_more: bool,
}

impl WireSearchResult {
    fn into_result(self) -> SearchResult {
        SearchResult {
            items: self.items.into_iter().map(WireEntry::into_entry).collect(),
            total_count: self.total_count,
            page: self.page,
            limit: self.limit,
            has_more: self.has_more,
        }
    }
}

/// Local entry as sent to the remote: everything except the fields the
/// remote owns.
fn entry_body(entry: &FoodDiaryEntry) -> Result<Value, DiaryError> {
    let mut body = serde_json::to_value(entry)
        .map_err(|err| DiaryError::Validation(format!("entry not serializable: {err}")))?;
    if let Some(fields) = body.as_object_mut() {
        fields.remove("state");
        fields.remove("revision");
    }
    Ok(body)
}

fn patch_body(patch: &EntryPatch) -> Result<Value, DiaryError> {
    let mut body = serde_json::to_value(patch)
        .map_err(|err| DiaryError::Validation(format!("patch not serializable: {err}")))?;
    if let Some(fields) = body.as_object_mut() {
        for field in PROTECTED_FIELDS {
            fields.remove(*field);
        }
    }
    Ok(body)
}

/// Shared online/offline flag. Flipping it wakes every subscriber, which
/// is how the sync engine notices the network coming back.
#[derive(Clone)]
pub struct Connectivity {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, receiver) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.receiver.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> HttpDiaryApi {
        HttpDiaryApi::new(
            Url::parse("https://diary.example.test/api/").unwrap(),
            "token".into(),
            Duration::from_secs(5),
        )
    }

    fn sample_entry() -> FoodDiaryEntry {
        FoodDiaryEntry {
            id: "e1".into(),
            date: "2026-03-14".parse().unwrap(),
            meal_type: MealType::Lunch,
            name: "ramen".into(),
            calories: Some(450.0),
            protein_g: None,
            carbs_g: None,
            fat_g: None,
            notes: None,
            logged_at: Utc::now(),
            state: EntryState::LocalOnly,
            revision: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn requests_carry_bearer_token_and_versioned_paths() {
        let api = api();

        let fetch = api.fetch_request("e1").unwrap();
        assert_eq!(fetch.method(), reqwest::Method::GET);
        assert_eq!(fetch.url().path(), "/api/v1/entries/e1");
        assert_eq!(
            fetch
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );

        let ping = api.ping_request().unwrap();
        assert_eq!(ping.url().path(), "/api/v1/ping");
    }

    #[test]
    fn create_request_strips_remote_owned_fields() {
        let api = api();
        let mut entry = sample_entry();
        entry.revision = Some("rev-1".into());

        let request = api.create_request(&entry).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        let body: Value = serde_json::from_slice(
            request.body().and_then(|b| b.as_bytes()).unwrap(),
        )
        .unwrap();
        assert_eq!(body["id"], json!("e1"));
        assert_eq!(body["name"], json!("ramen"));
        assert!(body.get("state").is_none());
        assert!(body.get("revision").is_none());
    }

    #[test]
    fn update_request_sets_precondition_unless_forced() {
        let api = api();
        let patch = EntryPatch::new().set("name", json!("miso ramen"));

        let guarded = api
            .update_request("e1", &patch, Some("rev-3"), false)
            .unwrap();
        assert_eq!(guarded.method(), reqwest::Method::PATCH);
        assert_eq!(
            guarded
                .headers()
                .get("If-Match")
                .and_then(|h| h.to_str().ok()),
            Some("rev-3")
        );

        let forced = api.update_request("e1", &patch, Some("rev-3"), true).unwrap();
        assert!(forced.headers().get("If-Match").is_none());

        let unconfirmed = api.update_request("e1", &patch, None, false).unwrap();
        assert!(unconfirmed.headers().get("If-Match").is_none());
    }

    #[test]
    fn search_request_encodes_filters() {
        let api = api();
        let options = SearchOptions {
            page: Some(2),
            limit: Some(10),
            date: Some("2026-03-14".parse().unwrap()),
            meal_type: Some(MealType::Dinner),
        };

        let request = api.search_request(&options).unwrap();
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("page".into(), "2".into())));
        assert!(pairs.contains(&("limit".into(), "10".into())));
        assert!(pairs.contains(&("date".into(), "2026-03-14".into())));
        assert!(pairs.contains(&("meal_type".into(), "dinner".into())));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "revision moved"),
            DiaryError::Conflict(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::PRECONDITION_FAILED, ""),
            DiaryError::Conflict(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad date"),
            DiaryError::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            DiaryError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            DiaryError::Transient(_)
        ));
    }

    #[test]
    fn wire_entry_becomes_synced_with_revision() {
        let wire: WireEntry = serde_json::from_value(json!({
            "id": "srv-1",
            "date": "2026-03-14",
            "meal_type": "lunch",
            "name": "ramen",
            "logged_at": "2026-03-14T12:00:00Z",
            "revision": "rev-7",
            "mood": "great"
        }))
        .unwrap();

        let entry = wire.into_entry();
        assert_eq!(entry.state, EntryState::Synced);
        assert_eq!(entry.revision.as_deref(), Some("rev-7"));
        assert_eq!(entry.extra.get("mood"), Some(&json!("great")));
    }

    #[tokio::test]
    async fn connectivity_flips_wake_subscribers() {
        let connectivity = Connectivity::new(false);
        assert!(!connectivity.is_online());

        let mut rx = connectivity.subscribe();
        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(connectivity.is_online());
    }
}
