use crate::application::movement_repository::{clear_dangling_links, MovementRepository};
use crate::application::{system_now, NowProvider};
use crate::domain::models::{Movement, Task};
use crate::infrastructure::config::RemoteConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_client::{
    ChangeKind, RemoteFilter, RemoteStoreClient, RemoteTable,
};
use crate::infrastructure::storage::{LocalStore, PendingChange};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration as TokioDuration, Instant};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOp {
    pub kind: ChangeKind,
    pub table: RemoteTable,
    pub payload: serde_json::Value,
    pub id: Option<String>,
}

impl ChangeOp {
    /// The id is taken from the payload when it carries one.
    pub fn create(table: RemoteTable, payload: serde_json::Value) -> Self {
        let id = payload
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        Self {
            kind: ChangeKind::Create,
            table,
            payload,
            id,
        }
    }

    pub fn update(table: RemoteTable, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table,
            payload,
            id: Some(id.into()),
        }
    }

    pub fn delete(table: RemoteTable, id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table,
            payload: serde_json::Value::Null,
            id: Some(id.into()),
        }
    }

    fn pending_entry(&self) -> Option<PendingChange> {
        self.id
            .as_deref()
            .map(|id| PendingChange::new(self.kind, self.table, id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeError {
    pub index: usize,
    pub id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub processed: usize,
    pub errors: Vec<ChangeError>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution<T> {
    pub source: ResolutionSource,
    pub record: T,
}

/// Records that can be reconciled by last-write-wins.
pub trait Versioned {
    fn record_id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Versioned for Task {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Versioned for Movement {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// The strictly newer record wins whole; equal timestamps keep the local one.
pub fn resolve_conflict<T: Versioned + Clone>(local: &T, remote: &T) -> Resolution<T> {
    if remote.updated_at() > local.updated_at() {
        Resolution {
            source: ResolutionSource::Remote,
            record: remote.clone(),
        }
    } else {
        Resolution {
            source: ResolutionSource::Local,
            record: local.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub kept_local: usize,
    pub suppressed: usize,
}

/// Merges remote records into the local list by id. Local order is kept and
/// remote-only records are appended. Remote records whose id is in
/// `deleted` are dropped.
pub fn merge_records<T: Versioned + Clone>(
    local: Vec<T>,
    remote: Vec<T>,
    deleted: &HashSet<String>,
) -> (Vec<T>, MergeStats) {
    let mut stats = MergeStats::default();
    let mut remote_by_id = HashMap::new();
    let mut remote_order = Vec::new();
    for record in remote {
        let id = record.record_id().to_string();
        if deleted.contains(&id) {
            stats.suppressed += 1;
            continue;
        }
        if remote_by_id.insert(id.clone(), record).is_none() {
            remote_order.push(id);
        }
    }

    let mut merged = Vec::with_capacity(local.len() + remote_order.len());
    for record in local {
        match remote_by_id.remove(record.record_id()) {
            Some(remote_record) => {
                let resolution = resolve_conflict(&record, &remote_record);
                match resolution.source {
                    ResolutionSource::Remote => stats.updated += 1,
                    ResolutionSource::Local => stats.kept_local += 1,
                }
                merged.push(resolution.record);
            }
            None => merged.push(record),
        }
    }
    for id in remote_order {
        if let Some(record) = remote_by_id.remove(&id) {
            stats.added += 1;
            merged.push(record);
        }
    }
    (merged, stats)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    pub tasks: MergeStats,
    pub movements: MergeStats,
    pub skipped_rows: usize,
    pub repaired_links: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Syncing,
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: ConnectionState,
    pub message: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Stops the polling task when dropped.
pub struct ChangeSubscription {
    handle: JoinHandle<()>,
}

impl ChangeSubscription {
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Best-effort mirror of local data to a remote table store. Nothing here
/// ever blocks or fails a local mutation.
pub struct SyncService<C = dyn RemoteStoreClient>
where
    C: RemoteStoreClient + ?Sized + 'static,
{
    client: Arc<C>,
    store: Arc<LocalStore>,
    movements: Arc<MovementRepository>,
    retry_policy: RetryPolicy,
    timeout: TokioDuration,
    slow_threshold: TokioDuration,
    now_provider: NowProvider,
    last_error: Mutex<Option<String>>,
}

impl<C> SyncService<C>
where
    C: RemoteStoreClient + ?Sized + 'static,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<LocalStore>,
        movements: Arc<MovementRepository>,
    ) -> Self {
        let defaults = RemoteConfig::default();
        Self {
            client,
            store,
            movements,
            retry_policy: RetryPolicy::default(),
            timeout: TokioDuration::from_millis(defaults.timeout_ms),
            slow_threshold: TokioDuration::from_millis(defaults.slow_threshold_ms),
            now_provider: system_now(),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_timeouts(mut self, timeout: TokioDuration, slow_threshold: TokioDuration) -> Self {
        self.timeout = timeout;
        self.slow_threshold = slow_threshold;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .ok()
            .and_then(|last_error| last_error.clone())
    }

    fn record_error(&self, message: Option<String>) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = message;
        }
    }

    /// Applies each change independently; failures are collected, not raised.
    pub async fn push_local_changes(&self, batch: &[ChangeOp]) -> PushReport {
        let mut report = PushReport::default();
        for (index, change) in batch.iter().enumerate() {
            match self.apply_change(change).await {
                Ok(()) => report.processed += 1,
                Err(error) => {
                    tracing::warn!(
                        index,
                        table = change.table.as_str(),
                        id = change.id.as_deref().unwrap_or(""),
                        %error,
                        "remote change failed"
                    );
                    report.errors.push(ChangeError {
                        index,
                        id: change.id.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
        report.success = report.errors.is_empty();
        if report.success {
            self.record_error(None);
        } else {
            self.record_error(Some(format!(
                "{} of {} changes failed to sync",
                report.errors.len(),
                batch.len()
            )));
        }
        tracing::debug!(processed = report.processed, failed = report.errors.len(), "pushed local changes");
        report
    }

    /// Pushes `batch`, then records its outcome: pushed changes leave the
    /// pending list, failed ones stay queued for the next batch, and
    /// `last_sync` moves to `collected_at`.
    pub async fn push_and_settle(
        &self,
        batch: &[ChangeOp],
        collected_at: DateTime<Utc>,
    ) -> Result<PushReport, InfraError> {
        let report = self.push_local_changes(batch).await;
        let failed_indexes = report
            .errors
            .iter()
            .map(|error| error.index)
            .collect::<HashSet<_>>();

        let mut settled = Vec::new();
        let mut failed = Vec::new();
        for (index, change) in batch.iter().enumerate() {
            let Some(entry) = change.pending_entry() else {
                continue;
            };
            if failed_indexes.contains(&index) {
                failed.push(entry);
            } else {
                settled.push(entry);
            }
        }
        self.store.settle_pending(&settled, &failed, collected_at)?;
        tracing::debug!(settled = settled.len(), requeued = failed.len(), "settled pushed changes");
        Ok(report)
    }

    async fn apply_change(&self, change: &ChangeOp) -> Result<(), InfraError> {
        let required_id = || {
            change
                .id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| InfraError::Validation("change id must not be empty".to_string()))
        };
        match change.kind {
            ChangeKind::Create => {
                self.call_remote(|| self.client.insert(change.table, &change.payload))
                    .await?;
            }
            ChangeKind::Update => {
                let id = required_id()?;
                self.call_remote(|| self.client.update(change.table, id, &change.payload))
                    .await?;
            }
            ChangeKind::Delete => {
                let id = required_id()?;
                self.call_remote(|| self.client.delete(change.table, id))
                    .await?;
            }
        }
        Ok(())
    }

    /// Fetches the user's tasks and movements, merges them last-write-wins
    /// and persists both lists in one write. Rows that fail validation are
    /// skipped, records with a queued local delete stay deleted, and task
    /// links to unknown movements are cleared.
    pub async fn pull_and_merge(&self, user_id: &str) -> Result<PullReport, InfraError> {
        let result = self.pull_and_merge_inner(user_id).await;
        match &result {
            Ok(_) => self.record_error(None),
            Err(error) => self.record_error(Some(error.to_string())),
        }
        result
    }

    async fn pull_and_merge_inner(&self, user_id: &str) -> Result<PullReport, InfraError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(InfraError::Validation("user id must not be empty".to_string()));
        }
        let filters = [RemoteFilter::eq("user_id", user_id)];
        let task_rows = self
            .call_remote(|| self.client.select(RemoteTable::Tasks, &filters))
            .await?;
        let movement_rows = self
            .call_remote(|| self.client.select(RemoteTable::Movements, &filters))
            .await?;

        let mut report = PullReport::default();
        let remote_tasks = decode_rows::<Task>(task_rows, Task::validate, &mut report.skipped_rows);
        let remote_movements =
            decode_rows::<Movement>(movement_rows, Movement::validate, &mut report.skipped_rows);

        let pending = self.store.pending_sync();
        let deleted_tasks = queued_deletes(&pending, RemoteTable::Tasks);
        let deleted_movements = queued_deletes(&pending, RemoteTable::Movements);
        let now = (self.now_provider)();

        let (task_stats, movement_stats, repaired) =
            self.movements.rewrite_all(|movements, tasks| {
                let (mut tasks, task_stats) = merge_records(tasks, remote_tasks, &deleted_tasks);
                let (movements, movement_stats) =
                    merge_records(movements, remote_movements, &deleted_movements);
                let repaired = clear_dangling_links(&mut tasks, &movements, now);
                (movements, tasks, (task_stats, movement_stats, repaired))
            })?;

        report.tasks = task_stats;
        report.movements = movement_stats;
        report.repaired_links = repaired;
        tracing::info!(
            tasks_added = task_stats.added,
            tasks_updated = task_stats.updated,
            movements_added = movement_stats.added,
            movements_updated = movement_stats.updated,
            suppressed = task_stats.suppressed + movement_stats.suppressed,
            skipped = report.skipped_rows,
            repaired,
            "pulled remote changes"
        );
        Ok(report)
    }

    /// Pings the remote. Slow answers report `Syncing`, unreachable or
    /// timed-out remotes report `Offline`.
    pub async fn status(&self) -> SyncStatus {
        let started = Instant::now();
        let outcome = timeout(self.timeout, self.client.ping()).await;
        let elapsed = started.elapsed();

        let (state, message) = match outcome {
            Err(_) => (
                ConnectionState::Offline,
                Some(format!(
                    "remote did not respond within {}ms",
                    self.timeout.as_millis()
                )),
            ),
            Ok(Err(error)) if is_connectivity_error(&error) => {
                (ConnectionState::Offline, Some(error.to_string()))
            }
            Ok(Err(error)) => (ConnectionState::Error, Some(error.to_string())),
            Ok(Ok(())) if elapsed > self.slow_threshold => (
                ConnectionState::Syncing,
                Some(format!("remote answered in {}ms", elapsed.as_millis())),
            ),
            Ok(Ok(())) => (ConnectionState::Connected, None),
        };

        SyncStatus {
            state,
            message,
            last_sync: self.store.last_sync(),
            last_error: self.last_error(),
        }
    }

    /// Polls `table` for the user's rows updated after the subscription
    /// started and hands each non-empty batch to `on_change`.
    pub fn subscribe_changes<F>(
        &self,
        user_id: &str,
        table: RemoteTable,
        interval: TokioDuration,
        on_change: F,
    ) -> ChangeSubscription
    where
        F: Fn(Vec<serde_json::Value>) + Send + Sync + 'static,
    {
        let client = Arc::clone(&self.client);
        let call_timeout = self.timeout;
        let user_id = user_id.trim().to_string();
        let mut last_seen = (self.now_provider)();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let filters = [
                    RemoteFilter::eq("user_id", user_id.as_str()),
                    RemoteFilter::gt("updated_at", last_seen.to_rfc3339()),
                ];
                let rows = match timeout(call_timeout, client.select(table, &filters)).await {
                    Ok(Ok(rows)) => rows,
                    Ok(Err(error)) => {
                        tracing::debug!(table = table.as_str(), %error, "change poll failed");
                        continue;
                    }
                    Err(_) => {
                        tracing::debug!(table = table.as_str(), "change poll timed out");
                        continue;
                    }
                };

                let fresh = rows
                    .into_iter()
                    .filter(|row| row_updated_at(row).is_some_and(|updated| updated > last_seen))
                    .collect::<Vec<_>>();
                if fresh.is_empty() {
                    continue;
                }
                if let Some(newest) = fresh.iter().filter_map(row_updated_at).max() {
                    last_seen = newest;
                }
                on_change(fresh);
            }
        });

        ChangeSubscription { handle }
    }

    async fn call_remote<T, F, Fut>(&self, operation: F) -> Result<T, InfraError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let result = match timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(InfraError::Timeout(self.timeout.as_millis() as u64)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt));
                    tracing::debug!(attempt, delay_ms = delay, %error, "retrying remote call");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn decode_rows<T: DeserializeOwned>(
    rows: Vec<serde_json::Value>,
    validate: fn(&T) -> Result<(), String>,
    skipped: &mut usize,
) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| {
            let decoded = serde_json::from_value::<T>(row)
                .map_err(|error| error.to_string())
                .and_then(|record| validate(&record).map(|()| record));
            match decoded {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(%error, "skipping invalid remote row");
                    *skipped += 1;
                    None
                }
            }
        })
        .collect()
}

fn queued_deletes(pending: &[PendingChange], table: RemoteTable) -> HashSet<String> {
    pending
        .iter()
        .filter(|entry| entry.kind == ChangeKind::Delete && entry.table == table)
        .map(|entry| entry.id.clone())
        .collect()
}

fn row_updated_at(row: &serde_json::Value) -> Option<DateTime<Utc>> {
    row.get("updated_at")
        .and_then(serde_json::Value::as_str)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
}

fn remote_failure_mentions(error: &InfraError, markers: &[&str]) -> bool {
    if !error.is_remote() {
        return false;
    }
    let message = error.to_string().to_ascii_lowercase();
    markers.iter().any(|marker| message.contains(marker))
}

fn is_connectivity_error(error: &InfraError) -> bool {
    remote_failure_mentions(
        error,
        &["timed out", "network error", "connection refused", "dns"],
    )
}

fn should_retry(error: &InfraError) -> bool {
    remote_failure_mentions(
        error,
        &[
            "timed out",
            "network error",
            "temporarily unavailable",
            "connection reset",
            "http 503",
        ],
    )
}

/// Adds the owning user to a record so the remote can filter by it.
pub fn with_user_id<T: Serialize>(record: &T, user_id: &str) -> Result<serde_json::Value, InfraError> {
    let mut value = serde_json::to_value(record)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "user_id".to_string(),
            serde_json::Value::String(user_id.to_string()),
        );
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::task_repository::tests::{fixed_time, ticking_clock};
    use crate::application::task_repository::TaskRepository;
    use crate::domain::models::{energy_boost, MovementType, NewTask, Tempo};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    pub(crate) enum FakeResponse {
        Ok,
        NetworkError,
        HttpError,
    }

    /// In-memory remote keyed by table. Rows are matched by their `id`.
    #[derive(Default)]
    pub(crate) struct FakeRemoteStoreClient {
        rows: Mutex<HashMap<RemoteTable, Vec<serde_json::Value>>>,
        responses: Mutex<VecDeque<FakeResponse>>,
        applied: Mutex<Vec<(ChangeKind, RemoteTable, String)>>,
        ping_delay_ms: u64,
        calls: AtomicUsize,
    }

    fn row_id(row: &serde_json::Value) -> String {
        row.get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    impl FakeRemoteStoreClient {
        pub(crate) fn with_responses(responses: Vec<FakeResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        fn with_rows(table: RemoteTable, rows: Vec<serde_json::Value>) -> Self {
            let client = Self::default();
            client.rows.lock().expect("rows lock").insert(table, rows);
            client
        }

        pub(crate) fn seed(&self, table: RemoteTable, row: serde_json::Value) {
            self.rows
                .lock()
                .expect("rows lock")
                .entry(table)
                .or_default()
                .push(row);
        }

        pub(crate) fn queue(&self, response: FakeResponse) {
            self.responses.lock().expect("responses lock").push_back(response);
        }

        pub(crate) fn row_ids(&self, table: RemoteTable) -> Vec<String> {
            self.rows
                .lock()
                .expect("rows lock")
                .get(&table)
                .map(|rows| rows.iter().map(row_id).collect())
                .unwrap_or_default()
        }

        /// Drains the changes applied since the last call.
        pub(crate) fn take_applied(&self) -> Vec<(ChangeKind, RemoteTable, String)> {
            std::mem::take(&mut *self.applied.lock().expect("applied lock"))
        }

        fn record(&self, kind: ChangeKind, table: RemoteTable, id: String) {
            self.applied.lock().expect("applied lock").push((kind, table, id));
        }

        fn next_response(&self) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or(FakeResponse::Ok);
            match response {
                FakeResponse::Ok => Ok(()),
                FakeResponse::NetworkError => Err(InfraError::Remote(
                    "network error while inserting row".to_string(),
                )),
                FakeResponse::HttpError => {
                    Err(InfraError::Remote("remote tasks error: http 400".to_string()))
                }
            }
        }
    }

    #[async_trait]
    impl RemoteStoreClient for FakeRemoteStoreClient {
        async fn select(
            &self,
            table: RemoteTable,
            _filters: &[RemoteFilter],
        ) -> Result<Vec<serde_json::Value>, InfraError> {
            self.next_response()?;
            Ok(self
                .rows
                .lock()
                .expect("rows lock")
                .get(&table)
                .cloned()
                .unwrap_or_default())
        }

        async fn insert(
            &self,
            table: RemoteTable,
            row: &serde_json::Value,
        ) -> Result<serde_json::Value, InfraError> {
            self.next_response()?;
            let id = row_id(row);
            self.record(ChangeKind::Create, table, id.clone());
            let mut rows = self.rows.lock().expect("rows lock");
            let table_rows = rows.entry(table).or_default();
            table_rows.retain(|existing| row_id(existing) != id);
            table_rows.push(row.clone());
            Ok(row.clone())
        }

        async fn update(
            &self,
            table: RemoteTable,
            id: &str,
            row: &serde_json::Value,
        ) -> Result<serde_json::Value, InfraError> {
            self.next_response()?;
            self.record(ChangeKind::Update, table, id.to_string());
            let mut rows = self.rows.lock().expect("rows lock");
            if let Some(existing) = rows
                .entry(table)
                .or_default()
                .iter_mut()
                .find(|existing| row_id(existing) == id)
            {
                *existing = row.clone();
            }
            Ok(row.clone())
        }

        async fn delete(&self, table: RemoteTable, id: &str) -> Result<(), InfraError> {
            self.next_response()?;
            self.record(ChangeKind::Delete, table, id.to_string());
            self.rows
                .lock()
                .expect("rows lock")
                .entry(table)
                .or_default()
                .retain(|existing| row_id(existing) != id);
            Ok(())
        }

        async fn ping(&self) -> Result<(), InfraError> {
            if self.ping_delay_ms > 0 {
                sleep(TokioDuration::from_millis(self.ping_delay_ms)).await;
            }
            self.next_response()
        }
    }

    struct Fixture {
        store: Arc<LocalStore>,
        tasks: Arc<TaskRepository>,
        movements: Arc<MovementRepository>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let tasks = Arc::new(TaskRepository::load(Arc::clone(&store)).with_now_provider(ticking_clock()));
        let movements = Arc::new(
            MovementRepository::load(Arc::clone(&store), Arc::clone(&tasks))
                .with_now_provider(ticking_clock()),
        );
        Fixture {
            store,
            tasks,
            movements,
        }
    }

    fn service(fixture: &Fixture, client: Arc<FakeRemoteStoreClient>) -> SyncService<FakeRemoteStoreClient> {
        SyncService::new(
            client,
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.movements),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
        })
        .with_now_provider(Arc::new(fixed_time))
    }

    fn task_at(id: &str, title: &str, updated_at: DateTime<Utc>) -> Task {
        Task {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            tempo_required: Tempo::Moderato,
            completed: false,
            movement_id: None,
            priority: 3,
            estimated_minutes: 15,
            energy_boost: energy_boost(3, 15),
            created_at: fixed_time(),
            completed_at: None,
            updated_at,
        }
    }

    #[test]
    fn later_remote_wins_and_ties_keep_local() {
        let earlier = fixed_time();
        let later = earlier + chrono::Duration::seconds(1);
        let local = task_at("tsk-1", "local", earlier);
        let remote = task_at("tsk-1", "remote", later);

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.source, ResolutionSource::Remote);
        assert_eq!(resolution.record.title, "remote");

        let tied_remote = task_at("tsk-1", "remote", earlier);
        let resolution = resolve_conflict(&local, &tied_remote);
        assert_eq!(resolution.source, ResolutionSource::Local);
        assert_eq!(resolution.record, local);

        let resolution = resolve_conflict(&remote, &local);
        assert_eq!(resolution.source, ResolutionSource::Local);
    }

    proptest! {
        #[test]
        fn resolution_always_picks_newest(local_offset in -1000i64..1000, remote_offset in -1000i64..1000) {
            let local = task_at("tsk-1", "local", fixed_time() + chrono::Duration::seconds(local_offset));
            let remote = task_at("tsk-1", "remote", fixed_time() + chrono::Duration::seconds(remote_offset));
            let resolution = resolve_conflict(&local, &remote);
            prop_assert_eq!(resolution.record.updated_at, local.updated_at.max(remote.updated_at));
            if local_offset >= remote_offset {
                prop_assert_eq!(resolution.source, ResolutionSource::Local);
            }
        }
    }

    #[test]
    fn merge_records_adds_updates_and_keeps() {
        let base = fixed_time();
        let local = vec![
            task_at("a", "local a", base),
            task_at("b", "local b", base + chrono::Duration::seconds(10)),
            task_at("c", "local only", base),
        ];
        let remote = vec![
            task_at("a", "remote a", base + chrono::Duration::seconds(5)),
            task_at("b", "remote b", base),
            task_at("d", "remote only", base),
        ];
        let (merged, stats) = merge_records(local, remote, &HashSet::new());
        let titles = merged.iter().map(|task| task.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["remote a", "local b", "local only", "remote only"]);
        assert_eq!(
            stats,
            MergeStats {
                added: 1,
                updated: 1,
                kept_local: 1,
                suppressed: 0,
            }
        );
    }

    #[test]
    fn merge_records_drops_deleted_ids() {
        let base = fixed_time();
        let remote = vec![task_at("gone", "deleted here", base), task_at("new", "new", base)];
        let deleted = HashSet::from(["gone".to_string()]);
        let (merged, stats) = merge_records(Vec::new(), remote, &deleted);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "new");
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.added, 1);
    }

    #[test]
    fn only_remote_failures_are_retried_or_reported_offline() {
        assert!(should_retry(&InfraError::Timeout(10)));
        assert!(is_connectivity_error(&InfraError::Timeout(10)));
        let unavailable = InfraError::Remote("remote tasks error: http 503".to_string());
        assert!(should_retry(&unavailable));
        assert!(!is_connectivity_error(&unavailable));
        assert!(!should_retry(&InfraError::Validation("network error in title".to_string())));
        assert!(!is_connectivity_error(&InfraError::Storage("network error".to_string())));
    }

    #[tokio::test]
    async fn push_reports_partial_failures() {
        let fixture = fixture();
        let client = Arc::new(FakeRemoteStoreClient::with_responses(vec![
            FakeResponse::Ok,
            FakeResponse::HttpError,
            FakeResponse::Ok,
        ]));
        let service = service(&fixture, Arc::clone(&client));

        let batch = vec![
            ChangeOp::create(RemoteTable::Tasks, serde_json::json!({"id": "a"})),
            ChangeOp::update(RemoteTable::Tasks, "b", serde_json::json!({"id": "b"})),
            ChangeOp::delete(RemoteTable::Tasks, "c"),
        ];
        let report = service.push_local_changes(&batch).await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
        assert_eq!(report.errors[0].id.as_deref(), Some("b"));
        assert!(!report.success);
        assert!(service.last_error().is_some());
    }

    #[tokio::test]
    async fn push_rejects_change_without_id() {
        let fixture = fixture();
        let client = Arc::new(FakeRemoteStoreClient::default());
        let service = service(&fixture, Arc::clone(&client));

        let mut change = ChangeOp::delete(RemoteTable::Movements, "x");
        change.id = None;
        let report = service.push_local_changes(&[change]).await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn push_retries_network_errors() {
        let fixture = fixture();
        let client = Arc::new(FakeRemoteStoreClient::with_responses(vec![
            FakeResponse::NetworkError,
            FakeResponse::Ok,
        ]));
        let service = service(&fixture, Arc::clone(&client)).with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
        });

        let report = service
            .push_local_changes(&[ChangeOp::create(
                RemoteTable::Melodies,
                serde_json::json!({"id": "m"}),
            )])
            .await;
        assert!(report.success);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert!(service.last_error().is_none());
    }

    #[tokio::test]
    async fn pull_and_merge_updates_local_lists() {
        let fixture = fixture();
        let local = fixture
            .tasks
            .create(NewTask::new("Local title", Tempo::Adagio))
            .expect("create local task");

        let mut newer = local.clone();
        newer.title = "Remote title".to_string();
        newer.updated_at = local.updated_at + chrono::Duration::hours(1);
        let remote_only = task_at("tsk-remote", "From phone", fixed_time());
        let movement = Movement {
            id: "mvt-remote".to_string(),
            name: "Shared errands".to_string(),
            description: None,
            movement_type: MovementType::Ensemble,
            ensemble_members: vec!["sam".to_string()],
            color_theme: "#3b82f6".to_string(),
            template_category: None,
            created_at: fixed_time(),
            updated_at: fixed_time(),
        };

        let client = Arc::new(FakeRemoteStoreClient::with_rows(
            RemoteTable::Tasks,
            vec![
                with_user_id(&newer, "user-1").expect("row"),
                with_user_id(&remote_only, "user-1").expect("row"),
                serde_json::json!({"id": "broken"}),
            ],
        ));
        client.seed(
            RemoteTable::Movements,
            with_user_id(&movement, "user-1").expect("row"),
        );
        let service = service(&fixture, Arc::clone(&client));

        let report = service.pull_and_merge("user-1").await.expect("pull");
        assert_eq!(report.tasks.updated, 1);
        assert_eq!(report.tasks.added, 1);
        assert_eq!(report.movements.added, 1);
        assert_eq!(report.skipped_rows, 1);

        let tasks = fixture.tasks.list().expect("tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Remote title");
        assert_eq!(fixture.store.tasks(), tasks);
        assert_eq!(fixture.movements.list().expect("movements"), vec![movement]);
        assert!(fixture.store.last_sync().is_none());
    }

    #[tokio::test]
    async fn pull_does_not_bring_back_locally_deleted_records() {
        let fixture = fixture();
        let task = fixture
            .tasks
            .create(NewTask::new("Buy milk", Tempo::Adagio))
            .expect("create task");
        let client = Arc::new(FakeRemoteStoreClient::with_rows(
            RemoteTable::Tasks,
            vec![with_user_id(&task, "user-1").expect("row")],
        ));
        let service = service(&fixture, Arc::clone(&client));

        assert!(fixture.tasks.delete(&task.id).expect("delete"));
        let report = service.pull_and_merge("user-1").await.expect("pull");

        assert_eq!(report.tasks.added, 0);
        assert_eq!(report.tasks.suppressed, 1);
        assert!(fixture.tasks.list().expect("tasks").is_empty());
        assert!(fixture.store.tasks().is_empty());
    }

    #[tokio::test]
    async fn pull_skips_invalid_rows_and_clears_unknown_movements() {
        let fixture = fixture();
        let mut half_done = task_at("tsk-half", "Half done", fixed_time());
        half_done.completed = true;
        let mut orphan = task_at("tsk-orphan", "Orphan", fixed_time());
        orphan.movement_id = Some("mvt-deleted-remotely".to_string());

        let client = Arc::new(FakeRemoteStoreClient::with_rows(
            RemoteTable::Tasks,
            vec![
                with_user_id(&half_done, "user-1").expect("row"),
                with_user_id(&orphan, "user-1").expect("row"),
            ],
        ));
        let service = service(&fixture, client);

        let report = service.pull_and_merge("user-1").await.expect("pull");
        assert_eq!(report.skipped_rows, 1);
        assert_eq!(report.tasks.added, 1);
        assert_eq!(report.repaired_links, 1);

        let tasks = fixture.tasks.list().expect("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "tsk-orphan");
        assert_eq!(tasks[0].movement_id, None);
        assert_eq!(fixture.store.tasks(), tasks);
    }

    #[tokio::test]
    async fn push_and_settle_requeues_only_failed_changes() {
        let fixture = fixture();
        let client = Arc::new(FakeRemoteStoreClient::with_responses(vec![
            FakeResponse::Ok,
            FakeResponse::HttpError,
        ]));
        let service = service(&fixture, Arc::clone(&client));
        fixture
            .store
            .save_tasks_with_pending(&[], &[PendingChange::deleted(RemoteTable::Tasks, "tsk-old")])
            .expect("queue delete");

        let batch = vec![
            ChangeOp::delete(RemoteTable::Tasks, "tsk-old"),
            ChangeOp::create(RemoteTable::Tasks, serde_json::json!({"id": "tsk-new"})),
        ];
        let collected_at = fixed_time() - chrono::Duration::minutes(5);
        let report = service
            .push_and_settle(&batch, collected_at)
            .await
            .expect("settle");

        assert_eq!(report.processed, 1);
        assert_eq!(
            fixture.store.pending_sync(),
            vec![PendingChange::new(ChangeKind::Create, RemoteTable::Tasks, "tsk-new")]
        );
        assert_eq!(fixture.store.last_sync(), Some(collected_at));
    }

    #[tokio::test]
    async fn pull_failure_is_recorded_and_leaves_local_data() {
        let fixture = fixture();
        fixture
            .tasks
            .create(NewTask::new("Keep me", Tempo::Adagio))
            .expect("create task");
        let client = Arc::new(FakeRemoteStoreClient::with_responses(vec![
            FakeResponse::HttpError,
        ]));
        let service = service(&fixture, client);

        assert!(service.pull_and_merge("user-1").await.is_err());
        assert_eq!(fixture.tasks.list().expect("tasks").len(), 1);
        assert!(fixture.store.last_sync().is_none());

        let status = service.status().await;
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn status_reports_connectivity_states() {
        let fixture = fixture();

        let healthy = service(&fixture, Arc::new(FakeRemoteStoreClient::default()));
        assert_eq!(healthy.status().await.state, ConnectionState::Connected);

        let offline = service(
            &fixture,
            Arc::new(FakeRemoteStoreClient::with_responses(vec![
                FakeResponse::NetworkError,
            ])),
        );
        assert_eq!(offline.status().await.state, ConnectionState::Offline);

        let failing = service(
            &fixture,
            Arc::new(FakeRemoteStoreClient::with_responses(vec![
                FakeResponse::HttpError,
            ])),
        );
        let status = failing.status().await;
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.message.is_some());
    }

    #[tokio::test]
    async fn status_distinguishes_slow_and_unresponsive_remotes() {
        let fixture = fixture();
        let slow_client = Arc::new(FakeRemoteStoreClient {
            ping_delay_ms: 40,
            ..FakeRemoteStoreClient::default()
        });
        let slow = service(&fixture, slow_client).with_timeouts(
            TokioDuration::from_millis(1_000),
            TokioDuration::from_millis(5),
        );
        assert_eq!(slow.status().await.state, ConnectionState::Syncing);

        let stuck_client = Arc::new(FakeRemoteStoreClient {
            ping_delay_ms: 500,
            ..FakeRemoteStoreClient::default()
        });
        let stuck = service(&fixture, stuck_client).with_timeouts(
            TokioDuration::from_millis(20),
            TokioDuration::from_millis(5),
        );
        let status = stuck.status().await;
        assert_eq!(status.state, ConnectionState::Offline);
        assert!(status.message.expect("message").contains("20ms"));
    }

    #[tokio::test]
    async fn subscription_reports_only_newer_rows_until_dropped() {
        let fixture = fixture();
        let client = Arc::new(FakeRemoteStoreClient::default());
        let old_row = with_user_id(&task_at("old", "old", fixed_time()), "user-1").expect("row");
        client.seed(RemoteTable::Tasks, old_row);
        let service = service(&fixture, Arc::clone(&client));

        let received = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&received);
        let subscription = service.subscribe_changes(
            "user-1",
            RemoteTable::Tasks,
            TokioDuration::from_millis(5),
            move |rows| {
                let mut sink = sink.lock().expect("sink lock");
                for row in rows {
                    if let Some(id) = row.get("id").and_then(serde_json::Value::as_str) {
                        sink.push(id.to_string());
                    }
                }
            },
        );

        let fresh = task_at("fresh", "fresh", fixed_time() + chrono::Duration::minutes(1));
        client.seed(RemoteTable::Tasks, with_user_id(&fresh, "user-1").expect("row"));
        sleep(TokioDuration::from_millis(60)).await;

        assert!(subscription.is_active());
        assert_eq!(*received.lock().expect("received lock"), vec!["fresh".to_string()]);

        drop(subscription);
        let later = task_at("later", "later", fixed_time() + chrono::Duration::minutes(2));
        client.seed(RemoteTable::Tasks, with_user_id(&later, "user-1").expect("row"));
        sleep(TokioDuration::from_millis(30)).await;
        assert_eq!(received.lock().expect("received lock").len(), 1);
    }
}
