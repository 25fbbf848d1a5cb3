//! In-memory doubles for the store, observer and remote.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::remote::{ChangeEvent, ChangeFeed, RemoteResult, RemoteStore};
use super::{ErrorKind, RemoteErrorDetail, Severity, SyncContext, SyncObserver};
use crate::config::SyncSettings;
use crate::models::{EntityId, EntityKind, RawRecord};
use crate::services::SnapshotStore;

pub(crate) fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub(crate) async fn context_with(
    observer: Arc<RecordingObserver>,
    settings: SyncSettings,
) -> Arc<SyncContext> {
    SyncContext::open(Arc::new(MemoryStore::default()), observer, settings).await
}

pub(crate) async fn context_on(
    store: Arc<MemoryStore>,
    observer: Arc<RecordingObserver>,
) -> Arc<SyncContext> {
    SyncContext::open(store, observer, SyncSettings::default()).await
}

pub(crate) async fn context(observer: Arc<RecordingObserver>) -> Arc<SyncContext> {
    context_with(observer, SyncSettings::default()).await
}

/// Snapshot store that can be told to fail, entirely or for some keys
#[derive(Default)]
pub(crate) struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    failing: Mutex<bool>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub(crate) fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    /// Fail every write that touches `key`
    pub(crate) fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    fn check_key(&self, key: &str) -> crate::Result<()> {
        if self.failing_keys.lock().unwrap().contains(key) {
            Err(crate::Error::Database(format!("cannot write {key}")))
        } else {
            Ok(())
        }
    }

    fn check(&self) -> crate::Result<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            Err(crate::Error::Database("disk I/O error".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, key: &str) -> crate::Result<Option<String>> {
        self.check()?;
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> crate::Result<()> {
        self.check()?;
        self.check_key(key)?;
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn save_many(&self, entries: &[(String, String)]) -> crate::Result<()> {
        self.check()?;
        for (key, _) in entries {
            self.check_key(key)?;
        }
        let mut values = self.values.lock().unwrap();
        for (key, value) in entries {
            values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> crate::Result<()> {
        self.check()?;
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Observer that records every callback
#[derive(Default)]
pub(crate) struct RecordingObserver {
    cache_changes: Mutex<Vec<EntityKind>>,
    connectivity: Mutex<Vec<bool>>,
    sync_errors: Mutex<Vec<(Option<EntityKind>, ErrorKind)>>,
    notices: Mutex<Vec<(Severity, String)>>,
}

impl RecordingObserver {
    pub(crate) fn cache_changes(&self) -> Vec<EntityKind> {
        self.cache_changes.lock().unwrap().clone()
    }

    pub(crate) fn connectivity(&self) -> Vec<bool> {
        self.connectivity.lock().unwrap().clone()
    }

    pub(crate) fn sync_errors(&self) -> Vec<(Option<EntityKind>, ErrorKind)> {
        self.sync_errors.lock().unwrap().clone()
    }

    pub(crate) fn notices(&self) -> Vec<(Severity, String)> {
        self.notices.lock().unwrap().clone()
    }

    pub(crate) fn reset(&self) {
        self.cache_changes.lock().unwrap().clear();
        self.connectivity.lock().unwrap().clear();
        self.sync_errors.lock().unwrap().clear();
        self.notices.lock().unwrap().clear();
    }
}

impl SyncObserver for RecordingObserver {
    fn on_cache_changed(&self, kind: EntityKind) {
        self.cache_changes.lock().unwrap().push(kind);
    }

    fn on_connectivity_changed(&self, connected: bool) {
        self.connectivity.lock().unwrap().push(connected);
    }

    fn on_sync_error(&self, kind: Option<EntityKind>, error: ErrorKind, _detail: &str) {
        self.sync_errors.lock().unwrap().push((kind, error));
    }

    fn on_notice(&self, severity: Severity, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }
}

/// A call received by [`ScriptedRemote`]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoteCall {
    FetchAll(EntityKind),
    Commit(EntityKind, Vec<RawRecord>),
    Delete(EntityKind, EntityId),
    Subscribe(EntityKind),
    Unsubscribe(EntityKind),
    Probe,
}

struct RemoteState {
    tables: HashMap<EntityKind, BTreeMap<EntityId, RawRecord>>,
    next_id: i64,
    calls: Vec<RemoteCall>,
    failing_fetches: HashMap<EntityKind, RemoteErrorDetail>,
    commit_failures: VecDeque<RemoteErrorDetail>,
    commit_delay: Option<Duration>,
    probe_script: VecDeque<bool>,
    probe_default: bool,
    feeds: HashMap<EntityKind, mpsc::Sender<Result<ChangeEvent, RemoteErrorDetail>>>,
    change_feed: bool,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            next_id: 1_000,
            calls: Vec::new(),
            failing_fetches: HashMap::new(),
            commit_failures: VecDeque::new(),
            commit_delay: None,
            probe_script: VecDeque::new(),
            probe_default: true,
            feeds: HashMap::new(),
            change_feed: true,
        }
    }
}

/// Scripted in-memory remote store.
///
/// Assigns ids from 1000 upward, enforces unique registration numbers on
/// users, rejects bulk writes whose rows carry different keys the way
/// PostgREST does, and hands out change feeds the test can push events into.
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    state: Mutex<RemoteState>,
}

impl ScriptedRemote {
    fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn seed(&self, kind: EntityKind, row: Value) {
        let row = record(row);
        let id: EntityId = serde_json::from_value(row["id"].clone()).unwrap();
        self.state()
            .tables
            .entry(kind)
            .or_default()
            .insert(id, row);
    }

    pub(crate) fn rows(&self, kind: EntityKind) -> Vec<RawRecord> {
        self.state()
            .tables
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_row(&self, kind: EntityKind, id: EntityId) -> bool {
        self.state()
            .tables
            .get(&kind)
            .is_some_and(|table| table.contains_key(&id))
    }

    pub(crate) fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub(crate) fn commits(&self, kind: EntityKind) -> Vec<Vec<RawRecord>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Commit(committed, records) if committed == kind => Some(records),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn fetch_count(&self, kind: EntityKind) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == RemoteCall::FetchAll(kind))
            .count()
    }

    pub(crate) fn deletes(&self) -> Vec<(EntityKind, EntityId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Delete(kind, id) => Some((kind, id)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub(crate) fn fail_fetch(&self, kind: EntityKind, detail: RemoteErrorDetail) {
        self.state().failing_fetches.insert(kind, detail);
    }

    pub(crate) fn fail_next_commits(&self, count: usize, detail: &RemoteErrorDetail) {
        let mut state = self.state();
        for _ in 0..count {
            state.commit_failures.push_back(detail.clone());
        }
    }

    pub(crate) fn set_commit_delay(&self, delay: Duration) {
        self.state().commit_delay = Some(delay);
    }

    pub(crate) fn script_probes(&self, results: &[bool]) {
        self.state().probe_script.extend(results.iter().copied());
    }

    pub(crate) fn set_probe_default(&self, reachable: bool) {
        self.state().probe_default = reachable;
    }

    pub(crate) fn disable_change_feed(&self) {
        self.state().change_feed = false;
    }

    pub(crate) fn subscriptions(&self, kind: EntityKind) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == RemoteCall::Subscribe(kind))
            .count()
    }

    /// Push an event into the live feed for `kind`
    pub(crate) async fn emit(&self, kind: EntityKind, event: Result<ChangeEvent, RemoteErrorDetail>) {
        let sender = self.state().feeds.get(&kind).cloned();
        if let Some(sender) = sender {
            sender.send(event).await.unwrap();
        }
    }

    /// Close the live feed for `kind` as if the server dropped it
    pub(crate) fn close_feed(&self, kind: EntityKind) {
        self.state().feeds.remove(&kind);
    }

    fn unique_violation(table: &BTreeMap<EntityId, RawRecord>, row: &RawRecord, id: EntityId) -> Option<RemoteErrorDetail> {
        let registration = row.get("registration_number")?;
        let clash = table
            .iter()
            .any(|(other, existing)| *other != id && existing.get("registration_number") == Some(registration));
        clash.then(|| {
            RemoteErrorDetail::new("duplicate key value violates unique constraint")
                .with_code("23505")
                .with_details(format!(
                    "Key (registration_number)=({}) already exists.",
                    registration.as_str().unwrap_or_default()
                ))
        })
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn fetch_all(&self, kind: EntityKind) -> RemoteResult<Vec<RawRecord>> {
        let mut state = self.state();
        state.calls.push(RemoteCall::FetchAll(kind));
        if let Some(detail) = state.failing_fetches.get(&kind) {
            return Err(detail.clone());
        }
        Ok(state
            .tables
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_batch(
        &self,
        kind: EntityKind,
        records: Vec<RawRecord>,
    ) -> RemoteResult<Vec<RawRecord>> {
        let delay = {
            let mut state = self.state();
            state.calls.push(RemoteCall::Commit(kind, records.clone()));
            state.commit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(detail) = state.commit_failures.pop_front() {
            return Err(detail);
        }
        if let Some(first) = records.first() {
            let mixed = records
                .iter()
                .any(|row| row.len() != first.len() || row.keys().any(|key| !first.contains_key(key)));
            if mixed {
                let mut detail = RemoteErrorDetail::new("All object keys must match")
                    .with_code("PGRST102");
                detail.status = Some(400);
                return Err(detail);
            }
        }

        let mut staged = state.tables.get(&kind).cloned().unwrap_or_default();
        let mut canonical = Vec::with_capacity(records.len());
        let mut next_id = state.next_id;
        for mut row in records {
            let id = match row.get("id") {
                Some(value) => serde_json::from_value::<EntityId>(value.clone())
                    .map_err(|error| RemoteErrorDetail::new(error.to_string()))?,
                None => {
                    next_id += 1;
                    EntityId::new(next_id)
                }
            };
            row.insert("id".to_string(), Value::from(id.get()));
            if kind == EntityKind::User {
                if let Some(detail) = Self::unique_violation(&staged, &row, id) {
                    return Err(detail);
                }
            }
            staged.insert(id, row.clone());
            canonical.push(row);
        }

        state.next_id = next_id;
        state.tables.insert(kind, staged);
        Ok(canonical)
    }

    async fn delete(&self, kind: EntityKind, id: EntityId) -> RemoteResult<()> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Delete(kind, id));
        if let Some(table) = state.tables.get_mut(&kind) {
            table.remove(&id);
        }
        Ok(())
    }

    async fn subscribe(&self, kind: EntityKind) -> RemoteResult<ChangeFeed> {
        let (sender, receiver) = mpsc::channel(64);
        let mut state = self.state();
        state.calls.push(RemoteCall::Subscribe(kind));
        state.feeds.insert(kind, sender);
        Ok(receiver)
    }

    async fn unsubscribe(&self, kind: EntityKind) {
        let mut state = self.state();
        state.calls.push(RemoteCall::Unsubscribe(kind));
        state.feeds.remove(&kind);
    }

    async fn probe(&self) -> RemoteResult<()> {
        let mut state = self.state();
        state.calls.push(RemoteCall::Probe);
        let reachable = state
            .probe_script
            .pop_front()
            .unwrap_or(state.probe_default);
        if reachable {
            Ok(())
        } else {
            Err(RemoteErrorDetail::new("connection refused"))
        }
    }

    fn supports_change_feed(&self) -> bool {
        self.state().change_feed
    }
}
