//! Sync service: live bridge between a store adapter and the UI.
//!
//! # Responsibility
//! - Load or seed the shared document on start.
//! - Follow document and connectivity changes into one observable snapshot.
//! - Expose toggle/update/patch operations that commit through the store.
//!
//! # Invariants
//! - The snapshot's `state` changes only on the initial read (or seed) and on
//!   confirmed store notifications, never on local optimistic guesses.
//! - Every read-modify-write goes through `transactional_update`.
//! - `Ready` requires a connectivity reading from the adapter; one that has
//!   not reported within `FIRST_READING_TIMEOUT` counts as offline.
//! - Errors are recorded in the snapshot and also returned to the caller.

use crate::model::child::ChildId;
use crate::model::state::AppState;
use crate::schema::Schema;
use crate::store::{ConnectivitySubscription, DocumentSubscription, StoreAdapter, StoreError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type SyncResult<T> = Result<T, SyncError>;

/// Upper bound on waiting for the adapter's first connectivity reading.
pub const FIRST_READING_TIMEOUT: Duration = Duration::from_secs(5);

/// Service error for sync use-cases.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Store adapter failure.
    Store(Arc<StoreError>),
    /// Target child is not part of the document.
    ChildNotFound(ChildId),
    /// A child would reference a task set the document does not have.
    TaskSetNotFound { child: ChildId, task_set_id: String },
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::ChildNotFound(child) => write!(f, "child not found: {child}"),
            Self::TaskSetNotFound { child, task_set_id } => {
                write!(f, "task set `{task_set_id}` not found for child {child}")
            }
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Store(Arc::new(value))
    }
}

/// Lifecycle of the service's view of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

/// Observable service state.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub phase: SyncPhase,
    /// Last confirmed document; `None` until the first successful load.
    pub state: Option<AppState>,
    pub online: bool,
    /// Most recent failure, cleared on a successful (re)start.
    pub last_error: Option<SyncError>,
}

impl SyncSnapshot {
    fn initial() -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            state: None,
            online: false,
            last_error: None,
        }
    }
}

/// Partial update of one child; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPatch {
    pub name: Option<String>,
    pub task_set_id: Option<String>,
    pub background_color: Option<String>,
}

/// Sync facade over a store adapter implementation.
pub struct SyncService<S: StoreAdapter + 'static> {
    store: Arc<S>,
    schema: Arc<Schema>,
    client_id: Uuid,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<S: StoreAdapter + 'static> SyncService<S> {
    pub fn new(store: Arc<S>, schema: Arc<Schema>) -> Self {
        let (snapshot, _) = watch::channel(SyncSnapshot::initial());
        Self {
            store,
            schema,
            client_id: Uuid::new_v4(),
            snapshot: Arc::new(snapshot),
            pump: Mutex::new(None),
        }
    }

    /// Identifier of this client instance, used only for diagnostics.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Subscribes, loads (or seeds) the document and starts following it.
    ///
    /// Subscriptions are opened before the initial read so no change made
    /// in between is lost. Calling `start` again after a failure retries;
    /// calling it while already running restarts the subscriptions.
    ///
    /// # Errors
    /// - Returns `SyncError::Store` when the initial read or seed fails; the
    ///   snapshot moves to `SyncPhase::Error`.
    pub async fn start(&self) -> SyncResult<AppState> {
        self.stop_pump();
        self.snapshot.send_modify(|snapshot| {
            snapshot.phase = SyncPhase::Loading;
            snapshot.last_error = None;
        });
        info!(
            "event=sync_start module=sync status=start client_id={} location={}",
            self.client_id,
            self.store.location()
        );

        let mut connectivity = self.store.subscribe_connectivity();
        let documents = self.store.subscribe();

        let initial = match self.load_or_seed().await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    "event=sync_start module=sync status=error client_id={} error={}",
                    self.client_id, err
                );
                self.snapshot.send_modify(|snapshot| {
                    snapshot.phase = SyncPhase::Error;
                    snapshot.last_error = Some(err.clone());
                });
                return Err(err);
            }
        };

        let online = match tokio::time::timeout(
            FIRST_READING_TIMEOUT,
            connectivity.first_reading(),
        )
        .await
        {
            Ok(reading) => reading.unwrap_or(false),
            Err(_) => {
                warn!(
                    "event=sync_start module=sync status=degraded client_id={} reason=no_connectivity_reading timeout_ms={}",
                    self.client_id,
                    FIRST_READING_TIMEOUT.as_millis()
                );
                false
            }
        };
        self.snapshot.send_modify(|snapshot| {
            snapshot.phase = SyncPhase::Ready;
            snapshot.state = Some(initial.clone());
            snapshot.online = online;
        });

        let handle = tokio::spawn(pump_changes(
            documents,
            connectivity,
            Arc::clone(&self.snapshot),
            self.client_id,
        ));
        *self.pump.lock() = Some(handle);

        info!(
            "event=sync_start module=sync status=ok client_id={} online={}",
            self.client_id, online
        );
        Ok(initial)
    }

    /// Flips one task's completion for one child.
    ///
    /// Unknown children or tasks leave the document unchanged.
    pub async fn toggle_task(&self, child: ChildId, task_id: &str) -> SyncResult<AppState> {
        let mutator = |state: AppState| toggle_completed(state, child, task_id);
        let committed = self
            .store
            .transactional_update(&mutator)
            .await
            .map_err(|err| self.record_failure(err.into()))?;
        debug!(
            "event=task_toggle module=sync status=ok child={} task_id={} done={}",
            child,
            task_id,
            committed
                .child(child)
                .is_some_and(|entry| entry.is_completed(task_id))
        );
        Ok(committed)
    }

    /// Replaces the whole document.
    ///
    /// # Errors
    /// - Returns `SyncError::TaskSetNotFound` when a child references a task
    ///   set absent from `state`; nothing is written.
    pub async fn update_state(&self, state: AppState) -> SyncResult<()> {
        if let Some((child, task_set_id)) = self.schema.find_dangling_assignment(&state) {
            let err = SyncError::TaskSetNotFound {
                child,
                task_set_id: task_set_id.to_string(),
            };
            return Err(self.record_failure(err));
        }
        self.store
            .set(&state)
            .await
            .map_err(|err| self.record_failure(err.into()))?;
        info!(
            "event=state_replace module=sync status=ok client_id={}",
            self.client_id
        );
        Ok(())
    }

    /// Applies a partial update to one child.
    ///
    /// # Errors
    /// - Returns `SyncError::ChildNotFound` when the child is absent.
    /// - Returns `SyncError::TaskSetNotFound` when the patch names a task set
    ///   the document does not have; nothing is written.
    pub async fn update_child(&self, child: ChildId, patch: ChildPatch) -> SyncResult<AppState> {
        let mutator = |state: AppState| apply_child_patch(state, child, &patch);
        let committed = self
            .store
            .transactional_update(&mutator)
            .await
            .map_err(|err| self.record_failure(err.into()))?;

        let Some(entry) = committed.child(child) else {
            return Err(self.record_failure(SyncError::ChildNotFound(child)));
        };
        if let Some(task_set_id) = &patch.task_set_id {
            if &entry.task_set_id != task_set_id {
                return Err(self.record_failure(SyncError::TaskSetNotFound {
                    child,
                    task_set_id: task_set_id.clone(),
                }));
            }
        }
        info!(
            "event=child_update module=sync status=ok child={} task_set_id={}",
            child, entry.task_set_id
        );
        Ok(committed)
    }

    /// Returns the latest snapshot.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Returns the last confirmed document, if loaded.
    pub fn current(&self) -> Option<AppState> {
        self.snapshot.borrow().state.clone()
    }

    /// Receiver that wakes on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.subscribe()
    }

    /// Stops following the store. The last snapshot stays readable.
    pub fn shutdown(&self) {
        if self.stop_pump() {
            self.snapshot.send_modify(|snapshot| {
                snapshot.phase = SyncPhase::Uninitialized;
            });
            info!(
                "event=sync_stop module=sync status=ok client_id={}",
                self.client_id
            );
        }
    }

    async fn load_or_seed(&self) -> SyncResult<AppState> {
        if let Some(state) = self.store.get().await? {
            return Ok(state);
        }
        let seed = self.schema.seed_state();
        self.store.set(&seed).await?;
        info!(
            "event=document_seed module=sync status=ok client_id={} location={}",
            self.client_id,
            self.store.location()
        );
        Ok(seed)
    }

    fn record_failure(&self, err: SyncError) -> SyncError {
        warn!(
            "event=sync_write module=sync status=error client_id={} error={}",
            self.client_id, err
        );
        self.snapshot.send_modify(|snapshot| {
            snapshot.last_error = Some(err.clone());
        });
        err
    }

    fn stop_pump(&self) -> bool {
        match self.pump.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl<S: StoreAdapter + 'static> Drop for SyncService<S> {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Returns `state` with `task_id` flipped in `child`'s completed set.
///
/// Children missing from the document and tasks outside the child's set
/// leave `state` untouched.
pub fn toggle_completed(mut state: AppState, child: ChildId, task_id: &str) -> AppState {
    let known = state
        .child(child)
        .and_then(|entry| state.task_set_for(entry))
        .is_some_and(|set| set.contains(task_id));
    if !known {
        return state;
    }
    if let Some(entry) = state.children.get_mut(&child) {
        if !entry.completed_tasks.remove(task_id) {
            entry.completed_tasks.insert(task_id.to_string());
        }
    }
    state
}

/// Returns `state` with `patch` applied to `child`.
///
/// The patch is dropped as a whole when the child is missing or when it
/// names an unknown task set. Switching task sets clears completions.
pub fn apply_child_patch(mut state: AppState, child: ChildId, patch: &ChildPatch) -> AppState {
    if let Some(task_set_id) = &patch.task_set_id {
        if !state.task_sets.contains_key(task_set_id) {
            return state;
        }
    }
    let Some(entry) = state.children.get_mut(&child) else {
        return state;
    };
    if let Some(name) = &patch.name {
        entry.name = name.clone();
    }
    if let Some(background_color) = &patch.background_color {
        entry.background_color = background_color.clone();
    }
    if let Some(task_set_id) = &patch.task_set_id {
        if &entry.task_set_id != task_set_id {
            entry.task_set_id = task_set_id.clone();
            entry.completed_tasks.clear();
        }
    }
    state
}

async fn pump_changes(
    mut documents: DocumentSubscription,
    mut connectivity: ConnectivitySubscription,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
    client_id: Uuid,
) {
    let mut connectivity_open = true;
    loop {
        tokio::select! {
            change = documents.next() => {
                let Some(state) = change else {
                    warn!("event=sync_feed module=sync status=closed client_id={client_id}");
                    break;
                };
                snapshot.send_if_modified(|current| {
                    if current.state.as_ref() == Some(&state) {
                        return false;
                    }
                    current.state = Some(state);
                    true
                });
            }
            reading = connectivity.changed(), if connectivity_open => match reading {
                Some(online) => {
                    info!(
                        "event=connectivity module=sync status=ok client_id={client_id} online={online}"
                    );
                    snapshot.send_modify(|current| current.online = online);
                }
                None => connectivity_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_child_patch, toggle_completed, ChildPatch};
    use crate::model::child::ChildId;
    use crate::model::defaults::default_app_state;

    #[test]
    fn toggle_twice_restores_completion() {
        let state = default_app_state();
        let once = toggle_completed(state.clone(), ChildId::Alex, "make_bed");
        assert!(once.children[&ChildId::Alex].is_completed("make_bed"));
        let twice = toggle_completed(once, ChildId::Alex, "make_bed");
        assert_eq!(twice, state);
    }

    #[test]
    fn toggle_of_unknown_task_is_noop() {
        let state = default_app_state();
        let next = toggle_completed(state.clone(), ChildId::Alex, "feed_dragon");
        assert_eq!(next, state);
    }

    #[test]
    fn patch_with_unknown_task_set_is_dropped_whole() {
        let state = default_app_state();
        let patch = ChildPatch {
            name: Some("Al".to_string()),
            task_set_id: Some("missing".to_string()),
            background_color: None,
        };
        assert_eq!(apply_child_patch(state.clone(), ChildId::Alex, &patch), state);
    }

    #[test]
    fn switching_task_set_clears_completions() {
        let state = toggle_completed(default_app_state(), ChildId::Alex, "make_bed");
        let patch = ChildPatch {
            task_set_id: Some("cecci_tasks".to_string()),
            ..ChildPatch::default()
        };
        let next = apply_child_patch(state, ChildId::Alex, &patch);
        let alex = &next.children[&ChildId::Alex];
        assert_eq!(alex.task_set_id, "cecci_tasks");
        assert!(alex.completed_tasks.is_empty());
    }
}
