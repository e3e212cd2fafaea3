//! Store adapter contract for the single shared document.
//!
//! # Responsibility
//! - Hide the backing store behind get/set/transaction/subscribe primitives.
//! - Normalize every value on its way in and out.
//!
//! # Invariants
//! - Values returned by `get` and delivered by subscriptions are normalized.
//! - Payloads of `set` and `transactional_update` are normalized before
//!   commit, so the stored document is always schema-valid.
//! - Read-modify-write goes through `transactional_update` only.
//! - Subscribers also receive the adapter's own writes; duplicates are
//!   possible and carry identical content.

pub mod firebase;
pub mod memory;
pub mod sqlite;
mod sse;

use crate::db::DbError;
use crate::model::state::AppState;
use async_trait::async_trait;
use log::debug;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

pub use firebase::{FirebaseConfig, FirebaseStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteDocumentStore;

/// Upper bound on optimistic transaction re-applications.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 25;

const CHANGE_FEED_CAPACITY: usize = 16;

pub type StoreResult<T> = Result<T, StoreError>;

/// Document mutator applied inside a transactional update.
///
/// May run several times; must be a pure function of its input.
pub type Mutator<'a> = &'a (dyn Fn(AppState) -> AppState + Send + Sync);

/// Failure reported by a store adapter.
#[derive(Debug)]
pub enum StoreError {
    /// Store is known to be unreachable.
    Offline,
    /// Store refused or failed the operation.
    Unavailable(String),
    /// Network-level failure talking to the hosted store.
    Transport(reqwest::Error),
    /// Hosted store answered with a failure status.
    Http { status: u16, body: String },
    /// Hosted store answered with something this adapter cannot use.
    Protocol(String),
    /// Local database failure.
    Db(DbError),
    /// Document could not be encoded or decoded.
    Serialization(serde_json::Error),
    /// Every optimistic attempt lost to a concurrent writer.
    TransactionConflict { attempts: u32 },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "store is offline"),
            Self::Unavailable(message) => write!(f, "store unavailable: {message}"),
            Self::Transport(err) => write!(f, "store transport failed: {err}"),
            Self::Http { status, body } => write!(f, "store returned HTTP {status}: {body}"),
            Self::Protocol(message) => write!(f, "unexpected store response: {message}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "document serialization failed: {err}"),
            Self::TransactionConflict { attempts } => {
                write!(f, "transaction aborted after {attempts} conflicting attempts")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Primitive operations on the shared document.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Document location used in diagnostics.
    fn location(&self) -> &str;

    /// Reads the current document; `None` when nothing is stored yet.
    async fn get(&self) -> StoreResult<Option<AppState>>;

    /// Replaces the whole document.
    async fn set(&self, state: &AppState) -> StoreResult<()>;

    /// Atomically applies `mutator` to the latest committed document and
    /// returns what was committed.
    ///
    /// The mutator is re-invoked with the newer value whenever a concurrent
    /// write wins the race. An unchanged result commits nothing.
    async fn transactional_update(&self, mutator: Mutator<'_>) -> StoreResult<AppState>;

    /// Streams every observed document change.
    fn subscribe(&self) -> DocumentSubscription;

    /// Streams online/offline transitions.
    fn subscribe_connectivity(&self) -> ConnectivitySubscription;
}

/// Cancellable stream of document changes. Dropping it unsubscribes.
pub struct DocumentSubscription {
    receiver: broadcast::Receiver<AppState>,
}

impl DocumentSubscription {
    /// Waits for the next change; `None` once the adapter is gone.
    ///
    /// A subscriber that fell behind resumes at the newest value.
    pub async fn next(&mut self) -> Option<AppState> {
        loop {
            match self.receiver.recv().await {
                Ok(state) => return Some(state),
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(skipped)) => {
                    debug!("event=subscription_lagged module=store status=ok skipped={skipped}");
                    if let Some(latest) = self.drain_latest() {
                        return Some(latest);
                    }
                }
            }
        }
    }

    /// Releases the subscription.
    pub fn unsubscribe(self) {}

    fn drain_latest(&mut self) -> Option<AppState> {
        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok(state) => latest = Some(state),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return latest,
            }
        }
    }
}

/// Cancellable stream of connectivity readings. Dropping it unsubscribes.
///
/// Adapters that learn connectivity from the network start with no
/// reading; `current` reports such a state as offline.
pub struct ConnectivitySubscription {
    receiver: watch::Receiver<Option<bool>>,
}

impl ConnectivitySubscription {
    /// Latest known reading; `false` while none has been taken yet.
    pub fn current(&self) -> bool {
        self.receiver.borrow().unwrap_or(false)
    }

    /// Whether the adapter has reported any reading yet.
    pub fn has_reading(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Waits for the next reading; `None` once the adapter is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        loop {
            self.receiver.changed().await.ok()?;
            if let Some(online) = *self.receiver.borrow_and_update() {
                return Some(online);
            }
        }
    }

    /// Returns the first reading, waiting for it if none exists yet.
    pub async fn first_reading(&mut self) -> Option<bool> {
        if let Some(online) = *self.receiver.borrow_and_update() {
            return Some(online);
        }
        self.changed().await
    }

    pub fn unsubscribe(self) {}
}

/// Fan-out shared by adapter implementations.
pub(crate) struct ChangeFeed {
    changes: broadcast::Sender<AppState>,
    online: watch::Sender<Option<bool>>,
}

impl ChangeFeed {
    /// Feed for an adapter whose connectivity is known up front.
    pub(crate) fn new(initially_online: bool) -> Self {
        Self::with_reading(Some(initially_online))
    }

    /// Feed for an adapter that has not taken a connectivity reading yet.
    pub(crate) fn awaiting_reading() -> Self {
        Self::with_reading(None)
    }

    fn with_reading(reading: Option<bool>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let (online, _) = watch::channel(reading);
        Self { changes, online }
    }

    pub(crate) fn publish(&self, state: AppState) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(state);
    }

    /// Records a connectivity reading; only transitions wake subscribers.
    pub(crate) fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            if *current == Some(online) {
                return false;
            }
            *current = Some(online);
            true
        });
    }

    pub(crate) fn subscribe(&self) -> DocumentSubscription {
        DocumentSubscription {
            receiver: self.changes.subscribe(),
        }
    }

    pub(crate) fn subscribe_connectivity(&self) -> ConnectivitySubscription {
        ConnectivitySubscription {
            receiver: self.online.subscribe(),
        }
    }
}
