//! In-process store holding the raw document.
//!
//! Behaves like the hosted store from a client's point of view (echoed
//! writes, optimistic transactions, connectivity) and adds hooks to
//! simulate outages, legacy raw documents and racing writers.

use super::{
    ChangeFeed, ConnectivitySubscription, DocumentSubscription, Mutator, StoreAdapter,
    StoreError, StoreResult, MAX_TRANSACTION_ATTEMPTS,
};
use crate::model::state::AppState;
use crate::schema::Schema;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

const MEMORY_LOCATION: &str = "memory://state";

struct MemoryDocument {
    raw: Option<Value>,
    revision: u64,
    online: bool,
    pending_failures: u32,
    pending_conflicts: VecDeque<Value>,
}

impl MemoryDocument {
    fn check_available(&mut self) -> StoreResult<()> {
        if !self.online {
            return Err(StoreError::Offline);
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

/// Shared-document store living in process memory.
pub struct MemoryStore {
    schema: Arc<Schema>,
    document: Mutex<MemoryDocument>,
    feed: ChangeFeed,
}

impl MemoryStore {
    /// Creates an empty, online store.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            document: Mutex::new(MemoryDocument {
                raw: None,
                revision: 0,
                online: true,
                pending_failures: 0,
                pending_conflicts: VecDeque::new(),
            }),
            feed: ChangeFeed::new(true),
        }
    }

    /// Creates a store already holding `raw` exactly as given.
    pub fn with_raw(schema: Arc<Schema>, raw: Value) -> Self {
        let store = Self::new(schema);
        store.document.lock().raw = Some(raw);
        store
    }

    /// Writes `raw` verbatim, as another client or an older schema would,
    /// and notifies subscribers with its normalized form.
    pub fn write_raw(&self, raw: Value) {
        let mut document = self.document.lock();
        self.commit_locked(&mut document, raw);
    }

    /// Returns the stored document exactly as committed.
    pub fn raw_document(&self) -> Option<Value> {
        self.document.lock().raw.clone()
    }

    /// Number of commits so far.
    pub fn revision(&self) -> u64 {
        self.document.lock().revision
    }

    /// Simulates losing or regaining the connection.
    pub fn set_online(&self, online: bool) {
        self.document.lock().online = online;
        self.feed.set_online(online);
    }

    /// Makes the next `count` operations fail with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.document.lock().pending_failures = count;
    }

    /// Makes the next transactional update lose a race against a write of
    /// `raw` that lands between its read and its commit.
    pub fn inject_conflict(&self, raw: Value) {
        self.document.lock().pending_conflicts.push_back(raw);
    }

    fn commit_locked(&self, document: &mut MemoryDocument, raw: Value) -> AppState {
        let normalized = self.schema.normalize(&raw);
        document.raw = Some(raw);
        document.revision += 1;
        // Published under the lock so notification order equals commit order.
        self.feed.publish(normalized.clone());
        normalized
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn location(&self) -> &str {
        MEMORY_LOCATION
    }

    async fn get(&self) -> StoreResult<Option<AppState>> {
        let mut document = self.document.lock();
        document.check_available()?;
        Ok(document.raw.as_ref().map(|raw| self.schema.normalize(raw)))
    }

    async fn set(&self, state: &AppState) -> StoreResult<()> {
        let raw = self.schema.normalize_state(state).to_json()?;
        let mut document = self.document.lock();
        document.check_available()?;
        self.commit_locked(&mut document, raw);
        Ok(())
    }

    async fn transactional_update(&self, mutator: Mutator<'_>) -> StoreResult<AppState> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let (base_revision, exists, current) = {
                let mut document = self.document.lock();
                document.check_available()?;
                let current = self
                    .schema
                    .normalize(document.raw.as_ref().unwrap_or(&Value::Null));
                let snapshot = (document.revision, document.raw.is_some(), current);
                if let Some(conflict) = document.pending_conflicts.pop_front() {
                    self.commit_locked(&mut document, conflict);
                }
                snapshot
            };

            let next = self.schema.normalize_state(&mutator(current.clone()));

            let mut document = self.document.lock();
            if document.revision != base_revision {
                debug!(
                    "event=transaction_retry module=store status=conflict backend=memory attempt={attempt}"
                );
                continue;
            }
            if exists && next == current {
                return Ok(current);
            }
            let raw = next.to_json()?;
            return Ok(self.commit_locked(&mut document, raw));
        }

        Err(StoreError::TransactionConflict {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    fn subscribe(&self) -> DocumentSubscription {
        self.feed.subscribe()
    }

    fn subscribe_connectivity(&self) -> ConnectivitySubscription {
        self.feed.subscribe_connectivity()
    }
}
