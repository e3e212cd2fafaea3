//! Hosted realtime database adapter over its REST API.
//!
//! # Responsibility
//! - Read/write the document at `{database_url}/{path}.json`.
//! - Implement transactions with ETag conditional writes.
//! - Follow the server-sent-events stream for live changes and
//!   connectivity.
//!
//! # Invariants
//! - Connectivity is `true` only while the event stream is open. A stream
//!   that stays silent past the idle timeout counts as dead; the server
//!   sends keep-alives far more often.
//! - A 412 answer to a conditional write means another writer won; the
//!   mutator is re-applied to the fresh value.
//! - The listener never gives up on transport errors; it backs off
//!   (1 s doubling to 30 s) and reconnects until shut down.

use super::sse::{SseDecoder, SseEvent};
use super::{
    ChangeFeed, ConnectivitySubscription, DocumentSubscription, Mutator, StoreAdapter,
    StoreError, StoreResult, MAX_TRANSACTION_ATTEMPTS,
};
use crate::model::state::AppState;
use crate::schema::Schema;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, ETAG, IF_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const ETAG_REQUEST_HEADER: &str = "X-Firebase-ETag";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Longest silence tolerated on the event stream before reconnecting.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection parameters for the hosted database.
///
/// Supplied from environment configuration; never embedded in source.
#[derive(Clone, PartialEq, Eq)]
pub struct FirebaseConfig {
    /// Base URL, e.g. `https://<project>.firebasedatabase.app`.
    pub database_url: String,
    /// Document location below the root, e.g. `state`.
    pub document_path: String,
    /// Database secret or ID token sent as the `auth` query parameter.
    pub auth_token: Option<String>,
}

impl fmt::Debug for FirebaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirebaseConfig")
            .field("database_url", &self.database_url)
            .field("document_path", &self.document_path)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FirebaseConfig {
    pub fn document_url(&self) -> String {
        format!(
            "{}/{}.json",
            self.database_url.trim_end_matches('/'),
            self.document_path.trim_matches('/')
        )
    }
}

enum StreamEnd {
    /// Server closed the stream; reconnect.
    Closed,
    /// Server revoked access; reconnecting would not help.
    Cancelled(String),
}

struct FirebaseShared {
    client: reqwest::Client,
    document_url: String,
    auth_token: Option<String>,
    schema: Arc<Schema>,
    feed: ChangeFeed,
    idle_timeout: Duration,
}

impl FirebaseShared {
    fn request(&self, method: Method) -> RequestBuilder {
        let builder = self.client.request(method, &self.document_url);
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    async fn fetch(&self) -> StoreResult<Option<AppState>> {
        let response = ensure_success(self.request(Method::GET).send().await?).await?;
        let raw: Value = response.json().await?;
        Ok((!raw.is_null()).then(|| self.schema.normalize(&raw)))
    }

    async fn stream_once(&self, backoff: &mut Duration) -> StoreResult<StreamEnd> {
        let request = self
            .request(Method::GET)
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| self.idle_error())??;
        let mut response = ensure_success(response).await?;

        self.feed.set_online(true);
        *backoff = INITIAL_BACKOFF;
        info!("event=listener_connected module=store status=ok backend=firebase");

        let mut decoder = SseDecoder::default();
        loop {
            let chunk = tokio::time::timeout(self.idle_timeout, response.chunk())
                .await
                .map_err(|_| self.idle_error())??;
            let Some(chunk) = chunk else {
                break;
            };
            for event in decoder.push(&chunk) {
                if let Some(end) = self.handle_event(event).await? {
                    return Ok(end);
                }
            }
        }
        Ok(StreamEnd::Closed)
    }

    fn idle_error(&self) -> StoreError {
        StoreError::Unavailable(format!(
            "event stream silent for {}ms",
            self.idle_timeout.as_millis()
        ))
    }

    async fn handle_event(&self, event: SseEvent) -> StoreResult<Option<StreamEnd>> {
        match event.name.as_str() {
            "put" | "patch" => {
                let state = match root_put_payload(&event) {
                    Some(raw) if !raw.is_null() => Some(self.schema.normalize(&raw)),
                    // Sub-path updates carry fragments; re-read the whole document.
                    _ => self.fetch().await?,
                };
                if let Some(state) = state {
                    self.feed.publish(state);
                }
                Ok(None)
            }
            "keep-alive" => Ok(None),
            "cancel" | "auth_revoked" => Ok(Some(StreamEnd::Cancelled(event.name.clone()))),
            other => {
                debug!("event=listener_event module=store status=ignored backend=firebase name={other}");
                Ok(None)
            }
        }
    }
}

/// Returns the full document carried by a `put` at the document root.
fn root_put_payload(event: &SseEvent) -> Option<Value> {
    if event.name != "put" {
        return None;
    }
    let mut envelope: Value = serde_json::from_str(&event.data).ok()?;
    if envelope.get("path").and_then(Value::as_str) != Some("/") {
        return None;
    }
    envelope.get_mut("data").map(Value::take)
}

async fn ensure_success(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Http {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

async fn run_listener(shared: Arc<FirebaseShared>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match shared.stream_once(&mut backoff).await {
            Ok(StreamEnd::Closed) => {
                info!("event=listener_closed module=store status=ok backend=firebase");
            }
            Ok(StreamEnd::Cancelled(reason)) => {
                warn!(
                    "event=listener_cancelled module=store status=error backend=firebase reason={reason}"
                );
                shared.feed.set_online(false);
                return;
            }
            Err(err) => {
                warn!(
                    "event=listener_error module=store status=error backend=firebase retry_ms={} error={err}",
                    backoff.as_millis()
                );
            }
        }

        shared.feed.set_online(false);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Store adapter for the hosted realtime database.
pub struct FirebaseStore {
    shared: Arc<FirebaseShared>,
    location: String,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl FirebaseStore {
    /// Builds the adapter; no request is made until first use.
    pub fn new(config: &FirebaseConfig, schema: Arc<Schema>) -> StoreResult<Self> {
        Self::with_idle_timeout(config, schema, STREAM_IDLE_TIMEOUT)
    }

    /// Like `new`, reconnecting after `idle_timeout` of stream silence.
    pub fn with_idle_timeout(
        config: &FirebaseConfig,
        schema: Arc<Schema>,
        idle_timeout: Duration,
    ) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let document_url = config.document_url();

        Ok(Self {
            location: document_url.clone(),
            shared: Arc::new(FirebaseShared {
                client,
                document_url,
                auth_token: config.auth_token.clone(),
                schema,
                feed: ChangeFeed::awaiting_reading(),
                idle_timeout,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Opens the live event stream in the background. Idempotent.
    pub fn start_listener(&self) {
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *listener = Some(tokio::spawn(run_listener(Arc::clone(&self.shared))));
    }

    /// Closes the event stream and reports offline.
    pub fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        self.shared.feed.set_online(false);
    }
}

impl Drop for FirebaseStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl StoreAdapter for FirebaseStore {
    fn location(&self) -> &str {
        &self.location
    }

    async fn get(&self) -> StoreResult<Option<AppState>> {
        self.shared.fetch().await
    }

    async fn set(&self, state: &AppState) -> StoreResult<()> {
        let normalized = self.shared.schema.normalize_state(state);
        let body = normalized.to_json()?;
        ensure_success(self.shared.request(Method::PUT).json(&body).send().await?).await?;
        self.shared.feed.publish(normalized);
        Ok(())
    }

    async fn transactional_update(&self, mutator: Mutator<'_>) -> StoreResult<AppState> {
        let shared = &self.shared;
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let response = shared
                .request(Method::GET)
                .header(ETAG_REQUEST_HEADER, "true")
                .send()
                .await?;
            let response = ensure_success(response).await?;
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StoreError::Protocol("missing ETag header".to_string()))?;
            let raw: Value = response.json().await?;

            let current = shared.schema.normalize(&raw);
            let next = shared.schema.normalize_state(&mutator(current.clone()));
            if !raw.is_null() && next == current {
                return Ok(current);
            }

            let body = next.to_json()?;
            let response = shared
                .request(Method::PUT)
                .header(IF_MATCH, etag)
                .json(&body)
                .send()
                .await?;
            if response.status() == StatusCode::PRECONDITION_FAILED {
                debug!(
                    "event=transaction_retry module=store status=conflict backend=firebase attempt={attempt}"
                );
                continue;
            }
            ensure_success(response).await?;
            shared.feed.publish(next.clone());
            return Ok(next);
        }

        Err(StoreError::TransactionConflict {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        })
    }

    fn subscribe(&self) -> DocumentSubscription {
        self.shared.feed.subscribe()
    }

    fn subscribe_connectivity(&self) -> ConnectivitySubscription {
        self.shared.feed.subscribe_connectivity()
    }
}
