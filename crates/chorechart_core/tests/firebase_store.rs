use chorechart_core::service::sync_service::toggle_completed;
use chorechart_core::store::ConnectivitySubscription;
use chorechart_core::{
    default_app_state, AppState, ChildId, FirebaseConfig, FirebaseStore, Schema, StoreAdapter,
    SyncPhase, SyncService,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy)]
enum AfterEvents {
    Hold,
    Close,
}

#[derive(Debug, Default)]
struct Recorded {
    document: Value,
    version: u64,
    /// Conditional writes that lose to a simulated concurrent writer.
    conflicts: u32,
    conditional_puts: u32,
    plain_gets: u32,
    stream_connects: u32,
    targets: Vec<String>,
}

struct Request {
    method: String,
    target: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Minimal HTTP/1.1 stand-in for the realtime database REST API.
struct FakeDatabase {
    recorded: Mutex<Recorded>,
    events: Vec<(&'static str, String)>,
    after: AfterEvents,
}

impl FakeDatabase {
    async fn serve(
        document: Value,
        events: Vec<(&'static str, String)>,
        after: AfterEvents,
    ) -> (Arc<Self>, FirebaseConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = FirebaseConfig {
            database_url: format!("http://{}", listener.local_addr().unwrap()),
            document_path: "state".to_string(),
            auth_token: Some("test-token".to_string()),
        };
        let fake = Arc::new(Self {
            recorded: Mutex::new(Recorded {
                document,
                ..Recorded::default()
            }),
            events,
            after,
        });

        let server = Arc::clone(&fake);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(Arc::clone(&server).handle(socket));
            }
        });
        (fake, config)
    }

    async fn handle(self: Arc<Self>, mut socket: TcpStream) {
        let Some(request) = read_request(&mut socket).await else {
            return;
        };
        if request.header("accept") == Some("text/event-stream") {
            self.stream(socket).await;
            return;
        }

        let (status, body, etag) = self.answer(&request);
        let mut head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
            body.len()
        );
        if let Some(etag) = etag {
            head.push_str(&format!("ETag: {etag}\r\n"));
        }
        head.push_str("\r\n");
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    fn answer(&self, request: &Request) -> (&'static str, String, Option<String>) {
        let mut recorded = self.recorded.lock();
        recorded.targets.push(request.target.clone());
        match request.method.as_str() {
            "GET" => {
                if request.header("x-firebase-etag").is_none() {
                    recorded.plain_gets += 1;
                }
                let etag = etag_for(recorded.version);
                ("200 OK", recorded.document.to_string(), Some(etag))
            }
            "PUT" => {
                if let Some(expected) = request.header("if-match") {
                    recorded.conditional_puts += 1;
                    if recorded.conflicts > 0 {
                        recorded.conflicts -= 1;
                        let current = Schema::default().normalize(&recorded.document);
                        let foreign = toggle_completed(current, ChildId::Cecci, "play");
                        recorded.document = foreign.to_json().unwrap();
                        recorded.version += 1;
                    }
                    if expected != etag_for(recorded.version) {
                        let etag = etag_for(recorded.version);
                        return (
                            "412 Precondition Failed",
                            recorded.document.to_string(),
                            Some(etag),
                        );
                    }
                }
                recorded.document = serde_json::from_slice(&request.body).unwrap();
                recorded.version += 1;
                ("200 OK", recorded.document.to_string(), None)
            }
            _ => ("405 Method Not Allowed", "null".to_string(), None),
        }
    }

    async fn stream(self: Arc<Self>, mut socket: TcpStream) {
        self.recorded.lock().stream_connects += 1;
        let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        for (name, data) in &self.events {
            let frame = format!("event: {name}\ndata: {data}\n\n");
            if socket.write_all(frame.as_bytes()).await.is_err() {
                return;
            }
        }
        match self.after {
            AfterEvents::Close => {
                let _ = socket.shutdown().await;
            }
            AfterEvents::Hold => {
                let mut sink = [0u8; 64];
                while matches!(socket.read(&mut sink).await, Ok(read) if read > 0) {}
            }
        }
    }

    fn stream_connects(&self) -> u32 {
        self.recorded.lock().stream_connects
    }
}

fn etag_for(version: u64) -> String {
    format!("\"v{version}\"")
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect::<HashMap<_, _>>();

    let length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buffer[head_end..].to_vec();
    while body.len() < length {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Some(Request {
        method,
        target,
        headers,
        body,
    })
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::default())
}

async fn wait_for_connectivity(connectivity: &mut ConnectivitySubscription, online: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(connectivity.has_reading() && connectivity.current() == online) {
            if connectivity.changed().await.is_none() {
                break;
            }
        }
    })
    .await
    .expect("connectivity reading should arrive");
}

async fn wait_for_stream_connects(fake: &FakeDatabase, count: u32) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while fake.stream_connects() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener should reconnect");
}

#[tokio::test]
async fn conditional_write_reapplies_after_a_conflict() {
    let (fake, config) =
        FakeDatabase::serve(default_app_state().to_json().unwrap(), Vec::new(), AfterEvents::Hold)
            .await;
    fake.recorded.lock().conflicts = 1;
    let store = FirebaseStore::new(&config, schema()).unwrap();

    let committed = store
        .transactional_update(&|state: AppState| toggle_completed(state, ChildId::Alex, "make_bed"))
        .await
        .unwrap();

    assert!(committed.child(ChildId::Alex).unwrap().is_completed("make_bed"));
    assert!(committed.child(ChildId::Cecci).unwrap().is_completed("play"));
    let recorded = fake.recorded.lock();
    assert_eq!(recorded.conditional_puts, 2);
    assert_eq!(Schema::default().normalize(&recorded.document), committed);
    assert!(recorded
        .targets
        .iter()
        .all(|target| target == "/state.json?auth=test-token"));
}

#[tokio::test]
async fn empty_location_reads_as_absent() {
    let (_fake, config) = FakeDatabase::serve(Value::Null, Vec::new(), AfterEvents::Hold).await;
    let store = FirebaseStore::new(&config, schema()).unwrap();

    assert_eq!(store.get().await.unwrap(), None);
}

#[tokio::test]
async fn nested_put_refetches_and_broadcasts() {
    let stored = toggle_completed(default_app_state(), ChildId::Alex, "read_book");
    let event = json!({ "path": "/children/alex/completedTasks", "data": ["read_book"] });
    let (fake, config) = FakeDatabase::serve(
        stored.to_json().unwrap(),
        vec![("put", event.to_string())],
        AfterEvents::Hold,
    )
    .await;
    let store = FirebaseStore::new(&config, schema()).unwrap();
    let mut changes = store.subscribe();
    let mut connectivity = store.subscribe_connectivity();
    assert!(!connectivity.has_reading());

    store.start_listener();
    let seen = tokio::time::timeout(Duration::from_secs(5), changes.next())
        .await
        .expect("refetched document should be broadcast")
        .unwrap();

    assert_eq!(seen, stored);
    wait_for_connectivity(&mut connectivity, true).await;
    assert_eq!(fake.recorded.lock().plain_gets, 1);

    store.shutdown();
    assert!(!connectivity.current());
}

#[tokio::test]
async fn cancel_event_stops_the_listener() {
    let (fake, config) = FakeDatabase::serve(
        default_app_state().to_json().unwrap(),
        vec![("cancel", "null".to_string())],
        AfterEvents::Hold,
    )
    .await;
    let store = FirebaseStore::new(&config, schema()).unwrap();
    let mut connectivity = store.subscribe_connectivity();

    store.start_listener();
    wait_for_connectivity(&mut connectivity, false).await;
    // Longer than the first reconnect backoff.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(fake.stream_connects(), 1);
    assert!(!connectivity.current());
}

#[tokio::test]
async fn closed_stream_reconnects_after_backoff() {
    let (fake, config) = FakeDatabase::serve(
        default_app_state().to_json().unwrap(),
        Vec::new(),
        AfterEvents::Close,
    )
    .await;
    let store = FirebaseStore::new(&config, schema()).unwrap();
    let started = Instant::now();

    store.start_listener();
    wait_for_stream_connects(&fake, 2).await;

    assert!(started.elapsed() >= Duration::from_millis(900));
    store.shutdown();
}

#[tokio::test]
async fn silent_stream_goes_offline_and_reconnects() {
    let (fake, config) = FakeDatabase::serve(
        default_app_state().to_json().unwrap(),
        Vec::new(),
        AfterEvents::Hold,
    )
    .await;
    let store =
        FirebaseStore::with_idle_timeout(&config, schema(), Duration::from_millis(200)).unwrap();
    let mut connectivity = store.subscribe_connectivity();

    store.start_listener();
    wait_for_connectivity(&mut connectivity, true).await;
    wait_for_connectivity(&mut connectivity, false).await;
    wait_for_stream_connects(&fake, 2).await;
    store.shutdown();
}

#[tokio::test]
async fn sync_service_is_ready_with_a_real_connectivity_reading() {
    let (_fake, config) = FakeDatabase::serve(
        default_app_state().to_json().unwrap(),
        Vec::new(),
        AfterEvents::Hold,
    )
    .await;
    let schema = schema();
    let store = Arc::new(FirebaseStore::new(&config, Arc::clone(&schema)).unwrap());
    store.start_listener();
    let sync = SyncService::new(Arc::clone(&store), schema);

    let initial = sync.start().await.unwrap();

    assert_eq!(initial, default_app_state());
    let snapshot = sync.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Ready);
    assert!(snapshot.online);
    sync.shutdown();
}
