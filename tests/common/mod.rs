#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use loro::{LoroDoc, LoroMap, ToJson};
use mello_sync::config::Config;
use mello_sync::db::{BackendError, NoteBackend, NoteRecord, UserProfile};
use mello_sync::protocol::{AwarenessUpdate, SyncMessage, WireMessage};
use mello_sync::{build_router, AppState};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const TEST_SECRET: &str = "integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// In-memory stand-in for the notes database. Notes, permission grants
/// and profiles are plain maps, successful saves are recorded so tests
/// can assert on persistence behavior.
pub struct MemoryBackend {
    notes: Mutex<HashMap<i64, NoteRecord>>,
    grants: Mutex<HashSet<(i64, i64)>>,
    profiles: Mutex<HashMap<i64, UserProfile>>,
    saves: Mutex<Vec<(i64, String)>>,
    save_attempts: AtomicUsize,
    fail_saves: AtomicBool,
    save_delay_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            notes: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashSet::new()),
            profiles: Mutex::new(HashMap::new()),
            saves: Mutex::new(Vec::new()),
            save_attempts: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
            save_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn add_note(&self, id: i64, owner_id: i64, content: Option<&str>) {
        self.notes.lock().unwrap().insert(
            id,
            NoteRecord {
                id,
                owner_id,
                content: content.map(|c| c.to_string()),
                updated_at: chrono::Utc::now(),
            },
        );
    }

    pub fn grant(&self, user_id: i64, note_id: i64) {
        self.grants.lock().unwrap().insert((user_id, note_id));
    }

    pub fn add_profile(&self, id: i64, user_name: &str, avatar: Option<&str>) {
        self.profiles.lock().unwrap().insert(
            id,
            UserProfile {
                id,
                user_name: user_name.to_string(),
                avatar: avatar.map(|a| a.to_string()),
            },
        );
    }

    /// Successful writes, in order.
    pub fn saves(&self) -> Vec<(i64, String)> {
        self.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    /// Write attempts, whether they succeeded or not.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every save stall, modelling a slow database write.
    pub fn set_save_delay(&self, millis: u64) {
        self.save_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn note_content(&self, note_id: i64) -> Option<String> {
        self.notes
            .lock()
            .unwrap()
            .get(&note_id)
            .and_then(|note| note.content.clone())
    }
}

#[async_trait]
impl NoteBackend for MemoryBackend {
    async fn has_note_access(&self, user_id: i64, note_id: i64) -> Result<bool, BackendError> {
        let owns = self
            .notes
            .lock()
            .unwrap()
            .get(&note_id)
            .map(|note| note.owner_id == user_id)
            .unwrap_or(false);
        Ok(owns || self.grants.lock().unwrap().contains(&(user_id, note_id)))
    }

    async fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, BackendError> {
        Ok(self.profiles.lock().unwrap().get(&user_id).cloned())
    }

    async fn load_note(&self, note_id: i64) -> Result<Option<NoteRecord>, BackendError> {
        Ok(self.notes.lock().unwrap().get(&note_id).cloned())
    }

    async fn save_note_content(&self, note_id: i64, content: &str) -> Result<(), BackendError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(BackendError::Other("simulated write failure".to_string()));
        }
        let mut notes = self.notes.lock().unwrap();
        if let Some(note) = notes.get_mut(&note_id) {
            note.content = Some(content.to_string());
            note.updated_at = chrono::Utc::now();
        }
        self.saves
            .lock()
            .unwrap()
            .push((note_id, content.to_string()));
        Ok(())
    }
}

/// A relay bound to an ephemeral port, serving a [`MemoryBackend`].
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub backend: Arc<MemoryBackend>,
}

impl TestServer {
    pub async fn connect_user(&self, user_id: i64) -> WsClient {
        connect(self.addr, &mint_token(user_id)).await
    }
}

pub async fn spawn_server(backend: Arc<MemoryBackend>, debounce_ms: u64) -> TestServer {
    let config = Config {
        auth_jwt_secret: Some(TEST_SECRET.to_string()),
        save_debounce_ms: debounce_ms,
        ..Config::default()
    };
    let dyn_backend: Arc<dyn NoteBackend> = backend.clone();
    let state = AppState::new(config, Some(dyn_backend));
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind a test listener");
    let addr = listener.local_addr().expect("listener has no local addr");
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("test server stopped");
    });
    TestServer {
        addr,
        state,
        backend,
    }
}

/// Mint a token the relay accepts, carrying the user id in the `id`
/// claim the way the main application issues them.
pub fn mint_token(user_id: i64) -> String {
    mint_token_with_secret(user_id, TEST_SECRET)
}

pub fn mint_token_with_secret(user_id: i64, secret: &str) -> String {
    let claims = json!({
        "id": user_id,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to mint a token")
}

pub async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{}/ws/notes?token={}", addr, token);
    let (client, _) = connect_async(url).await.expect("websocket connect failed");
    client
}

pub async fn connect_without_credentials(addr: SocketAddr) -> WsClient {
    let url = format!("ws://{}/ws/notes", addr);
    let (client, _) = connect_async(url).await.expect("websocket connect failed");
    client
}

pub async fn send_text(client: &mut WsClient, value: &Value) {
    client
        .send(Message::text(value.to_string()))
        .await
        .expect("failed to send a text frame");
}

pub async fn send_binary(client: &mut WsClient, frame: Vec<u8>) {
    client
        .send(Message::binary(frame))
        .await
        .expect("failed to send a binary frame");
}

pub async fn send_update(client: &mut WsClient, payload: Vec<u8>) {
    send_binary(client, SyncMessage::Update(payload).encode()).await;
}

pub async fn join_note_message(client: &mut WsClient, note_id: i64) {
    send_text(client, &json!({ "action": "join_note", "noteId": note_id })).await;
}

pub async fn next_message(client: &mut WsClient) -> Message {
    match timeout(Duration::from_secs(5), client.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => panic!("websocket error: {e}"),
        Ok(None) => panic!("websocket stream ended unexpectedly"),
        Err(_) => panic!("timed out waiting for a websocket message"),
    }
}

pub async fn next_binary(client: &mut WsClient) -> Vec<u8> {
    loop {
        match next_message(client).await {
            Message::Binary(data) => return data.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
}

pub async fn next_text(client: &mut WsClient) -> Value {
    loop {
        match next_message(client).await {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("text frame is not JSON")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Expect a close frame and return its code.
pub async fn next_close_code(client: &mut WsClient) -> u16 {
    loop {
        match next_message(client).await {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame carried no code"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

/// Assert that nothing arrives on the socket for the given window.
pub async fn expect_silence(client: &mut WsClient, millis: u64) {
    match timeout(Duration::from_millis(millis), client.next()).await {
        Err(_) => {}
        Ok(received) => panic!("expected no traffic, received {received:?}"),
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool, millis: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {millis}ms");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Everything the relay sends while admitting a session to a room.
pub struct JoinBootstrap {
    pub snapshot: Vec<u8>,
    pub presence: AwarenessUpdate,
    pub joined: Value,
}

/// Send a join and consume the whole bootstrap sequence: state request,
/// full document state, the presence snapshot and the joined notice.
pub async fn join_note(client: &mut WsClient, note_id: i64) -> JoinBootstrap {
    join_note_message(client, note_id).await;

    let frame = next_binary(client).await;
    assert_eq!(
        WireMessage::decode(&frame).expect("bad bootstrap frame"),
        WireMessage::Sync(SyncMessage::StateRequest)
    );

    let frame = next_binary(client).await;
    let snapshot = match WireMessage::decode(&frame).expect("bad bootstrap frame") {
        WireMessage::Sync(SyncMessage::FullState(payload)) => payload,
        other => panic!("expected the full document state, got {other:?}"),
    };

    let frame = next_binary(client).await;
    let presence = match WireMessage::decode(&frame).expect("bad bootstrap frame") {
        WireMessage::Awareness(update) => update,
        other => panic!("expected the presence snapshot, got {other:?}"),
    };

    let joined = next_text(client).await;
    assert_eq!(joined["action"], "joined", "unexpected notice: {joined}");
    assert_eq!(joined["noteId"], json!(note_id));

    JoinBootstrap {
        snapshot,
        presence,
        joined,
    }
}

/// The awareness client id a user's identity entry was seeded under.
pub fn find_client_id(presence: &AwarenessUpdate, user_id: i64) -> u64 {
    presence
        .entries
        .iter()
        .find(|entry| {
            serde_json::from_str::<Value>(&entry.state)
                .map(|state| state["userId"] == json!(user_id))
                .unwrap_or(false)
        })
        .map(|entry| entry.client_id)
        .unwrap_or_else(|| panic!("no presence entry for user {user_id}"))
}

/// Client-side document replica. Local edits are committed one at a
/// time and captured as encoded updates, ready to be sent down the
/// relay the way a real editor would.
pub struct DocReplica {
    pub doc: LoroDoc,
    updates: Arc<Mutex<Vec<Vec<u8>>>>,
    _updates_sub: loro::Subscription,
}

impl DocReplica {
    pub fn new() -> Self {
        let doc = LoroDoc::new();
        let updates: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let sub = doc.subscribe_local_update(Box::new(move |update| {
            sink.lock().unwrap().push(update.clone());
            true
        }));
        DocReplica {
            doc,
            updates,
            _updates_sub: sub,
        }
    }

    pub fn import(&self, payload: &[u8]) {
        self.doc.import(payload).expect("replica import failed");
    }

    /// Append a paragraph block and return the encoded update.
    pub fn insert_block(&self, id: &str, text: &str) -> Vec<u8> {
        let blocks = self.doc.get_movable_list("blocks");
        self.insert_block_at(blocks.len(), id, text)
    }

    pub fn insert_block_at(&self, idx: usize, id: &str, text: &str) -> Vec<u8> {
        let blocks = self.doc.get_movable_list("blocks");
        let block = blocks
            .insert_container(idx, LoroMap::new())
            .expect("insert failed");
        block.insert("id", id).expect("insert failed");
        block.insert("type", "paragraph").expect("insert failed");
        block.insert("text", text).expect("insert failed");
        self.take_update()
    }

    fn take_update(&self) -> Vec<u8> {
        self.doc.commit();
        let mut pending = self.updates.lock().unwrap();
        assert_eq!(pending.len(), 1, "expected exactly one pending update");
        pending.pop().expect("no pending update")
    }

    /// Current block array as JSON.
    pub fn blocks(&self) -> Value {
        let deep = self.doc.get_deep_value().to_json_value();
        deep.get("blocks").cloned().unwrap_or_else(|| json!([]))
    }
}

impl Default for DocReplica {
    fn default() -> Self {
        Self::new()
    }
}
