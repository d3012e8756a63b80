use axum::extract::ws::Message;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::db::NoteBackend;
use crate::models::Collaborator;
use crate::ws::docstore::DocStore;
use crate::ws::persist::{self, PersistCommand};
use crate::ws::presence::PresenceTable;

/// Fan-out messages carry the sending session's id so that session can
/// skip its own frames on the way back.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub sender_id: Uuid,
    pub message: Message,
}

/// Sender id used for room-originated broadcasts (idle sweeps and the
/// like) that every member should receive.
pub const ROOM_SENDER: Uuid = Uuid::nil();

/// One connected session as seen by its room.
pub struct RoomMember {
    pub session_id: Uuid,
    pub user_id: i64,
    /// Awareness client id owning this member's identity entry.
    pub awareness_id: u64,
    pub identity: Collaborator,
    last_activity_ms: AtomicI64,
    /// Every awareness client id this session has spoken for. Clients
    /// pick ids freely on the wire, so leave and the idle sweep must
    /// clear all of them, not just the seeded one.
    announced: std::sync::Mutex<HashSet<u64>>,
}

impl RoomMember {
    pub fn new(session_id: Uuid, user_id: i64, awareness_id: u64, identity: Collaborator) -> Self {
        RoomMember {
            session_id,
            user_id,
            awareness_id,
            identity,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            announced: std::sync::Mutex::new(HashSet::from([awareness_id])),
        }
    }

    /// Record inbound traffic from this session.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Remember an awareness client id this session upserted.
    pub fn track_awareness_id(&self, client_id: u64) {
        if let Ok(mut ids) = self.announced.lock() {
            ids.insert(client_id);
        }
    }

    /// The awareness client ids to clear when this session's presence
    /// goes away.
    pub fn announced_ids(&self) -> Vec<u64> {
        match self.announced.lock() {
            Ok(ids) => ids.iter().copied().collect(),
            Err(_) => vec![self.awareness_id],
        }
    }
}

/// Mutable state of a room, everything behind one lock: the CRDT
/// store, the presence table and the member roster always change
/// together.
pub struct RoomState {
    pub doc: DocStore,
    pub presence: PresenceTable,
    pub members: HashMap<Uuid, Arc<RoomMember>>,
    next_awareness_id: u64,
    /// Counts accepted document mutations, exposed via diagnostics.
    pub revision: u64,
    /// Set on mutation, cleared after a successful save.
    pub dirty: bool,
    /// Set when the last member leaves. A closed room is never joined,
    /// lookups retry against the registry instead.
    pub closed: bool,
}

impl RoomState {
    fn new() -> Self {
        RoomState {
            doc: DocStore::new(),
            presence: PresenceTable::new(),
            members: HashMap::new(),
            next_awareness_id: 0,
            revision: 0,
            dirty: false,
            closed: false,
        }
    }

    pub fn next_awareness_id(&mut self) -> u64 {
        let id = self.next_awareness_id;
        self.next_awareness_id += 1;
        id
    }

    /// Roster entries for everyone except `session_id`.
    pub fn collaborators_excluding(&self, session_id: Uuid) -> Vec<Collaborator> {
        let mut collaborators: Vec<Collaborator> = self
            .members
            .values()
            .filter(|member| member.session_id != session_id)
            .map(|member| member.identity.clone())
            .collect();
        collaborators.sort_by_key(|c| c.user_id);
        collaborators
    }
}

/// A live editing room for one note. Shared between every session on
/// that note, the persistence task and the idle sweeper.
pub struct Room {
    pub note_id: i64,
    pub state: Mutex<RoomState>,
    broadcast: broadcast::Sender<BroadcastMessage>,
    persist: mpsc::UnboundedSender<PersistCommand>,
}

impl Room {
    /// Create the room and start its persistence task. The task holds
    /// the room alive until it is told to shut down, the room itself
    /// only holds the command channel, so teardown is acyclic.
    pub(crate) fn spawn(
        note_id: i64,
        backend: Option<Arc<dyn NoteBackend>>,
        debounce: std::time::Duration,
    ) -> Arc<Room> {
        let (broadcast_tx, _rx) = broadcast::channel::<BroadcastMessage>(100);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let room = Arc::new(Room {
            note_id,
            state: Mutex::new(RoomState::new()),
            broadcast: broadcast_tx,
            persist: persist_tx,
        });
        persist::spawn_saver(room.clone(), persist_rx, backend, debounce);
        room
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.broadcast.subscribe()
    }

    /// Fan a message out to every subscribed session. Callers hold the
    /// room lock, which is what makes subscribe-at-join gap-free.
    pub fn send_to_room(&self, sender_id: Uuid, message: Message) {
        if let Err(e) = self.broadcast.send(BroadcastMessage { sender_id, message }) {
            // Expected when the sender is the only member.
            debug!("No receivers for broadcast in note {}: {}", self.note_id, e);
        }
    }

    /// Ask the persistence task to (re)arm its debounce window.
    pub fn mark_dirty(&self) {
        let _ = self.persist.send(PersistCommand::Touch);
    }

    /// Tell the persistence task to flush pending changes and exit.
    /// The returned channel resolves once the final write has finished.
    pub fn shutdown_persistence(&self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.persist.send(PersistCommand::Shutdown(done_tx));
        done_rx
    }
}
