use axum::extract::ws::Message;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::db::NoteBackend;
use crate::ws::error::RelayError;
use crate::ws::room::{Room, RoomMember, ROOM_SENDER};
use crate::protocol::{AwarenessEntry, AwarenessUpdate};

/// Owns the note id to room map and the cross-room maintenance tasks.
/// The map lock is only ever held for lookups and inserts, never
/// across document or backend I/O.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<i64, Arc<Room>>>,
    backend: Option<Arc<dyn NoteBackend>>,
    save_debounce: Duration,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RoomRegistry {
    pub fn new(backend: Option<Arc<dyn NoteBackend>>, save_debounce: Duration) -> Self {
        RoomRegistry {
            rooms: RwLock::new(HashMap::new()),
            backend,
            save_debounce,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Fetch the live room for a note, creating and seeding it when
    /// this is the first session in. Creation publishes the room while
    /// holding its state lock, so concurrent joiners of the same note
    /// block until the stored content is loaded.
    pub async fn get_or_create(self: &Arc<Self>, note_id: i64) -> Result<Arc<Room>, RelayError> {
        loop {
            if let Some(room) = self.rooms.read().await.get(&note_id).cloned() {
                // A room marked closed is mid-teardown, wait for the
                // leaver to unlink it and look again.
                if room.state.lock().await.closed {
                    tokio::task::yield_now().await;
                    continue;
                }
                return Ok(room);
            }

            match self.create_room(note_id).await {
                Ok(Some(room)) => return Ok(room),
                // Lost the insert race, look the winner up.
                Ok(None) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to create, seed and publish the room for a note. Returns
    /// Ok(None) when another session published one first.
    async fn create_room(self: &Arc<Self>, note_id: i64) -> Result<Option<Arc<Room>>, RelayError> {
        let room = Room::spawn(note_id, self.backend.clone(), self.save_debounce);

        // Lock the fresh room before anyone can see it, then publish.
        let mut state = room.state.lock().await;
        {
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(&note_id) {
                drop(state);
                // Nothing was ever dirty here, no ack to wait for.
                let _ = room.shutdown_persistence();
                return Ok(None);
            }
            rooms.insert(note_id, room.clone());
        }

        // Joiners now block on the state lock while we seed.
        if let Some(backend) = &self.backend {
            match backend.load_note(note_id).await {
                Ok(Some(record)) => {
                    if let Some(content) = &record.content {
                        state.doc.seed_from_json(note_id, content);
                    }
                    info!("Room for note {} created", note_id);
                }
                Ok(None) => {
                    state.closed = true;
                    drop(state);
                    self.unlink(note_id, &room).await;
                    let _ = room.shutdown_persistence();
                    return Err(RelayError::NoteNotFound(note_id));
                }
                Err(e) => {
                    // Opening the room anyway would overwrite the stored
                    // content with an empty document on the next save.
                    error!("Failed to load note {}: {}", note_id, e);
                    state.closed = true;
                    drop(state);
                    self.unlink(note_id, &room).await;
                    let _ = room.shutdown_persistence();
                    return Err(RelayError::Backend(e));
                }
            }
        } else {
            debug!("Room for note {} created without backing storage", note_id);
        }

        drop(state);
        Ok(Some(room))
    }

    /// Remove a note's map entry if it still points at `room`. Guards
    /// against unlinking a replacement room that was created after
    /// this one closed.
    pub async fn unlink(&self, note_id: i64, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if let Some(current) = rooms.get(&note_id) {
            if Arc::ptr_eq(current, room) {
                rooms.remove(&note_id);
            }
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Start the background task that clears presence entries of
    /// sessions that have gone quiet. Swept sessions stay connected,
    /// only their cursors disappear for the rest of the room.
    pub fn start_idle_sweeper(self: &Arc<Self>, idle_after: Duration, interval: Duration) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                sweep_idle_presence(&registry, idle_after).await;
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }
}

impl Drop for RoomRegistry {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// One pass over every room: members whose last inbound traffic is
/// older than the cutoff lose their presence entry, announced with a
/// clock bump so clients do not resurrect it from a stale update.
async fn sweep_idle_presence(registry: &Arc<RoomRegistry>, idle_after: Duration) {
    let cutoff = Utc::now().timestamp_millis() - idle_after.as_millis() as i64;

    for room in registry.rooms_snapshot().await {
        let mut state = room.state.lock().await;
        if state.closed {
            continue;
        }

        let mut removed: Vec<AwarenessEntry> = Vec::new();
        let idle_members: Vec<Arc<RoomMember>> = state
            .members
            .values()
            .filter(|member| member.last_activity_ms() < cutoff)
            .cloned()
            .collect();
        for member in idle_members {
            for client_id in member.announced_ids() {
                if let Some(entry) = state.presence.remove(client_id) {
                    removed.push(AwarenessEntry {
                        client_id,
                        clock: entry.clock.saturating_add(1),
                        state: String::new(),
                    });
                }
            }
        }

        if !removed.is_empty() {
            warn!(
                "Sweeping {} idle presence entries from note {}",
                removed.len(),
                room.note_id
            );
            let frame = AwarenessUpdate::new(removed).encode();
            room.send_to_room(ROOM_SENDER, Message::Binary(frame));
        }
    }
}
