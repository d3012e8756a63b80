use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    ClientMessage, Collaborator, JoinedMessage, ServerMessage, UserJoinedMessage, UserLeftMessage,
};
use crate::protocol::{AwarenessEntry, AwarenessUpdate, SyncMessage, WireMessage};
use crate::services::profile_service::user_color;
use crate::ws::error::{RelayError, CLOSE_ACCESS_DENIED};
use crate::ws::room::{BroadcastMessage, Room, RoomMember};
use crate::AppState;

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// A session's handle on the room it joined.
struct JoinedRoom {
    room: Arc<Room>,
    member: Arc<RoomMember>,
    rx: broadcast::Receiver<BroadcastMessage>,
}

/// Drive one authenticated WebSocket connection through its lifetime:
/// wait for a join, relay frames between the socket and the room, then
/// clean up the membership.
pub(crate) async fn handle_session(socket: WebSocket, user_id: i64, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    info!(
        "WebSocket session {} established for user {}",
        session_id, user_id
    );

    // The sink is shared between the read loop (state replies), the
    // broadcast forwarder and the join handshake.
    let (sender, mut receiver) = socket.split();
    let sender: SharedSink = Arc::new(Mutex::new(sender));

    let Some(joined) = await_join(&mut receiver, &sender, &state, session_id, user_id).await else {
        info!("WebSocket session {} ended before joining a note", session_id);
        return;
    };
    let JoinedRoom { room, member, rx } = joined;

    // One task reads the socket, one forwards room broadcasts back.
    let recv_room = room.clone();
    let recv_member = member.clone();
    let recv_sender = sender.clone();
    let mut recv_task = tokio::spawn(async move {
        read_loop(receiver, recv_room, recv_member, recv_sender, session_id).await;
    });

    let fwd_sender = sender.clone();
    let mut fwd_task = tokio::spawn(async move {
        forward_broadcasts(rx, fwd_sender, session_id).await;
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut recv_task) => fwd_task.abort(),
        _ = (&mut fwd_task) => recv_task.abort(),
    };

    leave_room(&state, &room, &member).await;
    info!("WebSocket session {} terminated", session_id);
}

/// Pre-join phase: consume messages until a join succeeds or the
/// connection dies. Denied access closes the socket, an unknown note
/// leaves the session free to try another id.
async fn await_join(
    receiver: &mut SplitStream<WebSocket>,
    sender: &SharedSink,
    state: &Arc<AppState>,
    session_id: Uuid,
    user_id: i64,
) -> Option<JoinedRoom> {
    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            Message::Binary(_) => {
                warn!(
                    "Session {} sent binary data before joining a note",
                    session_id
                );
                continue;
            }
            _ => continue,
        };

        let note_id = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::JoinNote(join)) => join.note_id,
            Ok(ClientMessage::Heartbeat) => {
                debug!("Session {} heartbeat before join", session_id);
                continue;
            }
            Err(e) => {
                warn!("Session {} sent an unparseable message: {}", session_id, e);
                continue;
            }
        };

        match join_room(state, session_id, user_id, note_id, sender).await {
            Ok(joined) => {
                info!(
                    "User {} joined note {} (session {})",
                    user_id, note_id, session_id
                );
                return Some(joined);
            }
            Err(RelayError::AccessDenied { .. }) => {
                warn!("User {} denied access to note {}", user_id, note_id);
                send_to_session(sender, text_message(&ServerMessage::error("Access denied"))).await;
                close_with_code(sender, CLOSE_ACCESS_DENIED, "Access denied").await;
                return None;
            }
            Err(RelayError::NoteNotFound(_)) => {
                warn!("User {} tried to join missing note {}", user_id, note_id);
                send_to_session(sender, text_message(&ServerMessage::error("Note not found")))
                    .await;
            }
            Err(e) => {
                error!("User {} failed to join note {}: {}", user_id, note_id, e);
                send_to_session(
                    sender,
                    text_message(&ServerMessage::error("Note is temporarily unavailable")),
                )
                .await;
            }
        }
    }
    None
}

/// Check access, resolve the room and register the session in it, then
/// send the bootstrap sequence: state request, full document state,
/// presence snapshot and the joined notice.
async fn join_room(
    state: &Arc<AppState>,
    session_id: Uuid,
    user_id: i64,
    note_id: i64,
    sender: &SharedSink,
) -> Result<JoinedRoom, RelayError> {
    // Access is checked before any room state exists for this session.
    let allowed = match &state.backend {
        Some(backend) => backend
            .has_note_access(user_id, note_id)
            .await
            .unwrap_or_else(|e| {
                error!(
                    "Access check failed for user {} on note {}: {}",
                    user_id, note_id, e
                );
                false
            }),
        None => {
            warn!(
                "No note backend configured, allowing user {} into note {}",
                user_id, note_id
            );
            true
        }
    };
    if !allowed {
        return Err(RelayError::AccessDenied { user_id, note_id });
    }

    let profile = state.profiles.get_or_fetch(state.backend.as_ref(), user_id).await;
    let identity = Collaborator {
        user_id,
        user_name: profile.user_name,
        avatar: profile.avatar,
        color: user_color(user_id).to_string(),
    };

    let (room, member, rx, snapshot, awareness, collaborators) = loop {
        let room = state.registry.get_or_create(note_id).await?;
        let mut room_state = room.state.lock().await;
        if room_state.closed {
            // Lost a race against the last leaver, fetch a fresh room.
            drop(room_state);
            tokio::task::yield_now().await;
            continue;
        }

        let awareness_id = room_state.next_awareness_id();
        let member = Arc::new(RoomMember::new(
            session_id,
            user_id,
            awareness_id,
            identity.clone(),
        ));
        room_state.members.insert(session_id, member.clone());
        let identity_state =
            serde_json::to_string(&member.identity).unwrap_or_else(|_| "{}".to_string());
        room_state.presence.seed(awareness_id, identity_state);

        let snapshot = match room_state.doc.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    "Failed to export note {} for session {}: {}",
                    note_id, session_id, e
                );
                room_state.members.remove(&session_id);
                room_state.presence.remove(awareness_id);
                return Err(RelayError::Persistence { note_id, reason: e });
            }
        };
        let awareness = room_state.presence.snapshot();
        let collaborators = room_state.collaborators_excluding(session_id);

        // Subscribing and announcing under the same lock hold keeps
        // join notices exactly-once: whoever registered earlier is in
        // the roster, whoever registers later gets the broadcast.
        let rx = room.subscribe();
        room.send_to_room(
            session_id,
            text_message(&ServerMessage::UserJoined(UserJoinedMessage {
                user: identity.clone(),
            })),
        );
        drop(room_state);
        break (room, member, rx, snapshot, awareness, collaborators);
    };

    send_to_session(sender, Message::Binary(SyncMessage::StateRequest.encode())).await;
    send_to_session(
        sender,
        Message::Binary(SyncMessage::FullState(snapshot).encode()),
    )
    .await;
    if let Some(update) = awareness {
        send_to_session(sender, Message::Binary(update.encode())).await;
    }
    send_to_session(
        sender,
        text_message(&ServerMessage::Joined(JoinedMessage {
            note_id,
            collaborators,
        })),
    )
    .await;

    Ok(JoinedRoom { room, member, rx })
}

/// Relay phase socket reader. Every inbound message counts as
/// activity, binary frames go through the wire protocol, text frames
/// are control messages.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    room: Arc<Room>,
    member: Arc<RoomMember>,
    sender: SharedSink,
    session_id: Uuid,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        member.touch();
        match msg {
            Message::Binary(frame) => {
                handle_binary_frame(&room, &member, &frame, &sender).await;
            }
            Message::Text(text) => {
                handle_control_message(session_id, &text);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Dispatch one decoded binary frame against the room.
async fn handle_binary_frame(
    room: &Arc<Room>,
    member: &Arc<RoomMember>,
    frame: &[u8],
    sender: &SharedSink,
) {
    let session_id = member.session_id;
    match WireMessage::decode(frame) {
        Ok(WireMessage::Sync(SyncMessage::StateRequest)) => {
            // Answered with this session's own full state reply, the
            // rest of the room is not involved.
            let snapshot = { room.state.lock().await.doc.snapshot() };
            match snapshot {
                Ok(payload) => {
                    let reply = Message::Binary(SyncMessage::FullState(payload).encode());
                    if !send_to_session(sender, reply).await {
                        debug!("Session {} vanished before its state reply", session_id);
                    }
                }
                Err(e) => error!("Failed to export note {}: {}", room.note_id, e),
            }
        }
        Ok(WireMessage::Sync(SyncMessage::FullState(payload)))
        | Ok(WireMessage::Sync(SyncMessage::Update(payload))) => {
            let changed = {
                let mut state = room.state.lock().await;
                match state.doc.apply(&payload) {
                    Ok(true) => {
                        state.revision += 1;
                        state.dirty = true;
                        // Peers get the received operations as an
                        // update, not the whole document.
                        room.send_to_room(
                            session_id,
                            Message::Binary(SyncMessage::Update(payload).encode()),
                        );
                        true
                    }
                    Ok(false) => false,
                    Err(e) => {
                        warn!(
                            "Session {} sent an unusable document payload for note {}: {}",
                            session_id, room.note_id, e
                        );
                        false
                    }
                }
            };
            if changed {
                room.mark_dirty();
            }
        }
        Ok(WireMessage::Awareness(update)) => {
            for entry in &update.entries {
                if !entry.is_removal() {
                    member.track_awareness_id(entry.client_id);
                }
            }
            let mut state = room.state.lock().await;
            if state.presence.apply(&update) {
                // Relayed verbatim so client-side clocks survive.
                room.send_to_room(session_id, Message::Binary(frame.to_vec()));
            }
        }
        Err(e) => {
            warn!(
                "Session {}: dropping malformed frame for note {}: {}",
                session_id, room.note_id, e
            );
        }
    }
}

fn handle_control_message(session_id: Uuid, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Heartbeat) => {
            debug!("Session {} heartbeat", session_id);
        }
        Ok(ClientMessage::JoinNote(join)) => {
            warn!(
                "Session {} sent join_note for note {} while already joined",
                session_id, join.note_id
            );
        }
        Err(e) => {
            warn!("Session {} sent an unparseable message: {}", session_id, e);
        }
    }
}

/// Forward room broadcasts to this session's socket, skipping frames
/// the session itself produced.
async fn forward_broadcasts(
    mut rx: broadcast::Receiver<BroadcastMessage>,
    sender: SharedSink,
    session_id: Uuid,
) {
    loop {
        match rx.recv().await {
            Ok(broadcast_msg) => {
                if broadcast_msg.sender_id == session_id {
                    continue;
                }
                if sender.lock().await.send(broadcast_msg.message).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    "Session {} lagged, {} broadcast messages dropped",
                    session_id, skipped
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Unregister the session from its room, let the others know, and tear
/// the room down when it just lost its last member.
async fn leave_room(state: &Arc<AppState>, room: &Arc<Room>, member: &Arc<RoomMember>) {
    let close_room = {
        let mut room_state = room.state.lock().await;
        room_state.members.remove(&member.session_id);

        // Clear every entry this session spoke for, each clock bumped
        // past the stored one (saturating, clients send any u64).
        let mut removals: Vec<AwarenessEntry> = Vec::new();
        for client_id in member.announced_ids() {
            if let Some(entry) = room_state.presence.remove(client_id) {
                removals.push(AwarenessEntry {
                    client_id,
                    clock: entry.clock.saturating_add(1),
                    state: String::new(),
                });
            }
        }
        if !removals.is_empty() {
            let removal = AwarenessUpdate::new(removals).encode();
            room.send_to_room(member.session_id, Message::Binary(removal));
        }

        room.send_to_room(
            member.session_id,
            text_message(&ServerMessage::UserLeft(UserLeftMessage {
                user_id: member.user_id,
            })),
        );
        if room_state.members.is_empty() {
            room_state.closed = true;
            true
        } else {
            false
        }
    };

    if close_room {
        // A rejoin reloads the note from storage, so the pending write
        // must land before the note id is unlinked and claimable.
        let _ = room.shutdown_persistence().await;
        state.registry.unlink(room.note_id, room).await;
        info!("Room for note {} closed", room.note_id);
    }

    info!(
        "User {} left note {} (session {})",
        member.user_id, room.note_id, member.session_id
    );
}

fn text_message(msg: &ServerMessage) -> Message {
    Message::Text(
        serde_json::to_string(msg)
            .unwrap_or_else(|_| r#"{"action":"error","message":"internal error"}"#.to_string()),
    )
}

async fn send_to_session(sender: &SharedSink, message: Message) -> bool {
    sender.lock().await.send(message).await.is_ok()
}

/// Send a close frame with an application close code.
async fn close_with_code(sender: &SharedSink, code: u16, reason: &'static str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    let _ = sender.lock().await.send(frame).await;
}
