use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::db::NoteBackend;
use crate::ws::room::Room;

/// Commands understood by a room's persistence task.
#[derive(Debug)]
pub enum PersistCommand {
    /// A document mutation happened, (re)arm the debounce window.
    Touch,
    /// Flush whatever is pending, acknowledge, and exit.
    Shutdown(oneshot::Sender<()>),
}

/// Start the debounced saver for one room. The task keeps the room
/// alive through its Arc so a shutdown flush can still read the
/// document after the registry dropped the room.
pub(crate) fn spawn_saver(
    room: Arc<Room>,
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    backend: Option<Arc<dyn NoteBackend>>,
    debounce: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(room, rx, backend, debounce))
}

async fn run(
    room: Arc<Room>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    backend: Option<Arc<dyn NoteBackend>>,
    debounce: Duration,
) {
    let mut deadline: Option<Instant> = None;
    let mut dirty = false;
    let mut ack: Option<oneshot::Sender<()>> = None;

    loop {
        // Placeholder instant while no flush is armed, the timer arm
        // below is gated on deadline being set.
        let wake = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(PersistCommand::Touch) => {
                    dirty = true;
                    deadline = Some(Instant::now() + debounce);
                }
                Some(PersistCommand::Shutdown(done)) => {
                    ack = Some(done);
                    break;
                }
                None => break,
            },
            _ = time::sleep_until(wake), if deadline.is_some() => {
                deadline = None;
                if flush(&room, backend.as_deref()).await {
                    dirty = false;
                }
                // A failed write leaves dirty set, the next touch or
                // the shutdown flush retries it.
            }
        }
    }

    if dirty {
        flush(&room, backend.as_deref()).await;
    }
    // Acknowledged only after the final write: the leaver waits on this
    // before the note id is unlinked and a rejoin can reload the note.
    if let Some(done) = ack {
        let _ = done.send(());
    }
    debug!("Persistence task for note {} stopped", room.note_id);
}

/// Export the current block array and hand it to the backend. Returns
/// true when the content is safely stored (or there is nowhere to
/// store it).
async fn flush(room: &Room, backend: Option<&dyn NoteBackend>) -> bool {
    let (content, revision) = {
        let state = room.state.lock().await;
        (state.doc.content_string(), state.revision)
    };

    let Some(backend) = backend else {
        debug!(
            "No note backend configured, dropping {} bytes of note {}",
            content.len(),
            room.note_id
        );
        return true;
    };

    match backend.save_note_content(room.note_id, &content).await {
        Ok(()) => {
            {
                // A mutation can land while the write is in flight; the
                // room is only clean if this save covered the latest
                // revision.
                let mut state = room.state.lock().await;
                if state.revision == revision {
                    state.dirty = false;
                }
            }
            info!("Saved note {} ({} bytes)", room.note_id, content.len());
            true
        }
        Err(e) => {
            error!("Failed to save note {}: {}", room.note_id, e);
            false
        }
    }
}
