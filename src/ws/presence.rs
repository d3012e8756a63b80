use std::collections::HashMap;

use crate::protocol::{AwarenessEntry, AwarenessUpdate};

/// Latest presence state of one awareness client.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub clock: u64,
    pub state: String,
}

/// Per-room table of ephemeral presence: cursors, selections and the
/// identity blobs seeded at join. Keyed by awareness client id, which
/// is unrelated to the user id (one user can hold several).
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: HashMap<u64, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        PresenceTable {
            entries: HashMap::new(),
        }
    }

    /// Fold a decoded awareness frame into the table. Upserts are
    /// accepted when their clock is not older than the stored one,
    /// removals are always honored. Returns true when the frame is
    /// worth relaying to the rest of the room.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> bool {
        let mut relay = false;
        for entry in &update.entries {
            if entry.is_removal() {
                self.entries.remove(&entry.client_id);
                // Peers track removal clocks themselves, a repeated
                // removal still has to reach them.
                relay = true;
                continue;
            }
            match self.entries.get(&entry.client_id) {
                Some(existing) if entry.clock < existing.clock => {}
                _ => {
                    self.entries.insert(
                        entry.client_id,
                        PresenceEntry {
                            clock: entry.clock,
                            state: entry.state.clone(),
                        },
                    );
                    relay = true;
                }
            }
        }
        relay
    }

    /// Install the identity entry for a freshly joined participant.
    pub fn seed(&mut self, client_id: u64, state: String) {
        self.entries
            .insert(client_id, PresenceEntry { clock: 0, state });
    }

    /// Drop a client's entry, returning it so the caller can announce
    /// the removal with a clock newer than anything the room has seen
    /// for that client.
    pub fn remove(&mut self, client_id: u64) -> Option<PresenceEntry> {
        self.entries.remove(&client_id)
    }

    /// One frame carrying every live entry at its stored clock, or
    /// None when the table is empty.
    pub fn snapshot(&self) -> Option<AwarenessUpdate> {
        if self.entries.is_empty() {
            return None;
        }
        let mut entries: Vec<AwarenessEntry> = self
            .entries
            .iter()
            .map(|(client_id, entry)| AwarenessEntry {
                client_id: *client_id,
                clock: entry.clock,
                state: entry.state.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        Some(AwarenessUpdate::new(entries))
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.entries.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
