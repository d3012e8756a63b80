//! Binary wire protocol spoken over the note WebSocket.
//!
//! Every binary frame starts with a varint envelope tag selecting the
//! channel: `0` for document sync, `1` for awareness. Sync frames carry
//! a second varint selecting the sub-type, awareness frames carry a
//! single length-prefixed buffer of client state tuples. Anything the
//! decoder does not recognize is an error; callers drop the frame and
//! keep the connection open.

pub mod codec;

use codec::{write_var_bytes, write_var_string, write_var_u64, Reader};
use thiserror::Error;

pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;

pub const SYNC_STATE_REQUEST: u64 = 0;
pub const SYNC_FULL_STATE: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected end of frame at byte {0}")]
    UnexpectedEof(usize),
    #[error("varint does not fit in 64 bits")]
    VarIntOverflow,
    #[error("unknown envelope tag {0}")]
    UnknownEnvelope(u64),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u64),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after end of message")]
    TrailingBytes(usize),
    #[error("document payload rejected: {0}")]
    InvalidPayload(String),
}

/// Document sync channel messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Ask the peer to reply with its full document state.
    StateRequest,
    /// Complete encoded document state.
    FullState(Vec<u8>),
    /// Incremental change set.
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, MSG_SYNC);
        match self {
            SyncMessage::StateRequest => write_var_u64(&mut buf, SYNC_STATE_REQUEST),
            SyncMessage::FullState(payload) => {
                write_var_u64(&mut buf, SYNC_FULL_STATE);
                write_var_bytes(&mut buf, payload);
            }
            SyncMessage::Update(payload) => {
                write_var_u64(&mut buf, SYNC_UPDATE);
                write_var_bytes(&mut buf, payload);
            }
        }
        buf
    }
}

/// One client's presence entry inside an awareness frame. An empty
/// state string marks the entry as removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: String,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state.is_empty()
    }
}

/// Decoded awareness frame: a batch of per-client presence entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new(entries: Vec<AwarenessEntry>) -> Self {
        AwarenessUpdate { entries }
    }

    /// Builds a frame announcing a single client as gone.
    pub fn removal(client_id: u64, clock: u64) -> Self {
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock,
                state: String::new(),
            }],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::new();
        write_var_u64(&mut inner, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_u64(&mut inner, entry.client_id);
            write_var_u64(&mut inner, entry.clock);
            write_var_string(&mut inner, &entry.state);
        }
        let mut buf = Vec::new();
        write_var_u64(&mut buf, MSG_AWARENESS);
        write_var_bytes(&mut buf, &inner);
        buf
    }

    fn decode_inner(inner: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(inner);
        let count = reader.read_var_u64()?;
        let mut entries = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let client_id = reader.read_var_u64()?;
            let clock = reader.read_var_u64()?;
            let state = reader.read_var_string()?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        reader.finish()?;
        Ok(AwarenessUpdate { entries })
    }
}

/// A fully decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl WireMessage {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(frame);
        let envelope = reader.read_var_u64()?;
        let message = match envelope {
            MSG_SYNC => {
                let sub = reader.read_var_u64()?;
                let sync = match sub {
                    SYNC_STATE_REQUEST => SyncMessage::StateRequest,
                    SYNC_FULL_STATE => SyncMessage::FullState(reader.read_var_bytes()?.to_vec()),
                    SYNC_UPDATE => SyncMessage::Update(reader.read_var_bytes()?.to_vec()),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                WireMessage::Sync(sync)
            }
            MSG_AWARENESS => {
                let inner = reader.read_var_bytes()?;
                WireMessage::Awareness(AwarenessUpdate::decode_inner(inner)?)
            }
            other => return Err(ProtocolError::UnknownEnvelope(other)),
        };
        reader.finish()?;
        Ok(message)
    }
}
