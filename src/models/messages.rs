use serde::{Deserialize, Serialize};

/// A participant as announced to other members of a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: i64,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinNoteMessage {
    pub note_id: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMessage {
    pub note_id: i64,
    pub collaborators: Vec<Collaborator>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedMessage {
    pub user: Collaborator,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftMessage {
    pub user_id: i64,
}

/// Text frames accepted from clients.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "action")]
pub enum ClientMessage {
    #[serde(rename = "join_note")]
    JoinNote(JoinNoteMessage),
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Text frames the relay sends to clients.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "action")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined(JoinedMessage),
    #[serde(rename = "error")]
    Error(ErrorMessage),
    #[serde(rename = "user_joined")]
    UserJoined(UserJoinedMessage),
    #[serde(rename = "user_left")]
    UserLeft(UserLeftMessage),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            message: message.into(),
        })
    }
}
