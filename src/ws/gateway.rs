use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::services::auth_service;
use crate::ws::error::{RelayError, CLOSE_UNAUTHORIZED};
use crate::ws::session;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// WebSocket entry point. Authentication happens before the upgrade,
/// the note join happens after it, over the socket itself.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    info!("New WebSocket connection attempt");

    match authenticate(&state, params.token.as_deref(), &headers) {
        Ok((user_id, echo_protocol)) => {
            let mut upgrade = ws;
            if let Some(protocol) = echo_protocol {
                // Browsers drop the connection when an offered
                // subprotocol is not selected by the server.
                upgrade = upgrade.protocols([protocol]);
            }
            upgrade.on_upgrade(move |socket| session::handle_session(socket, user_id, state))
        }
        Err(e) => {
            warn!("WebSocket authentication failed: {}", e);
            // The application close code is only observable by browser
            // clients after the upgrade, so accept the socket and close
            // it right away.
            ws.on_upgrade(reject_unauthorized)
        }
    }
}

fn authenticate(
    state: &Arc<AppState>,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<(i64, Option<String>), RelayError> {
    let Some(secret) = &state.config.auth_jwt_secret else {
        return Err(RelayError::Unauthorized(
            "AUTH_JWT_SECRET is not configured".to_string(),
        ));
    };
    let Some(credential) = auth_service::get_websocket_token(query_token, headers) else {
        return Err(RelayError::Unauthorized(
            "no credential presented".to_string(),
        ));
    };
    let user_id = auth_service::resolve_user_id(&credential.token, secret)
        .map_err(RelayError::Unauthorized)?;
    Ok((user_id, credential.echo_protocol))
}

async fn reject_unauthorized(mut socket: WebSocket) {
    let frame = Message::Close(Some(CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "Unauthorized".into(),
    }));
    let _ = socket.send(frame).await;
}
