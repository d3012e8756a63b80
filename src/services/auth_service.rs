use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use tracing::debug;

/// Credential extracted from a WebSocket upgrade request, together
/// with the Sec-WebSocket-Protocol value to echo back when the token
/// arrived through that header. Browsers abort the handshake when a
/// requested subprotocol is not echoed by the server.
pub struct WsCredential {
    pub token: String,
    pub echo_protocol: Option<String>,
}

// Get the auth token from a plain HTTP request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str
            .strip_prefix("Bearer ")
            .unwrap_or(auth_str)
            .to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = req
            .headers()
            .get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for cookie in cookie::Cookie::split_parse(cookie_header) {
            if let Ok(c) = cookie {
                if c.name() == "auth_token" {
                    return Ok(c.value().to_string());
                }
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Get the auth token from a WebSocket upgrade request. Browser clients
// cannot set Authorization headers on WebSocket connections, so the
// token may also arrive as a query parameter or smuggled through the
// subprotocol header.
pub fn get_websocket_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<WsCredential> {
    // 1. Explicit ?token= query parameter
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(WsCredential {
                token: token.to_string(),
                echo_protocol: None,
            });
        }
    }

    // 2. Sec-WebSocket-Protocol carrying the raw token
    if let Some(proto) = headers.get(http::header::SEC_WEBSOCKET_PROTOCOL) {
        if let Ok(value) = proto.to_str() {
            // Clients may offer several protocols, the token is the first
            let token = value.split(',').next().unwrap_or(value).trim();
            if !token.is_empty() {
                return Some(WsCredential {
                    token: token.to_string(),
                    echo_protocol: Some(token.to_string()),
                });
            }
        }
    }

    // 3. Authorization header (non-browser clients)
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);
            if !token.is_empty() {
                return Some(WsCredential {
                    token: token.to_string(),
                    echo_protocol: None,
                });
            }
        }
    }

    // 4. auth_token cookie
    if let Some(cookie_header) = headers.get(http::header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            for cookie in cookie::Cookie::split_parse(cookie_str) {
                if let Ok(c) = cookie {
                    if c.name() == "auth_token" {
                        return Some(WsCredential {
                            token: c.value().to_string(),
                            echo_protocol: None,
                        });
                    }
                }
            }
        }
    }

    None
}

// Get the numeric user id from a JWT token
pub fn resolve_user_id(token: &str, secret: &str) -> Result<i64, String> {
    let token_data = match validate_jwt(token, secret) {
        Ok(token_data) => token_data,
        Err(e) => return Err(format!("JWT validation failed: {}", e)),
    };

    // Tokens carry the user id in one of several claim shapes
    let claims = &token_data.claims;
    if let Some(id) = claims.get("payload").and_then(|v| v.as_i64()) {
        debug!("JWT token validated successfully for user: {}", id);
        return Ok(id);
    }
    if let Some(id) = claims.get("id").and_then(|v| v.as_i64()) {
        debug!("JWT token validated successfully for user: {}", id);
        return Ok(id);
    }
    if let Some(id) = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
    {
        debug!("JWT token validated successfully for user: {}", id);
        return Ok(id);
    }

    Err("Can't extract a user id from the JWT token".to_string())
}

// Validate a JWT token and return the token data
pub fn validate_jwt(
    token: &str,
    secret: &str,
) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}
