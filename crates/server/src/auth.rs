//! Optional auth token middleware.
//!
//! When a token is configured (via `--auth-token` or the `auth-token` file
//! in the data dir), all requests to `/ws` and `/api/hook` must include
//! `Authorization: Bearer <token>` or `?token=<token>` (for WebSocket
//! clients that cannot set headers). `/health` stays unauthenticated.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if token == expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if token == expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}

/// Read the optional `auth-token` file from the data dir.
pub fn load_token_file() -> Option<String> {
    let token = std::fs::read_to_string(crate::paths::token_file_path())
        .ok()?
        .trim()
        .to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
