//! Bearer token authentication for the control plane.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_protocol::{endpoints::BEARER_PREFIX, RelayError};
use tracing::warn;

use crate::state::ServerState;

/// Reject requests without the configured bearer token.
///
/// Runs before any handler, so a rejected request never reaches the image
/// store or the filesystem.
pub async fn auth_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix(BEARER_PREFIX));

    match presented {
        Some(token) if token_matches(token, &state.config.token) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "invalid token");
            unauthorized(RelayError::unauthorized("invalid token"))
        }
        None => unauthorized(RelayError::unauthorized("bearer token required")),
    }
}

fn unauthorized(error: RelayError) -> Response {
    (StatusCode::UNAUTHORIZED, error.message).into_response()
}

/// Compare without short-circuiting on the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("45dc157e", "45dc157e"));
        assert!(!token_matches("45dc157f", "45dc157e"));
        assert!(!token_matches("45dc157", "45dc157e"));
        assert!(!token_matches("", "45dc157e"));
    }
}
