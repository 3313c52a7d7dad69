// Credential gate for the model update routes
//
// Callers present the shared key in the `access_token` header.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

pub const API_KEY_HEADER: &str = "access_token";

/// Shared-key check; with no key configured every call is refused
#[derive(Clone, Default)]
pub struct ApiKeyGate {
    key: Option<Arc<str>>,
}

impl ApiKeyGate {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.map(Arc::from),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        let Some(expected) = self.key.as_deref() else {
            warn!("Model update rejected: API_KEY is not configured");
            return Err(StatusCode::FORBIDDEN);
        };

        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok())
            .ok_or(StatusCode::FORBIDDEN)?;

        if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            warn!("Model update rejected: invalid credentials");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Axum middleware enforcing the gate
pub async fn require_api_key(
    State(gate): State<ApiKeyGate>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    gate.check(&headers)?;
    Ok(next.run(request).await)
}
