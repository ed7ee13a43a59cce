//! Principal extraction
//!
//! Authentication itself is an upstream concern: by the time a request
//! reaches the gateway, a validated user id (if any) has been placed in the
//! `x-user-id` header by the authenticating proxy. This module turns that
//! plus the client address into a [`Principal`] attached to the request.

use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use fleet_core::{Error, Result};
use std::net::SocketAddr;

/// Header carrying the validated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The identity rate limiting and quota act on.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Validated user id, when the request was authenticated upstream
    pub user_id: Option<String>,

    /// Client address, used as the fallback rate-limit key
    pub client_ip: String,
}

impl Principal {
    /// Rate-limit key: user id when authenticated, client IP otherwise.
    pub fn rate_key(&self) -> String {
        match &self.user_id {
            Some(id) => format!("user:{}", id),
            None => format!("ip:{}", self.client_ip),
        }
    }

    /// The user id, or an unauthorized error for quota-gated routes.
    pub fn require_user(&self) -> Result<&str> {
        self.user_id
            .as_deref()
            .ok_or_else(|| Error::unauthorized("authenticated user required"))
    }
}

/// Middleware that attaches a [`Principal`] to every request.
pub async fn attach_principal(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let client_ip = client_ip(&request);

    request
        .extensions_mut()
        .insert(Principal { user_id, client_ip });
    next.run(request).await
}

/// Best-effort client address: forwarded headers first, then the socket.
fn client_ip(request: &Request) -> String {
    for header in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = request.headers().get(header).and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_key_prefers_user() {
        let principal = Principal {
            user_id: Some("u42".to_string()),
            client_ip: "10.0.0.1".to_string(),
        };
        assert_eq!(principal.rate_key(), "user:u42");
    }

    #[test]
    fn test_rate_key_falls_back_to_ip() {
        let principal = Principal {
            user_id: None,
            client_ip: "10.0.0.1".to_string(),
        };
        assert_eq!(principal.rate_key(), "ip:10.0.0.1");
    }

    #[test]
    fn test_require_user() {
        let authed = Principal {
            user_id: Some("u42".to_string()),
            client_ip: "10.0.0.1".to_string(),
        };
        assert_eq!(authed.require_user().unwrap(), "u42");

        let anonymous = Principal {
            user_id: None,
            client_ip: "10.0.0.1".to_string(),
        };
        assert_eq!(anonymous.require_user().unwrap_err().to_http_status(), 401);
    }

    #[test]
    fn test_client_ip_from_headers() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.2")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "203.0.113.9");

        let request = Request::builder()
            .header("x-real-ip", "198.51.100.7")
            .header("x-forwarded-for", "203.0.113.9")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_unknown_without_hints() {
        let request = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "unknown");
    }
}
