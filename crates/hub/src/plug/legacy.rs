// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Legacy single-round handshake.
//!
//! The hashed credential buys a session token that rides as a query
//! parameter on subsequent `/app` requests. Code 1003 from the device is a
//! hard stop: it is surfaced as a non-retryable auth error and must never be
//! retried within the driver.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::error::{HubError, HubResult};
use crate::plug::http::PlugHttp;
use crate::plug::{hex_encode, unwrap_envelope};

#[derive(Debug)]
pub struct LegacySession {
    pub token: String,
}

/// Credential hashing the legacy firmware expects: base64 over the lowercase
/// hex SHA-1 digest of the secret.
pub fn hash_credential(secret: &str) -> String {
    let digest = Sha1::digest(secret.as_bytes());
    BASE64.encode(hex_encode(&digest))
}

pub async fn handshake(
    http: &dyn PlugHttp,
    username: &str,
    secret: &str,
) -> HubResult<LegacySession> {
    let body = json!({
        "method": "handshake",
        "params": {
            "username": username,
            "password": hash_credential(secret),
        }
    });
    let response = http.post_json("/app", body).await?;
    let result = unwrap_envelope(response)?;
    let token = result
        .get("token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| HubError::device("handshake response missing token"))?;
    Ok(LegacySession { token: token.to_owned() })
}

/// Issue a niladic method call on an authenticated session.
pub async fn request(
    http: &dyn PlugHttp,
    session: &LegacySession,
    method: &str,
) -> HubResult<serde_json::Value> {
    let response = http
        .post_json(&format!("/app?token={}", session.token), json!({"method": method}))
        .await?;
    unwrap_envelope(response)
}

pub async fn set_device_state(
    http: &dyn PlugHttp,
    session: &LegacySession,
    on: bool,
) -> HubResult<()> {
    let body = json!({
        "method": "set_device_info",
        "params": {"device_on": on}
    });
    let response = http
        .post_json(&format!("/app?token={}", session.token), body)
        .await?;
    unwrap_envelope(response).map(|_| ())
}

#[cfg(test)]
#[path = "legacy_tests.rs"]
mod tests;
