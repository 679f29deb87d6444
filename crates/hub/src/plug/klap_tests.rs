// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use super::*;
use crate::error::ErrorKind;
use crate::plug::{hex_decode, hex_encode};

/// In-process KLAP endpoint that performs the server side of the handshake
/// and answers sealed requests symmetrically.
struct FakeKlapDevice {
    username: String,
    secret: String,
    tamper_server_hash: bool,
    handshake1_calls: Mutex<u32>,
    state: Mutex<FakeKlapState>,
}

#[derive(Default)]
struct FakeKlapState {
    client_nonce: Option<Vec<u8>>,
    server_nonce: Vec<u8>,
    session: Option<KlapSession>,
}

impl FakeKlapDevice {
    fn new(username: &str, secret: &str, tamper_server_hash: bool) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_owned(),
            secret: secret.to_owned(),
            tamper_server_hash,
            handshake1_calls: Mutex::new(0),
            state: Mutex::new(FakeKlapState {
                server_nonce: b"server-nonce-16b".to_vec(),
                ..Default::default()
            }),
        })
    }
}

#[async_trait]
impl PlugHttp for FakeKlapDevice {
    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> crate::error::HubResult<serde_json::Value> {
        let auth = auth_hash(&self.username, &self.secret);
        match path {
            "/app/handshake1" => {
                *self.handshake1_calls.lock().await += 1;
                let client_nonce = hex_decode(
                    body.get("client_nonce")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default(),
                )?;
                let mut state = self.state.lock().await;
                let mut server_hash = expected_server_hash(&client_nonce, &auth);
                if self.tamper_server_hash {
                    server_hash[0] ^= 0xff;
                }
                let response = json!({
                    "server_nonce": hex_encode(&state.server_nonce),
                    "server_hash": hex_encode(&server_hash),
                });
                state.client_nonce = Some(client_nonce);
                Ok(response)
            }
            "/app/handshake2" => {
                let mut state = self.state.lock().await;
                let expected = confirm_hash(&state.server_nonce, &auth);
                let confirm = hex_decode(
                    body.get("confirm").and_then(serde_json::Value::as_str).unwrap_or_default(),
                )?;
                if confirm != expected {
                    return Ok(json!({"error_code": 1003}));
                }
                let client_nonce = state.client_nonce.clone().unwrap_or_default();
                let server_nonce = state.server_nonce.clone();
                state.session = Some(KlapSession::derive(&client_nonce, &server_nonce, &auth));
                Ok(json!({"error_code": 0}))
            }
            other => Err(HubError::device(format!("unexpected path {other}"))),
        }
    }

    async fn post_raw(&self, path: &str, body: Vec<u8>) -> crate::error::HubResult<Vec<u8>> {
        let seq: u32 = path
            .split("seq=")
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HubError::device("missing seq parameter"))?;
        let mut state = self.state.lock().await;
        let Some(ref mut session) = state.session else {
            return Err(HubError::device("no server session"));
        };
        let request = session.open(seq, &body)?;
        let request: serde_json::Value = serde_json::from_slice(&request)
            .map_err(|e| HubError::device("bad sealed request").with_cause(e))?;
        let response = match request.get("method").and_then(serde_json::Value::as_str) {
            Some("get_device_info") => {
                json!({"error_code": 0, "result": {"device_on": true, "signal_level": 3}})
            }
            Some("get_energy_usage") => {
                json!({"error_code": 0, "result": {"current_power": 4200.0, "today_energy": 310.0}})
            }
            _ => json!({"error_code": 1003}),
        };
        // Seal the reply under the same sequence the client used.
        session.seq = seq - 1;
        let (_, sealed) = session.seal(response.to_string().as_bytes())?;
        Ok(sealed)
    }
}

#[test]
fn auth_hash_is_deterministic_and_credential_sensitive() -> anyhow::Result<()> {
    let a = auth_hash("ops@example.com", "hunter2");
    let b = auth_hash("ops@example.com", "hunter2");
    let c = auth_hash("ops@example.com", "hunter3");
    assert_eq!(a, b);
    assert_ne!(a, c);
    Ok(())
}

#[test]
fn seal_and_open_round_trip() -> anyhow::Result<()> {
    let auth = auth_hash("u", "p");
    let mut client = KlapSession::derive(b"client-nonce", b"server-nonce", &auth);
    let server = KlapSession::derive(b"client-nonce", b"server-nonce", &auth);

    let (seq, sealed) = client.seal(b"hello plug").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(seq, 1);
    let opened = server.open(seq, &sealed).map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(opened, b"hello plug");
    Ok(())
}

#[test]
fn open_with_wrong_sequence_fails() -> anyhow::Result<()> {
    let auth = auth_hash("u", "p");
    let mut client = KlapSession::derive(b"client-nonce", b"server-nonce", &auth);
    let server = KlapSession::derive(b"client-nonce", b"server-nonce", &auth);

    let (seq, sealed) = client.seal(b"hello").map_err(|e| anyhow::anyhow!("{e}"))?;
    let result = server.open(seq + 1, &sealed);
    assert!(matches!(result, Err(e) if e.kind() == ErrorKind::Device));
    Ok(())
}

#[test]
fn sessions_from_different_transcripts_do_not_interoperate() -> anyhow::Result<()> {
    let auth = auth_hash("u", "p");
    let mut client = KlapSession::derive(b"client-a", b"server-a", &auth);
    let server = KlapSession::derive(b"client-b", b"server-b", &auth);

    let (seq, sealed) = client.seal(b"hello").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert!(server.open(seq, &sealed).is_err());
    Ok(())
}

#[tokio::test]
async fn handshake_establishes_a_working_session() -> anyhow::Result<()> {
    let device = FakeKlapDevice::new("ops@example.com", "hunter2", false);
    let mut session = handshake(device.as_ref(), "ops@example.com", "hunter2")
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let info = request(device.as_ref(), &mut session, "get_device_info")
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(info["device_on"], true);

    let energy = request(device.as_ref(), &mut session, "get_energy_usage")
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(energy["current_power"], 4200.0);
    Ok(())
}

#[tokio::test]
async fn tampered_server_hash_is_a_non_retryable_auth_error() -> anyhow::Result<()> {
    let device = FakeKlapDevice::new("ops@example.com", "hunter2", true);
    let result = handshake(device.as_ref(), "ops@example.com", "hunter2").await;

    let err = match result {
        Err(e) => e,
        Ok(_) => anyhow::bail!("expected hash mismatch"),
    };
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!err.is_retryable());
    assert_eq!(*device.handshake1_calls.lock().await, 1);
    Ok(())
}

#[tokio::test]
async fn wrong_credentials_fail_verification_locally() -> anyhow::Result<()> {
    // Device knows one secret, the client another: round one must fail on
    // the client side before any credential material is sent.
    let device = FakeKlapDevice::new("ops@example.com", "hunter2", false);
    let result = handshake(device.as_ref(), "ops@example.com", "not-hunter2").await;
    assert!(matches!(result, Err(e) if e.kind() == ErrorKind::Auth));
    Ok(())
}
