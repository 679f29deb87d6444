// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! KLAP two-round challenge-response handshake.
//!
//! Round one proves the device knows the credential hash before the client
//! sends anything secret; a mismatch is a non-retryable auth error. Round two
//! proves the client, after which both sides derive an AES-128-GCM session
//! key from the nonce pair and the auth hash.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use rand::Rng;
use serde_json::json;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{HubError, HubResult};
use crate::plug::http::PlugHttp;
use crate::plug::{hex_decode, hex_encode, unwrap_envelope};

/// `SHA256(SHA1(username) || SHA1(secret))`, shared by both rounds.
pub fn auth_hash(username: &str, secret: &str) -> [u8; 32] {
    let user_digest = Sha1::digest(username.as_bytes());
    let secret_digest = Sha1::digest(secret.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(user_digest);
    hasher.update(secret_digest);
    hasher.finalize().into()
}

/// The hash the device must present in round one.
pub fn expected_server_hash(client_nonce: &[u8], auth: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_nonce);
    hasher.update(auth);
    hasher.finalize().into()
}

/// The proof the client posts in round two.
pub fn confirm_hash(server_nonce: &[u8], auth: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(server_nonce);
    hasher.update(auth);
    hasher.finalize().into()
}

/// Established KLAP session: AES key, nonce seed, and request sequence.
pub struct KlapSession {
    key: [u8; 16],
    nonce_seed: [u8; 8],
    seq: u32,
}

impl fmt::Debug for KlapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapSession").field("seq", &self.seq).finish_non_exhaustive()
    }
}

impl KlapSession {
    /// Derive key material from the handshake transcript.
    pub fn derive(client_nonce: &[u8], server_nonce: &[u8], auth: &[u8; 32]) -> Self {
        let mut key_hasher = Sha256::new();
        key_hasher.update(b"lsk");
        key_hasher.update(client_nonce);
        key_hasher.update(server_nonce);
        key_hasher.update(auth);
        let key_digest = key_hasher.finalize();

        let mut seed_hasher = Sha256::new();
        seed_hasher.update(b"iv");
        seed_hasher.update(client_nonce);
        seed_hasher.update(server_nonce);
        seed_hasher.update(auth);
        let seed_digest = seed_hasher.finalize();

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_digest[..16]);
        let mut nonce_seed = [0u8; 8];
        nonce_seed.copy_from_slice(&seed_digest[..8]);
        Self { key, nonce_seed, seq: 0 }
    }

    /// Encrypt a request body under the next sequence number.
    pub fn seal(&mut self, plaintext: &[u8]) -> HubResult<(u32, Vec<u8>)> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let cipher = self.cipher()?;
        let nonce = self.nonce_for(seq);
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map(|sealed| (seq, sealed))
            .map_err(|_| HubError::device("failed to seal plug request"))
    }

    /// Decrypt a response sealed under `seq`.
    pub fn open(&self, seq: u32, ciphertext: &[u8]) -> HubResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce = self.nonce_for(seq);
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| HubError::device("failed to decrypt plug response"))
    }

    fn cipher(&self) -> HubResult<Aes128Gcm> {
        Aes128Gcm::new_from_slice(&self.key)
            .map_err(|_| HubError::device("invalid session key length"))
    }

    fn nonce_for(&self, seq: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.nonce_seed);
        nonce[8..].copy_from_slice(&seq.to_be_bytes());
        nonce
    }
}

pub async fn handshake(
    http: &dyn PlugHttp,
    username: &str,
    secret: &str,
) -> HubResult<KlapSession> {
    let mut client_nonce = [0u8; 16];
    rand::rng().fill(&mut client_nonce);

    let response = http
        .post_json("/app/handshake1", json!({"client_nonce": hex_encode(&client_nonce)}))
        .await?;
    let server_nonce_hex = response
        .get("server_nonce")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| HubError::device("handshake1 response missing server_nonce"))?;
    let server_hash_hex = response
        .get("server_hash")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| HubError::device("handshake1 response missing server_hash"))?;
    let server_nonce = hex_decode(server_nonce_hex)?;
    let server_hash = hex_decode(server_hash_hex)?;

    let auth = auth_hash(username, secret);
    if server_hash != expected_server_hash(&client_nonce, &auth) {
        return Err(HubError::auth("klap server hash mismatch, check credentials"));
    }

    let confirm = confirm_hash(&server_nonce, &auth);
    let response = http
        .post_json("/app/handshake2", json!({"confirm": hex_encode(&confirm)}))
        .await?;
    unwrap_envelope(response)?;

    Ok(KlapSession::derive(&client_nonce, &server_nonce, &auth))
}

/// Issue a niladic method call through the session cipher.
pub async fn request(
    http: &dyn PlugHttp,
    session: &mut KlapSession,
    method: &str,
) -> HubResult<serde_json::Value> {
    let body = json!({"method": method}).to_string();
    let (seq, sealed) = session.seal(body.as_bytes())?;
    let response = http.post_raw(&format!("/app/request?seq={seq}"), sealed).await?;
    let plaintext = session.open(seq, &response)?;
    let value: serde_json::Value = serde_json::from_slice(&plaintext)
        .map_err(|e| HubError::device("plug response is not valid JSON").with_cause(e))?;
    unwrap_envelope(value)
}

#[cfg(test)]
#[path = "klap_tests.rs"]
mod tests;
