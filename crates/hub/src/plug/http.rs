// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport to a single smart plug.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{HubError, HubResult};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Plug RPC transport. Real plugs speak plain HTTP on the LAN; tests plug in
/// an in-process double.
#[async_trait]
pub trait PlugHttp: Send + Sync {
    /// POST a JSON body and decode the JSON response.
    async fn post_json(&self, path: &str, body: serde_json::Value) -> HubResult<serde_json::Value>;

    /// POST opaque bytes and return the raw response body (KLAP cipher path).
    async fn post_raw(&self, path: &str, body: Vec<u8>) -> HubResult<Vec<u8>>;
}

pub struct ReqwestPlugHttp {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestPlugHttp {
    pub fn new(ip: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { base_url: format!("http://{ip}"), client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn map_status(status: reqwest::StatusCode) -> Option<HubError> {
    if status.is_success() {
        return None;
    }
    // A plug answers 403 once it no longer recognizes the session.
    if status == reqwest::StatusCode::FORBIDDEN {
        return Some(
            HubError::device("plug rejected the session").with_context("http_status", "403"),
        );
    }
    Some(
        HubError::connection("plug request failed")
            .with_context("http_status", status.as_u16().to_string()),
    )
}

#[async_trait]
impl PlugHttp for ReqwestPlugHttp {
    async fn post_json(&self, path: &str, body: serde_json::Value) -> HubResult<serde_json::Value> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::connection("plug unreachable").with_cause(e))?;
        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }
        response
            .json()
            .await
            .map_err(|e| HubError::device("plug response is not valid JSON").with_cause(e))
    }

    async fn post_raw(&self, path: &str, body: Vec<u8>) -> HubResult<Vec<u8>> {
        let response = self
            .client
            .post(self.url(path))
            .body(body)
            .send()
            .await
            .map_err(|e| HubError::connection("plug unreachable").with_cause(e))?;
        if let Some(err) = map_status(response.status()) {
            return Err(err);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HubError::io("failed to read plug response").with_cause(e))?;
        Ok(bytes.to_vec())
    }
}
