// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! UDP multicast asset discovery.
//!
//! Participants announce themselves on 239.255.42.42:42424, answer queries
//! for their service kind, and say goodbye on shutdown. Peers expire after
//! five minutes of silence. This component stands alone; nothing in the
//! sensor, rule, or plug paths depends on it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};
use crate::logger::ServiceLogger;

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 42);
pub const MULTICAST_PORT: u16 = 42424;

const PEER_TTL_SECS: i64 = 300;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    Announce {
        instance_id: String,
        service: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
    },
    Query {
        instance_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    Response {
        instance_id: String,
        service: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
    },
    Goodbye { instance_id: String },
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub instance_id: String,
    pub service: String,
    pub name: String,
    pub addr: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

pub struct DiscoveryService {
    instance_id: String,
    service: String,
    name: String,
    peers: RwLock<HashMap<String, Peer>>,
    logger: ServiceLogger,
}

impl DiscoveryService {
    pub fn new(service: impl Into<String>, name: impl Into<String>, logger: ServiceLogger) -> Arc<Self> {
        Arc::new(Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            name: name.into(),
            peers: RwLock::new(HashMap::new()),
            logger,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    /// The announce message this instance broadcasts.
    pub fn announcement(&self) -> DiscoveryMessage {
        DiscoveryMessage::Announce {
            instance_id: self.instance_id.clone(),
            service: self.service.clone(),
            name: self.name.clone(),
            addr: None,
        }
    }

    /// Process one datagram; returns the reply to broadcast, if any.
    pub async fn handle_datagram(&self, payload: &[u8]) -> Option<DiscoveryMessage> {
        let message: DiscoveryMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(err = %e, "discovery: undecodable datagram");
                return None;
            }
        };

        match message {
            DiscoveryMessage::Announce { instance_id, service, name, addr }
            | DiscoveryMessage::Response { instance_id, service, name, addr } => {
                if instance_id == self.instance_id {
                    return None;
                }
                let mut peers = self.peers.write().await;
                let fresh = !peers.contains_key(&instance_id);
                peers.insert(
                    instance_id.clone(),
                    Peer {
                        instance_id: instance_id.clone(),
                        service,
                        name,
                        addr,
                        last_seen_at: Utc::now(),
                    },
                );
                drop(peers);
                if fresh {
                    self.logger.info(&format!("discovered peer {instance_id}"), None);
                }
                None
            }
            DiscoveryMessage::Query { instance_id, service } => {
                if instance_id == self.instance_id {
                    return None;
                }
                let wants_us = service.as_deref().is_none_or(|s| s == self.service);
                wants_us.then(|| DiscoveryMessage::Response {
                    instance_id: self.instance_id.clone(),
                    service: self.service.clone(),
                    name: self.name.clone(),
                    addr: None,
                })
            }
            DiscoveryMessage::Goodbye { instance_id } => {
                if self.peers.write().await.remove(&instance_id).is_some() {
                    self.logger.info(&format!("peer {instance_id} said goodbye"), None);
                }
                None
            }
        }
    }

    /// Drop peers silent for longer than the TTL. Returns the expired ids.
    pub async fn expire_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut peers = self.peers.write().await;
        let expired: Vec<String> = peers
            .values()
            .filter(|p| now.signed_duration_since(p.last_seen_at).num_seconds() > PEER_TTL_SECS)
            .map(|p| p.instance_id.clone())
            .collect();
        for id in &expired {
            peers.remove(id);
        }
        drop(peers);
        for id in &expired {
            self.logger.info(&format!("peer {id} expired"), None);
        }
        expired
    }

    /// Bind the multicast socket and run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> HubResult<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT))
            .await
            .map_err(|e| HubError::io("failed to bind discovery socket").with_cause(e))?;
        socket
            .join_multicast_v4(MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| HubError::io("failed to join multicast group").with_cause(e))?;
        self.logger.info(
            &format!("discovery listening on {MULTICAST_ADDR}:{MULTICAST_PORT}"),
            None,
        );

        let mut announce_timer = tokio::time::interval(ANNOUNCE_INTERVAL);
        let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = announce_timer.tick() => {
                    self.broadcast(&socket, &self.announcement()).await;
                }
                _ = sweep_timer.tick() => {
                    self.expire_once(Utc::now()).await;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _from)) => {
                            if let Some(reply) = self.handle_datagram(&buf[..len]).await {
                                self.broadcast(&socket, &reply).await;
                            }
                        }
                        Err(e) => {
                            self.logger.warn(&format!("discovery receive failed: {e}"), None);
                        }
                    }
                }
            }
        }

        // Best-effort goodbye so peers drop us before the TTL runs out.
        let goodbye = DiscoveryMessage::Goodbye { instance_id: self.instance_id.clone() };
        self.broadcast(&socket, &goodbye).await;
        Ok(())
    }

    async fn broadcast(&self, socket: &UdpSocket, message: &DiscoveryMessage) {
        let Ok(payload) = serde_json::to_vec(message) else {
            return;
        };
        if let Err(e) = socket.send_to(&payload, (MULTICAST_ADDR, MULTICAST_PORT)).await {
            tracing::debug!(err = %e, "discovery send failed");
        }
    }
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
