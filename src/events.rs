//! Audit events for session and peer lifecycle transitions.
//!
//! Every event is logged. When a NATS connection is configured the event is
//! also published as JSON on `{subject}.{event_type}`; publishing is
//! best-effort and never blocks or fails the caller.

use crate::chain::Address;
use crate::policy::Tier;
use async_nats::Client as NatsClient;
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

pub const NATS_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const LOCAL_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    SessionCreated {
        wallet: Address,
        tier: Tier,
        via: Option<Address>,
        expires_at: i64,
        timestamp: i64,
    },
    SessionEnded {
        wallet: Address,
        reason: SessionEndReason,
        timestamp: i64,
    },
    PeerConnected {
        wallet: Address,
        public_key: String,
        client_address: String,
        timestamp: i64,
    },
    PeerDisconnected {
        wallet: Address,
        public_key: String,
        client_address: String,
        timestamp: i64,
    },
    PeerRevoked {
        wallet: Address,
        public_key: String,
        client_address: String,
        timestamp: i64,
    },
    AccessDenied {
        wallet: Address,
        reason: String,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Disconnected,
    Expired,
    Revoked,
}

impl GatewayEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            GatewayEvent::SessionCreated { .. } => "session_created",
            GatewayEvent::SessionEnded { .. } => "session_ended",
            GatewayEvent::PeerConnected { .. } => "peer_connected",
            GatewayEvent::PeerDisconnected { .. } => "peer_disconnected",
            GatewayEvent::PeerRevoked { .. } => "peer_revoked",
            GatewayEvent::AccessDenied { .. } => "access_denied",
        }
    }

    pub fn wallet(&self) -> Address {
        match self {
            GatewayEvent::SessionCreated { wallet, .. }
            | GatewayEvent::SessionEnded { wallet, .. }
            | GatewayEvent::PeerConnected { wallet, .. }
            | GatewayEvent::PeerDisconnected { wallet, .. }
            | GatewayEvent::PeerRevoked { wallet, .. }
            | GatewayEvent::AccessDenied { wallet, .. } => *wallet,
        }
    }

    pub(crate) fn now() -> i64 {
        Utc::now().timestamp()
    }
}

/// Holds the current NATS client, replaced by [`NatsConnection::maintain`]
/// whenever the connection has to be re-established.
pub struct NatsConnection {
    client: Mutex<Option<NatsClient>>,
    url: String,
}

impl NatsConnection {
    pub fn new(url: String) -> Self {
        Self {
            client: Mutex::new(None),
            url,
        }
    }

    async fn current(&self) -> Option<NatsClient> {
        self.client.lock().await.clone()
    }

    /// Connect, and retry every [`NATS_RETRY_INTERVAL`] while there is no
    /// client, until `shutdown` flips to `true`. Once connected the client
    /// reconnects on its own.
    pub async fn maintain(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if self.current().await.is_none() {
                match async_nats::connect(self.url.as_str()).await {
                    Ok(client) => {
                        info!("Connected to NATS at {}", self.url);
                        *self.client.lock().await = Some(client);
                    }
                    Err(e) => error!(
                        "NATS at {} unavailable ({}); audit events stay local for {:?}",
                        self.url, e, NATS_RETRY_INTERVAL
                    ),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(NATS_RETRY_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Fans audit events out to the log, local subscribers, and NATS.
pub struct EventPublisher {
    nats: Option<Arc<NatsConnection>>,
    subject: String,
    local: broadcast::Sender<GatewayEvent>,
}

impl EventPublisher {
    /// Log-only publisher.
    pub fn new() -> Self {
        let (local, _) = broadcast::channel(LOCAL_SUBSCRIBER_CAPACITY);
        Self {
            nats: None,
            subject: String::new(),
            local,
        }
    }

    pub fn with_nats(nats: Arc<NatsConnection>, subject: impl Into<String>) -> Self {
        Self {
            nats: Some(nats),
            subject: subject.into(),
            ..Self::new()
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.local.subscribe()
    }

    pub fn emit(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::AccessDenied { wallet, reason, .. } => {
                warn!("Access denied for {}: {}", wallet, reason)
            }
            other => info!("{} for {}", other.event_type(), other.wallet()),
        }

        // No local subscribers is the normal case.
        let _ = self.local.send(event.clone());

        if let Some(nats) = &self.nats {
            let subject = format!("{}.{}", self.subject, event.event_type());
            let nats = nats.clone();
            tokio::spawn(async move {
                let Some(client) = nats.current().await else {
                    return;
                };
                match serde_json::to_vec(&event) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(subject, payload.into()).await {
                            error!("Failed to publish gateway event: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to serialize gateway event: {}", e),
                }
            });
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("nats", &self.nats.is_some())
            .field("subject", &self.subject)
            .finish()
    }
}
