//! Peer registry: binds tunnel public keys to pool addresses and backend state.

use crate::chain::Address;
use crate::events::{EventPublisher, GatewayEvent};
use crate::tunnel::backend::{BackendError, TunnelBackend};
use crate::tunnel::pool::{AddressPool, TunnelNetwork};
use crate::tunnel::PeerKey;
use chrono::{DateTime, Utc};
use log::{error, info};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Tunnel address pool exhausted")]
    PoolExhausted,

    #[error("Public key is already in use by another wallet")]
    KeyInUse,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// An active tunnel peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: PeerKey,
    pub address: Ipv4Addr,
    /// `address/prefix`, as handed to the client.
    pub client_address: String,
    /// `address/32`, as configured on the server.
    pub allowed_ips: String,
    /// Wallet whose session the peer belongs to.
    pub owner: Address,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct PeerSlot {
    peer: Option<Peer>,
    /// Set once the slot has been removed from the registry; whoever was
    /// waiting on it must look the key up again.
    retired: bool,
}

type SlotGuard = OwnedMutexGuard<PeerSlot>;

/// An allocated address that returns to the pool unless committed.
struct Lease<'a> {
    pool: &'a AddressPool,
    address: Ipv4Addr,
    committed: bool,
}

impl<'a> Lease<'a> {
    fn take(pool: &'a AddressPool) -> Option<Self> {
        pool.allocate().map(|address| Self {
            pool,
            address,
            committed: false,
        })
    }

    fn commit(mut self) -> Ipv4Addr {
        self.committed = true;
        self.address
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.release(self.address);
        }
    }
}

#[derive(Clone, Copy)]
enum ReleaseKind {
    Disconnect,
    Revoke,
}

/// Registry of active peers, one per public key.
///
/// Operations on the same key are serialised by a per-key slot; operations on
/// different keys only meet in the address pool, whose lock is never held
/// across a backend call. Teardown runs on its own task, so a caller that is
/// dropped mid-release still returns the address to the pool.
pub struct PeerManager {
    pool: Arc<AddressPool>,
    backend: Arc<dyn TunnelBackend>,
    slots: RwLock<HashMap<PeerKey, Arc<Mutex<PeerSlot>>>>,
    active: AtomicUsize,
    backend_timeout: Duration,
    events: Arc<EventPublisher>,
}

impl PeerManager {
    pub fn new(
        network: TunnelNetwork,
        backend: Arc<dyn TunnelBackend>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            pool: Arc::new(AddressPool::new(network)),
            backend,
            slots: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            events,
        }
    }

    pub fn with_backend_timeout(mut self, backend_timeout: Duration) -> Self {
        self.backend_timeout = backend_timeout;
        self
    }

    pub fn network(&self) -> &TunnelNetwork {
        self.pool.network()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn free_addresses(&self) -> usize {
        self.pool.free_count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn is_address_free(&self, address: Ipv4Addr) -> bool {
        self.pool.is_free(address)
    }

    async fn slot(&self, key: &PeerKey) -> Arc<Mutex<PeerSlot>> {
        if let Some(slot) = self.slots.read().await.get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, key: &PeerKey) -> Option<Arc<Mutex<PeerSlot>>> {
        self.slots.read().await.get(key).cloned()
    }

    async fn retire(&self, key: &PeerKey, slot: &Arc<Mutex<PeerSlot>>, state: &mut PeerSlot) {
        state.retired = true;
        let mut slots = self.slots.write().await;
        if slots
            .get(key)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
        {
            slots.remove(key);
        }
    }

    /// Register `key` for `owner`, replacing any peer the same owner already
    /// has under that key.
    pub async fn connect(&self, key: PeerKey, owner: Address) -> Result<Peer, PeerError> {
        loop {
            let slot = self.slot(&key).await;
            let mut state = slot.clone().lock_owned().await;
            if state.retired {
                continue;
            }

            if let Some(existing) = &state.peer {
                if existing.owner != owner {
                    return Err(PeerError::KeyInUse);
                }
            }
            if let Some(previous) = state.peer.take() {
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.emit(&previous, ReleaseKind::Disconnect);
                state = match self.teardown(previous, state).await {
                    Some(state) => state,
                    None => {
                        return Err(BackendError::Rejected(
                            "peer teardown did not complete".to_string(),
                        )
                        .into())
                    }
                };
            }

            let result = self.install(&mut state, &key, owner).await;
            if result.is_err() && state.peer.is_none() {
                self.retire(&key, &slot, &mut state).await;
            }
            return result;
        }
    }

    async fn install(
        &self,
        state: &mut PeerSlot,
        key: &PeerKey,
        owner: Address,
    ) -> Result<Peer, PeerError> {
        let lease = Lease::take(&self.pool).ok_or(PeerError::PoolExhausted)?;
        match timeout(self.backend_timeout, self.backend.add_peer(key, lease.address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to add peer {} to tunnel backend: {}", key, e);
                return Err(e.into());
            }
            Err(_) => {
                error!("Timed out adding peer {} to tunnel backend", key);
                // The add may still have landed.
                let _ = timeout(self.backend_timeout, self.backend.remove_peer(key)).await;
                return Err(BackendError::Timeout.into());
            }
        }

        let address = lease.commit();
        let peer = Peer {
            public_key: key.clone(),
            address,
            client_address: self.pool.network().with_prefix(address),
            allowed_ips: format!("{}/32", address),
            owner,
            created_at: Utc::now(),
        };
        state.peer = Some(peer.clone());
        self.active.fetch_add(1, Ordering::SeqCst);
        info!("Peer {} active at {} for {}", key, address, owner);
        self.events.emit(GatewayEvent::PeerConnected {
            wallet: owner,
            public_key: key.to_string(),
            client_address: peer.client_address.clone(),
            timestamp: GatewayEvent::now(),
        });
        Ok(peer)
    }

    /// Release the peer for `key`. Absent peers are not an error.
    pub async fn disconnect(&self, key: &PeerKey) -> Option<Peer> {
        self.release(key, ReleaseKind::Disconnect).await
    }

    /// Same as [`PeerManager::disconnect`], recorded as a revocation.
    pub async fn revoke(&self, key: &PeerKey) -> Option<Peer> {
        self.release(key, ReleaseKind::Revoke).await
    }

    pub async fn peer(&self, key: &PeerKey) -> Option<Peer> {
        let slot = self.existing_slot(key).await?;
        let state = slot.lock().await;
        state.peer.clone()
    }

    async fn release(&self, key: &PeerKey, kind: ReleaseKind) -> Option<Peer> {
        loop {
            let slot = self.existing_slot(key).await?;
            let mut state = slot.clone().lock_owned().await;
            if state.retired {
                continue;
            }

            let Some(peer) = state.peer.take() else {
                self.retire(key, &slot, &mut state).await;
                return None;
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.emit(&peer, kind);
            // Backend first: once the slot is retired the key may be re-added
            // by someone else.
            if let Some(mut state) = self.teardown(peer.clone(), state).await {
                self.retire(key, &slot, &mut state).await;
            }
            return Some(peer);
        }
    }

    /// Remove `peer` from the backend and return its address, holding the
    /// slot until both are done. Runs detached so that cancelling the caller
    /// cannot strand the address.
    async fn teardown(&self, peer: Peer, state: SlotGuard) -> Option<SlotGuard> {
        let backend = self.backend.clone();
        let pool = self.pool.clone();
        let backend_timeout = self.backend_timeout;
        let task = tokio::spawn(async move {
            match timeout(backend_timeout, backend.remove_peer(&peer.public_key)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "Failed to remove peer {} from tunnel backend: {}",
                    peer.public_key, e
                ),
                Err(_) => error!(
                    "Timed out removing peer {} from tunnel backend",
                    peer.public_key
                ),
            }
            pool.release(peer.address);
            state
        });
        match task.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!("Peer teardown task failed: {}", e);
                None
            }
        }
    }

    fn emit(&self, peer: &Peer, kind: ReleaseKind) {
        let public_key = peer.public_key.to_string();
        let client_address = peer.client_address.clone();
        let timestamp = GatewayEvent::now();
        let event = match kind {
            ReleaseKind::Disconnect => GatewayEvent::PeerDisconnected {
                wallet: peer.owner,
                public_key,
                client_address,
                timestamp,
            },
            ReleaseKind::Revoke => GatewayEvent::PeerRevoked {
                wallet: peer.owner,
                public_key,
                client_address,
                timestamp,
            },
        };
        self.events.emit(event);
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("pool", &self.pool)
            .field("active", &self.active_count())
            .field("backend_timeout", &self.backend_timeout)
            .finish()
    }
}
