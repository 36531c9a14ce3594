//! Session Store.
//!
//! The single owner of sessions. Sessions of one wallet share a mutex, so
//! requests for unrelated wallets never wait on each other; the token and
//! delegator indexes are only ever locked for short lookups and never across
//! an await on another lock.
//!
//! Every path that destroys a session (revocation, expiry, explicit end)
//! first releases its peer through the [`PeerManager`].

use crate::chain::Address;
use crate::events::{EventPublisher, GatewayEvent, SessionEndReason};
use crate::policy::{Tier, TierDecision};
use crate::tunnel::{Peer, PeerError, PeerKey, PeerManager};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found or expired")]
    NotFound,

    #[error("{0}")]
    Denied(String),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Opaque bearer credential. `Debug` and [`SessionToken::short`] only reveal
/// a prefix, which is all that ever reaches the logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: SessionToken,
    pub wallet: Address,
    pub tier: Tier,
    /// Delegator whose holdings granted access, if any.
    pub via: Option<Address>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub peer: Option<Peer>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }
}

/// Session lifetime per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLifetimes {
    pub free: std::time::Duration,
    pub paid: std::time::Duration,
}

impl SessionLifetimes {
    fn for_tier(&self, tier: Tier) -> Duration {
        let lifetime = match tier {
            Tier::Free => self.free,
            Tier::Paid => self.paid,
        };
        Duration::from_std(lifetime).unwrap_or_else(|_| Duration::hours(1))
    }
}

impl Default for SessionLifetimes {
    fn default() -> Self {
        Self {
            free: std::time::Duration::from_secs(3600),
            paid: std::time::Duration::from_secs(86400),
        }
    }
}

#[derive(Default)]
struct WalletSessions {
    sessions: HashMap<SessionToken, Session>,
    retired: bool,
}

type WalletEntry = Arc<Mutex<WalletSessions>>;

pub struct SessionStore {
    tokens: RwLock<HashMap<SessionToken, Address>>,
    wallets: RwLock<HashMap<Address, WalletEntry>>,
    /// delegator -> wallets holding a session granted through it
    delegated: RwLock<HashMap<Address, HashSet<Address>>>,
    peers: Arc<PeerManager>,
    events: Arc<EventPublisher>,
    lifetimes: SessionLifetimes,
}

impl SessionStore {
    pub fn new(
        peers: Arc<PeerManager>,
        events: Arc<EventPublisher>,
        lifetimes: SessionLifetimes,
    ) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            wallets: RwLock::new(HashMap::new()),
            delegated: RwLock::new(HashMap::new()),
            peers,
            events,
            lifetimes,
        }
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Lock the live entry for `wallet`, creating it if needed.
    async fn lock_wallet(&self, wallet: Address) -> (WalletEntry, OwnedMutexGuard<WalletSessions>) {
        loop {
            let entry = {
                let wallets = self.wallets.read().await;
                wallets.get(&wallet).cloned()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => self
                    .wallets
                    .write()
                    .await
                    .entry(wallet)
                    .or_default()
                    .clone(),
            };
            let guard = entry.clone().lock_owned().await;
            if !guard.retired {
                return (entry, guard);
            }
        }
    }

    /// Lock the entry for `wallet` only if one exists.
    async fn lock_existing(
        &self,
        wallet: Address,
    ) -> Option<(WalletEntry, OwnedMutexGuard<WalletSessions>)> {
        loop {
            let entry = self.wallets.read().await.get(&wallet).cloned()?;
            let guard = entry.clone().lock_owned().await;
            if !guard.retired {
                return Some((entry, guard));
            }
        }
    }

    /// Drop the entry from the registry once it holds no sessions.
    async fn retire_if_empty(
        &self,
        wallet: Address,
        entry: &WalletEntry,
        guard: &mut WalletSessions,
    ) {
        if !guard.sessions.is_empty() {
            return;
        }
        guard.retired = true;
        let mut wallets = self.wallets.write().await;
        if wallets
            .get(&wallet)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false)
        {
            wallets.remove(&wallet);
        }
    }

    async fn wallet_of(&self, token: &SessionToken) -> Result<Address, SessionError> {
        self.tokens
            .read()
            .await
            .get(token)
            .copied()
            .ok_or(SessionError::NotFound)
    }

    async fn index_delegation(&self, via: Address, wallet: Address) {
        self.delegated
            .write()
            .await
            .entry(via)
            .or_default()
            .insert(wallet);
    }

    /// Remove `wallet` from the delegator index for `via` unless one of its
    /// remaining sessions still came through `via`.
    async fn unindex_delegation(&self, via: Address, wallet: Address, remaining: &WalletSessions) {
        if remaining.sessions.values().any(|s| s.via == Some(via)) {
            return;
        }
        let mut delegated = self.delegated.write().await;
        if let Some(wallets) = delegated.get_mut(&via) {
            wallets.remove(&wallet);
            if wallets.is_empty() {
                delegated.remove(&via);
            }
        }
    }

    /// Create a session from a successful tier decision.
    pub async fn create(&self, decision: &TierDecision) -> Session {
        let now = Utc::now();
        let session = Session {
            token: SessionToken::generate(),
            wallet: decision.wallet,
            tier: decision.tier,
            via: decision.via,
            created_at: now,
            expires_at: now + self.lifetimes.for_tier(decision.tier),
            peer: None,
        };

        let (_entry, mut guard) = self.lock_wallet(session.wallet).await;
        guard
            .sessions
            .insert(session.token.clone(), session.clone());
        self.tokens
            .write()
            .await
            .insert(session.token.clone(), session.wallet);
        if let Some(via) = session.via {
            self.index_delegation(via, session.wallet).await;
        }
        drop(guard);

        info!(
            "Session {} created for {} ({} tier)",
            session.token.short(),
            session.wallet,
            session.tier
        );
        self.events.emit(GatewayEvent::SessionCreated {
            wallet: session.wallet,
            tier: session.tier,
            via: session.via,
            expires_at: session.expires_at.timestamp(),
            timestamp: GatewayEvent::now(),
        });
        session
    }

    /// Look up a live session. Expired sessions are reported as not found
    /// even before the sweeper has removed them.
    pub async fn get(&self, token: &SessionToken) -> Result<Session, SessionError> {
        let wallet = self.wallet_of(token).await?;
        let (_entry, guard) = self
            .lock_existing(wallet)
            .await
            .ok_or(SessionError::NotFound)?;
        guard
            .sessions
            .get(token)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    /// Bind `key` to the session, releasing whatever key the session had
    /// before. A key held by another session of the same wallet moves to
    /// this one; a key held by another wallet is refused.
    pub async fn attach_peer(
        &self,
        token: &SessionToken,
        key: PeerKey,
    ) -> Result<Session, SessionError> {
        let wallet = self.wallet_of(token).await?;
        let (_entry, mut guard) = self
            .lock_existing(wallet)
            .await
            .ok_or(SessionError::NotFound)?;

        // Checked again atomically by the peer manager; this keeps the
        // current binding intact when the request is refused.
        if let Some(existing) = self.peers.peer(&key).await {
            if existing.owner != wallet {
                return Err(key_in_use());
            }
        }

        let now = Utc::now();
        let previous = match guard.sessions.get_mut(token) {
            Some(session) if !session.is_expired(now) => session.peer.take(),
            _ => return Err(SessionError::NotFound),
        };
        if let Some(previous) = previous {
            if previous.public_key != key {
                self.peers.disconnect(&previous.public_key).await;
            }
        }
        for other in guard.sessions.values_mut() {
            if other.token != *token
                && other.peer.as_ref().map(|p| &p.public_key) == Some(&key)
            {
                debug!(
                    "Moving peer {} from session {} to {}",
                    key,
                    other.token.short(),
                    token.short()
                );
                other.peer = None;
            }
        }

        let peer = self.peers.connect(key, wallet).await.map_err(|e| match e {
            PeerError::KeyInUse => key_in_use(),
            other => SessionError::Peer(other),
        })?;

        let session = guard
            .sessions
            .get_mut(token)
            .ok_or(SessionError::NotFound)?;
        session.peer = Some(peer);
        Ok(session.clone())
    }

    /// Release the peer bound to the session, if any.
    pub async fn detach_peer(&self, token: &SessionToken) -> Result<Option<Peer>, SessionError> {
        self.detach_matching(token, None).await
    }

    /// Release `key` if it is the peer bound to the session; otherwise do
    /// nothing.
    pub async fn detach_key(
        &self,
        token: &SessionToken,
        key: &PeerKey,
    ) -> Result<Option<Peer>, SessionError> {
        self.detach_matching(token, Some(key)).await
    }

    async fn detach_matching(
        &self,
        token: &SessionToken,
        key: Option<&PeerKey>,
    ) -> Result<Option<Peer>, SessionError> {
        let wallet = self.wallet_of(token).await?;
        let (_entry, mut guard) = self
            .lock_existing(wallet)
            .await
            .ok_or(SessionError::NotFound)?;
        let session = guard
            .sessions
            .get_mut(token)
            .ok_or(SessionError::NotFound)?;

        let matches = match (key, &session.peer) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(key), Some(peer)) => peer.public_key == *key,
        };
        if !matches {
            return Ok(None);
        }
        let bound = session.peer.take();
        if let Some(peer) = &bound {
            self.peers.disconnect(&peer.public_key).await;
        }
        Ok(bound)
    }

    /// End one session at the client's request.
    pub async fn end(&self, token: &SessionToken) -> Result<(), SessionError> {
        let wallet = self.wallet_of(token).await?;
        let (entry, mut guard) = self
            .lock_existing(wallet)
            .await
            .ok_or(SessionError::NotFound)?;
        let session = guard
            .sessions
            .remove(token)
            .ok_or(SessionError::NotFound)?;
        self.destroy(session, &guard, SessionEndReason::Disconnected)
            .await;
        self.retire_if_empty(wallet, &entry, &mut guard).await;
        Ok(())
    }

    /// Revoke every session of `wallet`. Returns how many were revoked.
    pub async fn revoke(&self, wallet: Address) -> usize {
        self.revoke_matching(wallet, |_| true).await
    }

    /// Revoke the sessions of `wallet` created before `cutoff`. Sessions
    /// created later were granted by an evaluation this one cannot overrule.
    pub async fn revoke_created_before(&self, wallet: Address, cutoff: DateTime<Utc>) -> usize {
        self.revoke_matching(wallet, |s| s.created_at < cutoff).await
    }

    async fn revoke_matching<F>(&self, wallet: Address, matches: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let Some((entry, mut guard)) = self.lock_existing(wallet).await else {
            return 0;
        };
        let tokens: Vec<SessionToken> = guard
            .sessions
            .values()
            .filter(|s| matches(s))
            .map(|s| s.token.clone())
            .collect();
        let count = tokens.len();
        for token in tokens {
            if let Some(session) = guard.sessions.remove(&token) {
                self.destroy(session, &guard, SessionEndReason::Revoked)
                    .await;
            }
        }
        self.retire_if_empty(wallet, &entry, &mut guard).await;
        if count > 0 {
            info!("Revoked {} session(s) for {}", count, wallet);
        }
        count
    }

    /// Remove every session that expired by `now`. Returns how many.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let wallets: Vec<Address> = self.wallets.read().await.keys().copied().collect();
        let mut expired = 0;
        for wallet in wallets {
            let Some((entry, mut guard)) = self.lock_existing(wallet).await else {
                continue;
            };
            let tokens: Vec<SessionToken> = guard
                .sessions
                .values()
                .filter(|s| s.is_expired(now))
                .map(|s| s.token.clone())
                .collect();
            for token in tokens {
                if let Some(session) = guard.sessions.remove(&token) {
                    self.destroy(session, &guard, SessionEndReason::Expired)
                        .await;
                    expired += 1;
                }
            }
            self.retire_if_empty(wallet, &entry, &mut guard).await;
        }
        if expired > 0 {
            debug!("Expired {} session(s)", expired);
        }
        expired
    }

    /// Tear down a session already removed from `remaining`.
    async fn destroy(&self, session: Session, remaining: &WalletSessions, reason: SessionEndReason) {
        if let Some(peer) = &session.peer {
            match reason {
                SessionEndReason::Revoked => self.peers.revoke(&peer.public_key).await,
                _ => self.peers.disconnect(&peer.public_key).await,
            };
        }
        self.tokens.write().await.remove(&session.token);
        if let Some(via) = session.via {
            self.unindex_delegation(via, session.wallet, remaining).await;
        }
        info!(
            "Session {} for {} ended ({:?})",
            session.token.short(),
            session.wallet,
            reason
        );
        self.events.emit(GatewayEvent::SessionEnded {
            wallet: session.wallet,
            reason,
            timestamp: GatewayEvent::now(),
        });
    }

    /// Apply a fresh, successful decision to the wallet's sessions: tier and
    /// delegation provenance follow the chain, expiry does not change.
    /// Returns the number of sessions whose tier changed.
    pub async fn refresh(&self, decision: &TierDecision) -> usize {
        let Some((_entry, mut guard)) = self.lock_existing(decision.wallet).await else {
            return 0;
        };
        let mut changed = 0;
        let mut dropped_via = HashSet::new();
        for session in guard.sessions.values_mut() {
            if session.tier != decision.tier {
                info!(
                    "Session {} for {} moves from {} to {} tier",
                    session.token.short(),
                    session.wallet,
                    session.tier,
                    decision.tier
                );
                session.tier = decision.tier;
                changed += 1;
            }
            if session.via != decision.via {
                if let Some(old) = session.via {
                    dropped_via.insert(old);
                }
                session.via = decision.via;
            }
        }
        if let Some(via) = decision.via {
            self.index_delegation(via, decision.wallet).await;
        }
        for via in dropped_via {
            self.unindex_delegation(via, decision.wallet, &guard).await;
        }
        changed
    }

    /// Live sessions of `wallet`.
    pub async fn sessions_for(&self, wallet: Address) -> Vec<Session> {
        match self.lock_existing(wallet).await {
            Some((_entry, guard)) => guard.sessions.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Wallets with a session granted through `delegator`.
    pub async fn wallets_delegated_by(&self, delegator: Address) -> Vec<Address> {
        self.delegated
            .read()
            .await
            .get(&delegator)
            .map(|wallets| wallets.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn active_wallets(&self) -> Vec<Address> {
        self.wallets.read().await.keys().copied().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

fn key_in_use() -> SessionError {
    SessionError::Denied("Public key is bound to another wallet".to_string())
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("lifetimes", &self.lifetimes)
            .finish()
    }
}
