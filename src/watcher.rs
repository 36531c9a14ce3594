//! Revocation Watcher and session sweeper.
//!
//! The watcher follows token transfers and delegation changes. Every event
//! becomes a set of "re-evaluate wallet W" checks that go through the same
//! session-store operations client requests use. A denial revokes; an
//! unavailable chain keeps the session (fail open) until the next event or
//! periodic re-check.
//!
//! After every (re)subscription the watcher re-scans recent blocks, so events
//! missed while disconnected are still checked. Checks are idempotent and may
//! run more than once for the same event.

use crate::auth::Authenticator;
use crate::chain::{Address, ChainError, ChainEvent, ChainEventSource};
use crate::events::{EventPublisher, GatewayEvent};
use crate::policy::{AccessPolicy, PolicyError};
use crate::session::SessionStore;
use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// Blocks re-scanned on every (re)subscription.
    pub rescan_blocks: u64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            rescan_blocks: 64,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// What a single re-evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The wallet had no live session; nothing was evaluated.
    NoSessions,
    /// Access confirmed (the tier may have changed).
    Kept,
    /// Access denied; this many sessions were revoked.
    Revoked(usize),
    /// The chain could not be consulted; sessions were left alone.
    Skipped,
}

/// Resolves when shutdown is requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub struct RevocationWatcher {
    source: Arc<dyn ChainEventSource>,
    policy: Arc<AccessPolicy>,
    sessions: Arc<SessionStore>,
    events: Arc<EventPublisher>,
    config: WatcherConfig,
    last_block: Mutex<Option<u64>>,
}

impl RevocationWatcher {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        policy: Arc<AccessPolicy>,
        sessions: Arc<SessionStore>,
        events: Arc<EventPublisher>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            source,
            policy,
            sessions,
            events,
            config,
            last_block: Mutex::new(None),
        }
    }

    /// Highest block whose events have been processed.
    pub fn last_block(&self) -> Option<u64> {
        *self.last_block.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_block(&self, block: u64) {
        let mut last = self.last_block.lock().unwrap_or_else(|e| e.into_inner());
        if last.map(|b| block > b).unwrap_or(true) {
            *last = Some(block);
        }
    }

    /// Wallets whose sessions an event may affect: the addresses it names,
    /// plus wallets whose access was granted through one of them.
    async fn affected_wallets(&self, event: &ChainEvent) -> BTreeSet<Address> {
        let mut wallets = BTreeSet::new();
        for address in event.affected_wallets() {
            wallets.insert(address);
            wallets.extend(self.sessions.wallets_delegated_by(address).await);
        }
        wallets
    }

    /// Re-evaluate every wallet the event affects.
    pub async fn handle_event(&self, event: &ChainEvent) -> Vec<(Address, CheckOutcome)> {
        debug!("Processing chain event at block {}", event.block_number);
        let mut outcomes = Vec::new();
        for wallet in self.affected_wallets(event).await {
            let outcome = self.recheck_wallet(wallet).await;
            outcomes.push((wallet, outcome));
        }
        self.mark_block(event.block_number);
        outcomes
    }

    /// Evaluate `wallet` against the chain and apply the result to its
    /// sessions. The chain is consulted with no session lock held.
    pub async fn recheck_wallet(&self, wallet: Address) -> CheckOutcome {
        // A wallet without sessions can still log in again on a cached tier.
        self.policy.invalidate(&wallet).await;
        if self.sessions.sessions_for(wallet).await.is_empty() {
            return CheckOutcome::NoSessions;
        }

        let evaluated_from = Utc::now();
        match self.policy.evaluate_fresh(wallet).await {
            Ok(decision) => {
                self.sessions.refresh(&decision).await;
                CheckOutcome::Kept
            }
            Err(PolicyError::Denied(_)) => {
                let revoked = self
                    .sessions
                    .revoke_created_before(wallet, evaluated_from)
                    .await;
                self.events.emit(GatewayEvent::AccessDenied {
                    wallet,
                    reason: "qualifying holding no longer present".to_string(),
                    timestamp: GatewayEvent::now(),
                });
                CheckOutcome::Revoked(revoked)
            }
            Err(PolicyError::EvaluationUnavailable(e)) => {
                warn!(
                    "Could not re-evaluate {} ({}); keeping its sessions until the next check",
                    wallet, e
                );
                CheckOutcome::Skipped
            }
        }
    }

    /// Re-evaluate every wallet with a live session. Returns how many
    /// sessions were revoked.
    pub async fn recheck_all(&self) -> usize {
        let mut revoked = 0;
        for wallet in self.sessions.active_wallets().await {
            if let CheckOutcome::Revoked(n) = self.recheck_wallet(wallet).await {
                revoked += n;
            }
        }
        revoked
    }

    /// Follow chain events until shutdown, resubscribing with exponential
    /// backoff whenever the subscription fails.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.config.initial_backoff;
        loop {
            match self.follow(&mut shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => warn!(
                    "Revocation watcher subscription failed: {}. Resubscribing in {:?}",
                    e, backoff
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
        info!("Revocation watcher stopped");
    }

    /// One subscription lifetime. `Ok` means shutdown was requested.
    async fn follow(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> Result<(), ChainError> {
        // Subscribe before re-scanning so nothing falls between the two.
        let mut stream = self.source.subscribe().await?;
        let latest = self.source.latest_block().await?;
        let window_start = latest.saturating_sub(self.config.rescan_blocks);
        let from = match self.last_block() {
            Some(seen) => (seen + 1).min(window_start),
            None => window_start,
        };
        if from <= latest {
            let missed = self.source.events_between(from, latest).await?;
            debug!(
                "Re-scanning {} event(s) in blocks {}..={}",
                missed.len(),
                from,
                latest
            );
            for event in &missed {
                self.handle_event(event).await;
            }
        }
        self.mark_block(latest);
        info!("Revocation watcher subscribed at block {}", latest);
        *backoff = self.config.initial_backoff;

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => return Ok(()),
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        self.handle_event(&event).await;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ChainError::SubscriptionClosed(
                            "event stream ended".to_string(),
                        ))
                    }
                },
            }
        }
    }

    /// Re-evaluate all live sessions every `interval` until shutdown.
    pub async fn run_rechecks(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let revoked = self.recheck_all().await;
                    if revoked > 0 {
                        info!("Periodic re-check revoked {} session(s)", revoked);
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }
}

impl std::fmt::Debug for RevocationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationWatcher")
            .field("config", &self.config)
            .field("last_block", &self.last_block())
            .finish()
    }
}

/// Remove expired sessions and challenges every `interval` until shutdown.
pub async fn run_sweeper(
    sessions: Arc<SessionStore>,
    authenticator: Arc<Authenticator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let sessions_removed = sessions.expire(now).await;
                let challenges_removed = authenticator.challenges().sweep(now);
                if sessions_removed + challenges_removed > 0 {
                    debug!(
                        "Sweeper removed {} session(s) and {} challenge(s)",
                        sessions_removed, challenges_removed
                    );
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainReader, MemoryChain, TokenId};
    use crate::policy::{Tier, TierDecision, TierRules};
    use crate::session::SessionLifetimes;
    use crate::tunnel::{MemoryBackend, PeerKey, PeerManager};

    const FREE: u64 = 0;
    const PAID: u64 = 1;

    struct Fixture {
        chain: Arc<MemoryChain>,
        policy: Arc<AccessPolicy>,
        sessions: Arc<SessionStore>,
        watcher: RevocationWatcher,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new());
        let events = Arc::new(EventPublisher::new());
        let policy = Arc::new(
            AccessPolicy::new(
                chain.clone(),
                TierRules {
                    free_tier: TokenId::from(FREE),
                    paid_tier: vec![TokenId::from(PAID)],
                },
            )
            .with_cache_ttl(Duration::from_secs(60)),
        );
        let peers = Arc::new(PeerManager::new(
            "10.8.0.0/24".parse().unwrap(),
            Arc::new(MemoryBackend::new()),
            events.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            peers,
            events.clone(),
            SessionLifetimes::default(),
        ));
        let watcher = RevocationWatcher::new(
            chain.clone(),
            policy.clone(),
            sessions.clone(),
            events,
            WatcherConfig::default(),
        );
        Fixture {
            chain,
            policy,
            sessions,
            watcher,
        }
    }

    fn wallet(b: u8) -> Address {
        Address([b; 20])
    }

    async fn open_session(f: &Fixture, wallet: Address, tier: Tier, via: Option<Address>) {
        let session = f
            .sessions
            .create(&TierDecision {
                wallet,
                tier,
                via,
                evaluated_at: Utc::now(),
            })
            .await;
        f.sessions
            .attach_peer(&session.token, PeerKey::from_bytes([wallet.0[0]; 32]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transfer_away_revokes() {
        let f = fixture();
        f.chain.mint(wallet(1), TokenId::from(FREE));
        open_session(&f, wallet(1), Tier::Free, None).await;

        let event = f.chain.transfer(wallet(1), wallet(2), TokenId::from(FREE));
        let outcomes = f.watcher.handle_event(&event).await;

        assert!(outcomes.contains(&(wallet(1), CheckOutcome::Revoked(1))));
        assert!(outcomes.contains(&(wallet(2), CheckOutcome::NoSessions)));
        assert!(f.sessions.sessions_for(wallet(1)).await.is_empty());
        assert_eq!(f.sessions.peers().active_count(), 0);
        assert_eq!(f.watcher.last_block(), Some(event.block_number));
    }

    #[tokio::test]
    async fn test_transfer_after_logout_drops_cached_tier() {
        let f = fixture();
        f.chain.mint(wallet(1), TokenId::from(PAID));
        let decision = f.policy.evaluate(wallet(1)).await.unwrap();
        let session = f.sessions.create(&decision).await;
        f.sessions.end(&session.token).await.unwrap();

        let event = f.chain.transfer(wallet(1), wallet(2), TokenId::from(PAID));
        let outcomes = f.watcher.handle_event(&event).await;
        assert!(outcomes.contains(&(wallet(1), CheckOutcome::NoSessions)));

        // Logging back in must not be answered from the cache.
        assert!(matches!(
            f.policy.evaluate(wallet(1)).await,
            Err(PolicyError::Denied(_))
        ));
    }

    /// Reads the in-memory chain, slowly.
    struct SlowReader {
        chain: Arc<MemoryChain>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ChainReader for SlowReader {
        async fn check_ownership(
            &self,
            wallet: Address,
            token_ids: &[TokenId],
        ) -> Result<bool, ChainError> {
            tokio::time::sleep(self.delay).await;
            self.chain.check_ownership(wallet, token_ids).await
        }

        async fn resolve_delegations(&self, wallet: Address) -> Result<Vec<Address>, ChainError> {
            tokio::time::sleep(self.delay).await;
            self.chain.resolve_delegations(wallet).await
        }
    }

    #[tokio::test]
    async fn test_denial_spares_session_granted_during_evaluation() {
        let chain = Arc::new(MemoryChain::new());
        let events = Arc::new(EventPublisher::new());
        let reader = Arc::new(SlowReader {
            chain: chain.clone(),
            delay: Duration::from_millis(100),
        });
        let policy = Arc::new(AccessPolicy::new(
            reader,
            TierRules {
                free_tier: TokenId::from(FREE),
                paid_tier: vec![TokenId::from(PAID)],
            },
        ));
        let peers = Arc::new(PeerManager::new(
            "10.8.0.0/24".parse().unwrap(),
            Arc::new(MemoryBackend::new()),
            events.clone(),
        ));
        let sessions = Arc::new(SessionStore::new(
            peers,
            events.clone(),
            SessionLifetimes::default(),
        ));
        let watcher = Arc::new(RevocationWatcher::new(
            chain.clone(),
            policy,
            sessions.clone(),
            events,
            WatcherConfig::default(),
        ));
        let grant = |holder: Address| TierDecision {
            wallet: holder,
            tier: Tier::Free,
            via: None,
            evaluated_at: Utc::now(),
        };

        chain.mint(wallet(1), TokenId::from(FREE));
        let older = sessions.create(&grant(wallet(1))).await;
        chain.transfer(wallet(1), wallet(2), TokenId::from(FREE));

        let check = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.recheck_wallet(wallet(1)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let newer = sessions.create(&grant(wallet(1))).await;

        assert_eq!(check.await.unwrap(), CheckOutcome::Revoked(1));
        assert!(sessions.get(&older.token).await.is_err());
        assert!(sessions.get(&newer.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_replacement_holding_keeps_session() {
        let f = fixture();
        f.chain.mint(wallet(1), TokenId::from(FREE));
        f.chain.mint(wallet(1), TokenId::from(PAID));
        open_session(&f, wallet(1), Tier::Paid, None).await;

        let event = f.chain.transfer(wallet(1), wallet(2), TokenId::from(PAID));
        f.watcher.handle_event(&event).await;

        let sessions = f.sessions.sessions_for(wallet(1)).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_outage_fails_open() {
        let f = fixture();
        f.chain.mint(wallet(1), TokenId::from(FREE));
        open_session(&f, wallet(1), Tier::Free, None).await;

        let event = f.chain.transfer(wallet(1), wallet(2), TokenId::from(FREE));
        f.chain.set_available(false);
        assert_eq!(f.watcher.recheck_wallet(wallet(1)).await, CheckOutcome::Skipped);
        assert_eq!(f.sessions.sessions_for(wallet(1)).await.len(), 1);

        f.chain.set_available(true);
        f.watcher.handle_event(&event).await;
        assert!(f.sessions.sessions_for(wallet(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_delegator_transfer_revokes_delegate() {
        let f = fixture();
        f.chain.mint(wallet(9), TokenId::from(PAID));
        f.chain.delegate(wallet(9), wallet(1));
        open_session(&f, wallet(1), Tier::Paid, Some(wallet(9))).await;

        let event = f.chain.transfer(wallet(9), wallet(3), TokenId::from(PAID));
        f.watcher.handle_event(&event).await;

        assert!(f.sessions.sessions_for(wallet(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_delegation_revocation_revokes_delegate() {
        let f = fixture();
        f.chain.mint(wallet(9), TokenId::from(FREE));
        f.chain.delegate(wallet(9), wallet(1));
        open_session(&f, wallet(1), Tier::Free, Some(wallet(9))).await;

        let event = f.chain.revoke_delegation(wallet(9), wallet(1));
        let outcomes = f.watcher.handle_event(&event).await;

        assert_eq!(outcomes, vec![(wallet(1), CheckOutcome::Revoked(1))]);
    }

    #[tokio::test]
    async fn test_recheck_all() {
        let f = fixture();
        f.chain.mint(wallet(1), TokenId::from(FREE));
        f.chain.mint(wallet(2), TokenId::from(FREE));
        open_session(&f, wallet(1), Tier::Free, None).await;
        open_session(&f, wallet(2), Tier::Free, None).await;

        // Burned without the watcher seeing it.
        f.chain.transfer(wallet(2), Address::ZERO, TokenId::from(FREE));
        assert_eq!(f.watcher.recheck_all().await, 1);
        assert_eq!(f.sessions.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        shutdown_requested(&mut rx).await;
    }
}
