use nftvpn::chain::{Address, MemoryChain, TokenId};
use nftvpn::events::{EventPublisher, GatewayEvent, SessionEndReason};
use nftvpn::policy::{AccessPolicy, Tier, TierRules};
use nftvpn::session::{SessionLifetimes, SessionStore, SessionToken};
use nftvpn::tunnel::{MemoryBackend, PeerKey, PeerManager};
use nftvpn::watcher::{CheckOutcome, RevocationWatcher, WatcherConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const FREE: u64 = 0;
const PAID: u64 = 1;

struct Harness {
    chain: Arc<MemoryChain>,
    backend: Arc<MemoryBackend>,
    policy: Arc<AccessPolicy>,
    sessions: Arc<SessionStore>,
    events: Arc<EventPublisher>,
    watcher: Arc<RevocationWatcher>,
}

fn harness() -> Harness {
    let chain = Arc::new(MemoryChain::new());
    let backend = Arc::new(MemoryBackend::new());
    let events = Arc::new(EventPublisher::new());
    let policy = Arc::new(AccessPolicy::new(
        chain.clone(),
        TierRules {
            free_tier: TokenId::from(FREE),
            paid_tier: vec![TokenId::from(PAID)],
        },
    ));
    let peers = Arc::new(PeerManager::new(
        "10.8.0.0/24".parse().unwrap(),
        backend.clone(),
        events.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(
        peers,
        events.clone(),
        SessionLifetimes::default(),
    ));
    let watcher = Arc::new(RevocationWatcher::new(
        chain.clone(),
        policy.clone(),
        sessions.clone(),
        events.clone(),
        WatcherConfig {
            rescan_blocks: 64,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        },
    ));
    Harness {
        chain,
        backend,
        policy,
        sessions,
        events,
        watcher,
    }
}

async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

impl Harness {
    /// Log `wallet` in and bind a peer to its session.
    async fn connected_session(&self, wallet: Address, key_byte: u8) -> SessionToken {
        let decision = self.policy.evaluate(wallet).await.unwrap();
        let session = self.sessions.create(&decision).await;
        self.sessions
            .attach_peer(&session.token, PeerKey::from_bytes([key_byte; 32]))
            .await
            .unwrap();
        session.token
    }

    async fn wait_for_session_end(&self, token: &SessionToken) {
        for _ in 0..200 {
            if self.sessions.get(token).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session was never revoked");
    }
}

#[tokio::test]
async fn test_transfer_revokes_live_session() {
    let h = harness();
    let alice = Address([0xA1; 20]);
    let bob = Address([0xB0; 20]);
    h.chain.mint(alice, TokenId::from(PAID));
    let token = h.connected_session(alice, 1).await;
    let mut events = h.events.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.watcher.clone().run(shutdown_rx));
    let chain = h.chain.clone();
    wait_for("subscription", || chain.subscriber_count() == 1).await;

    h.chain.transfer(alice, bob, TokenId::from(PAID));
    h.wait_for_session_end(&token).await;
    assert_eq!(h.backend.peer_count(), 0);
    assert!(h.sessions.peers().is_address_free("10.8.0.2".parse().unwrap()));

    let mut saw_revoked_peer = false;
    let mut saw_session_end = false;
    while let Ok(event) = events.try_recv() {
        match event {
            GatewayEvent::PeerRevoked { wallet, .. } => saw_revoked_peer = wallet == alice,
            GatewayEvent::SessionEnded { wallet, reason, .. } => {
                saw_session_end = wallet == alice && reason == SessionEndReason::Revoked
            }
            _ => {}
        }
    }
    assert!(saw_revoked_peer);
    assert!(saw_session_end);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_events_missed_during_outage_are_rescanned() {
    let h = harness();
    let alice = Address([0xA2; 20]);
    let bob = Address([0xB0; 20]);
    h.chain.mint(alice, TokenId::from(FREE));
    let token = h.connected_session(alice, 2).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.watcher.clone().run(shutdown_rx));
    let chain = h.chain.clone();
    wait_for("subscription", || chain.subscriber_count() == 1).await;

    // Drop the feed and keep the node down so the transfer is only in history.
    h.chain.set_available(false);
    h.chain.drop_subscriptions();
    h.chain.transfer(alice, bob, TokenId::from(FREE));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sessions.get(&token).await.is_ok());

    h.chain.set_available(true);
    h.wait_for_session_end(&token).await;
    assert_eq!(h.backend.peer_count(), 0);
    wait_for("resubscription", || chain.subscriber_count() == 1).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_outage_keeps_sessions() {
    let h = harness();
    let alice = Address([0xA3; 20]);
    h.chain.mint(alice, TokenId::from(FREE));
    let token = h.connected_session(alice, 3).await;

    h.chain.set_available(false);
    assert_eq!(h.watcher.recheck_wallet(alice).await, CheckOutcome::Skipped);
    assert!(h.sessions.get(&token).await.unwrap().is_connected());
    assert_eq!(h.backend.peer_count(), 1);
}

#[tokio::test]
async fn test_revoked_delegation_ends_delegated_session() {
    let h = harness();
    let vault = Address([0xC0; 20]);
    let hot = Address([0xC1; 20]);
    h.chain.mint(vault, TokenId::from(PAID));
    h.chain.delegate(vault, hot);

    let decision = h.policy.evaluate(hot).await.unwrap();
    assert_eq!(decision.tier, Tier::Paid);
    assert_eq!(decision.via, Some(vault));
    let token = h.connected_session(hot, 4).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.watcher.clone().run(shutdown_rx));
    let chain = h.chain.clone();
    wait_for("subscription", || chain.subscriber_count() == 1).await;

    h.chain.revoke_delegation(vault, hot);
    h.wait_for_session_end(&token).await;

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_upgrade_refreshes_tier_without_revoking() {
    let h = harness();
    let alice = Address([0xA4; 20]);
    h.chain.mint(alice, TokenId::from(FREE));
    let token = h.connected_session(alice, 5).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(h.watcher.clone().run(shutdown_rx));
    let chain = h.chain.clone();
    wait_for("subscription", || chain.subscriber_count() == 1).await;

    h.chain.mint(alice, TokenId::from(PAID));
    let mut upgraded = false;
    for _ in 0..200 {
        if h.sessions.get(&token).await.unwrap().tier == Tier::Paid {
            upgraded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(upgraded);
    assert!(h.sessions.get(&token).await.unwrap().is_connected());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}
