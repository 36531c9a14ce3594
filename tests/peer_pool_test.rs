use async_trait::async_trait;
use chrono::Utc;
use nftvpn::chain::Address;
use nftvpn::events::EventPublisher;
use nftvpn::policy::{Tier, TierDecision};
use nftvpn::session::{SessionLifetimes, SessionStore};
use nftvpn::tunnel::{BackendError, MemoryBackend, PeerError, PeerKey, PeerManager, TunnelBackend};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

fn manager(network: &str) -> (Arc<MemoryBackend>, Arc<PeerManager>) {
    let backend = Arc::new(MemoryBackend::new());
    let peers = Arc::new(PeerManager::new(
        network.parse().unwrap(),
        backend.clone(),
        Arc::new(EventPublisher::new()),
    ));
    (backend, peers)
}

fn key(i: u8) -> PeerKey {
    let mut bytes = [0u8; 32];
    bytes[0] = i;
    bytes[31] = 0x5A;
    PeerKey::from_bytes(bytes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_get_distinct_addresses() {
    let (backend, peers) = manager("10.20.0.0/28");
    let capacity = peers.capacity();
    assert_eq!(capacity, 13);

    let mut tasks = Vec::new();
    for i in 0..(capacity as u8 + 3) {
        let peers = peers.clone();
        tasks.push(tokio::spawn(async move {
            peers.connect(key(i), Address([i; 20])).await
        }));
    }

    let mut addresses = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(peer) => assert!(addresses.insert(peer.address)),
            Err(PeerError::PoolExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected connect failure: {}", e),
        }
    }
    assert_eq!(addresses.len(), capacity);
    assert_eq!(exhausted, 3);
    assert_eq!(backend.peer_count(), capacity);
    assert_eq!(peers.free_addresses(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_disconnect_churn_restores_pool() {
    let (backend, peers) = manager("10.20.0.0/24");
    let before = peers.free_addresses();

    let mut tasks = Vec::new();
    for i in 0..64u8 {
        let peers = peers.clone();
        tasks.push(tokio::spawn(async move {
            let owner = Address([i; 20]);
            peers.connect(key(i), owner).await.unwrap();
            // Reconnecting the same key keeps a single binding.
            peers.connect(key(i), owner).await.unwrap();
            peers.disconnect(&key(i)).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }

    assert_eq!(peers.active_count(), 0);
    assert_eq!(peers.free_addresses(), before);
    assert_eq!(backend.peer_count(), 0);
}

#[tokio::test]
async fn test_failed_backend_leaves_pool_untouched() {
    let (backend, peers) = manager("10.20.0.0/30");
    backend.set_fail_adds(true);

    assert!(matches!(
        peers.connect(key(1), Address([1; 20])).await,
        Err(PeerError::Backend(_))
    ));
    assert_eq!(peers.free_addresses(), 1);

    backend.set_fail_adds(false);
    let peer = peers.connect(key(1), Address([1; 20])).await.unwrap();
    assert_eq!(peer.client_address, "10.20.0.2/30");
}

/// Backend whose removals outlive an impatient caller.
struct SlowRemoveBackend {
    inner: MemoryBackend,
}

#[async_trait]
impl TunnelBackend for SlowRemoveBackend {
    async fn add_peer(&self, key: &PeerKey, address: Ipv4Addr) -> Result<(), BackendError> {
        self.inner.add_peer(key, address).await
    }

    async fn remove_peer(&self, key: &PeerKey) -> Result<(), BackendError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.inner.remove_peer(key).await
    }
}

#[tokio::test]
async fn test_abandoned_key_swap_returns_address() {
    let backend = Arc::new(SlowRemoveBackend {
        inner: MemoryBackend::new(),
    });
    let events = Arc::new(EventPublisher::new());
    let peers = Arc::new(PeerManager::new(
        "10.20.0.0/29".parse().unwrap(),
        backend.clone(),
        events.clone(),
    ));
    let sessions = SessionStore::new(peers.clone(), events, SessionLifetimes::default());
    let wallet = Address([7; 20]);
    let session = sessions
        .create(&TierDecision {
            wallet,
            tier: Tier::Free,
            via: None,
            evaluated_at: Utc::now(),
        })
        .await;
    sessions.attach_peer(&session.token, key(1)).await.unwrap();

    let swap = sessions.attach_peer(&session.token, key(2));
    assert!(tokio::time::timeout(Duration::from_millis(20), swap)
        .await
        .is_err());
    sessions.end(&session.token).await.unwrap();

    // Settles once the detached teardown of the first key is done.
    assert!(peers.peer(&key(1)).await.is_none());
    assert_eq!(peers.active_count(), 0);
    assert_eq!(peers.free_addresses(), peers.capacity());
    assert_eq!(backend.inner.peer_count(), 0);
}
