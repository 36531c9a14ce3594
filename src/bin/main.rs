use log::{error, info, warn};
use nftvpn::api::{self, GatewayState, TunnelProfile};
use nftvpn::auth::{Authenticator, ChallengeStore};
use nftvpn::chain::RpcChainClient;
use nftvpn::config::{BackendKind, ServerSettings};
use nftvpn::events::{EventPublisher, NatsConnection};
use nftvpn::policy::AccessPolicy;
use nftvpn::session::SessionStore;
use nftvpn::tunnel::{MemoryBackend, PeerManager, TunnelBackend, WgBackend};
use nftvpn::watcher::{run_sweeper, RevocationWatcher, WatcherConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = ServerSettings::from_env()?;
    info!(
        "Gateway for {} on port {}, tunnel {} via {:?}",
        settings.domain, settings.port, settings.tunnel_network, settings.tunnel_backend
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let events = match &settings.nats_url {
        Some(url) => {
            let nats = Arc::new(NatsConnection::new(url.clone()));
            tokio::spawn(nats.clone().maintain(shutdown_rx.clone()));
            Arc::new(EventPublisher::with_nats(nats, settings.nats_subject.clone()))
        }
        None => {
            info!("NATS_URL not set; gateway events stay local");
            Arc::new(EventPublisher::new())
        }
    };

    let chain = Arc::new(RpcChainClient::new(
        settings.chain_rpc_url.clone(),
        settings.chain_ws_url.clone(),
        settings.contracts(),
        settings.chain_timeout,
    )?);
    let policy = Arc::new(
        AccessPolicy::new(chain.clone(), settings.tier_rules())
            .with_cache_ttl(settings.policy_cache_ttl)
            .with_timeout(settings.chain_timeout),
    );

    let backend: Arc<dyn TunnelBackend> = match settings.tunnel_backend {
        BackendKind::Wg => Arc::new(WgBackend::new(settings.tunnel_interface.clone())),
        BackendKind::Memory => {
            warn!("Using the in-memory tunnel backend; no traffic will be routed");
            Arc::new(MemoryBackend::new())
        }
    };
    let peers = Arc::new(PeerManager::new(
        settings.tunnel_network,
        backend,
        events.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(
        peers,
        events.clone(),
        settings.session_lifetimes(),
    ));
    let authenticator = Arc::new(Authenticator::new(
        ChallengeStore::new(
            settings.domain.clone(),
            settings.challenge_ttl,
            settings.max_pending_challenges,
        ),
        policy.clone(),
        sessions.clone(),
        events.clone(),
    ));

    let watcher = Arc::new(RevocationWatcher::new(
        chain,
        policy,
        sessions.clone(),
        events,
        WatcherConfig {
            rescan_blocks: settings.rescan_blocks,
            ..WatcherConfig::default()
        },
    ));
    tokio::spawn(watcher.clone().run(shutdown_rx.clone()));
    if settings.recheck_interval.is_zero() {
        info!("Periodic tier rechecks disabled");
    } else {
        tokio::spawn(
            watcher
                .clone()
                .run_rechecks(settings.recheck_interval, shutdown_rx.clone()),
        );
    }
    tokio::spawn(run_sweeper(
        sessions.clone(),
        authenticator.clone(),
        settings.sweep_interval,
        shutdown_rx.clone(),
    ));

    let state = Arc::new(GatewayState {
        authenticator,
        sessions,
        tunnel: TunnelProfile {
            server_public_key: settings.server_public_key,
            server_endpoint: settings.server_endpoint.clone(),
            dns: settings.client_dns.clone(),
            allowed_ips: settings.client_allowed_ips.clone(),
        },
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            // Dropping the sender would stop everything.
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("Listening on: 0.0.0.0:{}", settings.port);
    api::serve(listener, state, shutdown_rx).await?;

    info!("Gateway stopped");
    Ok(())
}
