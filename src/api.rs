//! HTTP surface of the gateway.
//!
//! Every failure is rendered as `(status, {"error": <message>})` from a
//! [`GatewayError`].

use crate::auth::Authenticator;
use crate::chain::Address;
use crate::error::GatewayError;
use crate::policy::Tier;
use crate::session::{Session, SessionStore, SessionToken};
use crate::tunnel::PeerKey;
use crate::watcher::shutdown_requested;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Keepalive interval clients should configure, in seconds.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// Server-side tunnel parameters handed to every connecting client.
#[derive(Debug, Clone)]
pub struct TunnelProfile {
    pub server_public_key: PeerKey,
    pub server_endpoint: String,
    pub dns: String,
    pub allowed_ips: String,
}

pub struct GatewayState {
    pub authenticator: Arc<Authenticator>,
    pub sessions: Arc<SessionStore>,
    pub tunnel: TunnelProfile,
}

// ==================== Request/Response Types ====================

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub message: String,
    pub nonce: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub message: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub address: Address,
    pub tier: Tier,
    pub expires_at: String,
    pub session_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
    pub pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub server_public_key: String,
    pub server_endpoint: String,
    pub client_address: String,
    pub dns: String,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
    pub expires_at: String,
    pub tier: Tier,
}

/// Without `pubkey`, the whole session is ended.
#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub status: String,
    /// Whether a peer was actually released.
    pub released: bool,
    pub session_ended: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusQuery {
    pub session_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub address: Address,
    pub connected: bool,
    pub tier: Tier,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub active_peers: usize,
    pub free_addresses: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ==================== Helper Functions ====================

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn invalid_json(rejection: JsonRejection) -> GatewayError {
    GatewayError::InvalidInput(rejection.body_text())
}

/// Session token from `Authorization: Bearer`, falling back to the request.
fn session_token(headers: &HeaderMap, fallback: Option<&str>) -> Result<SessionToken, GatewayError> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    from_header
        .or(fallback.filter(|t| !t.is_empty()))
        .map(SessionToken::from)
        .ok_or_else(|| GatewayError::InvalidInput("Missing session token".to_string()))
}

/// Check that `address` owns the session behind `token`.
async fn authorize(
    state: &GatewayState,
    token: &SessionToken,
    address: &str,
) -> Result<Session, GatewayError> {
    let address: Address = address.parse()?;
    let session = state.sessions.get(token).await?;
    if session.wallet != address {
        return Err(GatewayError::Denied(format!(
            "Session does not belong to {}",
            address
        )));
    }
    Ok(session)
}

// ==================== Handlers ====================

async fn challenge(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<ChallengeRequest>, JsonRejection>,
) -> Result<Json<ChallengeResponse>, GatewayError> {
    let Json(request) = payload.map_err(invalid_json)?;
    let wallet: Address = request.address.parse()?;
    let challenge = state.authenticator.issue_challenge(wallet)?;
    Ok(Json(ChallengeResponse {
        message: challenge.message,
        nonce: challenge.nonce,
        expires_at: timestamp(challenge.expires_at),
    }))
}

async fn verify(
    State(state): State<Arc<GatewayState>>,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, GatewayError> {
    let Json(request) = payload.map_err(invalid_json)?;
    let session = state
        .authenticator
        .verify(&request.message, &request.signature)
        .await?;
    Ok(Json(VerifyResponse {
        address: session.wallet,
        tier: session.tier,
        expires_at: timestamp(session.expires_at),
        session_token: session.token.as_str().to_string(),
    }))
}

async fn connect(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<ConnectResponse>, GatewayError> {
    let Json(request) = payload.map_err(invalid_json)?;
    let token = session_token(&headers, request.session_token.as_deref())?;
    let key: PeerKey = request.pubkey.parse()?;
    authorize(&state, &token, &request.address).await?;

    let session = state.sessions.attach_peer(&token, key).await?;
    let peer = session
        .peer
        .as_ref()
        .ok_or_else(|| GatewayError::Internal("Peer binding missing after connect".to_string()))?;
    info!(
        "Session {} connected {} at {}",
        token.short(),
        peer.public_key,
        peer.client_address
    );

    Ok(Json(ConnectResponse {
        server_public_key: state.tunnel.server_public_key.to_string(),
        server_endpoint: state.tunnel.server_endpoint.clone(),
        client_address: peer.client_address.clone(),
        dns: state.tunnel.dns.clone(),
        allowed_ips: state.tunnel.allowed_ips.clone(),
        persistent_keepalive: PERSISTENT_KEEPALIVE_SECS,
        expires_at: timestamp(session.expires_at),
        tier: session.tier,
    }))
}

async fn disconnect(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    payload: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Json<DisconnectResponse>, GatewayError> {
    let Json(request) = payload.map_err(invalid_json)?;
    let token = session_token(&headers, request.session_token.as_deref())?;
    let key = request
        .pubkey
        .as_deref()
        .map(str::parse::<PeerKey>)
        .transpose()?;
    let session = authorize(&state, &token, &request.address).await?;

    let (released, session_ended) = match key {
        Some(key) => (state.sessions.detach_key(&token, &key).await?.is_some(), false),
        None => {
            state.sessions.end(&token).await?;
            (session.is_connected(), true)
        }
    };
    Ok(Json(DisconnectResponse {
        status: "ok".to_string(),
        released,
        session_ended,
    }))
}

async fn status(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, GatewayError> {
    let Query(query) = query.map_err(|e| GatewayError::InvalidInput(e.body_text()))?;
    let token = session_token(&headers, query.session_token.as_deref())?;
    let session = state.sessions.get(&token).await?;
    Ok(Json(StatusResponse {
        address: session.wallet,
        connected: session.is_connected(),
        tier: session.tier,
        expires_at: timestamp(session.expires_at),
        client_address: session.peer.map(|p| p.client_address),
    }))
}

async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let peers = state.sessions.peers();
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.active_count().await,
        active_peers: peers.active_count(),
        free_addresses: peers.free_addresses(),
    })
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/auth/challenge", post(challenge))
        .route("/auth/verify", post(verify))
        .route("/vpn/connect", post(connect))
        .route("/vpn/disconnect", post(disconnect))
        .route("/vpn/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the router on `listener` until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await
}
