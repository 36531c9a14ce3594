//! Typed HTTP client for a running gateway.

use crate::api::{
    ChallengeRequest, ChallengeResponse, ConnectRequest, ConnectResponse, DisconnectRequest,
    DisconnectResponse, ErrorResponse, HealthResponse, StatusResponse, VerifyRequest,
    VerifyResponse,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gateway error ({}): {message}", .status.as_u16())]
    Gateway { status: StatusCode, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Gateway { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    http: Client,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: &str, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        Err(ClientError::Gateway { status, message })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        token: Option<&str>,
    ) -> Result<T, ClientError> {
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Self::decode(request.send().await?).await
    }

    pub async fn challenge(&self, address: &str) -> Result<ChallengeResponse, ClientError> {
        let body = ChallengeRequest {
            address: address.to_string(),
        };
        self.post("/auth/challenge", &body, None).await
    }

    pub async fn verify(
        &self,
        message: &str,
        signature: &str,
    ) -> Result<VerifyResponse, ClientError> {
        let body = VerifyRequest {
            message: message.to_string(),
            signature: signature.to_string(),
        };
        self.post("/auth/verify", &body, None).await
    }

    pub async fn connect(
        &self,
        token: &str,
        address: &str,
        pubkey: &str,
    ) -> Result<ConnectResponse, ClientError> {
        let body = ConnectRequest {
            address: address.to_string(),
            pubkey: pubkey.to_string(),
            session_token: None,
        };
        self.post("/vpn/connect", &body, Some(token)).await
    }

    /// Release `pubkey`, or end the whole session when it is `None`.
    pub async fn disconnect(
        &self,
        token: &str,
        address: &str,
        pubkey: Option<&str>,
    ) -> Result<DisconnectResponse, ClientError> {
        let body = DisconnectRequest {
            address: address.to_string(),
            pubkey: pubkey.map(str::to_string),
            session_token: None,
        };
        self.post("/vpn/disconnect", &body, Some(token)).await
    }

    pub async fn status(&self, token: &str) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .get(self.url("/vpn/status"))
            .bearer_auth(token)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let response = self.http.get(self.url("/health")).send().await?;
        Self::decode(response).await
    }
}
