//! Gateway error taxonomy and its HTTP status mapping.

use crate::auth::AuthError;
use crate::chain::ParseError;
use crate::policy::PolicyError;
use crate::session::SessionError;
use crate::tunnel::PeerError;
use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidSignature(String),

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Challenge not found or already used")]
    ChallengeNotFound,

    #[error("{0}")]
    Denied(String),

    #[error("{0}")]
    EvaluationUnavailable(String),

    #[error("Tunnel address pool exhausted")]
    PoolExhausted,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidSignature(_)
            | GatewayError::ChallengeExpired
            | GatewayError::ChallengeNotFound => StatusCode::UNAUTHORIZED,
            GatewayError::Denied(_) => StatusCode::FORBIDDEN,
            GatewayError::EvaluationUnavailable(_) | GatewayError::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Infrastructure trouble a client may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::EvaluationUnavailable(_) | GatewayError::PoolExhausted
        )
    }
}

impl From<ParseError> for GatewayError {
    fn from(e: ParseError) -> Self {
        GatewayError::InvalidInput(e.to_string())
    }
}

impl From<PolicyError> for GatewayError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Denied(_) => GatewayError::Denied(e.to_string()),
            PolicyError::EvaluationUnavailable(_) => {
                GatewayError::EvaluationUnavailable(e.to_string())
            }
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MalformedMessage(_) | AuthError::MalformedSignature(_) => {
                GatewayError::InvalidInput(e.to_string())
            }
            AuthError::InvalidSignature(_) => GatewayError::InvalidSignature(e.to_string()),
            AuthError::ChallengeNotFound => GatewayError::ChallengeNotFound,
            AuthError::ChallengeExpired => GatewayError::ChallengeExpired,
            AuthError::RateLimited(_) => GatewayError::RateLimited(e.to_string()),
            AuthError::Policy(policy) => policy.into(),
        }
    }
}

impl From<PeerError> for GatewayError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::InvalidKey(_) => GatewayError::InvalidInput(e.to_string()),
            PeerError::PoolExhausted => GatewayError::PoolExhausted,
            PeerError::KeyInUse => GatewayError::Denied(e.to_string()),
            PeerError::Backend(_) => GatewayError::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => GatewayError::NotFound(e.to_string()),
            SessionError::Denied(reason) => GatewayError::Denied(reason),
            SessionError::Peer(peer) => peer.into(),
        }
    }
}
