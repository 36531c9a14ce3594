//! Authentication Protocol.
//!
//! `issue_challenge` hands a wallet a message to sign; `verify` recovers the
//! signer, consumes the challenge, asks the access policy for a tier and
//! opens a session. The recovered signer is authoritative: the address a
//! client claims is only used to find the challenge.

pub mod challenge;
pub mod signature;

pub use challenge::{Challenge, ChallengeMessage, ChallengeStore};
pub use signature::{decode_signature, recover_signer, sign_personal_message, SignatureError};

use crate::chain::Address;
use crate::events::{EventPublisher, GatewayEvent};
use crate::policy::{AccessPolicy, PolicyError};
use crate::session::{Session, SessionStore};
use chrono::{DateTime, Utc};
use log::warn;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Malformed challenge message: {0}")]
    MalformedMessage(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(SignatureError),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Challenge not found or already used")]
    ChallengeNotFound,

    #[error("Challenge expired")]
    ChallengeExpired,

    #[error("Too many outstanding challenges for {0}")]
    RateLimited(Address),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub struct Authenticator {
    challenges: ChallengeStore,
    policy: Arc<AccessPolicy>,
    sessions: Arc<SessionStore>,
    events: Arc<EventPublisher>,
}

impl Authenticator {
    pub fn new(
        challenges: ChallengeStore,
        policy: Arc<AccessPolicy>,
        sessions: Arc<SessionStore>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            challenges,
            policy,
            sessions,
            events,
        }
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    pub fn issue_challenge(&self, wallet: Address) -> Result<Challenge, AuthError> {
        self.challenges.issue(wallet, Utc::now())
    }

    pub async fn verify(&self, message: &str, signature: &str) -> Result<Session, AuthError> {
        self.verify_at(message, signature, Utc::now()).await
    }

    /// [`Authenticator::verify`] against an explicit clock.
    pub async fn verify_at(
        &self,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let parsed = ChallengeMessage::parse(message)?;

        // Consumed here, whatever the outcome below.
        let challenge = self
            .challenges
            .take(&parsed.address, &parsed.nonce)
            .ok_or_else(|| {
                warn!(
                    "Unknown or replayed challenge nonce for {}",
                    parsed.address
                );
                AuthError::ChallengeNotFound
            })?;
        if challenge.message != message {
            warn!("Challenge message for {} was altered", challenge.wallet);
            return Err(AuthError::MalformedMessage(
                "message does not match the issued challenge".to_string(),
            ));
        }
        if challenge.is_expired(now) {
            return Err(AuthError::ChallengeExpired);
        }

        let bytes = decode_signature(signature).map_err(AuthError::MalformedSignature)?;
        let signer = recover_signer(message, &bytes).map_err(|e| {
            warn!("Signature recovery failed for {}: {}", challenge.wallet, e);
            AuthError::InvalidSignature(e.to_string())
        })?;
        if signer != challenge.wallet {
            warn!(
                "Challenge for {} was signed by {}",
                challenge.wallet, signer
            );
            return Err(AuthError::InvalidSignature(
                "signer does not match the challenged address".to_string(),
            ));
        }

        let decision = match self.policy.evaluate(signer).await {
            Ok(decision) => decision,
            Err(e) => {
                if let PolicyError::Denied(_) = e {
                    self.events.emit(GatewayEvent::AccessDenied {
                        wallet: signer,
                        reason: e.to_string(),
                        timestamp: GatewayEvent::now(),
                    });
                }
                return Err(e.into());
            }
        };
        Ok(self.sessions.create(&decision).await)
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("challenges", &self.challenges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryChain, TokenId};
    use crate::policy::{Tier, TierRules};
    use crate::session::SessionLifetimes;
    use crate::tunnel::{MemoryBackend, PeerManager};
    use k256::ecdsa::SigningKey;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<MemoryChain>,
        auth: Authenticator,
        key: SigningKey,
        wallet: Address,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new());
        let policy = Arc::new(AccessPolicy::new(
            chain.clone(),
            TierRules {
                free_tier: TokenId::from(0u64),
                paid_tier: vec![TokenId::from(1u64)],
            },
        ));
        let events = Arc::new(EventPublisher::new());
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
        let auth = Authenticator::new(
            ChallengeStore::new("vpn.example.org", Duration::from_secs(300), 5),
            policy,
            sessions,
            events,
        );
        let key = SigningKey::from_slice(&[0x42; 32]).unwrap();
        let wallet = signature::address_of(key.verifying_key());
        Fixture {
            chain,
            auth,
            key,
            wallet,
        }
    }

    #[tokio::test]
    async fn test_verify_opens_session() {
        let f = fixture();
        f.chain.mint(f.wallet, TokenId::from(0u64));

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        let session = f.auth.verify(&challenge.message, &sig).await.unwrap();

        assert_eq!(session.wallet, f.wallet);
        assert_eq!(session.tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let f = fixture();
        f.chain.mint(f.wallet, TokenId::from(1u64));

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        assert!(f.auth.verify(&challenge.message, &sig).await.is_ok());
        assert!(matches!(
            f.auth.verify(&challenge.message, &sig).await,
            Err(AuthError::ChallengeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_signature_from_other_key_is_invalid() {
        let f = fixture();
        f.chain.mint(f.wallet, TokenId::from(0u64));
        let impostor = SigningKey::from_slice(&[0x43; 32]).unwrap();

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&impostor, &challenge.message).unwrap();
        assert!(matches!(
            f.auth.verify(&challenge.message, &sig).await,
            Err(AuthError::InvalidSignature(_))
        ));

        // The failed attempt consumed the challenge.
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        assert!(matches!(
            f.auth.verify(&challenge.message, &sig).await,
            Err(AuthError::ChallengeNotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_challenge() {
        let f = fixture();
        f.chain.mint(f.wallet, TokenId::from(0u64));

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        let later = challenge.expires_at + chrono::Duration::seconds(1);
        assert!(matches!(
            f.auth.verify_at(&challenge.message, &sig, later).await,
            Err(AuthError::ChallengeExpired)
        ));
    }

    #[tokio::test]
    async fn test_altered_message_is_rejected() {
        let f = fixture();
        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let altered = challenge.message.replace("Version: 1", "Version: 2");
        let sig = sign_personal_message(&f.key, &altered).unwrap();
        assert!(matches!(
            f.auth.verify(&altered, &sig).await,
            Err(AuthError::MalformedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_denied_wallet_gets_no_session() {
        let f = fixture();
        let mut events = f.auth.events.subscribe();

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        assert!(matches!(
            f.auth.verify(&challenge.message, &sig).await,
            Err(AuthError::Policy(PolicyError::Denied(_)))
        ));
        assert_eq!(f.auth.sessions.active_count().await, 0);
        assert_eq!(events.recv().await.unwrap().event_type(), "access_denied");
    }

    #[tokio::test]
    async fn test_chain_outage_is_unavailable() {
        let f = fixture();
        f.chain.mint(f.wallet, TokenId::from(0u64));
        f.chain.set_available(false);

        let challenge = f.auth.issue_challenge(f.wallet).unwrap();
        let sig = sign_personal_message(&f.key, &challenge.message).unwrap();
        assert!(matches!(
            f.auth.verify(&challenge.message, &sig).await,
            Err(AuthError::Policy(PolicyError::EvaluationUnavailable(_)))
        ));
    }
}
