//! Challenge messages and the store of outstanding challenges.

use crate::auth::AuthError;
use crate::chain::Address;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::debug;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Mutex;

const NONCE_BYTES: usize = 16;
const STATEMENT: &str = "Sign in to connect to the VPN gateway.";
const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";

/// The human-readable text a wallet signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub domain: String,
    pub address: Address,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeMessage {
    pub fn render(&self) -> String {
        format!(
            "{domain}{HEADER_SUFFIX}\n{address}\n\n{STATEMENT}\n\nURI: https://{domain}\nVersion: 1\nNonce: {nonce}\nIssued At: {issued}\nExpiration Time: {expires}",
            domain = self.domain,
            address = self.address,
            nonce = self.nonce,
            issued = self.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            expires = self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    /// Extract the fields Verify needs. Tolerates `\r\n` line endings but
    /// otherwise expects the layout produced by [`ChallengeMessage::render`].
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let mut lines = text.lines();

        let header = lines
            .next()
            .ok_or_else(|| malformed("empty message"))?;
        let domain = header
            .strip_suffix(HEADER_SUFFIX)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| malformed("missing sign-in header"))?;

        let address = lines
            .next()
            .ok_or_else(|| malformed("missing address line"))?
            .trim()
            .parse::<Address>()
            .map_err(|e| malformed(&e.to_string()))?;

        let mut nonce = None;
        let mut issued_at = None;
        let mut expires_at = None;
        for line in lines {
            if let Some(value) = line.strip_prefix("Nonce: ") {
                nonce = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Issued At: ") {
                issued_at = Some(parse_time(value)?);
            } else if let Some(value) = line.strip_prefix("Expiration Time: ") {
                expires_at = Some(parse_time(value)?);
            }
        }

        Ok(Self {
            domain: domain.to_string(),
            address,
            nonce: nonce
                .filter(|n| !n.is_empty())
                .ok_or_else(|| malformed("missing nonce"))?,
            issued_at: issued_at.ok_or_else(|| malformed("missing issued-at"))?,
            expires_at: expires_at.ok_or_else(|| malformed("missing expiration time"))?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(&format!("bad timestamp: {}", e)))
}

fn malformed(reason: &str) -> AuthError {
    AuthError::MalformedMessage(reason.to_string())
}

/// A pending challenge. Owned by the [`ChallengeStore`] until consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub nonce: String,
    pub wallet: Address,
    pub message: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outstanding challenges, keyed by wallet then nonce.
pub struct ChallengeStore {
    domain: String,
    ttl: Duration,
    max_pending: usize,
    pending: Mutex<HashMap<Address, Vec<Challenge>>>,
}

impl ChallengeStore {
    pub fn new(domain: impl Into<String>, ttl: std::time::Duration, max_pending: usize) -> Self {
        Self {
            domain: domain.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
            max_pending: max_pending.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Vec<Challenge>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create and remember a challenge for `wallet`. Expired challenges do
    /// not count against the per-wallet limit.
    pub fn issue(&self, wallet: Address, now: DateTime<Utc>) -> Result<Challenge, AuthError> {
        let mut pending = self.lock();
        let outstanding = pending.entry(wallet).or_default();
        outstanding.retain(|c| !c.is_expired(now));
        if outstanding.len() >= self.max_pending {
            return Err(AuthError::RateLimited(wallet));
        }

        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let message = ChallengeMessage {
            domain: self.domain.clone(),
            address: wallet,
            nonce: hex::encode(nonce),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let challenge = Challenge {
            nonce: message.nonce.clone(),
            wallet,
            message: message.render(),
            issued_at: message.issued_at,
            expires_at: message.expires_at,
        };
        outstanding.push(challenge.clone());
        debug!(
            "Issued challenge for {} ({} outstanding)",
            wallet,
            outstanding.len()
        );
        Ok(challenge)
    }

    /// Remove and return the challenge, whatever happens next.
    pub fn take(&self, wallet: &Address, nonce: &str) -> Option<Challenge> {
        let mut pending = self.lock();
        let outstanding = pending.get_mut(wallet)?;
        let index = outstanding.iter().position(|c| c.nonce == nonce)?;
        let challenge = outstanding.swap_remove(index);
        if outstanding.is_empty() {
            pending.remove(wallet);
        }
        Some(challenge)
    }

    /// Drop expired challenges. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut pending = self.lock();
        let mut removed = 0;
        pending.retain(|_, outstanding| {
            let before = outstanding.len();
            outstanding.retain(|c| !c.is_expired(now));
            removed += before - outstanding.len();
            !outstanding.is_empty()
        });
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("domain", &self.domain)
            .field("ttl", &self.ttl)
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ChallengeStore {
        ChallengeStore::new("vpn.example.org", std::time::Duration::from_secs(300), 2)
    }

    fn wallet() -> Address {
        "0x00000000000000000000000000000000000abc00".parse().unwrap()
    }

    #[test]
    fn test_message_layout() {
        let now = DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let message = ChallengeMessage {
            domain: "vpn.example.org".to_string(),
            address: wallet(),
            nonce: "n1".to_string(),
            issued_at: now,
            expires_at: now + Duration::seconds(300),
        };
        let expected = "vpn.example.org wants you to sign in with your Ethereum account:\n\
0x00000000000000000000000000000000000abc00\n\
\n\
Sign in to connect to the VPN gateway.\n\
\n\
URI: https://vpn.example.org\n\
Version: 1\n\
Nonce: n1\n\
Issued At: 2026-10-19T12:00:00Z\n\
Expiration Time: 2026-10-19T12:05:00Z";
        assert_eq!(message.render(), expected);
        assert_eq!(ChallengeMessage::parse(expected).unwrap(), message);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            ChallengeMessage::parse("hello"),
            Err(AuthError::MalformedMessage(_))
        ));
        let no_nonce = "d wants you to sign in with your Ethereum account:\n\
0x00000000000000000000000000000000000abc00\n\
Issued At: 2026-10-19T12:00:00Z\n\
Expiration Time: 2026-10-19T12:05:00Z";
        assert!(matches!(
            ChallengeMessage::parse(no_nonce),
            Err(AuthError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_issue_and_take_once() {
        let store = store();
        let challenge = store.issue(wallet(), Utc::now()).unwrap();
        assert_eq!(challenge.nonce.len(), NONCE_BYTES * 2);

        assert!(store.take(&wallet(), &challenge.nonce).is_some());
        assert!(store.take(&wallet(), &challenge.nonce).is_none());
    }

    #[test]
    fn test_rate_limit_per_wallet() {
        let store = store();
        let now = Utc::now();
        store.issue(wallet(), now).unwrap();
        store.issue(wallet(), now).unwrap();
        assert!(matches!(
            store.issue(wallet(), now),
            Err(AuthError::RateLimited(_))
        ));

        // Another wallet is unaffected.
        store.issue(Address([0x11; 20]), now).unwrap();

        // Expired challenges free up the slots.
        let later = now + Duration::seconds(301);
        assert!(store.issue(wallet(), later).is_ok());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let store = store();
        let now = Utc::now();
        store.issue(wallet(), now).unwrap();
        store.issue(Address([0x11; 20]), now).unwrap();
        assert_eq!(store.sweep(now), 0);
        assert_eq!(store.sweep(now + Duration::seconds(300)), 2);
        assert_eq!(store.pending_count(), 0);
    }
}
