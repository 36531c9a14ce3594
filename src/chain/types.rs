//! Types shared by the chain reader, the policy evaluator and the watcher.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing addresses and token ids from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Address must be 0x followed by 40 hex digits: {0}")]
    InvalidAddress(String),

    #[error("Invalid token id: {0}")]
    InvalidTokenId(String),
}

/// A 20-byte account address.
///
/// Parsed case-insensitively from `0x`-prefixed hex and always rendered
/// lowercase, so two spellings of the same account compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Build an address from the low 20 bytes of a 32-byte ABI word.
    pub fn from_word(word: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Address(bytes)
    }

    /// Left-pad the address into a 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
        if digits.len() != 40 {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }
        let bytes = hex::decode(digits).map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 256-bit token identifier, stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    pub fn from_word(word: &[u8; 32]) -> Self {
        TokenId(*word)
    }

    pub fn to_word(&self) -> [u8; 32] {
        self.0
    }
}

impl From<u128> for TokenId {
    fn from(value: u128) -> Self {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        TokenId(word)
    }
}

impl From<u64> for TokenId {
    fn from(value: u64) -> Self {
        TokenId::from(value as u128)
    }
}

impl FromStr for TokenId {
    type Err = ParseError;

    /// Accepts decimal (up to `u128::MAX`) or `0x` hex (up to 32 bytes).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(digits) = trimmed.strip_prefix("0x") {
            if digits.is_empty() || digits.len() > 64 {
                return Err(ParseError::InvalidTokenId(s.to_string()));
            }
            let padded = format!("{:0>64}", digits);
            let bytes =
                hex::decode(padded).map_err(|_| ParseError::InvalidTokenId(s.to_string()))?;
            let mut word = [0u8; 32];
            word.copy_from_slice(&bytes);
            return Ok(TokenId(word));
        }
        trimmed
            .parse::<u128>()
            .map(TokenId::from)
            .map_err(|_| ParseError::InvalidTokenId(s.to_string()))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0[..16].iter().all(|b| *b == 0) {
            let mut low = [0u8; 16];
            low.copy_from_slice(&self.0[16..]);
            write!(f, "{}", u128::from_be_bytes(low))
        } else {
            write!(f, "0x{}", hex::encode(self.0))
        }
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self)
    }
}

impl Serialize for TokenId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What happened on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventKind {
    /// Access tokens moved between two accounts. Mints have a zero `from`,
    /// burns a zero `to`.
    Transfer {
        from: Address,
        to: Address,
        token_ids: Vec<TokenId>,
    },

    /// A delegation from `delegator` to `delegate` was granted or revoked.
    Delegation { delegator: Address, delegate: Address },
}

/// A decoded event together with the block it was included in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub kind: ChainEventKind,
}

impl ChainEvent {
    pub fn transfer(block_number: u64, from: Address, to: Address, token_ids: Vec<TokenId>) -> Self {
        Self {
            block_number,
            kind: ChainEventKind::Transfer {
                from,
                to,
                token_ids,
            },
        }
    }

    pub fn delegation(block_number: u64, delegator: Address, delegate: Address) -> Self {
        Self {
            block_number,
            kind: ChainEventKind::Delegation {
                delegator,
                delegate,
            },
        }
    }

    /// Non-zero accounts whose access may have changed because of this event.
    ///
    /// For transfers this is sender and receiver. For delegation changes it is
    /// the delegate only: the delegator's own holdings are untouched.
    pub fn affected_wallets(&self) -> Vec<Address> {
        let candidates = match &self.kind {
            ChainEventKind::Transfer { from, to, .. } => vec![*from, *to],
            ChainEventKind::Delegation { delegate, .. } => vec![*delegate],
        };
        let mut out: Vec<Address> = candidates.into_iter().filter(|a| !a.is_zero()).collect();
        out.dedup();
        out
    }
}
