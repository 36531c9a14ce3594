//! Personal-message signatures (`personal_sign`).
//!
//! The signer is always recovered from the signature; a client-supplied
//! address is never trusted.

use crate::chain::abi::keccak256;
use crate::chain::Address;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// `r ‖ s ‖ v`
pub const SIGNATURE_LENGTH: usize = 65;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Signature is not valid hex")]
    NotHex,

    #[error("Signature must be {SIGNATURE_LENGTH} bytes, got {0}")]
    BadLength(usize),

    #[error("Invalid recovery id {0}")]
    BadRecoveryId(u8),

    #[error("Malformed signature scalars")]
    Malformed,

    #[error("Public key recovery failed")]
    RecoveryFailed,
}

/// Hash `message` the way wallets do for `personal_sign`:
/// `keccak256("\x19Ethereum Signed Message:\n" ‖ len ‖ message)`.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Decode a hex signature, with or without `0x`.
pub fn decode_signature(signature: &str) -> Result<[u8; SIGNATURE_LENGTH], SignatureError> {
    let trimmed = signature.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|_| SignatureError::NotHex)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::BadLength(bytes.len()))
}

/// Recover the address that signed `message`.
pub fn recover_signer(
    message: &str,
    signature: &[u8; SIGNATURE_LENGTH],
) -> Result<Address, SignatureError> {
    let hash = personal_message_hash(message.as_bytes());

    let v = signature[64];
    let recovery_byte = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(SignatureError::BadRecoveryId(other)),
    };
    let mut recovery_id =
        RecoveryId::from_byte(recovery_byte).ok_or(SignatureError::BadRecoveryId(v))?;

    let mut sig = Signature::from_slice(&signature[..64]).map_err(|_| SignatureError::Malformed)?;
    // Low-s form flips the parity of R's y coordinate.
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
    }

    let key = VerifyingKey::recover_from_prehash(&hash, &sig, recovery_id)
        .map_err(|_| SignatureError::RecoveryFailed)?;
    Ok(address_of(&key))
}

/// Account address of a secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let public_key = k256::PublicKey::from(key);
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address(bytes)
}

/// Wallet-side counterpart of [`recover_signer`]: sign `message` and return
/// `0x`-prefixed hex with `v` in {27, 28}. Used by tooling and tests.
pub fn sign_personal_message(key: &SigningKey, message: &str) -> Result<String, SignatureError> {
    let hash = personal_message_hash(message.as_bytes());
    let (sig, recovery_id) = key
        .sign_prehash_recoverable(&hash)
        .map_err(|_| SignatureError::Malformed)?;
    let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
    out.extend_from_slice(&sig.to_bytes());
    out.push(27 + recovery_id.to_byte());
    Ok(format!("0x{}", hex::encode(out)))
}
