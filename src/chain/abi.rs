//! Minimal contract ABI codec.
//!
//! Only the shapes the gateway reads are supported: static argument lists,
//! dynamic arrays of static elements, and 32-byte words.

use crate::chain::error::ChainError;
use sha3::{Digest, Keccak256};

pub const WORD: usize = 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Four-byte function selector for a canonical signature such as
/// `balanceOf(address,uint256)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic0 for a canonical event signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// Encode a call with static arguments.
pub fn encode_call(signature: &str, args: &[[u8; 32]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.len() * WORD);
    out.extend_from_slice(&selector(signature));
    for arg in args {
        out.extend_from_slice(arg);
    }
    out
}

/// Read the word at `index` (in words, not bytes).
pub fn word(data: &[u8], index: usize) -> Result<[u8; 32], ChainError> {
    let (start, end) = index
        .checked_mul(WORD)
        .and_then(|start| Some((start, start.checked_add(WORD)?)))
        .ok_or_else(|| ChainError::DecodeError("word index overflow".to_string()))?;
    if data.len() < end {
        return Err(ChainError::DecodeError(format!(
            "need {} bytes, have {}",
            end,
            data.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&data[start..end]);
    Ok(out)
}

/// Interpret a word as an offset or length.
pub fn word_to_usize(word: &[u8; 32]) -> Result<usize, ChainError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(ChainError::DecodeError("length does not fit in u64".to_string()));
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(low))
        .map_err(|_| ChainError::DecodeError("length does not fit in usize".to_string()))
}

pub fn is_nonzero(word: &[u8; 32]) -> bool {
    word.iter().any(|b| *b != 0)
}

/// Decode a dynamic array of static elements whose head sits at word
/// `head_index`. Each returned slice is `stride_words` words long.
pub fn dynamic_array(
    data: &[u8],
    head_index: usize,
    stride_words: usize,
) -> Result<Vec<&[u8]>, ChainError> {
    let offset = word_to_usize(&word(data, head_index)?)?;
    if offset % WORD != 0 {
        return Err(ChainError::DecodeError(format!("unaligned array offset {}", offset)));
    }
    let len_index = offset / WORD;
    let len = word_to_usize(&word(data, len_index)?)?;
    let overflow = || ChainError::DecodeError("array length overflow".to_string());
    let body_start = offset.checked_add(WORD).ok_or_else(overflow)?;
    let stride = stride_words.checked_mul(WORD).ok_or_else(overflow)?;
    let body_end = len
        .checked_mul(stride)
        .and_then(|body_len| body_start.checked_add(body_len))
        .ok_or_else(overflow)?;
    if data.len() < body_end {
        return Err(ChainError::DecodeError(format!(
            "array of {} elements truncated",
            len
        )));
    }
    Ok((0..len)
        .map(|i| &data[body_start + i * stride..body_start + (i + 1) * stride])
        .collect())
}

/// Parse `0x`-prefixed hex from a JSON-RPC payload.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, ChainError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.len() % 2 == 1 {
        return hex::decode(format!("0{}", digits))
            .map_err(|e| ChainError::DecodeError(e.to_string()));
    }
    hex::decode(digits).map_err(|e| ChainError::DecodeError(e.to_string()))
}

/// Parse a JSON-RPC quantity such as `0x1b4`.
pub fn decode_quantity(value: &str) -> Result<u64, ChainError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| ChainError::DecodeError(e.to_string()))
}

pub fn encode_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn encode_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_selectors() {
        assert_eq!(hex::encode(selector("balanceOf(address,uint256)")), "00fdd58e");
        assert_eq!(
            hex::encode(event_topic("Transfer(address,address,uint256)")),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_dynamic_array_of_words() {
        let mut data = Vec::new();
        let mut offset = [0u8; 32];
        offset[31] = 0x20;
        data.extend_from_slice(&offset);
        let mut len = [0u8; 32];
        len[31] = 2;
        data.extend_from_slice(&len);
        data.extend_from_slice(&[0x11; 32]);
        data.extend_from_slice(&[0x22; 32]);

        let items = dynamic_array(&data, 0, 1).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], &[0x22; 32][..]);
    }

    #[test]
    fn test_truncated_array_is_decode_error() {
        let mut data = Vec::new();
        let mut offset = [0u8; 32];
        offset[31] = 0x20;
        data.extend_from_slice(&offset);
        let mut len = [0u8; 32];
        len[31] = 3;
        data.extend_from_slice(&len);
        data.extend_from_slice(&[0x11; 32]);

        assert!(matches!(
            dynamic_array(&data, 0, 1),
            Err(ChainError::DecodeError(_))
        ));
    }

    fn length_word(len: u64) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&len.to_be_bytes());
        word
    }

    #[test]
    fn test_huge_array_length_is_decode_error() {
        let mut data = Vec::new();
        data.extend_from_slice(&length_word(0x20));
        data.extend_from_slice(&length_word((usize::MAX / WORD) as u64));
        data.extend_from_slice(&[0x11; 32]);

        assert!(matches!(
            dynamic_array(&data, 0, 1),
            Err(ChainError::DecodeError(_))
        ));
        assert!(matches!(
            dynamic_array(&data, 0, 7),
            Err(ChainError::DecodeError(_))
        ));
    }

    #[test]
    fn test_huge_array_offset_is_decode_error() {
        let offset = (usize::MAX - (WORD - 1)) as u64;
        let data = length_word(offset);

        assert!(matches!(
            dynamic_array(&data, 0, 1),
            Err(ChainError::DecodeError(_))
        ));
        assert!(matches!(word(&data, usize::MAX / WORD), Err(ChainError::DecodeError(_))));
    }

    #[test]
    fn test_quantity_and_hex_helpers() {
        assert_eq!(decode_quantity("0x1b4").unwrap(), 436);
        assert_eq!(encode_quantity(436), "0x1b4");
        assert_eq!(decode_hex("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(decode_hex("0x0").unwrap(), vec![0]);
    }
}
