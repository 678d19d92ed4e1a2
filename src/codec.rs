use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Errors from the pure decoding layer. Every variant carries enough position
/// information to pinpoint the bad byte range; decoders return these instead
/// of panicking, and the pipeline counts them per event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("input too short at offset {offset}: expected {expected} bytes, have {actual}")]
    ShortInput {
        offset: usize,
        expected: usize,
        actual: usize,
    },
    #[error("invalid base58 key: {0}")]
    Base58(String),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("is_buy flag out of range: {0}")]
    IsBuyRange(u8),
}

/// Read a little-endian u64 at `offset`.
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64, DecodeError> {
    let end = offset.checked_add(8).ok_or(DecodeError::ShortInput {
        offset,
        expected: 8,
        actual: 0,
    })?;
    if data.len() < end {
        return Err(DecodeError::ShortInput {
            offset,
            expected: 8,
            actual: data.len().saturating_sub(offset),
        });
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..end]);
    Ok(u64::from_le_bytes(buf))
}

/// Read a single byte at `offset`.
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, DecodeError> {
    data.get(offset).copied().ok_or(DecodeError::ShortInput {
        offset,
        expected: 1,
        actual: 0,
    })
}

/// Read a 32-byte public key at `offset`.
pub fn read_pubkey(data: &[u8], offset: usize) -> Result<Pubkey, DecodeError> {
    let end = offset.checked_add(32).ok_or(DecodeError::ShortInput {
        offset,
        expected: 32,
        actual: 0,
    })?;
    if data.len() < end {
        return Err(DecodeError::ShortInput {
            offset,
            expected: 32,
            actual: data.len().saturating_sub(offset),
        });
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&data[offset..end]);
    Ok(Pubkey::new_from_array(buf))
}

/// Decode a base58 string into a 32-byte public key.
pub fn decode_base58_key(s: &str) -> Result<Pubkey, DecodeError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| DecodeError::Base58(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(DecodeError::Base58(format!(
            "decoded to {} bytes, expected 32",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&bytes);
    Ok(Pubkey::new_from_array(buf))
}

/// Encode a 32-byte public key as base58.
pub fn encode_base58_key(key: &Pubkey) -> String {
    bs58::encode(key.as_ref()).into_string()
}

/// Decode the base64 payload of a "Program data:" log line.
pub fn decode_program_data(payload: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

/// Compare the 8-byte discriminator prefix of `data` against `expected`.
/// Data shorter than 8 bytes never matches.
pub fn discriminator_matches(data: &[u8], expected: &[u8; 8]) -> bool {
    data.len() >= 8 && &data[..8] == expected
}
