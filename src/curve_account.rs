use crate::codec::{self, DecodeError};
use crate::constants::GRADUATION_TARGET_LAMPORTS;

/// On-chain state of a bonding-curve account.
///
/// This is the authoritative source for curve completion: an account read
/// showing `complete = true` graduates the token even before its first AMM
/// trade (`TradeHandler::apply_curve_completion`). Trade events only carry
/// post-trade reserve snapshots; the curve account carries the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondingCurveAccount {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
}

// Account layout: 8-byte discriminator, five u64 reserve/supply fields,
// one completion flag.
const OFF_VIRTUAL_TOKEN: usize = 8;
const OFF_VIRTUAL_SOL: usize = 16;
const OFF_REAL_TOKEN: usize = 24;
const OFF_REAL_SOL: usize = 32;
const OFF_TOTAL_SUPPLY: usize = 40;
const OFF_COMPLETE: usize = 48;

/// Minimum account size that covers every field we read.
pub const CURVE_ACCOUNT_MIN_LEN: usize = 49;

impl BondingCurveAccount {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < CURVE_ACCOUNT_MIN_LEN {
            return Err(DecodeError::ShortInput {
                offset: 0,
                expected: CURVE_ACCOUNT_MIN_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            virtual_token_reserves: codec::read_u64_le(data, OFF_VIRTUAL_TOKEN)?,
            virtual_sol_reserves: codec::read_u64_le(data, OFF_VIRTUAL_SOL)?,
            real_token_reserves: codec::read_u64_le(data, OFF_REAL_TOKEN)?,
            real_sol_reserves: codec::read_u64_le(data, OFF_REAL_SOL)?,
            token_total_supply: codec::read_u64_le(data, OFF_TOTAL_SUPPLY)?,
            complete: codec::read_u8(data, OFF_COMPLETE)? != 0,
        })
    }

    /// A curve is done when the program says so, when it has sold out of
    /// real tokens, or when the real SOL reserves reached the graduation
    /// target.
    pub fn is_complete(&self) -> bool {
        self.complete
            || self.real_token_reserves == 0
            || self.real_sol_reserves >= GRADUATION_TARGET_LAMPORTS
    }

    #[cfg(test)]
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; CURVE_ACCOUNT_MIN_LEN];
        buf[OFF_VIRTUAL_TOKEN..OFF_VIRTUAL_TOKEN + 8]
            .copy_from_slice(&self.virtual_token_reserves.to_le_bytes());
        buf[OFF_VIRTUAL_SOL..OFF_VIRTUAL_SOL + 8]
            .copy_from_slice(&self.virtual_sol_reserves.to_le_bytes());
        buf[OFF_REAL_TOKEN..OFF_REAL_TOKEN + 8]
            .copy_from_slice(&self.real_token_reserves.to_le_bytes());
        buf[OFF_REAL_SOL..OFF_REAL_SOL + 8]
            .copy_from_slice(&self.real_sol_reserves.to_le_bytes());
        buf[OFF_TOTAL_SUPPLY..OFF_TOTAL_SUPPLY + 8]
            .copy_from_slice(&self.token_total_supply.to_le_bytes());
        buf[OFF_COMPLETE] = self.complete as u8;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_curve() -> BondingCurveAccount {
        BondingCurveAccount {
            virtual_token_reserves: 1_073_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 793_100_000_000_000,
            real_sol_reserves: 5_000_000_000,
            token_total_supply: 1_000_000_000_000_000,
            complete: false,
        }
    }

    #[test]
    fn test_decode_roundtrip() {
        let account = active_curve();
        let decoded = BondingCurveAccount::decode(&account.encode()).unwrap();
        assert_eq!(decoded, account);
        assert!(!decoded.is_complete());
    }

    #[test]
    fn test_decode_tolerates_trailing_bytes() {
        let mut buf = active_curve().encode();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(BondingCurveAccount::decode(&buf).is_ok());
    }

    #[test]
    fn test_short_account_rejected() {
        let buf = active_curve().encode();
        let err = BondingCurveAccount::decode(&buf[..48]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ShortInput {
                offset: 0,
                expected: CURVE_ACCOUNT_MIN_LEN,
                actual: 48
            }
        );
    }

    #[test]
    fn test_completion_rules() {
        let mut account = active_curve();
        account.complete = true;
        assert!(account.is_complete());

        let mut account = active_curve();
        account.real_token_reserves = 0;
        assert!(account.is_complete());

        let mut account = active_curve();
        account.real_sol_reserves = GRADUATION_TARGET_LAMPORTS;
        assert!(account.is_complete());

        account.real_sol_reserves = GRADUATION_TARGET_LAMPORTS - 1;
        assert!(!account.is_complete());
    }
}
