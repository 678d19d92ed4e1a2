use solana_sdk::pubkey::Pubkey;

use crate::codec::{self, DecodeError};
use crate::constants::TRADE_EVENT_LEN;

/// A bonding-curve trade event as emitted in a "Program data:" log line.
///
/// All four reserve figures are post-trade snapshots of the curve, not deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeEvent {
    pub mint: Pubkey,
    /// Lamports moved by the trade
    pub sol_amount: u64,
    /// Raw token units moved by the trade
    pub token_amount: u64,
    pub is_buy: bool,
    pub user: Pubkey,
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
}

// Field offsets within the 225-byte payload. The trailing bytes past the
// last reserve are fee/accounting fields this pipeline does not consume.
const OFF_MINT: usize = 8;
const OFF_SOL_AMOUNT: usize = 40;
const OFF_TOKEN_AMOUNT: usize = 48;
const OFF_IS_BUY: usize = 56;
const OFF_USER: usize = 57;
const OFF_VIRTUAL_TOKEN: usize = 89;
const OFF_VIRTUAL_SOL: usize = 97;
const OFF_REAL_TOKEN: usize = 105;
const OFF_REAL_SOL: usize = 113;

impl TradeEvent {
    /// Decode a trade event from a program-data payload.
    ///
    /// Returns `Ok(None)` unless the buffer is exactly 225 bytes: the length
    /// gate is the admission test, so unrelated program-data frames are
    /// rejected before any field reads. The 8-byte event discriminator is not
    /// checked. An is_buy byte outside {0, 1} is a decode error.
    pub fn decode(data: &[u8]) -> Result<Option<TradeEvent>, DecodeError> {
        if data.len() != TRADE_EVENT_LEN {
            return Ok(None);
        }

        let is_buy = match codec::read_u8(data, OFF_IS_BUY)? {
            0 => false,
            1 => true,
            other => return Err(DecodeError::IsBuyRange(other)),
        };

        Ok(Some(TradeEvent {
            mint: codec::read_pubkey(data, OFF_MINT)?,
            sol_amount: codec::read_u64_le(data, OFF_SOL_AMOUNT)?,
            token_amount: codec::read_u64_le(data, OFF_TOKEN_AMOUNT)?,
            is_buy,
            user: codec::read_pubkey(data, OFF_USER)?,
            virtual_token_reserves: codec::read_u64_le(data, OFF_VIRTUAL_TOKEN)?,
            virtual_sol_reserves: codec::read_u64_le(data, OFF_VIRTUAL_SOL)?,
            real_token_reserves: codec::read_u64_le(data, OFF_REAL_TOKEN)?,
            real_sol_reserves: codec::read_u64_le(data, OFF_REAL_SOL)?,
        }))
    }

    /// Encode into the 225-byte wire layout. The discriminator and the
    /// unparsed tail are zeroed; `decode(encode(e))` returns `e`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TRADE_EVENT_LEN];
        buf[OFF_MINT..OFF_MINT + 32].copy_from_slice(self.mint.as_ref());
        buf[OFF_SOL_AMOUNT..OFF_SOL_AMOUNT + 8].copy_from_slice(&self.sol_amount.to_le_bytes());
        buf[OFF_TOKEN_AMOUNT..OFF_TOKEN_AMOUNT + 8]
            .copy_from_slice(&self.token_amount.to_le_bytes());
        buf[OFF_IS_BUY] = self.is_buy as u8;
        buf[OFF_USER..OFF_USER + 32].copy_from_slice(self.user.as_ref());
        buf[OFF_VIRTUAL_TOKEN..OFF_VIRTUAL_TOKEN + 8]
            .copy_from_slice(&self.virtual_token_reserves.to_le_bytes());
        buf[OFF_VIRTUAL_SOL..OFF_VIRTUAL_SOL + 8]
            .copy_from_slice(&self.virtual_sol_reserves.to_le_bytes());
        buf[OFF_REAL_TOKEN..OFF_REAL_TOKEN + 8]
            .copy_from_slice(&self.real_token_reserves.to_le_bytes());
        buf[OFF_REAL_SOL..OFF_REAL_SOL + 8]
            .copy_from_slice(&self.real_sol_reserves.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> TradeEvent {
        TradeEvent {
            mint: Pubkey::new_unique(),
            sol_amount: 1_500_000_000,
            token_amount: 52_000_000_000_000,
            is_buy: true,
            user: Pubkey::new_unique(),
            virtual_token_reserves: 1_073_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 793_100_000_000_000,
            real_sol_reserves: 5_000_000_000,
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let event = sample_event();
        let buf = event.encode();
        assert_eq!(buf.len(), TRADE_EVENT_LEN);
        let decoded = TradeEvent::decode(&buf).unwrap().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_length_gate() {
        let buf = sample_event().encode();

        let short = &buf[..TRADE_EVENT_LEN - 1];
        assert_eq!(TradeEvent::decode(short).unwrap(), None);

        let mut long = buf.clone();
        long.push(0);
        assert_eq!(TradeEvent::decode(&long).unwrap(), None);

        assert_eq!(TradeEvent::decode(&[]).unwrap(), None);
    }

    #[test]
    fn test_sell_side() {
        let mut event = sample_event();
        event.is_buy = false;
        let decoded = TradeEvent::decode(&event.encode()).unwrap().unwrap();
        assert!(!decoded.is_buy);
    }

    #[test]
    fn test_is_buy_out_of_range() {
        let mut buf = sample_event().encode();
        buf[OFF_IS_BUY] = 7;
        assert_eq!(
            TradeEvent::decode(&buf).unwrap_err(),
            DecodeError::IsBuyRange(7)
        );
    }

    #[test]
    fn test_discriminator_is_not_checked() {
        let mut buf = sample_event().encode();
        buf[..8].copy_from_slice(&[0xff; 8]);
        assert!(TradeEvent::decode(&buf).unwrap().is_some());
    }
}
