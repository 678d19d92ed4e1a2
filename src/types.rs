use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

/// Venue a token currently trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    BondingCurve,
    AmmPool,
}

impl ProgramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramKind::BondingCurve => "bonding_curve",
            ProgramKind::AmmPool => "amm_pool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bonding_curve" => Some(ProgramKind::BondingCurve),
            "amm_pool" => Some(ProgramKind::AmmPool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// Token identity. Immutable once set; the pool reference is assigned at
/// graduation and never after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mint {
    pub address: Pubkey,
    pub first_seen_slot: u64,
    pub first_seen_at: DateTime<Utc>,
    pub creator: Option<Pubkey>,
    pub bonding_curve: Option<Pubkey>,
    pub pool: Option<Pubkey>,
}

/// Per-mint aggregate mutated only by the trade handler.
///
/// Invariants: `graduated_to_amm` never reverts to false, `current_program`
/// only moves bonding_curve → amm_pool, and `threshold_crossed_at` is set at
/// most once. Reserves stay u64 end to end; only the derived price fields are
/// floating point.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenState {
    pub mint: Mint,
    pub first_program: ProgramKind,
    pub current_program: ProgramKind,

    pub first_price_sol: f64,
    pub first_price_usd: f64,
    pub first_market_cap_usd: f64,
    pub current_price_sol: f64,
    pub current_price_usd: f64,
    pub current_market_cap_usd: f64,

    pub latest_virtual_sol_reserves: u64,
    pub latest_virtual_token_reserves: u64,
    pub latest_real_sol_reserves: u64,

    /// Advisory, trade-event-derived; always in [0, 1). Not persisted on the
    /// token row; the on-chain curve account is the authoritative source.
    pub bonding_curve_progress: f64,

    pub graduated_to_amm: bool,
    pub threshold_crossed: bool,
    pub threshold_crossed_at: Option<DateTime<Utc>>,
    pub last_price_update: DateTime<Utc>,
}

/// A canonical trade record, keyed by transaction signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub signature: String,
    pub mint: Pubkey,
    pub program: ProgramKind,
    pub side: TradeSide,
    pub user: Pubkey,
    pub sol_amount: u64,
    pub token_amount: u64,
    pub price_sol: f64,
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub volume_usd: f64,
    /// Post-trade snapshots from the event, not deltas
    pub virtual_sol_reserves: u64,
    pub virtual_token_reserves: u64,
    pub bonding_curve: Option<Pubkey>,
    pub bonding_curve_progress: Option<f64>,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
}

/// Append-only pool reserve snapshot, keyed by (pool_address, slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStateSnapshot {
    pub mint: Pubkey,
    pub pool_address: Pubkey,
    pub virtual_sol_reserves: u64,
    pub virtual_token_reserves: u64,
    pub real_sol_reserves: Option<u64>,
    pub real_token_reserves: Option<u64>,
    pub pool_open: bool,
    pub slot: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_kind_strings() {
        assert_eq!(ProgramKind::BondingCurve.as_str(), "bonding_curve");
        assert_eq!(ProgramKind::AmmPool.as_str(), "amm_pool");
        assert_eq!(
            ProgramKind::parse("bonding_curve"),
            Some(ProgramKind::BondingCurve)
        );
        assert_eq!(ProgramKind::parse("amm_pool"), Some(ProgramKind::AmmPool));
        assert_eq!(ProgramKind::parse("raydium"), None);
    }

    #[test]
    fn test_trade_side_strings() {
        assert_eq!(TradeSide::Buy.as_str(), "buy");
        assert_eq!(TradeSide::Sell.as_str(), "sell");
    }
}
