/// Global constants for the curvescope pipeline
///
/// This module centralizes the chain-level and curve-level magic numbers so
/// that decoding, pricing, and lifecycle logic all agree on the same values.
use once_cell::sync::Lazy;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

// ============================================================================
// SOLANA BLOCKCHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Wrapped SOL mint address
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

// ============================================================================
// WATCHED PROGRAM DEFAULTS
// ============================================================================

/// Bonding-curve launch program (default; overridable in config)
pub const BONDING_CURVE_PROGRAM: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// AMM pool program tokens graduate to (default; overridable in config)
pub const AMM_POOL_PROGRAM: &str = "pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA";

pub static BONDING_CURVE_PROGRAM_ID: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str(BONDING_CURVE_PROGRAM).expect("invalid bonding curve program id"));

pub static AMM_POOL_PROGRAM_ID: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str(AMM_POOL_PROGRAM).expect("invalid amm pool program id"));

pub static WRAPPED_SOL_MINT_ID: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str(WRAPPED_SOL_MINT).expect("invalid wrapped sol mint"));

// ============================================================================
// INSTRUCTION DISCRIMINATORS (first 8 bytes of instruction data)
// ============================================================================

/// Bonding-curve `create` instruction
pub const CREATE_DISCRIMINATOR: [u8; 8] = [24, 30, 200, 40, 5, 28, 7, 119];

/// Bonding-curve / AMM `buy` instruction
pub const BUY_DISCRIMINATOR: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];

/// Bonding-curve / AMM `sell` instruction
pub const SELL_DISCRIMINATOR: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];

/// AMM `deposit` (add liquidity) instruction
pub const DEPOSIT_DISCRIMINATOR: [u8; 8] = [242, 35, 198, 137, 82, 225, 242, 182];

/// AMM `withdraw` (remove liquidity) instruction
pub const WITHDRAW_DISCRIMINATOR: [u8; 8] = [183, 18, 70, 156, 148, 109, 161, 34];

/// AMM `collect_fee` instruction
pub const COLLECT_FEE_DISCRIMINATOR: [u8; 8] = [160, 57, 89, 42, 181, 139, 43, 66];

// ============================================================================
// POSITIONAL ACCOUNT CONVENTIONS
// ============================================================================

/// `create`: account index of the bonding-curve account
pub const CREATE_BONDING_CURVE_INDEX: usize = 2;

/// `buy`/`sell` on the curve: account index of the bonding-curve account
pub const TRADE_BONDING_CURVE_INDEX: usize = 3;

/// AMM swap: account index of the pool account
pub const AMM_POOL_INDEX: usize = 0;

/// AMM swap: account index of the user wallet
pub const AMM_USER_INDEX: usize = 1;

/// AMM swap: account index of the base (token) vault
pub const AMM_BASE_VAULT_INDEX: usize = 3;

/// AMM swap: account index of the quote (SOL) vault
pub const AMM_QUOTE_VAULT_INDEX: usize = 4;

// ============================================================================
// BONDING CURVE CONSTANTS
// ============================================================================

/// Launch tokens use 6 decimals; one whole token is 1e6 raw units
pub const TOKEN_BASE_UNITS: u64 = 1_000_000;

/// Fixed total supply of a launch token, in whole tokens
pub const TOTAL_SUPPLY_TOKENS: f64 = 1_000_000_000.0;

/// Real SOL reserves at which a curve graduates to the AMM (~85 SOL)
pub const GRADUATION_TARGET_LAMPORTS: u64 = 85_000_000_000;

/// Progress is capped just below 1.0; completion is signalled by graduation,
/// not by the progress figure itself
pub const MAX_CURVE_PROGRESS: f64 = 0.9999;

/// Exact size of the curve trade event payload carried in "Program data:" logs
pub const TRADE_EVENT_LEN: usize = 225;

/// Log line prefix that carries base64 event payloads
pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";

// ============================================================================
// SAFETY CEILINGS
// ============================================================================

/// Market-cap ceiling for bonding-curve trades (catches decode mis-scaling;
/// a fresh launch is nowhere near this)
pub const BC_MAX_MARKET_CAP_USD: f64 = 10_000_000.0;

/// Market-cap ceiling for AMM trades; graduated tokens legitimately exceed
/// the curve ceiling
pub const AMM_MAX_MARKET_CAP_USD: f64 = 1_000_000_000_000.0;
