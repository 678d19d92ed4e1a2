use thiserror::Error;

use crate::constants::{
    GRADUATION_TARGET_LAMPORTS, LAMPORTS_PER_SOL, MAX_CURVE_PROGRESS, TOKEN_BASE_UNITS,
    TOTAL_SUPPLY_TOKENS,
};
use crate::types::ProgramKind;

/// Pricing failures are per-event: the trade is dropped and token state is
/// left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceError {
    #[error("invalid reserves: virtual_sol={virtual_sol} virtual_token={virtual_token}")]
    InvalidReserves { virtual_sol: u64, virtual_token: u64 },
    #[error("non-positive SOL/USD reference: {0}")]
    NonPositiveSolPrice(f64),
    #[error("market cap {market_cap_usd:.2} USD exceeds {program:?} ceiling {ceiling_usd:.0}")]
    SafetyCeilingExceeded {
        program: ProgramKind,
        market_cap_usd: f64,
        ceiling_usd: f64,
    },
}

/// Post-trade reserve snapshot the derivation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserves {
    pub virtual_sol: u64,
    pub virtual_token: u64,
    pub real_sol: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price_sol: f64,
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub liquidity_sol: f64,
    pub liquidity_usd: f64,
    /// Bonding-curve progress in [0, 1); advisory when event-derived
    pub progress: f64,
}

/// Per-program market-cap ceilings. The bonding-curve ceiling catches the
/// decode mis-scaling class of bug; graduated tokens trade under a much
/// higher AMM ceiling.
#[derive(Debug, Clone, Copy)]
pub struct SafetyCeilings {
    pub bonding_curve_usd: f64,
    pub amm_pool_usd: f64,
}

impl SafetyCeilings {
    fn for_program(&self, program: ProgramKind) -> f64 {
        match program {
            ProgramKind::BondingCurve => self.bonding_curve_usd,
            ProgramKind::AmmPool => self.amm_pool_usd,
        }
    }
}

/// Pure price derivation from reserves and a SOL/USD reference.
///
/// SOL reserves are scaled from lamports to SOL; token reserves are scaled
/// from raw units to whole tokens (6 decimals). Scaling both sides by the
/// same factor is the known mis-implementation and inflates every figure by
/// about a million.
#[derive(Debug, Clone, Copy)]
pub struct PriceEngine {
    ceilings: SafetyCeilings,
}

impl PriceEngine {
    pub fn new(ceilings: SafetyCeilings) -> Self {
        Self { ceilings }
    }

    pub fn compute(
        &self,
        program: ProgramKind,
        reserves: Reserves,
        sol_price_usd: f64,
    ) -> Result<PriceQuote, PriceError> {
        if reserves.virtual_sol == 0 || reserves.virtual_token == 0 {
            return Err(PriceError::InvalidReserves {
                virtual_sol: reserves.virtual_sol,
                virtual_token: reserves.virtual_token,
            });
        }
        if !(sol_price_usd > 0.0) || !sol_price_usd.is_finite() {
            return Err(PriceError::NonPositiveSolPrice(sol_price_usd));
        }

        let sol_side = reserves.virtual_sol as f64 / LAMPORTS_PER_SOL as f64;
        let token_side = reserves.virtual_token as f64 / TOKEN_BASE_UNITS as f64;

        let price_sol = sol_side / token_side;
        let price_usd = price_sol * sol_price_usd;
        let market_cap_usd = price_usd * TOTAL_SUPPLY_TOKENS;

        let ceiling_usd = self.ceilings.for_program(program);
        if market_cap_usd > ceiling_usd {
            return Err(PriceError::SafetyCeilingExceeded {
                program,
                market_cap_usd,
                ceiling_usd,
            });
        }

        let liquidity_sol = reserves.real_sol as f64 / LAMPORTS_PER_SOL as f64;
        let progress = (reserves.real_sol as f64 / GRADUATION_TARGET_LAMPORTS as f64)
            .min(MAX_CURVE_PROGRESS);

        Ok(PriceQuote {
            price_sol,
            price_usd,
            market_cap_usd,
            liquidity_sol,
            liquidity_usd: liquidity_sol * sol_price_usd,
            progress,
        })
    }
}

impl Default for PriceEngine {
    fn default() -> Self {
        Self::new(SafetyCeilings {
            bonding_curve_usd: crate::constants::BC_MAX_MARKET_CAP_USD,
            amm_pool_usd: crate::constants::AMM_MAX_MARKET_CAP_USD,
        })
    }
}
