//! Generate a synthetic feed capture for `curvescope --replay`: a handful of
//! token launches, each with a run of bonding-curve buys marching toward
//! graduation and a first AMM trade after it.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use solana_sdk::pubkey::Pubkey;
use std::path::PathBuf;

use curvescope::constants::{
    BONDING_CURVE_PROGRAM, BUY_DISCRIMINATOR, CREATE_DISCRIMINATOR, AMM_POOL_PROGRAM,
    GRADUATION_TARGET_LAMPORTS,
};
use curvescope::feed::{
    CompiledInstruction, ConfirmedTransaction, TokenBalance, TransactionMessage, TransactionMeta,
};
use curvescope::trade_event::TradeEvent;

#[derive(Parser, Debug)]
#[command(name = "capture_gen", about = "Generate a synthetic feed capture")]
struct Cli {
    /// Output path for the capture (JSON array of transactions)
    #[arg(long, default_value = "capture.json")]
    out: PathBuf,

    /// Number of token launches to synthesize
    #[arg(long, default_value_t = 3)]
    tokens: usize,

    /// Bonding-curve trades per token before graduation
    #[arg(long, default_value_t = 20)]
    trades_per_token: usize,

    /// Unix seconds of the first block; later blocks step by one slot
    #[arg(long, default_value_t = 1_700_000_000)]
    start_time: i64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let bc_program: Pubkey = BONDING_CURVE_PROGRAM.parse()?;
    let amm_program: Pubkey = AMM_POOL_PROGRAM.parse()?;

    let mut transactions = Vec::new();
    let mut slot = 1_000u64;

    for token in 0..cli.tokens {
        let mint = Pubkey::new_unique();
        let curve = Pubkey::new_unique();
        let pool = Pubkey::new_unique();
        let creator = Pubkey::new_unique();

        transactions.push(creation_tx(
            bc_program, mint, curve, creator, slot, cli.start_time,
        ));
        slot += 1;

        // Reserves march from launch values toward the graduation target
        let mut virtual_sol = 30_000_000_000u64;
        let mut virtual_token = 1_073_000_000_000_000u64;
        let mut real_sol = 0u64;
        let mut real_token = 793_100_000_000_000u64;
        let step_sol = GRADUATION_TARGET_LAMPORTS / cli.trades_per_token.max(1) as u64;

        for trade in 0..cli.trades_per_token {
            let tokens_out = real_token / (cli.trades_per_token - trade).max(1) as u64;
            virtual_sol += step_sol;
            real_sol += step_sol;
            real_token -= tokens_out;
            virtual_token -= tokens_out;

            let event = TradeEvent {
                mint,
                sol_amount: step_sol,
                token_amount: tokens_out,
                is_buy: true,
                user: Pubkey::new_unique(),
                virtual_token_reserves: virtual_token,
                virtual_sol_reserves: virtual_sol,
                real_token_reserves: real_token,
                real_sol_reserves: real_sol,
            };
            transactions.push(trade_tx(
                bc_program,
                curve,
                &event,
                format!("bc-{token}-{trade}"),
                slot,
                cli.start_time + slot as i64 - 1_000,
            ));
            slot += 1;
        }

        // First AMM trade after graduation
        let event = TradeEvent {
            mint,
            sol_amount: 1_000_000_000,
            token_amount: 5_000_000_000_000,
            is_buy: true,
            user: Pubkey::new_unique(),
            virtual_token_reserves: 280_000_000_000_000,
            virtual_sol_reserves: 115_000_000_000,
            real_token_reserves: 275_000_000_000_000,
            real_sol_reserves: 110_000_000_000,
        };
        transactions.push(trade_tx(
            amm_program,
            pool,
            &event,
            format!("amm-{token}"),
            slot,
            cli.start_time + slot as i64 - 1_000,
        ));
        slot += 1;
    }

    std::fs::write(&cli.out, serde_json::to_vec_pretty(&transactions)?)?;
    println!(
        "wrote {} transactions ({} tokens) to {}",
        transactions.len(),
        cli.tokens,
        cli.out.display()
    );
    Ok(())
}

fn creation_tx(
    program: Pubkey,
    mint: Pubkey,
    curve: Pubkey,
    creator: Pubkey,
    slot: u64,
    block_time: i64,
) -> ConfirmedTransaction {
    ConfirmedTransaction {
        signature: format!("create-{mint}"),
        slot,
        block_time: Some(block_time),
        message: TransactionMessage {
            account_keys: vec![creator, mint, curve, Pubkey::new_unique(), program],
            instructions: vec![CompiledInstruction {
                program_id_index: 4,
                accounts: vec![0, 1, 2, 3],
                data: CREATE_DISCRIMINATOR.to_vec(),
            }],
        },
        meta: TransactionMeta {
            err: None,
            log_messages: vec![],
            pre_token_balances: vec![],
            post_token_balances: vec![TokenBalance {
                mint: mint.to_string(),
                owner: creator.to_string(),
                amount: 0,
            }],
        },
    }
}

fn trade_tx(
    program: Pubkey,
    venue: Pubkey,
    event: &TradeEvent,
    signature: String,
    slot: u64,
    block_time: i64,
) -> ConfirmedTransaction {
    // Venue sits at the positional index both conventions read: index 0 for
    // AMM pools, index 3 for curve trades
    let account_keys = vec![
        venue,
        event.user,
        Pubkey::new_unique(),
        venue,
        Pubkey::new_unique(),
        Pubkey::new_unique(),
        program,
    ];
    ConfirmedTransaction {
        signature,
        slot,
        block_time: Some(block_time),
        message: TransactionMessage {
            account_keys,
            instructions: vec![CompiledInstruction {
                program_id_index: 6,
                accounts: vec![0, 1, 2, 3, 4, 5],
                data: BUY_DISCRIMINATOR.to_vec(),
            }],
        },
        meta: TransactionMeta {
            err: None,
            log_messages: vec![format!("Program data: {}", BASE64.encode(event.encode()))],
            pre_token_balances: vec![],
            post_token_balances: vec![],
        },
    }
}
