//! Decode a bonding-curve account or a program-data trade event from the
//! command line. Handy when eyeballing what the pipeline would make of a
//! payload pulled from an explorer.

use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;

use curvescope::constants::{lamports_to_sol, GRADUATION_TARGET_LAMPORTS};
use curvescope::curve_account::BondingCurveAccount;
use curvescope::trade_event::TradeEvent;

#[derive(Parser, Debug)]
#[command(name = "curve_inspect", about = "Decode curve accounts and trade events")]
struct Cli {
    /// Base64 payload (curve account data or a 225-byte trade event)
    payload: String,

    /// Treat the payload as a trade event instead of auto-detecting
    #[arg(long)]
    trade_event: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data = BASE64.decode(cli.payload.trim())?;

    if cli.trade_event || data.len() == curvescope::constants::TRADE_EVENT_LEN {
        match TradeEvent::decode(&data)? {
            Some(event) => {
                println!("trade event");
                println!("  mint                  {}", event.mint);
                println!("  side                  {}", if event.is_buy { "buy" } else { "sell" });
                println!("  user                  {}", event.user);
                println!(
                    "  sol_amount            {} ({} SOL)",
                    event.sol_amount,
                    lamports_to_sol(event.sol_amount)
                );
                println!("  token_amount          {}", event.token_amount);
                println!("  virtual_sol_reserves  {}", event.virtual_sol_reserves);
                println!("  virtual_token_reserves {}", event.virtual_token_reserves);
                println!("  real_sol_reserves     {}", event.real_sol_reserves);
                println!("  real_token_reserves   {}", event.real_token_reserves);
                return Ok(());
            }
            None => bail!(
                "payload is {} bytes, not a {}-byte trade event",
                data.len(),
                curvescope::constants::TRADE_EVENT_LEN
            ),
        }
    }

    let account = BondingCurveAccount::decode(&data)?;
    println!("bonding curve account");
    println!("  virtual_sol_reserves   {}", account.virtual_sol_reserves);
    println!("  virtual_token_reserves {}", account.virtual_token_reserves);
    println!(
        "  real_sol_reserves      {} ({:.3} of graduation target)",
        account.real_sol_reserves,
        account.real_sol_reserves as f64 / GRADUATION_TARGET_LAMPORTS as f64
    );
    println!("  real_token_reserves    {}", account.real_token_reserves);
    println!("  token_total_supply     {}", account.token_total_supply);
    println!("  complete               {}", account.complete);
    println!("  is_complete            {}", account.is_complete());
    Ok(())
}
