//! End-to-end pipeline scenarios: scripted feed in, SQLite rows out.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Duration as ChronoDuration;
use chrono::{TimeZone, Utc};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::watch;

use curvescope::clock::{system_clock, ManualClock, SharedClock};
use curvescope::config::AppConfig;
use curvescope::event_bus::EventBus;
use curvescope::feed::{
    CompiledInstruction, ConfirmedTransaction, ReplayConnector, TokenBalance, TransactionMessage,
    TransactionMeta,
};
use curvescope::metrics::PipelineMetrics;
use curvescope::persistence::SqliteStore;
use curvescope::supervisor::StreamSupervisor;
use curvescope::trade_event::TradeEvent;
use curvescope::{pipeline, CircuitState, PipelineEvent};

const BC_PROGRAM: &str = curvescope::constants::BONDING_CURVE_PROGRAM;
const AMM_PROGRAM: &str = curvescope::constants::AMM_POOL_PROGRAM;
const BUY: [u8; 8] = curvescope::constants::BUY_DISCRIMINATOR;

fn test_config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.monitor.save_all_tokens = true;
    config.batcher.batch_timeout_ms = 25;
    config.supervisor.checkpoint_path = dir
        .join("checkpoint.json")
        .to_string_lossy()
        .into_owned();
    // Nothing listens here; the oracle keeps its fallback of 150 USD
    config.oracle.endpoint = "http://127.0.0.1:9".to_string();
    config.oracle.timeout_ms = 100;
    config.oracle.poll_interval_ms = 3_600_000;
    config
}

fn launch_event(mint: Pubkey, is_buy: bool) -> TradeEvent {
    TradeEvent {
        mint,
        sol_amount: 1_000_000_000,
        token_amount: 35_000_000_000_000,
        is_buy,
        user: Pubkey::new_unique(),
        virtual_token_reserves: 1_073_000_000_000_000,
        virtual_sol_reserves: 30_000_000_000,
        real_token_reserves: 793_100_000_000_000,
        real_sol_reserves: 5_000_000_000,
    }
}

fn amm_event(mint: Pubkey) -> TradeEvent {
    TradeEvent {
        mint,
        sol_amount: 2_000_000_000,
        token_amount: 8_000_000_000_000,
        is_buy: true,
        user: Pubkey::new_unique(),
        virtual_token_reserves: 500_000_000_000_000,
        virtual_sol_reserves: 120_000_000_000,
        real_token_reserves: 480_000_000_000_000,
        real_sol_reserves: 110_000_000_000,
    }
}

/// A successful transaction with one instruction against `program` and a
/// program-data log carrying `event`.
fn trade_tx(
    program: &str,
    signature: &str,
    slot: u64,
    block_time: i64,
    event: &TradeEvent,
) -> ConfirmedTransaction {
    let program: Pubkey = program.parse().unwrap();
    let mut account_keys: Vec<Pubkey> = (0..6).map(|_| Pubkey::new_unique()).collect();
    account_keys.push(program);
    ConfirmedTransaction {
        signature: signature.to_string(),
        slot,
        block_time: Some(block_time),
        message: TransactionMessage {
            account_keys,
            instructions: vec![CompiledInstruction {
                program_id_index: 6,
                accounts: vec![0, 1, 2, 3, 4, 5],
                data: BUY.to_vec(),
            }],
        },
        meta: TransactionMeta {
            err: None,
            log_messages: vec![format!("Program data: {}", BASE64.encode(event.encode()))],
            pre_token_balances: vec![],
            post_token_balances: vec![TokenBalance {
                mint: event.mint.to_string(),
                owner: "owner".to_string(),
                amount: 1,
            }],
        },
    }
}

/// Run the whole pipeline over a scripted transaction list, then shut down.
async fn run_once(config: AppConfig, store: SqliteStore, txs: Vec<ConfirmedTransaction>) {
    let connector = Arc::new(ReplayConnector::new(txs));
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(pipeline::run(
        config,
        connector,
        store,
        system_clock(),
        stop_rx,
    ));
    tokio::time::sleep(Duration::from_millis(600)).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scenario_a_bonding_curve_trade() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    let mint = Pubkey::new_unique();
    let event = launch_event(mint, true);

    run_once(
        test_config(dir.path()),
        store.clone(),
        vec![trade_tx(BC_PROGRAM, "sig-a", 1_000, 1_700_000_000, &event)],
    )
    .await;

    let row = store.fetch_trade("sig-a").unwrap().expect("trade persisted");
    assert_eq!(row.trade_type, "buy");
    assert_eq!(row.program, "bonding_curve");
    assert!((row.price_sol - 2.796e-8).abs() < 1e-10, "price_sol {}", row.price_sol);
    assert!((row.price_usd - 4.194e-6).abs() < 1e-8, "price_usd {}", row.price_usd);
    assert!((row.market_cap_usd - 4193.8).abs() < 5.0, "mcap {}", row.market_cap_usd);
    assert_eq!(row.virtual_sol_reserves, 30_000_000_000);
    assert!((row.bonding_curve_progress.unwrap() - 5.0 / 85.0).abs() < 1e-6);

    let token = store.fetch_token(&mint.to_string()).unwrap().expect("token row");
    assert_eq!(token.first_price_sol, token.current_price_sol);
    assert_eq!(token.first_market_cap_usd, token.current_market_cap_usd);
    assert_eq!(token.current_program.as_str(), "bonding_curve");
    assert!(!token.graduated_to_amm);
    assert_eq!(token.latest_virtual_sol_reserves, 30_000_000_000);
}

#[tokio::test]
async fn scenario_b_graduation_by_amm_trade() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    let mint = Pubkey::new_unique();

    run_once(
        test_config(dir.path()),
        store.clone(),
        vec![
            trade_tx(BC_PROGRAM, "sig-bc", 1_000, 1_700_000_000, &launch_event(mint, true)),
            trade_tx(AMM_PROGRAM, "sig-amm", 1_500, 1_700_000_300, &amm_event(mint)),
        ],
    )
    .await;

    let token = store.fetch_token(&mint.to_string()).unwrap().unwrap();
    assert!(token.graduated_to_amm);
    assert_eq!(token.current_program.as_str(), "amm_pool");
    // First prices still reflect the curve trade, currents the AMM trade
    assert!((token.first_market_cap_usd - 4193.8).abs() < 5.0);
    assert!(token.current_market_cap_usd > 30_000.0);
    assert!(token.mint.pool.is_some());

    assert_eq!(store.count_trades().unwrap(), 2);
    assert_eq!(store.count_pool_snapshots().unwrap(), 1);
}

#[tokio::test]
async fn scenario_c_duplicate_signature() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_in_memory().unwrap();
    let mint = Pubkey::new_unique();
    let event = launch_event(mint, true);
    let tx = trade_tx(BC_PROGRAM, "sig-dup", 1_000, 1_700_000_000, &event);

    run_once(
        test_config(dir.path()),
        store.clone(),
        vec![tx.clone(), tx],
    )
    .await;

    assert_eq!(store.count_trades().unwrap(), 1);
}

#[tokio::test]
async fn scenario_d_connection_failure_and_failover() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    let shared: SharedClock = Arc::new(clock.clone());
    let mut config = AppConfig::default().supervisor;
    config.failure_threshold = 3;
    config.half_open_requests = 2;
    config.recovery_timeout_ms = 30_000;
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let mut supervisor = StreamSupervisor::new(config, shared, bus, PipelineMetrics::new());

    supervisor.register_connection("conn-a");
    supervisor.register_connection("conn-b");
    let sub_1 = supervisor.add_subscription("conn-a").unwrap();
    let sub_2 = supervisor.add_subscription("conn-a").unwrap();
    supervisor.add_subscription("conn-b").unwrap();

    for _ in 0..3 {
        supervisor.record_failure("conn-a");
    }
    assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Open));
    assert!(supervisor.subscriptions("conn-a").is_empty());
    let on_b = supervisor.subscriptions("conn-b");
    assert!(on_b.contains(&sub_1) && on_b.contains(&sub_2));

    let mut saw_failover = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::Failover { .. }) {
            saw_failover = true;
        }
    }
    assert!(saw_failover);

    // After the recovery timeout the connection is probed half-open
    clock.advance(ChronoDuration::milliseconds(30_000));
    assert_eq!(
        supervisor.circuit_state("conn-a"),
        Some(CircuitState::HalfOpen)
    );
    assert!(supervisor.allow_request("conn-a"));
    supervisor.record_success("conn-a", 10.0);
    assert!(supervisor.allow_request("conn-a"));
    supervisor.record_success("conn-a", 10.0);
    assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn scenario_e_all_connections_fail() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    let shared: SharedClock = Arc::new(clock.clone());
    let mut config = AppConfig::default().supervisor;
    config.failure_threshold = 3;
    config.recovery_backoff_ms = 5_000;
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let mut supervisor = StreamSupervisor::new(config, shared, bus, PipelineMetrics::new());
    supervisor.register_connection("conn-a");
    supervisor.register_connection("conn-b");

    for _ in 0..3 {
        supervisor.record_failure("conn-a");
    }
    for _ in 0..3 {
        supervisor.record_failure("conn-b");
    }
    assert!(supervisor.in_emergency());

    clock.advance(ChronoDuration::milliseconds(5 * 5_000 + 1));
    supervisor.tick();
    assert!(!supervisor.in_emergency());
    assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Closed));
    assert_eq!(supervisor.circuit_state("conn-b"), Some(CircuitState::Closed));

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    let emergency_at = kinds.iter().position(|k| *k == "emergency");
    let recovery_at = kinds.iter().position(|k| *k == "emergency_recovery");
    assert!(emergency_at.is_some());
    assert!(recovery_at.is_some());
    assert!(emergency_at < recovery_at);
}

#[tokio::test]
async fn scenario_f_crash_and_recover() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("curvescope.db");
    let config = test_config(dir.path());
    let mint = Pubkey::new_unique();
    let bc = trade_tx(BC_PROGRAM, "sig-bc", 1_000, 1_700_000_000, &launch_event(mint, true));
    let amm = trade_tx(AMM_PROGRAM, "sig-amm", 1_500, 1_700_000_300, &amm_event(mint));

    // First life: process both trades, then "crash" (shutdown writes the
    // final checkpoint either way)
    let store = SqliteStore::open(db_path.to_str().unwrap()).unwrap();
    run_once(config.clone(), store, vec![bc.clone(), amm]).await;

    let checkpoint_path = dir.path().join("checkpoint.json");
    assert!(checkpoint_path.exists());
    let raw = std::fs::read_to_string(&checkpoint_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(!parsed["connections"].as_object().unwrap().is_empty());

    // Second life: same database and checkpoint, the feed replays the
    // already-seen curve trade
    let store = SqliteStore::open(db_path.to_str().unwrap()).unwrap();
    run_once(config, store.clone(), vec![bc]).await;

    // Idempotency absorbed the replay; graduation survived the restart
    assert_eq!(store.count_trades().unwrap(), 2);
    let token = store.fetch_token(&mint.to_string()).unwrap().unwrap();
    assert!(token.graduated_to_amm);
    assert_eq!(token.current_program.as_str(), "amm_pool");
}
