use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

use crate::codec;
use crate::types::{Mint, PoolStateSnapshot, ProgramKind, TokenState, Trade, TradeSide};

/// Persistence failures. Transient errors are retried by the batcher;
/// constraint conflicts on the signature key are expected and swallowed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{field} value {value} exceeds the signed 64-bit range")]
    RangeExceeded { field: &'static str, value: u64 },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

fn map_sqlite_err(e: rusqlite::Error) -> PersistenceError {
    if let rusqlite::Error::SqliteFailure(code, _) = &e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return PersistenceError::Constraint(e.to_string());
        }
    }
    PersistenceError::Transient(e.to_string())
}

/// u64 wire values are stored in signed 64-bit columns; the boundary
/// conversion is explicit and checked.
fn to_i64(field: &'static str, value: u64) -> Result<i64, PersistenceError> {
    i64::try_from(value).map_err(|_| PersistenceError::RangeExceeded { field, value })
}

fn parse_ts(field: &str, raw: String) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::CorruptRow(format!("{field}: {e}")))
}

/// Outcome of one trade batch: how many rows were new and how many were
/// discarded on the signature key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// SQLite-backed store for tokens, trades, and pool snapshots.
///
/// All writes are idempotent under retry: trades insert-or-ignore on the
/// signature key, token upserts never regress graduation or the
/// threshold-crossed timestamp, pool snapshots ignore duplicate
/// (pool, slot) observations.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PersistenceError::Transient(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path).map_err(map_sqlite_err)?;
        Self::init(conn, db_path)
    }

    /// In-memory store; stands in for the real one in tests.
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self, PersistenceError> {
        let schema = include_str!("../schema.sql");
        conn.execute_batch(schema).map_err(map_sqlite_err)?;
        info!("✅ Database initialized: {label}");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert-or-update one token row. Mutable fields are overwritten;
    /// `threshold_crossed_at`, `graduated_to_amm`, the pool reference, and
    /// every `first_*` field are write-once (the SET list coalesces).
    pub fn upsert_token(&self, state: &TokenState) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO tokens_unified (
                mint_address, creator, bonding_curve_key, pool_address,
                first_program, current_program,
                first_price_sol, first_price_usd, first_market_cap_usd,
                current_price_sol, current_price_usd, current_market_cap_usd,
                graduated_to_amm, threshold_crossed_at,
                latest_virtual_sol_reserves, latest_virtual_token_reserves,
                latest_real_sol_reserves, first_seen_slot, last_price_update, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(mint_address) DO UPDATE SET
                current_program = CASE
                    WHEN tokens_unified.graduated_to_amm THEN 'amm_pool'
                    ELSE excluded.current_program
                END,
                current_price_sol = excluded.current_price_sol,
                current_price_usd = excluded.current_price_usd,
                current_market_cap_usd = excluded.current_market_cap_usd,
                graduated_to_amm = tokens_unified.graduated_to_amm OR excluded.graduated_to_amm,
                threshold_crossed_at = COALESCE(tokens_unified.threshold_crossed_at, excluded.threshold_crossed_at),
                pool_address = COALESCE(tokens_unified.pool_address, excluded.pool_address),
                bonding_curve_key = COALESCE(tokens_unified.bonding_curve_key, excluded.bonding_curve_key),
                latest_virtual_sol_reserves = excluded.latest_virtual_sol_reserves,
                latest_virtual_token_reserves = excluded.latest_virtual_token_reserves,
                latest_real_sol_reserves = excluded.latest_real_sol_reserves,
                last_price_update = excluded.last_price_update",
            params![
                state.mint.address.to_string(),
                state.mint.creator.map(|k| k.to_string()),
                state.mint.bonding_curve.map(|k| k.to_string()),
                state.mint.pool.map(|k| k.to_string()),
                state.first_program.as_str(),
                state.current_program.as_str(),
                state.first_price_sol,
                state.first_price_usd,
                state.first_market_cap_usd,
                state.current_price_sol,
                state.current_price_usd,
                state.current_market_cap_usd,
                state.graduated_to_amm,
                state.threshold_crossed_at.map(|t| t.to_rfc3339()),
                to_i64("latest_virtual_sol_reserves", state.latest_virtual_sol_reserves)?,
                to_i64("latest_virtual_token_reserves", state.latest_virtual_token_reserves)?,
                to_i64("latest_real_sol_reserves", state.latest_real_sol_reserves)?,
                to_i64("first_seen_slot", state.mint.first_seen_slot)?,
                state.last_price_update.to_rfc3339(),
                state.mint.first_seen_at.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    /// Insert a batch of trades inside one transaction. Duplicate signatures
    /// are discarded, novel rows land; a batch with one duplicate and N-1
    /// novel signatures inserts exactly N-1 rows.
    pub fn batch_insert_trades(&self, trades: &[Trade]) -> Result<BatchOutcome, PersistenceError> {
        if trades.is_empty() {
            return Ok(BatchOutcome {
                inserted: 0,
                duplicates: 0,
            });
        }

        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(map_sqlite_err)?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO trades_unified (
                        signature, mint_address, program, trade_type, user_address,
                        sol_amount, token_amount, price_sol, price_usd, market_cap_usd,
                        volume_usd, virtual_sol_reserves, virtual_token_reserves,
                        bonding_curve_key, bonding_curve_progress, slot, block_time
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                )
                .map_err(map_sqlite_err)?;

            for trade in trades {
                let changed = stmt
                    .execute(params![
                        trade.signature,
                        trade.mint.to_string(),
                        trade.program.as_str(),
                        trade.side.as_str(),
                        trade.user.to_string(),
                        to_i64("sol_amount", trade.sol_amount)?,
                        to_i64("token_amount", trade.token_amount)?,
                        trade.price_sol,
                        trade.price_usd,
                        trade.market_cap_usd,
                        trade.volume_usd,
                        to_i64("virtual_sol_reserves", trade.virtual_sol_reserves)?,
                        to_i64("virtual_token_reserves", trade.virtual_token_reserves)?,
                        trade.bonding_curve.map(|k| k.to_string()),
                        trade.bonding_curve_progress,
                        to_i64("slot", trade.slot)?,
                        trade.block_time.to_rfc3339(),
                    ])
                    .map_err(map_sqlite_err)?;
                inserted += changed;
            }
        }
        tx.commit().map_err(map_sqlite_err)?;

        Ok(BatchOutcome {
            inserted,
            duplicates: trades.len() - inserted,
        })
    }

    /// Append one pool snapshot; a duplicate (pool, slot) observation is a
    /// no-op.
    pub fn insert_pool_snapshot(
        &self,
        snapshot: &PoolStateSnapshot,
        observed_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO amm_pool_states (
                mint_address, pool_address, virtual_sol_reserves, virtual_token_reserves,
                real_sol_reserves, real_token_reserves, pool_open, slot, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot.mint.to_string(),
                snapshot.pool_address.to_string(),
                to_i64("virtual_sol_reserves", snapshot.virtual_sol_reserves)?,
                to_i64("virtual_token_reserves", snapshot.virtual_token_reserves)?,
                snapshot
                    .real_sol_reserves
                    .map(|v| to_i64("real_sol_reserves", v))
                    .transpose()?,
                snapshot
                    .real_token_reserves
                    .map(|v| to_i64("real_token_reserves", v))
                    .transpose()?,
                snapshot.pool_open,
                to_i64("slot", snapshot.slot)?,
                observed_at.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_err)?;
        Ok(())
    }

    /// Load one token row; used by the trade handler on a state-cache miss.
    pub fn fetch_token(&self, mint: &str) -> Result<Option<TokenState>, PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT mint_address, creator, bonding_curve_key, pool_address,
                    first_program, current_program,
                    first_price_sol, first_price_usd, first_market_cap_usd,
                    current_price_sol, current_price_usd, current_market_cap_usd,
                    graduated_to_amm, threshold_crossed_at,
                    latest_virtual_sol_reserves, latest_virtual_token_reserves,
                    latest_real_sol_reserves, first_seen_slot, last_price_update, created_at
             FROM tokens_unified WHERE mint_address = ?1",
            params![mint],
            row_to_token_state,
        )
        .optional()
        .map_err(map_sqlite_err)?
        .transpose()
    }

    pub fn count_trades(&self) -> Result<u64, PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT COUNT(*) FROM trades_unified", [], |row| row.get(0))
            .map_err(map_sqlite_err)
    }

    pub fn count_pool_snapshots(&self) -> Result<u64, PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row("SELECT COUNT(*) FROM amm_pool_states", [], |row| row.get(0))
            .map_err(map_sqlite_err)
    }
}

fn row_to_token_state(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<TokenState, PersistenceError>> {
    // Column extraction is rusqlite-fallible; semantic parsing reports
    // CorruptRow instead.
    let mint_address: String = row.get(0)?;
    let creator: Option<String> = row.get(1)?;
    let bonding_curve: Option<String> = row.get(2)?;
    let pool: Option<String> = row.get(3)?;
    let first_program: String = row.get(4)?;
    let current_program: String = row.get(5)?;
    let first_price_sol: f64 = row.get(6)?;
    let first_price_usd: f64 = row.get(7)?;
    let first_market_cap_usd: f64 = row.get(8)?;
    let current_price_sol: f64 = row.get(9)?;
    let current_price_usd: f64 = row.get(10)?;
    let current_market_cap_usd: f64 = row.get(11)?;
    let graduated_to_amm: bool = row.get(12)?;
    let threshold_crossed_at: Option<String> = row.get(13)?;
    let latest_virtual_sol: i64 = row.get(14)?;
    let latest_virtual_token: i64 = row.get(15)?;
    let latest_real_sol: i64 = row.get(16)?;
    let first_seen_slot: i64 = row.get(17)?;
    let last_price_update: String = row.get(18)?;
    let created_at: String = row.get(19)?;

    Ok((|| {
        let parse_key = |field: &str, s: String| {
            codec::decode_base58_key(&s)
                .map_err(|e| PersistenceError::CorruptRow(format!("{field}: {e}")))
        };
        let parse_opt_key = |field: &str, s: Option<String>| {
            s.map(|s| parse_key(field, s)).transpose()
        };

        let threshold_crossed_at = threshold_crossed_at
            .map(|raw| parse_ts("threshold_crossed_at", raw))
            .transpose()?;

        Ok(TokenState {
            mint: Mint {
                address: parse_key("mint_address", mint_address)?,
                first_seen_slot: first_seen_slot as u64,
                first_seen_at: parse_ts("created_at", created_at)?,
                creator: parse_opt_key("creator", creator)?,
                bonding_curve: parse_opt_key("bonding_curve_key", bonding_curve)?,
                pool: parse_opt_key("pool_address", pool)?,
            },
            first_program: ProgramKind::parse(&first_program)
                .ok_or_else(|| PersistenceError::CorruptRow(format!("first_program {first_program:?}")))?,
            current_program: ProgramKind::parse(&current_program)
                .ok_or_else(|| PersistenceError::CorruptRow(format!("current_program {current_program:?}")))?,
            first_price_sol,
            first_price_usd,
            first_market_cap_usd,
            current_price_sol,
            current_price_usd,
            current_market_cap_usd,
            latest_virtual_sol_reserves: latest_virtual_sol as u64,
            latest_virtual_token_reserves: latest_virtual_token as u64,
            latest_real_sol_reserves: latest_real_sol as u64,
            bonding_curve_progress: 0.0,
            graduated_to_amm,
            threshold_crossed: threshold_crossed_at.is_some(),
            threshold_crossed_at,
            last_price_update: parse_ts("last_price_update", last_price_update)?,
        })
    })())
}

// Trade rows are read back only in tests and ad-hoc queries; the pipeline
// itself never reads trades.
impl SqliteStore {
    pub fn fetch_trade(&self, signature: &str) -> Result<Option<StoredTrade>, PersistenceError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT signature, mint_address, program, trade_type, user_address,
                    sol_amount, token_amount, price_sol, price_usd, market_cap_usd,
                    volume_usd, virtual_sol_reserves, virtual_token_reserves,
                    bonding_curve_progress, slot, block_time
             FROM trades_unified WHERE signature = ?1",
            params![signature],
            |row| {
                Ok(StoredTrade {
                    signature: row.get(0)?,
                    mint_address: row.get(1)?,
                    program: row.get(2)?,
                    trade_type: row.get(3)?,
                    user_address: row.get(4)?,
                    sol_amount: row.get::<_, i64>(5)?,
                    token_amount: row.get::<_, i64>(6)?,
                    price_sol: row.get(7)?,
                    price_usd: row.get(8)?,
                    market_cap_usd: row.get(9)?,
                    volume_usd: row.get(10)?,
                    virtual_sol_reserves: row.get::<_, i64>(11)?,
                    virtual_token_reserves: row.get::<_, i64>(12)?,
                    bonding_curve_progress: row.get(13)?,
                    slot: row.get::<_, i64>(14)?,
                    block_time: row.get(15)?,
                })
            },
        )
        .optional()
        .map_err(map_sqlite_err)
    }
}

/// A trade row as stored, with boundary types left as the columns hold them.
#[derive(Debug, Clone)]
pub struct StoredTrade {
    pub signature: String,
    pub mint_address: String,
    pub program: String,
    pub trade_type: String,
    pub user_address: String,
    pub sol_amount: i64,
    pub token_amount: i64,
    pub price_sol: f64,
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub volume_usd: f64,
    pub virtual_sol_reserves: i64,
    pub virtual_token_reserves: i64,
    pub bonding_curve_progress: Option<f64>,
    pub slot: i64,
    pub block_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use solana_sdk::pubkey::Pubkey;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn sample_state(mint: Pubkey) -> TokenState {
        TokenState {
            mint: Mint {
                address: mint,
                first_seen_slot: 1000,
                first_seen_at: ts(),
                creator: Some(Pubkey::new_unique()),
                bonding_curve: Some(Pubkey::new_unique()),
                pool: None,
            },
            first_program: ProgramKind::BondingCurve,
            current_program: ProgramKind::BondingCurve,
            first_price_sol: 2.8e-8,
            first_price_usd: 4.2e-6,
            first_market_cap_usd: 4200.0,
            current_price_sol: 2.8e-8,
            current_price_usd: 4.2e-6,
            current_market_cap_usd: 4200.0,
            latest_virtual_sol_reserves: 30_000_000_000,
            latest_virtual_token_reserves: 1_073_000_000_000_000,
            latest_real_sol_reserves: 5_000_000_000,
            bonding_curve_progress: 0.058,
            graduated_to_amm: false,
            threshold_crossed: false,
            threshold_crossed_at: None,
            last_price_update: ts(),
        }
    }

    fn sample_trade(signature: &str, mint: Pubkey) -> Trade {
        Trade {
            signature: signature.to_string(),
            mint,
            program: ProgramKind::BondingCurve,
            side: TradeSide::Buy,
            user: Pubkey::new_unique(),
            sol_amount: 1_000_000_000,
            token_amount: 35_000_000_000_000,
            price_sol: 2.8e-8,
            price_usd: 4.2e-6,
            market_cap_usd: 4200.0,
            volume_usd: 150.0,
            virtual_sol_reserves: 30_000_000_000,
            virtual_token_reserves: 1_073_000_000_000_000,
            bonding_curve: Some(Pubkey::new_unique()),
            bonding_curve_progress: Some(0.058),
            slot: 1000,
            block_time: ts(),
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mint = Pubkey::new_unique();
        let state = sample_state(mint);
        store.upsert_token(&state).unwrap();

        let loaded = store.fetch_token(&mint.to_string()).unwrap().unwrap();
        assert_eq!(loaded.mint.address, mint);
        assert_eq!(loaded.first_program, ProgramKind::BondingCurve);
        assert_eq!(loaded.latest_virtual_token_reserves, 1_073_000_000_000_000);
        assert!(!loaded.graduated_to_amm);
        assert!(loaded.threshold_crossed_at.is_none());
    }

    #[test]
    fn test_upsert_preserves_first_fields_and_graduation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mint = Pubkey::new_unique();
        let mut state = sample_state(mint);
        store.upsert_token(&state).unwrap();

        // Graduate with new prices
        state.graduated_to_amm = true;
        state.current_program = ProgramKind::AmmPool;
        state.current_price_sol = 5.0e-8;
        state.first_price_sol = 999.0; // must NOT overwrite the stored first price
        state.threshold_crossed_at = Some(ts());
        store.upsert_token(&state).unwrap();

        let loaded = store.fetch_token(&mint.to_string()).unwrap().unwrap();
        assert!(loaded.graduated_to_amm);
        assert_eq!(loaded.current_program, ProgramKind::AmmPool);
        assert_eq!(loaded.current_price_sol, 5.0e-8);
        assert_eq!(loaded.first_price_sol, 2.8e-8);
        let crossed_at = loaded.threshold_crossed_at.unwrap();

        // A later upsert claiming "not graduated, not crossed" must not regress
        state.graduated_to_amm = false;
        state.current_program = ProgramKind::BondingCurve;
        state.threshold_crossed_at = Some(ts() + chrono::Duration::hours(1));
        store.upsert_token(&state).unwrap();

        let loaded = store.fetch_token(&mint.to_string()).unwrap().unwrap();
        assert!(loaded.graduated_to_amm);
        assert_eq!(loaded.current_program, ProgramKind::AmmPool);
        assert_eq!(loaded.threshold_crossed_at.unwrap(), crossed_at);
    }

    #[test]
    fn test_batch_insert_counts_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mint = Pubkey::new_unique();

        let first = store
            .batch_insert_trades(&[sample_trade("sig-1", mint), sample_trade("sig-2", mint)])
            .unwrap();
        assert_eq!(first, BatchOutcome { inserted: 2, duplicates: 0 });

        // One duplicate and two novel rows: exactly two land, no error
        let second = store
            .batch_insert_trades(&[
                sample_trade("sig-2", mint),
                sample_trade("sig-3", mint),
                sample_trade("sig-4", mint),
            ])
            .unwrap();
        assert_eq!(second, BatchOutcome { inserted: 2, duplicates: 1 });
        assert_eq!(store.count_trades().unwrap(), 4);
    }

    #[test]
    fn test_trade_row_contents() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mint = Pubkey::new_unique();
        store
            .batch_insert_trades(&[sample_trade("sig-a", mint)])
            .unwrap();

        let row = store.fetch_trade("sig-a").unwrap().unwrap();
        assert_eq!(row.trade_type, "buy");
        assert_eq!(row.program, "bonding_curve");
        assert_eq!(row.virtual_sol_reserves, 30_000_000_000);
        assert_eq!(row.mint_address, mint.to_string());
        assert!(store.fetch_trade("missing").unwrap().is_none());
    }

    #[test]
    fn test_pool_snapshots_append_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let snapshot = PoolStateSnapshot {
            mint: Pubkey::new_unique(),
            pool_address: Pubkey::new_unique(),
            virtual_sol_reserves: 100_000_000_000,
            virtual_token_reserves: 500_000_000_000_000,
            real_sol_reserves: Some(90_000_000_000),
            real_token_reserves: None,
            pool_open: true,
            slot: 7000,
        };
        store.insert_pool_snapshot(&snapshot, ts()).unwrap();
        // Same (pool, slot) observed again: no-op
        store.insert_pool_snapshot(&snapshot, ts()).unwrap();

        let mut later = snapshot.clone();
        later.slot = 7001;
        store.insert_pool_snapshot(&later, ts()).unwrap();

        assert_eq!(store.count_pool_snapshots().unwrap(), 2);
    }

    #[test]
    fn test_u64_boundary_is_checked() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut trade = sample_trade("sig-big", Pubkey::new_unique());
        trade.sol_amount = u64::MAX;
        let err = store.batch_insert_trades(&[trade]).unwrap_err();
        assert!(matches!(err, PersistenceError::RangeExceeded { field: "sol_amount", .. }));
    }
}
