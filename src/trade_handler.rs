use chrono::{DateTime, TimeZone, Utc};
use lru::LruCache;
use solana_sdk::pubkey::Pubkey;
use std::num::NonZeroUsize;
use tracing::{debug, info, warn};

use crate::batcher::{AdaptiveBatcher, BatchItem};
use crate::bounded_cache::BoundedCache;
use crate::classifier::{ClassifiedEvent, LiquidityChange, PrimaryTrade, TokenCreation};
use crate::curve_account::BondingCurveAccount;
use crate::config::MonitorConfig;
use crate::event_bus::{EventBus, PipelineEvent};
use crate::metrics::PipelineMetrics;
use crate::persistence::SqliteStore;
use crate::price_engine::{PriceEngine, PriceQuote, Reserves};
use crate::sol_price_oracle::SolPriceHandle;
use crate::types::{Mint, PoolStateSnapshot, ProgramKind, TokenState, Trade, TradeSide};

/// Creation details remembered until the first trade discovers the token.
#[derive(Debug, Clone)]
struct CreationInfo {
    creator: Pubkey,
    bonding_curve: Pubkey,
}

const PENDING_CREATIONS: usize = 10_000;

/// Applies classified events to per-mint token state and queues the results
/// for persistence.
///
/// One handler instance serves one shard; all events for a given mint arrive
/// here in order, which is what linearizes the state machine. State is
/// queued to the batcher only after the in-memory update, so persisted
/// trades always agree with the token's current price.
pub struct TradeHandler {
    engine: PriceEngine,
    sol_price: SolPriceHandle,
    store: SqliteStore,
    batcher: AdaptiveBatcher,
    bus: EventBus,
    metrics: PipelineMetrics,
    monitor: MonitorConfig,
    /// Shard-local recent state; avoids a read-modify-write round trip per event
    state_cache: LruCache<Pubkey, TokenState>,
    pending_creations: LruCache<Pubkey, CreationInfo>,
    /// Shared pool-address → mint index learned from AMM trades
    pool_index: BoundedCache,
}

impl TradeHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: PriceEngine,
        sol_price: SolPriceHandle,
        store: SqliteStore,
        batcher: AdaptiveBatcher,
        bus: EventBus,
        metrics: PipelineMetrics,
        monitor: MonitorConfig,
        pool_index: BoundedCache,
        state_cache_entries: usize,
    ) -> Self {
        Self {
            engine,
            sol_price,
            store,
            batcher,
            bus,
            metrics,
            monitor,
            state_cache: LruCache::new(
                NonZeroUsize::new(state_cache_entries.max(1)).expect("non-zero cache size"),
            ),
            pending_creations: LruCache::new(
                NonZeroUsize::new(PENDING_CREATIONS).expect("non-zero cache size"),
            ),
            pool_index,
        }
    }

    pub async fn handle_event(&mut self, event: ClassifiedEvent) {
        match event {
            ClassifiedEvent::BcCreate(creation) => self.handle_creation(creation).await,
            ClassifiedEvent::BcTrade(trade) | ClassifiedEvent::AmmTrade(trade) => {
                self.handle_trade(trade).await
            }
            ClassifiedEvent::AmmDeposit(change)
            | ClassifiedEvent::AmmWithdraw(change)
            | ClassifiedEvent::AmmFee(change) => self.handle_liquidity(change),
        }
    }

    /// Apply an on-chain curve account observation. The account is the
    /// authoritative completion source; anything short of complete is
    /// ignored here (prices only move on trades).
    pub async fn apply_curve_account(&mut self, mint: Pubkey, account: &BondingCurveAccount) {
        if account.is_complete() {
            self.apply_curve_completion(mint).await;
        }
    }

    /// A curve account observed with complete = true graduates the token
    /// even before its first AMM trade.
    pub async fn apply_curve_completion(&mut self, mint: Pubkey) {
        let Some(mut state) = self.load_state(&mint) else {
            debug!("curve completion for untracked mint {mint}");
            return;
        };
        if self.graduate(&mut state, None) {
            self.store_state(mint, state).await;
        }
    }

    async fn handle_trade(&mut self, trade: PrimaryTrade) {
        let event = &trade.event;
        let mint = event.mint;
        let reserves = Reserves {
            virtual_sol: event.virtual_sol_reserves,
            virtual_token: event.virtual_token_reserves,
            real_sol: event.real_sol_reserves,
        };

        let quote = match self
            .engine
            .compute(trade.program, reserves, self.sol_price.current())
        {
            Ok(quote) => quote,
            Err(e) => {
                self.metrics.price_rejections.inc();
                warn!("dropping trade {}: {e}", trade.signature);
                return;
            }
        };

        let prior = self.load_state(&mint);
        let block_time = resolve_block_time(prior.as_ref(), trade.block_time, trade.slot);

        let mut state = match prior {
            Some(state) => state,
            None => {
                let threshold = match trade.program {
                    ProgramKind::BondingCurve => self.monitor.bc_save_threshold_usd,
                    ProgramKind::AmmPool => self.monitor.amm_save_threshold_usd,
                };
                if !self.monitor.save_all_tokens && quote.market_cap_usd < threshold {
                    debug!(
                        "ignoring {} below save threshold ({:.0} < {:.0})",
                        mint, quote.market_cap_usd, threshold
                    );
                    return;
                }
                self.discover(&trade, &quote, block_time)
            }
        };

        if trade.program == ProgramKind::AmmPool {
            // First AMM trade for a curve-resident token is proof of
            // graduation even if the completed curve was never observed
            self.graduate(&mut state, trade.venue);
        }

        state.current_price_sol = quote.price_sol;
        state.current_price_usd = quote.price_usd;
        state.current_market_cap_usd = quote.market_cap_usd;
        state.latest_virtual_sol_reserves = event.virtual_sol_reserves;
        state.latest_virtual_token_reserves = event.virtual_token_reserves;
        state.latest_real_sol_reserves = event.real_sol_reserves;
        state.last_price_update = block_time;
        if trade.program == ProgramKind::BondingCurve {
            state.bonding_curve_progress = quote.progress;
            if state.mint.bonding_curve.is_none() {
                state.mint.bonding_curve = trade.venue;
            }
        }

        if state.current_program == ProgramKind::BondingCurve
            && !state.threshold_crossed
            && quote.market_cap_usd >= self.monitor.bc_save_threshold_usd
        {
            state.threshold_crossed = true;
            state.threshold_crossed_at = Some(block_time);
            self.bus.publish(PipelineEvent::TokenThresholdCrossed {
                mint,
                at: block_time,
            });
        }

        // A curve that sold out of real tokens or reached the graduation
        // target is complete; don't wait for the account read or the first
        // AMM trade to flip the flag
        if trade.program == ProgramKind::BondingCurve
            && (event.real_token_reserves == 0
                || event.real_sol_reserves >= crate::constants::GRADUATION_TARGET_LAMPORTS)
        {
            self.graduate(&mut state, None);
        }

        let side = if event.is_buy {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        let trade_row = Trade {
            signature: trade.signature.clone(),
            mint,
            program: trade.program,
            side,
            user: trade.user_wallet.unwrap_or(event.user),
            sol_amount: event.sol_amount,
            token_amount: event.token_amount,
            price_sol: quote.price_sol,
            price_usd: quote.price_usd,
            market_cap_usd: quote.market_cap_usd,
            volume_usd: (event.sol_amount as f64 / crate::constants::LAMPORTS_PER_SOL as f64)
                * self.sol_price.current(),
            virtual_sol_reserves: event.virtual_sol_reserves,
            virtual_token_reserves: event.virtual_token_reserves,
            bonding_curve: state.mint.bonding_curve,
            bonding_curve_progress: (trade.program == ProgramKind::BondingCurve)
                .then_some(quote.progress),
            slot: trade.slot,
            block_time,
        };

        // In-memory state first, then the queue: the persisted trade must
        // agree with the token's updated price
        self.store_state(mint, state.clone()).await;
        if !self.batcher.submit(BatchItem::Trade(trade_row)).await {
            self.state_cache.pop(&mint);
            return;
        }

        if trade.program == ProgramKind::AmmPool {
            if let Some(pool) = trade.venue {
                self.pool_index
                    .put(&pool.to_string(), mint.to_bytes().to_vec());
                let snapshot = PoolStateSnapshot {
                    mint,
                    pool_address: pool,
                    virtual_sol_reserves: event.virtual_sol_reserves,
                    virtual_token_reserves: event.virtual_token_reserves,
                    real_sol_reserves: Some(event.real_sol_reserves),
                    real_token_reserves: Some(event.real_token_reserves),
                    pool_open: true,
                    slot: trade.slot,
                };
                if !self.batcher.submit(BatchItem::PoolSnapshot(snapshot)).await {
                    return;
                }
            }
        }

        self.metrics.trades_processed.inc();
        self.bus.publish(PipelineEvent::TradeProcessed {
            signature: trade.signature,
            mint,
            side,
            volume_usd: (event.sol_amount as f64 / crate::constants::LAMPORTS_PER_SOL as f64)
                * self.sol_price.current(),
        });
    }

    fn discover(
        &mut self,
        trade: &PrimaryTrade,
        quote: &PriceQuote,
        block_time: DateTime<Utc>,
    ) -> TokenState {
        let mint_address = trade.event.mint;
        let creation = self.pending_creations.pop(&mint_address);
        let graduated = trade.program == ProgramKind::AmmPool;

        let state = TokenState {
            mint: Mint {
                address: mint_address,
                first_seen_slot: trade.slot,
                first_seen_at: block_time,
                creator: creation.as_ref().map(|c| c.creator),
                bonding_curve: match trade.program {
                    ProgramKind::BondingCurve => {
                        trade.venue.or(creation.as_ref().map(|c| c.bonding_curve))
                    }
                    ProgramKind::AmmPool => creation.as_ref().map(|c| c.bonding_curve),
                },
                pool: graduated.then(|| trade.venue).flatten(),
            },
            first_program: trade.program,
            current_program: trade.program,
            first_price_sol: quote.price_sol,
            first_price_usd: quote.price_usd,
            first_market_cap_usd: quote.market_cap_usd,
            current_price_sol: quote.price_sol,
            current_price_usd: quote.price_usd,
            current_market_cap_usd: quote.market_cap_usd,
            latest_virtual_sol_reserves: trade.event.virtual_sol_reserves,
            latest_virtual_token_reserves: trade.event.virtual_token_reserves,
            latest_real_sol_reserves: trade.event.real_sol_reserves,
            bonding_curve_progress: if graduated { 0.0 } else { quote.progress },
            graduated_to_amm: graduated,
            threshold_crossed: false,
            threshold_crossed_at: None,
            last_price_update: block_time,
        };

        self.metrics.tokens_discovered.inc();
        info!(
            "🆕 discovered {} on {} (mcap {:.0} USD)",
            mint_address,
            trade.program.as_str(),
            quote.market_cap_usd
        );
        self.bus.publish(PipelineEvent::TokenDiscovered {
            mint: mint_address,
            program: trade.program,
            market_cap_usd: quote.market_cap_usd,
        });
        state
    }

    /// Irreversible transition to the AMM venue. Returns true when the state
    /// actually changed, and emits token.graduated exactly once per mint.
    fn graduate(&mut self, state: &mut TokenState, pool: Option<Pubkey>) -> bool {
        if state.graduated_to_amm {
            if state.mint.pool.is_none() && pool.is_some() {
                state.mint.pool = pool;
                return true;
            }
            return false;
        }
        state.graduated_to_amm = true;
        state.current_program = ProgramKind::AmmPool;
        if state.mint.pool.is_none() {
            state.mint.pool = pool;
        }
        self.metrics.graduations.inc();
        info!("🎓 {} graduated to the AMM", state.mint.address);
        self.bus.publish(PipelineEvent::TokenGraduated {
            mint: state.mint.address,
        });
        true
    }

    async fn handle_creation(&mut self, creation: TokenCreation) {
        debug!(
            "token creation {} by {} (curve {})",
            creation.mint, creation.creator, creation.bonding_curve
        );
        if let Some(mut state) = self.load_state(&creation.mint) {
            // Trades beat the creation here; backfill identity fields once
            let mut changed = false;
            if state.mint.creator.is_none() {
                state.mint.creator = Some(creation.creator);
                changed = true;
            }
            if state.mint.bonding_curve.is_none() {
                state.mint.bonding_curve = Some(creation.bonding_curve);
                changed = true;
            }
            if changed {
                self.store_state(creation.mint, state).await;
            }
        } else {
            self.pending_creations.put(
                creation.mint,
                CreationInfo {
                    creator: creation.creator,
                    bonding_curve: creation.bonding_curve,
                },
            );
        }
    }

    fn handle_liquidity(&mut self, change: LiquidityChange) {
        let Some(pool) = change.pool else {
            return;
        };
        match self.resolve_pool(&pool) {
            Some(mint) => debug!(
                "liquidity {:?} on pool {} (mint {}) in {}",
                change.kind, pool, mint, change.signature
            ),
            // Nothing to attribute the event to; downstream consumers may
            // discard classified-but-partial events
            None => debug!(
                "liquidity {:?} on unknown pool {} in {}",
                change.kind, pool, change.signature
            ),
        }
    }

    fn resolve_pool(&self, pool: &Pubkey) -> Option<Pubkey> {
        let bytes = self.pool_index.get(&pool.to_string())?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Pubkey::new_from_array(arr))
    }

    fn load_state(&mut self, mint: &Pubkey) -> Option<TokenState> {
        if let Some(state) = self.state_cache.get(mint) {
            return Some(state.clone());
        }
        match self.store.fetch_token(&mint.to_string()) {
            Ok(Some(state)) => {
                self.state_cache.put(*mint, state.clone());
                Some(state)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("state load failed for {mint}: {e}");
                None
            }
        }
    }

    async fn store_state(&mut self, mint: Pubkey, state: TokenState) {
        self.state_cache.put(mint, state.clone());
        if !self.batcher.submit(BatchItem::TokenUpsert(state)).await {
            // Write path is gone; the cached entry can no longer be trusted
            self.state_cache.pop(&mint);
        }
    }
}

/// Observable trade timing comes from the feed: block time when present,
/// otherwise a per-mint monotonic fallback (last observed block time, or the
/// slot mapped onto the epoch for a mint with no history). Never the wall
/// clock.
fn resolve_block_time(
    prior: Option<&TokenState>,
    block_time: Option<i64>,
    slot: u64,
) -> DateTime<Utc> {
    if let Some(seconds) = block_time {
        if let chrono::LocalResult::Single(dt) = Utc.timestamp_opt(seconds, 0) {
            return dt;
        }
    }
    match prior {
        Some(state) => state.last_price_update,
        None => Utc
            .timestamp_opt(slot.min(i64::MAX as u64) as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap()),
    }
}
