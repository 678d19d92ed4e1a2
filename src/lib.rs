//! Real-time ingestion and analytics pipeline for a bonding-curve token
//! launch ecosystem.
//!
//! The crate consumes a stream of confirmed transactions, picks out the ones
//! touching the watched launch and AMM programs, decodes their instruction
//! and event payloads, derives canonical trade records and per-mint token
//! state (discovery → threshold crossed → graduation), and persists the
//! results idempotently. A connection supervisor with per-connection circuit
//! breakers, subscription failover, and periodic checkpoints keeps the feed
//! side alive through upstream trouble.

pub mod batcher;
pub mod bounded_cache;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod curve_account;
pub mod dispatcher;
pub mod event_bus;
pub mod feed;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod price_engine;
pub mod sol_price_oracle;
pub mod supervisor;
pub mod trade_event;
pub mod trade_handler;
pub mod types;

// Re-export main types for convenience
pub use batcher::{AdaptiveBatcher, BatchItem, BatcherCore, Priority};
pub use bounded_cache::{BoundedCache, CacheStats, EvictionPolicy};
pub use checkpoint::{Checkpoint, CheckpointStore, ConnectionHealthSnapshot};
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classifier::{
    ClassifiedEvent, InstructionKind, LiquidityChange, LiquidityKind, PrimaryTrade,
    TokenCreation, TransactionClassifier,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use codec::DecodeError;
pub use config::{AppConfig, ConfigError};
pub use curve_account::BondingCurveAccount;
pub use dispatcher::Dispatcher;
pub use event_bus::{EventBus, PipelineEvent};
pub use feed::{
    ConfirmedTransaction, FeedConnector, FeedError, NdjsonTcpConnector, ReplayConnector,
    SubscriptionId, TransactionStream,
};
pub use metrics::PipelineMetrics;
pub use persistence::{BatchOutcome, PersistenceError, SqliteStore};
pub use price_engine::{PriceEngine, PriceError, PriceQuote, Reserves, SafetyCeilings};
pub use sol_price_oracle::{OracleError, SolPriceHandle, SolPriceOracle};
pub use supervisor::{StreamSupervisor, SupervisorError};
pub use trade_event::TradeEvent;
pub use trade_handler::TradeHandler;
pub use types::{Mint, PoolStateSnapshot, ProgramKind, TokenState, Trade, TradeSide};
