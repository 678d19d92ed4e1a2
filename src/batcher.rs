use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::BatcherConfig;
use crate::event_bus::{EventBus, PipelineEvent};
use crate::metrics::PipelineMetrics;
use crate::persistence::{PersistenceError, SqliteStore};
use crate::types::{PoolStateSnapshot, TokenState, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Work accepted by the batching worker. Token upserts ride ahead of trades;
/// pool snapshots yield to both.
#[derive(Debug, Clone)]
pub enum BatchItem {
    TokenUpsert(TokenState),
    Trade(Trade),
    PoolSnapshot(PoolStateSnapshot),
}

impl BatchItem {
    pub fn priority(&self) -> Priority {
        match self {
            BatchItem::TokenUpsert(_) => Priority::High,
            BatchItem::Trade(_) => Priority::Normal,
            BatchItem::PoolSnapshot(_) => Priority::Low,
        }
    }
}

struct Pending {
    item: BatchItem,
    enqueued_at: DateTime<Utc>,
}

/// Batching core: priority queues, adaptive batch sizing, and the flush
/// path with its one-retry-then-degrade policy. Separated from the task
/// wrapper so the behavior is directly testable.
pub struct BatcherCore {
    store: SqliteStore,
    bus: EventBus,
    metrics: PipelineMetrics,
    clock: SharedClock,
    config: BatcherConfig,

    high: VecDeque<Pending>,
    normal: VecDeque<Pending>,
    low: VecDeque<Pending>,

    batch_size: usize,
    /// Moving admissions-per-second estimate, updated on admit
    throughput: f64,
    last_admit: Option<DateTime<Utc>>,
    degraded: bool,
}

impl BatcherCore {
    pub fn new(
        store: SqliteStore,
        bus: EventBus,
        metrics: PipelineMetrics,
        clock: SharedClock,
        config: BatcherConfig,
    ) -> Self {
        let batch_size = config.min_batch;
        Self {
            store,
            bus,
            metrics,
            clock,
            config,
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            batch_size,
            throughput: 0.0,
            last_admit: None,
            degraded: false,
        }
    }

    pub fn admit(&mut self, item: BatchItem) {
        let now = self.clock.now_utc();
        if let Some(last) = self.last_admit {
            let gap_ms = (now - last).num_milliseconds().max(1) as f64;
            let instant_rate = 1_000.0 / gap_ms;
            self.throughput = 0.9 * self.throughput + 0.1 * instant_rate;
        }
        self.last_admit = Some(now);

        let pending = Pending {
            item,
            enqueued_at: now,
        };
        match pending.item.priority() {
            Priority::High => self.high.push_back(pending),
            Priority::Normal => self.normal.push_back(pending),
            Priority::Low => self.low.push_back(pending),
        }
    }

    pub fn pending(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn should_flush(&self) -> bool {
        self.pending() >= self.batch_size
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Assemble the next batch. High preempts Normal and Low, but anything
    /// that has waited past the aging window goes first so lower priorities
    /// are never starved outright.
    fn assemble(&mut self) -> Vec<BatchItem> {
        let now = self.clock.now_utc();
        let aging = chrono::Duration::milliseconds(self.config.aging_window_ms as i64);
        let mut batch = Vec::with_capacity(self.batch_size.min(self.pending()));

        while batch.len() < self.batch_size {
            let aged_normal = self
                .normal
                .front()
                .map(|p| now - p.enqueued_at > aging)
                .unwrap_or(false);
            let aged_low = self
                .low
                .front()
                .map(|p| now - p.enqueued_at > aging)
                .unwrap_or(false);

            let next = if aged_low {
                self.low.pop_front()
            } else if aged_normal {
                self.normal.pop_front()
            } else if !self.high.is_empty() {
                self.high.pop_front()
            } else if !self.normal.is_empty() {
                self.normal.pop_front()
            } else {
                self.low.pop_front()
            };

            match next {
                Some(p) => batch.push(p.item),
                None => break,
            }
        }
        batch
    }

    /// Flush one batch. A transient write failure is retried once; a second
    /// failure requeues the batch and escalates as persistence.degraded.
    pub fn flush(&mut self) -> usize {
        let batch = self.assemble();
        if batch.is_empty() {
            return 0;
        }
        let size = batch.len();
        let started = std::time::Instant::now();

        match self.write(&batch).or_else(|first| {
            debug!("batch flush failed once, retrying: {first}");
            self.write(&batch)
        }) {
            Ok(()) => {
                self.metrics.batches_flushed.inc();
                self.degraded = false;
                self.adapt(started.elapsed(), size);
                size
            }
            Err(e) => {
                self.metrics.flush_failures.inc();
                warn!("⚠️ batch flush failed twice, requeuing {size} items: {e}");
                // Put the batch back at the front in original order
                let now = self.clock.now_utc();
                for item in batch.into_iter().rev() {
                    let pending = Pending {
                        item,
                        enqueued_at: now,
                    };
                    match pending.item.priority() {
                        Priority::High => self.high.push_front(pending),
                        Priority::Normal => self.normal.push_front(pending),
                        Priority::Low => self.low.push_front(pending),
                    }
                }
                if !self.degraded {
                    self.degraded = true;
                    self.bus.publish(PipelineEvent::PersistenceDegraded {
                        reason: e.to_string(),
                    });
                }
                0
            }
        }
    }

    fn write(&self, batch: &[BatchItem]) -> Result<(), PersistenceError> {
        let mut trades: Vec<Trade> = Vec::new();
        for item in batch {
            match item {
                BatchItem::TokenUpsert(state) => self.store.upsert_token(state)?,
                BatchItem::Trade(trade) => trades.push(trade.clone()),
                BatchItem::PoolSnapshot(snapshot) => self
                    .store
                    .insert_pool_snapshot(snapshot, self.clock.now_utc())?,
            }
        }
        if !trades.is_empty() {
            let outcome = self.store.batch_insert_trades(&trades)?;
            self.metrics.trades_inserted.inc_by(outcome.inserted as u64);
            self.metrics
                .duplicate_signatures
                .inc_by(outcome.duplicates as u64);
        }
        Ok(())
    }

    /// Steer the batch size toward the configured flush-latency target.
    fn adapt(&mut self, elapsed: StdDuration, _flushed: usize) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        let next = if elapsed_ms > self.config.target_flush_latency_ms {
            (self.batch_size as f64 * 0.8) as usize
        } else {
            (self.batch_size as f64 * 1.25) as usize + 1
        };
        self.batch_size = next.clamp(self.config.min_batch, self.config.max_batch);
    }

    /// Drain everything; used at shutdown. Degraded batches are abandoned
    /// after `max_attempts` full passes; persistence is idempotent, so a
    /// replay after restart reproduces them.
    pub fn drain(&mut self, max_attempts: usize) {
        let mut attempts = 0;
        while self.pending() > 0 && attempts < max_attempts {
            if self.flush() == 0 {
                attempts += 1;
            }
        }
        if self.pending() > 0 {
            warn!("🛑 abandoning {} unflushed items at shutdown", self.pending());
        }
    }
}

/// Handle for submitting work to the batching worker. The channel is the
/// queue bound; a full queue back-pressures the caller.
#[derive(Clone)]
pub struct AdaptiveBatcher {
    tx: mpsc::Sender<BatchItem>,
}

impl AdaptiveBatcher {
    pub fn spawn(
        store: SqliteStore,
        bus: EventBus,
        metrics: PipelineMetrics,
        clock: SharedClock,
        config: BatcherConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<BatchItem>(config.max_queue_size.max(1));
        let timeout = StdDuration::from_millis(config.batch_timeout_ms.max(1));
        let mut core = BatcherCore::new(store, bus, metrics, clock, config);

        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timeout);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => {
                            core.admit(item);
                            if core.should_flush() {
                                core.flush();
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if core.pending() > 0 {
                            core.flush();
                        }
                    }
                }
            }
            core.drain(3);
            info!("💾 batcher drained and stopped");
        });

        (Self { tx }, worker)
    }

    /// Submit one item. Returns false when the batcher has shut down.
    pub async fn submit(&self, item: BatchItem) -> bool {
        self.tx.send(item).await.is_ok()
    }
}
