use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batcher::AdaptiveBatcher;
use crate::bounded_cache::{BoundedCache, EvictionPolicy};
use crate::checkpoint::CheckpointStore;
use crate::classifier::TransactionClassifier;
use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::event_bus::{EventBus, PipelineEvent};
use crate::feed::FeedConnector;
use crate::metrics::PipelineMetrics;
use crate::persistence::SqliteStore;
use crate::price_engine::{PriceEngine, SafetyCeilings};
use crate::sol_price_oracle::SolPriceOracle;
use crate::supervisor::StreamSupervisor;
use crate::trade_handler::TradeHandler;

/// Pause between reconnect attempts when the breaker blocks a connection or
/// its subscription set is empty.
const READER_IDLE: Duration = Duration::from_millis(500);
/// Cadence of the supervisor housekeeping tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Cadence of the stats rollup log line.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Wire the whole pipeline and run it until the shutdown signal flips.
///
/// Layout, one task per concern: a reader per feed connection, a handler per
/// mint shard, the batching worker, the oracle, and the housekeeping task
/// (supervisor tick + checkpoints + stats). On shutdown everything drains in
/// dependency order and a final checkpoint is written.
pub async fn run(
    config: AppConfig,
    connector: Arc<dyn FeedConnector>,
    store: SqliteStore,
    clock: SharedClock,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bus = EventBus::new(config.pipeline.event_bus_capacity);
    let metrics = PipelineMetrics::new();

    let oracle = SolPriceOracle::new(config.oracle.clone(), bus.clone())?;
    let sol_price = oracle.handle();
    let oracle_task = tokio::spawn(oracle.run(shutdown.clone()));

    let (batcher, batcher_task) = AdaptiveBatcher::spawn(
        store.clone(),
        bus.clone(),
        metrics.clone(),
        clock.clone(),
        config.batcher.clone(),
    );

    let eviction = EvictionPolicy::parse(&config.cache.eviction_policy).unwrap_or_else(|| {
        warn!(
            "unknown cache.eviction_policy {:?}, using lru",
            config.cache.eviction_policy
        );
        EvictionPolicy::Lru
    });
    let pool_index = BoundedCache::new(
        clock.clone(),
        config.cache.max_bytes,
        config.cache.default_ttl_ms,
        config.cache.compression_threshold,
        eviction,
    );

    let engine = PriceEngine::new(SafetyCeilings {
        bonding_curve_usd: config.monitor.bc_max_market_cap_usd,
        amm_pool_usd: config.monitor.amm_max_market_cap_usd,
    });

    let (dispatcher, shard_tasks) = Dispatcher::spawn(
        config.pipeline.shards,
        config.pipeline.shard_queue_depth,
        |_shard| {
            TradeHandler::new(
                engine,
                sol_price.clone(),
                store.clone(),
                batcher.clone(),
                bus.clone(),
                metrics.clone(),
                config.monitor.clone(),
                pool_index.clone(),
                4_096,
            )
        },
    );

    let classifier = Arc::new(TransactionClassifier::new(
        config.bonding_curve_program()?,
        config.amm_pool_program()?,
        metrics.clone(),
    ));

    let mut supervisor = StreamSupervisor::new(
        config.supervisor.clone(),
        clock.clone(),
        bus.clone(),
        metrics.clone(),
    );
    let checkpoint_store = CheckpointStore::new(&config.supervisor.checkpoint_path);
    match checkpoint_store.load() {
        Ok(Some(checkpoint)) => supervisor.restore_from(&checkpoint),
        Ok(None) => {}
        Err(e) => warn!("checkpoint load failed, starting cold: {e:#}"),
    }
    for i in 0..config.upstream.connections {
        supervisor.register_connection(&format!("conn-{i}"));
    }
    // Every connection needs at least one subscription to read from; a
    // restored checkpoint may already carry them
    for id in supervisor.connection_ids() {
        if supervisor.subscriptions(&id).is_empty() {
            match supervisor.add_subscription(&id) {
                Ok(subscription) => debug!("subscription {subscription} on {id}"),
                Err(e) => warn!("subscription setup on {id} failed: {e}"),
            }
        }
    }
    let supervisor = Arc::new(Mutex::new(supervisor));

    let mut reader_tasks: Vec<JoinHandle<()>> = Vec::new();
    for id in supervisor.lock().await.connection_ids() {
        reader_tasks.push(tokio::spawn(run_reader(
            id,
            connector.clone(),
            supervisor.clone(),
            classifier.clone(),
            dispatcher.clone(),
            shutdown.clone(),
        )));
    }

    let housekeeping_task = tokio::spawn(run_housekeeping(
        supervisor.clone(),
        checkpoint_store.clone(),
        metrics.clone(),
        bus.clone(),
        config.supervisor.checkpoint_interval_ms,
        shutdown.clone(),
    ));

    // Wait for the stop signal
    let mut shutdown_watch = shutdown.clone();
    while !*shutdown_watch.borrow() {
        if shutdown_watch.changed().await.is_err() {
            break;
        }
    }
    info!("🛑 shutdown: draining pipeline");

    for task in reader_tasks {
        let _ = task.await;
    }
    drop(dispatcher);
    for task in shard_tasks {
        let _ = task.await;
    }
    drop(batcher);
    let _ = batcher_task.await;
    let _ = housekeeping_task.await;
    let _ = oracle_task.await;

    // Final checkpoint after the drain so the counters include it all
    write_checkpoint(&supervisor, &checkpoint_store, &metrics, &bus).await;
    info!("👋 pipeline stopped");
    Ok(())
}

async fn run_reader(
    id: String,
    connector: Arc<dyn FeedConnector>,
    supervisor: Arc<Mutex<StreamSupervisor>>,
    classifier: Arc<TransactionClassifier>,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let (allowed, subscriptions) = {
            let mut sup = supervisor.lock().await;
            (sup.allow_request(&id), sup.subscriptions(&id))
        };
        if !allowed || subscriptions.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(READER_IDLE) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let mut stream = match connector.connect(&id, &subscriptions).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connection {id} failed to connect: {e}");
                supervisor.lock().await.record_failure(&id);
                tokio::select! {
                    _ = tokio::time::sleep(READER_IDLE) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(tx)) => {
                        let started = Instant::now();
                        let relevant = classifier.touches_watched(&tx);
                        let events = classifier.classify(&tx);
                        {
                            let mut sup = supervisor.lock().await;
                            sup.note_slot(&id, tx.slot);
                            if relevant {
                                sup.record_parse_observation(&id, !events.is_empty());
                            }
                            sup.record_success(&id, started.elapsed().as_secs_f64() * 1_000.0);
                        }
                        for event in events {
                            // A full shard queue stalls this reader; that is
                            // the back-pressure path
                            if !dispatcher.dispatch(event).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("connection {id} stream error: {e}");
                        supervisor.lock().await.record_failure(&id);
                        break;
                    }
                    None => {
                        debug!("connection {id} stream ended");
                        supervisor.lock().await.record_failure(&id);
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(READER_IDLE) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run_housekeeping(
    supervisor: Arc<Mutex<StreamSupervisor>>,
    checkpoint_store: CheckpointStore,
    metrics: PipelineMetrics,
    bus: EventBus,
    checkpoint_interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut checkpoint_tick =
        tokio::time::interval(Duration::from_millis(checkpoint_interval_ms.max(1_000)));
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    // The first tick of every interval fires immediately; swallow them
    tick.tick().await;
    checkpoint_tick.tick().await;
    stats_tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let due = supervisor.lock().await.tick();
                for id in due {
                    info!("🔁 recovery attempt due for {id}");
                }
            }
            _ = checkpoint_tick.tick() => {
                write_checkpoint(&supervisor, &checkpoint_store, &metrics, &bus).await;
            }
            _ = stats_tick.tick() => {
                info!("📊 {}", metrics.summary_line());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn write_checkpoint(
    supervisor: &Arc<Mutex<StreamSupervisor>>,
    checkpoint_store: &CheckpointStore,
    metrics: &PipelineMetrics,
    bus: &EventBus,
) {
    let checkpoint = supervisor.lock().await.checkpoint();
    match checkpoint_store.save(&checkpoint) {
        Ok(()) => {
            metrics.checkpoints_written.inc();
            bus.publish(PipelineEvent::CheckpointWritten {
                at: checkpoint.taken_at,
            });
        }
        Err(e) => warn!("checkpoint write failed: {e:#}"),
    }
}
