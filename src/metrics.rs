use prometheus::{IntCounter, Registry};
use std::collections::BTreeMap;

/// Pipeline-wide counters.
///
/// Registered on a private prometheus registry; nothing here is exported over
/// the wire (dashboards are out of scope), but the same counters back the
/// periodic stats log line and the aggregate-counter section of checkpoints.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,

    pub transactions_seen: IntCounter,
    pub transactions_classified: IntCounter,
    pub events_parsed: IntCounter,
    pub decode_errors: IntCounter,
    pub partial_events: IntCounter,
    pub price_rejections: IntCounter,
    pub trades_processed: IntCounter,
    pub tokens_discovered: IntCounter,
    pub graduations: IntCounter,
    pub trades_inserted: IntCounter,
    pub duplicate_signatures: IntCounter,
    pub batches_flushed: IntCounter,
    pub flush_failures: IntCounter,
    pub breaker_trips: IntCounter,
    pub failovers: IntCounter,
    pub checkpoints_written: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid counter name");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter registration");
    c
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        Self {
            transactions_seen: counter(&registry, "transactions_seen", "transactions read off the feed"),
            transactions_classified: counter(&registry, "transactions_classified", "transactions touching a watched program"),
            events_parsed: counter(&registry, "events_parsed", "typed events recovered from classified transactions"),
            decode_errors: counter(&registry, "decode_errors", "per-event decode failures"),
            partial_events: counter(&registry, "partial_events", "events with missing positional accounts"),
            price_rejections: counter(&registry, "price_rejections", "trades dropped by the price engine guard rails"),
            trades_processed: counter(&registry, "trades_processed", "trades applied to token state"),
            tokens_discovered: counter(&registry, "tokens_discovered", "mints seen for the first time"),
            graduations: counter(&registry, "graduations", "tokens graduated to the AMM"),
            trades_inserted: counter(&registry, "trades_inserted", "trade rows written"),
            duplicate_signatures: counter(&registry, "duplicate_signatures", "trade inserts discarded on signature conflict"),
            batches_flushed: counter(&registry, "batches_flushed", "persistence batches flushed"),
            flush_failures: counter(&registry, "flush_failures", "persistence batch flushes that failed"),
            breaker_trips: counter(&registry, "breaker_trips", "circuit breakers tripped open"),
            failovers: counter(&registry, "failovers", "subscription failovers executed"),
            checkpoints_written: counter(&registry, "checkpoints_written", "checkpoints persisted"),
            registry,
        }
    }

    /// Current counter values, keyed by metric name. This is what checkpoints
    /// store as aggregate counters.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.registry
            .gather()
            .into_iter()
            .filter_map(|family| {
                let name = family.get_name().to_string();
                let value = family.get_metric().first()?.get_counter().get_value();
                Some((name, value as u64))
            })
            .collect()
    }

    /// One-line rollup for the periodic stats log.
    pub fn summary_line(&self) -> String {
        format!(
            "seen={} classified={} parsed={} trades={} inserted={} dupes={} decode_errs={} flush_fails={}",
            self.transactions_seen.get(),
            self.transactions_classified.get(),
            self.events_parsed.get(),
            self.trades_processed.get(),
            self.trades_inserted.get(),
            self.duplicate_signatures.get(),
            self.decode_errors.get(),
            self.flush_failures.get(),
        )
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
