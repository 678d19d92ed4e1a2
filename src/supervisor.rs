use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, ConnectionHealthSnapshot, CHECKPOINT_SCHEMA_VERSION};
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use crate::config::SupervisorConfig;
use crate::event_bus::{EventBus, PipelineEvent};
use crate::feed::SubscriptionId;
use crate::metrics::PipelineMetrics;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no healthy target connections available")]
    NoHealthyTargets,
    #[error("unknown connection {0}")]
    UnknownConnection(String),
}

/// EWMA smoothing for parse-rate and latency health metrics.
const EWMA_ALPHA: f64 = 0.2;

struct ConnectionState {
    breaker: CircuitBreaker,
    /// Moving fraction of relevant transactions that yielded a parseable event
    parse_rate: f64,
    latency_ms: f64,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    subscriptions: Vec<SubscriptionId>,
    last_slot: u64,
    recovery_attempts: u32,
    next_recovery_at: Option<DateTime<Utc>>,
    perf_alerted: bool,
}

impl ConnectionState {
    fn new(breaker: CircuitBreaker) -> Self {
        Self {
            breaker,
            parse_rate: 1.0,
            latency_ms: 0.0,
            last_failure: None,
            last_success: None,
            subscriptions: Vec::new(),
            last_slot: 0,
            recovery_attempts: 0,
            next_recovery_at: None,
            perf_alerted: false,
        }
    }
}

/// Owns the upstream connections: per-connection circuit breakers and health
/// metrics, subscription placement, failover, emergency mode, and the
/// checkpoint/restore cycle.
///
/// The supervisor is a synchronous state machine driven by the connection
/// readers (success/failure/parse observations) and a periodic `tick`; all
/// time comes from the injected clock.
pub struct StreamSupervisor {
    config: SupervisorConfig,
    clock: SharedClock,
    bus: EventBus,
    metrics: PipelineMetrics,
    connections: BTreeMap<String, ConnectionState>,
    emergency_until: Option<DateTime<Utc>>,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        clock: SharedClock,
        bus: EventBus,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            config,
            clock,
            bus,
            metrics,
            connections: BTreeMap::new(),
            emergency_until: None,
        }
    }

    fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: Duration::milliseconds(self.config.recovery_timeout_ms as i64),
            half_open_requests: self.config.half_open_requests,
            monitoring_window: Duration::milliseconds(self.config.monitoring_window_ms as i64),
        }
    }

    pub fn register_connection(&mut self, id: &str) {
        let breaker = CircuitBreaker::new(self.breaker_config());
        self.connections
            .entry(id.to_string())
            .or_insert_with(|| ConnectionState::new(breaker));
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    /// Mint a fresh subscription on a connection.
    pub fn add_subscription(&mut self, id: &str) -> Result<SubscriptionId, SupervisorError> {
        let state = self
            .connections
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownConnection(id.to_string()))?;
        let subscription = Uuid::new_v4();
        state.subscriptions.push(subscription);
        Ok(subscription)
    }

    pub fn subscriptions(&self, id: &str) -> Vec<SubscriptionId> {
        self.connections
            .get(id)
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn circuit_state(&mut self, id: &str) -> Option<CircuitState> {
        let now = self.clock.now_utc();
        self.connections.get_mut(id).map(|s| s.breaker.state(now))
    }

    pub fn allow_request(&mut self, id: &str) -> bool {
        let now = self.clock.now_utc();
        self.connections
            .get_mut(id)
            .map(|s| s.breaker.allow_request(now))
            .unwrap_or(false)
    }

    pub fn last_slot(&self, id: &str) -> u64 {
        self.connections.get(id).map(|s| s.last_slot).unwrap_or(0)
    }

    pub fn note_slot(&mut self, id: &str, slot: u64) {
        if let Some(state) = self.connections.get_mut(id) {
            state.last_slot = state.last_slot.max(slot);
        }
    }

    pub fn record_success(&mut self, id: &str, latency_ms: f64) {
        let now = self.clock.now_utc();
        let Some(state) = self.connections.get_mut(id) else {
            return;
        };
        let was_open = state.breaker.state(now) != CircuitState::Closed;
        state.breaker.record_success(now);
        state.last_success = Some(now);
        state.latency_ms = EWMA_ALPHA * latency_ms + (1.0 - EWMA_ALPHA) * state.latency_ms;

        if was_open && state.breaker.state(now) == CircuitState::Closed {
            info!("✅ connection {id} recovered (breaker closed)");
            state.recovery_attempts = 0;
            state.next_recovery_at = None;
        }
        self.check_performance(id);
    }

    pub fn record_failure(&mut self, id: &str) {
        let now = self.clock.now_utc();
        let tripped = match self.connections.get_mut(id) {
            Some(state) => {
                state.last_failure = Some(now);
                state.breaker.record_failure(now)
            }
            None => return,
        };
        if tripped {
            self.metrics.breaker_trips.inc();
            warn!("⛔ connection {id} circuit opened");
            if let Err(SupervisorError::NoHealthyTargets) = self.failover(id) {
                self.enter_emergency(now);
            }
        }
    }

    /// Record whether a classified-as-relevant transaction produced a
    /// parseable event.
    pub fn record_parse_observation(&mut self, id: &str, parsed: bool) {
        let Some(state) = self.connections.get_mut(id) else {
            return;
        };
        let observation = if parsed { 1.0 } else { 0.0 };
        state.parse_rate = EWMA_ALPHA * observation + (1.0 - EWMA_ALPHA) * state.parse_rate;
        self.check_performance(id);
    }

    /// Emit performance_degradation on the transition into degraded health;
    /// the circuit state is never changed here.
    fn check_performance(&mut self, id: &str) {
        let parse_floor = self.config.parse_rate_alert_threshold;
        let latency_ceiling = self.config.latency_alert_ms;
        let Some(state) = self.connections.get_mut(id) else {
            return;
        };
        let degraded = state.parse_rate < parse_floor || state.latency_ms > latency_ceiling;
        if degraded && !state.perf_alerted {
            state.perf_alerted = true;
            let (parse_rate, latency_ms) = (state.parse_rate, state.latency_ms);
            warn!(
                "📉 connection {id} degraded (parse {:.2}, latency {:.0}ms)",
                parse_rate, latency_ms
            );
            self.bus.publish(PipelineEvent::PerformanceDegradation {
                connection_id: id.to_string(),
                parse_rate,
                latency_ms,
            });
        } else if !degraded {
            state.perf_alerted = false;
        }
    }

    /// Move an opened connection's subscriptions to healthy peers, evenly
    /// partitioned. Subscriptions are moved, never duplicated.
    fn failover(&mut self, failed: &str) -> Result<(), SupervisorError> {
        let now = self.clock.now_utc();
        self.schedule_recovery(failed, now);

        let healthy_floor = self.config.healthy_parse_rate_floor;
        let mut targets: Vec<String> = Vec::new();
        for (id, state) in self.connections.iter_mut() {
            if id.as_str() != failed
                && state.breaker.state(now) == CircuitState::Closed
                && state.parse_rate >= healthy_floor
            {
                targets.push(id.clone());
            }
        }
        if targets.is_empty() {
            return Err(SupervisorError::NoHealthyTargets);
        }

        let moved = match self.connections.get_mut(failed) {
            Some(state) => std::mem::take(&mut state.subscriptions),
            None => return Err(SupervisorError::UnknownConnection(failed.to_string())),
        };
        if moved.is_empty() {
            return Ok(());
        }

        let mut partitions: BTreeMap<&str, Vec<SubscriptionId>> = BTreeMap::new();
        for (i, subscription) in moved.iter().enumerate() {
            partitions
                .entry(targets[i % targets.len()].as_str())
                .or_default()
                .push(*subscription);
        }

        for (target, partition) in partitions {
            info!(
                "🔀 failover: {} subscription(s) {failed} → {target}",
                partition.len()
            );
            if let Some(state) = self.connections.get_mut(target) {
                state.subscriptions.extend(partition.iter().copied());
            }
            self.metrics.failovers.inc();
            self.bus.publish(PipelineEvent::Failover {
                from: failed.to_string(),
                to: target.to_string(),
                subscriptions: partition,
            });
        }
        Ok(())
    }

    fn schedule_recovery(&mut self, id: &str, now: DateTime<Utc>) {
        let backoff_ms = self.config.recovery_backoff_ms;
        let max_attempts = self.config.max_recovery_attempts;
        if let Some(state) = self.connections.get_mut(id) {
            if state.recovery_attempts >= max_attempts {
                warn!("connection {id} exhausted its {max_attempts} recovery attempts");
                state.next_recovery_at = None;
                return;
            }
            let exp = backoff_ms.saturating_mul(1u64 << state.recovery_attempts.min(16));
            // ±10% jitter keeps simultaneous recoveries from thundering
            let jitter = 0.9 + fastrand::f64() * 0.2;
            let delay = Duration::milliseconds((exp as f64 * jitter) as i64);
            state.recovery_attempts += 1;
            state.next_recovery_at = Some(now + delay);
        }
    }

    fn enter_emergency(&mut self, now: DateTime<Utc>) {
        if self.emergency_until.is_some() {
            return;
        }
        let wait = Duration::milliseconds((self.config.recovery_backoff_ms * 5) as i64);
        self.emergency_until = Some(now + wait);
        warn!("🚨 no healthy connections left; emergency reset in {}ms", wait.num_milliseconds());
        self.bus.publish(PipelineEvent::Emergency {
            reason: "no healthy target connections".to_string(),
        });
    }

    pub fn in_emergency(&self) -> bool {
        self.emergency_until.is_some()
    }

    /// Periodic housekeeping: finish an emergency window with a forced
    /// breaker reset, surface due recovery attempts, and hand a subscription
    /// back to recovered-but-idle connections. Returns the connections due
    /// for a reconnect attempt.
    pub fn tick(&mut self) -> Vec<String> {
        let now = self.clock.now_utc();

        if let Some(until) = self.emergency_until {
            if now >= until {
                for (id, state) in self.connections.iter_mut() {
                    state.breaker.force_close();
                    state.recovery_attempts = 0;
                    state.next_recovery_at = None;
                    info!("🔧 emergency reset: breaker {id} forced closed");
                }
                self.emergency_until = None;
                self.bus.publish(PipelineEvent::EmergencyRecovery);
            }
        }

        let mut due = Vec::new();
        for (id, state) in self.connections.iter_mut() {
            if matches!(state.next_recovery_at, Some(at) if now >= at) {
                state.next_recovery_at = None;
                due.push(id.clone());
            }
        }

        self.rebalance();
        due
    }

    /// Give every healthy idle connection something to read: move one
    /// subscription over from the most-loaded healthy peer when it can spare
    /// one.
    fn rebalance(&mut self) {
        let now = self.clock.now_utc();
        loop {
            let mut idle: Option<String> = None;
            let mut donor: Option<(String, usize)> = None;
            for (id, state) in self.connections.iter_mut() {
                if state.breaker.state(now) != CircuitState::Closed {
                    continue;
                }
                let len = state.subscriptions.len();
                if len == 0 && idle.is_none() {
                    idle = Some(id.clone());
                } else if len >= 2 && donor.as_ref().map(|(_, l)| len > *l).unwrap_or(true) {
                    donor = Some((id.clone(), len));
                }
            }
            let (Some(idle), Some((donor, _))) = (idle, donor) else {
                break;
            };
            let Some(subscription) = self
                .connections
                .get_mut(&donor)
                .and_then(|s| s.subscriptions.pop())
            else {
                break;
            };
            if let Some(state) = self.connections.get_mut(&idle) {
                state.subscriptions.push(subscription);
            }
            info!("⚖️ rebalanced one subscription {donor} → {idle}");
            self.bus.publish(PipelineEvent::Failover {
                from: donor,
                to: idle,
                subscriptions: vec![subscription],
            });
        }
    }

    /// Snapshot everything the next process needs to resume.
    pub fn checkpoint(&self) -> Checkpoint {
        let mut connections = BTreeMap::new();
        let mut last_slots = BTreeMap::new();
        let mut subscriptions = BTreeMap::new();
        for (id, state) in &self.connections {
            connections.insert(
                id.clone(),
                ConnectionHealthSnapshot {
                    breaker: state.breaker.snapshot(),
                    parse_rate: state.parse_rate,
                    latency_ms: state.latency_ms,
                    last_failure: state.last_failure,
                    last_success: state.last_success,
                    recovery_attempts: state.recovery_attempts,
                },
            );
            last_slots.insert(id.clone(), state.last_slot);
            subscriptions.insert(id.clone(), state.subscriptions.clone());
        }
        Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            taken_at: self.clock.now_utc(),
            connections,
            last_slots,
            subscriptions,
            counters: self.metrics.snapshot(),
        }
    }

    /// Restore connection health from the latest checkpoint. Breaker states
    /// carry over as-is (an Open breaker stays Open, its recovery timer
    /// already running); subscription ids re-register verbatim.
    pub fn restore_from(&mut self, checkpoint: &Checkpoint) {
        let breaker_config = self.breaker_config();
        for (id, health) in &checkpoint.connections {
            let mut state =
                ConnectionState::new(CircuitBreaker::restore(breaker_config, &health.breaker));
            state.parse_rate = health.parse_rate;
            state.latency_ms = health.latency_ms;
            state.last_failure = health.last_failure;
            state.last_success = health.last_success;
            state.recovery_attempts = health.recovery_attempts;
            state.last_slot = checkpoint.last_slots.get(id).copied().unwrap_or(0);
            state.subscriptions = checkpoint
                .subscriptions
                .get(id)
                .cloned()
                .unwrap_or_default();
            self.connections.insert(id.clone(), state);
        }
        info!(
            "🔁 restored {} connection(s) from checkpoint taken {}",
            checkpoint.connections.len(),
            checkpoint.taken_at
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
            half_open_requests: 2,
            monitoring_window_ms: 60_000,
            recovery_backoff_ms: 5_000,
            max_recovery_attempts: 5,
            ..SupervisorConfig::default()
        }
    }

    fn rig() -> (StreamSupervisor, ManualClock, EventBus) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let bus = EventBus::new(64);
        let supervisor =
            StreamSupervisor::new(config(), shared, bus.clone(), PipelineMetrics::new());
        (supervisor, clock, bus)
    }

    fn two_connections(supervisor: &mut StreamSupervisor) {
        supervisor.register_connection("conn-a");
        supervisor.register_connection("conn-b");
        supervisor.add_subscription("conn-a").unwrap();
        supervisor.add_subscription("conn-a").unwrap();
        supervisor.add_subscription("conn-b").unwrap();
    }

    fn drain_kinds(rx: &mut tokio::sync::broadcast::Receiver<PipelineEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    #[test]
    fn test_failover_moves_subscriptions() {
        let (mut supervisor, _clock, bus) = rig();
        let mut rx = bus.subscribe();
        two_connections(&mut supervisor);
        let moved: Vec<_> = supervisor.subscriptions("conn-a");

        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }

        assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Open));
        assert!(supervisor.subscriptions("conn-a").is_empty());
        let on_b = supervisor.subscriptions("conn-b");
        assert_eq!(on_b.len(), 3);
        for subscription in moved {
            assert!(on_b.contains(&subscription));
        }
        assert!(drain_kinds(&mut rx).contains(&"failover"));
    }

    #[test]
    fn test_recovery_cycle_closed_after_probes() {
        let (mut supervisor, clock, _bus) = rig();
        two_connections(&mut supervisor);
        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }
        assert!(!supervisor.allow_request("conn-a"));

        clock.advance_millis(30_000);
        assert_eq!(
            supervisor.circuit_state("conn-a"),
            Some(CircuitState::HalfOpen)
        );
        assert!(supervisor.allow_request("conn-a"));
        supervisor.record_success("conn-a", 20.0);
        assert!(supervisor.allow_request("conn-a"));
        supervisor.record_success("conn-a", 20.0);

        assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Closed));
        assert!(supervisor.allow_request("conn-a"));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (mut supervisor, clock, _bus) = rig();
        two_connections(&mut supervisor);
        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }
        clock.advance_millis(30_000);
        assert!(supervisor.allow_request("conn-a"));
        supervisor.record_failure("conn-a");
        assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Open));
    }

    #[test]
    fn test_emergency_when_all_connections_fail() {
        let (mut supervisor, clock, bus) = rig();
        let mut rx = bus.subscribe();
        two_connections(&mut supervisor);

        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }
        for _ in 0..3 {
            supervisor.record_failure("conn-b");
        }
        assert!(supervisor.in_emergency());
        let kinds = drain_kinds(&mut rx);
        assert!(kinds.contains(&"emergency"));

        // Before the window elapses nothing resets
        clock.advance_millis(5 * 5_000 - 1);
        supervisor.tick();
        assert!(supervisor.in_emergency());
        assert_eq!(supervisor.circuit_state("conn-b"), Some(CircuitState::Open));

        clock.advance_millis(2);
        supervisor.tick();
        assert!(!supervisor.in_emergency());
        assert_eq!(supervisor.circuit_state("conn-a"), Some(CircuitState::Closed));
        assert_eq!(supervisor.circuit_state("conn-b"), Some(CircuitState::Closed));
        assert!(drain_kinds(&mut rx).contains(&"emergency_recovery"));
    }

    #[test]
    fn test_unhealthy_parse_rate_not_a_failover_target() {
        let (mut supervisor, _clock, _bus) = rig();
        two_connections(&mut supervisor);
        // Push conn-b's parse rate to the floor
        for _ in 0..60 {
            supervisor.record_parse_observation("conn-b", false);
        }

        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }
        // conn-b was not a viable target: emergency instead of failover
        assert!(supervisor.in_emergency());
    }

    #[test]
    fn test_performance_degradation_event_is_edge_triggered() {
        let (mut supervisor, _clock, bus) = rig();
        let mut rx = bus.subscribe();
        supervisor.register_connection("conn-a");

        for _ in 0..60 {
            supervisor.record_parse_observation("conn-a", false);
        }
        let degradations = drain_kinds(&mut rx)
            .iter()
            .filter(|k| **k == "performance_degradation")
            .count();
        assert_eq!(degradations, 1);
    }

    #[test]
    fn test_checkpoint_restore_preserves_open_breaker() {
        let (mut supervisor, _clock, _bus) = rig();
        two_connections(&mut supervisor);
        supervisor.note_slot("conn-a", 4_242);
        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }
        let checkpoint = supervisor.checkpoint();

        // "Restart": a fresh supervisor restores the snapshot
        let (mut restored, _, _) = rig();
        restored.restore_from(&checkpoint);
        assert_eq!(restored.circuit_state("conn-a"), Some(CircuitState::Open));
        assert_eq!(restored.last_slot("conn-a"), 4_242);
        assert_eq!(restored.subscriptions("conn-b").len(), 3);

        // The recovery timer continues from the original opened_at: a fresh
        // supervisor whose clock sits one timeout later sees HalfOpen
        let shared = ManualClock::new(checkpoint.taken_at + Duration::milliseconds(30_000));
        let mut after = StreamSupervisor::new(
            config(),
            Arc::new(shared),
            EventBus::new(8),
            PipelineMetrics::new(),
        );
        after.restore_from(&checkpoint);
        assert_eq!(after.circuit_state("conn-a"), Some(CircuitState::HalfOpen));
    }

    #[test]
    fn test_rebalance_feeds_idle_connection() {
        let (mut supervisor, _clock, _bus) = rig();
        supervisor.register_connection("conn-a");
        supervisor.register_connection("conn-b");
        supervisor.add_subscription("conn-a").unwrap();
        supervisor.add_subscription("conn-a").unwrap();
        supervisor.add_subscription("conn-a").unwrap();

        supervisor.tick();
        assert_eq!(supervisor.subscriptions("conn-a").len(), 2);
        assert_eq!(supervisor.subscriptions("conn-b").len(), 1);
    }

    #[test]
    fn test_recovery_attempts_scheduled_with_backoff() {
        let (mut supervisor, clock, _bus) = rig();
        two_connections(&mut supervisor);
        for _ in 0..3 {
            supervisor.record_failure("conn-a");
        }

        assert!(supervisor.tick().is_empty());
        // First attempt lands within [0.9, 1.1] × backoff
        clock.advance_millis(5_600);
        let due = supervisor.tick();
        assert_eq!(due, vec!["conn-a".to_string()]);
        // And is not re-issued until rescheduled
        assert!(supervisor.tick().is_empty());
    }
}
