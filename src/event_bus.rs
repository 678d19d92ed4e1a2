use chrono::{DateTime, Utc};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::broadcast;

use crate::feed::SubscriptionId;
use crate::types::{ProgramKind, TradeSide};

/// Everything the pipeline announces in-process. Deliveries are observations,
/// not authoritative state; consumers must tolerate redelivery and drops.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    TokenDiscovered {
        mint: Pubkey,
        program: ProgramKind,
        market_cap_usd: f64,
    },
    TokenThresholdCrossed {
        mint: Pubkey,
        at: DateTime<Utc>,
    },
    TokenGraduated {
        mint: Pubkey,
    },
    TradeProcessed {
        signature: String,
        mint: Pubkey,
        side: TradeSide,
        volume_usd: f64,
    },
    SolPriceUpdated {
        price_usd: f64,
    },
    PersistenceDegraded {
        reason: String,
    },
    PerformanceDegradation {
        connection_id: String,
        parse_rate: f64,
        latency_ms: f64,
    },
    Failover {
        from: String,
        to: String,
        subscriptions: Vec<SubscriptionId>,
    },
    Emergency {
        reason: String,
    },
    EmergencyRecovery,
    CheckpointWritten {
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Stable dotted name, used in logs and by filtering consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::TokenDiscovered { .. } => "token.discovered",
            PipelineEvent::TokenThresholdCrossed { .. } => "token.threshold_crossed",
            PipelineEvent::TokenGraduated { .. } => "token.graduated",
            PipelineEvent::TradeProcessed { .. } => "trade.processed",
            PipelineEvent::SolPriceUpdated { .. } => "sol.price_updated",
            PipelineEvent::PersistenceDegraded { .. } => "persistence.degraded",
            PipelineEvent::PerformanceDegradation { .. } => "performance_degradation",
            PipelineEvent::Failover { .. } => "failover",
            PipelineEvent::Emergency { .. } => "emergency",
            PipelineEvent::EmergencyRecovery => "emergency_recovery",
            PipelineEvent::CheckpointWritten { .. } => "checkpoint.written",
        }
    }
}

/// In-process typed publish/subscribe.
///
/// Publishing is synchronous on the publisher's task and ordered per
/// publisher. A subscriber that falls behind loses the oldest events
/// (broadcast lag) rather than stalling the pipeline.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Best-effort publish; having no subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        tracing::debug!("📣 {}", event.kind());
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
