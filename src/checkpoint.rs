use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::circuit_breaker::BreakerSnapshot;
use crate::feed::SubscriptionId;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Point-in-time view of one connection's health, as the supervisor sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealthSnapshot {
    pub breaker: BreakerSnapshot,
    pub parse_rate: f64,
    pub latency_ms: f64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
}

/// Periodic snapshot of supervisor state, written on an interval and at
/// shutdown; the latest one is loaded on startup.
///
/// Last-processed slots are advisory: the feed replays from its natural
/// position and the persistence idempotency key absorbs the overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub taken_at: DateTime<Utc>,
    pub connections: BTreeMap<String, ConnectionHealthSnapshot>,
    pub last_slots: BTreeMap<String, u64>,
    pub subscriptions: BTreeMap<String, Vec<SubscriptionId>>,
    pub counters: BTreeMap<String, u64>,
}

/// File-backed checkpoint storage with atomic replacement: a crash mid-write
/// never corrupts the previous checkpoint.
#[derive(Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let raw = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Load the latest checkpoint if one exists and speaks our schema.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&raw).context("parsing checkpoint")?;
        if checkpoint.schema_version != CHECKPOINT_SCHEMA_VERSION {
            warn!(
                "ignoring checkpoint with schema {} (want {})",
                checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION
            );
            return Ok(None);
        }
        info!(
            "📂 loaded checkpoint from {} (taken {})",
            self.path.display(),
            checkpoint.taken_at
        );
        Ok(Some(checkpoint))
    }
}
