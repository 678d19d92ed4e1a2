use chrono::{DateTime, Duration, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::debug;

use crate::clock::SharedClock;

/// Which entry goes first when the byte budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

impl EvictionPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Some(EvictionPolicy::Lru),
            "lfu" => Some(EvictionPolicy::Lfu),
            "fifo" => Some(EvictionPolicy::Fifo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub compressed_entries: u64,
}

enum Payload {
    Plain(Vec<u8>),
    Compressed { data: Vec<u8>, raw_len: usize },
}

impl Payload {
    fn stored_len(&self) -> usize {
        match self {
            Payload::Plain(data) => data.len(),
            Payload::Compressed { data, .. } => data.len(),
        }
    }
}

struct Entry {
    payload: Payload,
    expires_at: DateTime<Utc>,
    hit_count: u64,
    last_accessed: DateTime<Utc>,
    insert_seq: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    bytes_used: usize,
    insert_seq: u64,
    stats: CacheStats,
    // Hit-rate window driving the adaptive TTL multiplier
    window_requests: u64,
    window_hits: u64,
    previous_rate: f64,
    ttl_multiplier: f64,
}

/// Fixed-byte-capacity cache with per-entry TTL and transparent compression
/// of large values.
///
/// A miss returns absence; the cache never populates itself. The effective
/// TTL is `default_ttl × multiplier`, where the multiplier tracks hit-rate
/// decay: entries live shorter when the working set stops re-hitting.
#[derive(Clone)]
pub struct BoundedCache {
    inner: Arc<RwLock<Inner>>,
    clock: SharedClock,
    max_bytes: usize,
    default_ttl: Duration,
    compression_threshold: usize,
    policy: EvictionPolicy,
}

const TTL_MULTIPLIER_MIN: f64 = 0.5;
const TTL_MULTIPLIER_MAX: f64 = 2.0;
const RATE_WINDOW: u64 = 256;

impl BoundedCache {
    pub fn new(
        clock: SharedClock,
        max_bytes: usize,
        default_ttl_ms: u64,
        compression_threshold: usize,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: HashMap::new(),
                bytes_used: 0,
                insert_seq: 0,
                stats: CacheStats::default(),
                window_requests: 0,
                window_hits: 0,
                previous_rate: 1.0,
                ttl_multiplier: 1.0,
            })),
            clock,
            max_bytes,
            default_ttl: Duration::milliseconds(default_ttl_ms as i64),
            compression_threshold,
            policy,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write();
        inner.stats.total_requests += 1;
        inner.window_requests += 1;

        let expired = match inner.entries.get(key) {
            Some(entry) => now > entry.expires_at,
            None => {
                inner.stats.misses += 1;
                self.roll_window(&mut inner);
                return None;
            }
        };

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.bytes_used -= entry.payload.stored_len();
            }
            inner.stats.expired += 1;
            inner.stats.misses += 1;
            self.roll_window(&mut inner);
            return None;
        }

        let entry = inner.entries.get_mut(key).expect("checked above");
        entry.hit_count += 1;
        entry.last_accessed = now;
        let value = match &entry.payload {
            Payload::Plain(data) => Some(data.clone()),
            Payload::Compressed { data, raw_len } => decompress(data, *raw_len),
        };

        match value {
            Some(value) => {
                inner.stats.hits += 1;
                inner.window_hits += 1;
                self.roll_window(&mut inner);
                Some(value)
            }
            None => {
                // Unreadable entry; drop it and report a miss
                if let Some(entry) = inner.entries.remove(key) {
                    inner.bytes_used -= entry.payload.stored_len();
                }
                inner.stats.misses += 1;
                self.roll_window(&mut inner);
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: Vec<u8>) {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write();

        let payload = if value.len() >= self.compression_threshold {
            let raw_len = value.len();
            let compressed = compress(&value);
            // Keep the compressed form only when it actually shrinks
            if compressed.len() < raw_len {
                inner.stats.compressed_entries += 1;
                Payload::Compressed {
                    data: compressed,
                    raw_len,
                }
            } else {
                Payload::Plain(value)
            }
        } else {
            Payload::Plain(value)
        };

        let ttl_ms = (self.default_ttl.num_milliseconds() as f64 * inner.ttl_multiplier) as i64;
        let expires_at = now + Duration::milliseconds(ttl_ms.max(1));

        if let Some(old) = inner.entries.remove(key) {
            inner.bytes_used -= old.payload.stored_len();
        }
        inner.bytes_used += payload.stored_len();
        inner.insert_seq += 1;
        let seq = inner.insert_seq;
        inner.entries.insert(
            key.to_string(),
            Entry {
                payload,
                expires_at,
                hit_count: 0,
                last_accessed: now,
                insert_seq: seq,
            },
        );

        while inner.bytes_used > self.max_bytes && inner.entries.len() > 1 {
            self.evict_one(&mut inner);
        }
        // A single oversized entry still may not fit; drop it rather than
        // carry an over-budget cache
        if inner.bytes_used > self.max_bytes {
            if let Some(entry) = inner.entries.remove(key) {
                inner.bytes_used -= entry.payload.stored_len();
                inner.stats.evictions += 1;
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.remove(key) {
            inner.bytes_used -= entry.payload.stored_len();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.read().bytes_used
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.read().stats.clone()
    }

    pub fn ttl_multiplier(&self) -> f64 {
        self.inner.read().ttl_multiplier
    }

    fn evict_one(&self, inner: &mut Inner) {
        let victim = match self.policy {
            EvictionPolicy::Lru => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.hit_count, e.insert_seq))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.insert_seq)
                .map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.bytes_used -= entry.payload.stored_len();
                inner.stats.evictions += 1;
                debug!("🗑️ evicted cache entry: {key}");
            }
        }
    }

    /// Every RATE_WINDOW lookups, compare the window's hit rate with the
    /// previous window and steer the TTL multiplier: decaying hit rate
    /// shortens entry lifetimes, a recovering one stretches them.
    fn roll_window(&self, inner: &mut Inner) {
        if inner.window_requests < RATE_WINDOW {
            return;
        }
        let rate = inner.window_hits as f64 / inner.window_requests as f64;
        if rate < inner.previous_rate {
            inner.ttl_multiplier = (inner.ttl_multiplier * 0.9).max(TTL_MULTIPLIER_MIN);
        } else {
            inner.ttl_multiplier = (inner.ttl_multiplier * 1.05).min(TTL_MULTIPLIER_MAX);
        }
        inner.previous_rate = rate;
        inner.window_requests = 0;
        inner.window_hits = 0;
    }
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

fn decompress(data: &[u8], raw_len: usize) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(raw_len);
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}
