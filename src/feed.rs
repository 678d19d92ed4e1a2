use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier of one upstream subscription. Minted at subscribe time and
/// moved between connections on failover.
pub type SubscriptionId = Uuid;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed connection failed: {0}")]
    Connection(String),
    #[error("feed stream closed")]
    Closed,
    #[error("malformed feed record: {0}")]
    Malformed(String),
}

/// One confirmed transaction as delivered by the upstream feed, reduced to
/// the fields the classifier consumes. The wire protocol behind this record
/// is the connector's business; these structs are also the capture format
/// for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedTransaction {
    pub signature: String,
    pub slot: u64,
    /// Unix seconds; absent on feeds that omit block time
    pub block_time: Option<i64>,
    pub message: TransactionMessage,
    pub meta: TransactionMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMessage {
    pub account_keys: Vec<Pubkey>,
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    /// Indexes into `account_keys`
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// None when the transaction succeeded
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default)]
    pub log_messages: Vec<String>,
    #[serde(default)]
    pub pre_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    pub post_token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    pub mint: String,
    pub owner: String,
    pub amount: u64,
}

impl ConfirmedTransaction {
    pub fn succeeded(&self) -> bool {
        self.meta.err.is_none()
    }
}

impl TransactionMessage {
    /// Resolve an instruction's program id through the account-key table.
    pub fn program_id(&self, ix: &CompiledInstruction) -> Option<&Pubkey> {
        self.account_keys.get(ix.program_id_index as usize)
    }

    /// Resolve the n-th account of an instruction through the key table.
    pub fn instruction_account(&self, ix: &CompiledInstruction, position: usize) -> Option<&Pubkey> {
        let key_index = *ix.accounts.get(position)? as usize;
        self.account_keys.get(key_index)
    }
}

pub type TransactionStream =
    Pin<Box<dyn Stream<Item = Result<ConfirmedTransaction, FeedError>> + Send>>;

/// Seam between the supervisor and the upstream feed. A connector opens one
/// stream per (connection, subscription set); the supervisor owns reconnects,
/// health accounting, and failover above this interface.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(
        &self,
        connection_id: &str,
        subscriptions: &[SubscriptionId],
    ) -> Result<TransactionStream, FeedError>;
}

/// Live connector: newline-delimited JSON records over TCP, one
/// `ConfirmedTransaction` per line. A single JSON handshake line carries the
/// auth token, commitment, and subscription set.
pub struct NdjsonTcpConnector {
    endpoint: String,
    token: String,
    commitment: String,
}

impl NdjsonTcpConnector {
    pub fn new(endpoint: String, token: String, commitment: String) -> Self {
        // Accept both bare host:port and a URL-ish prefix
        let endpoint = endpoint
            .trim_start_matches("http://")
            .trim_start_matches("tcp://")
            .to_string();
        Self {
            endpoint,
            token,
            commitment,
        }
    }
}

#[async_trait]
impl FeedConnector for NdjsonTcpConnector {
    async fn connect(
        &self,
        connection_id: &str,
        subscriptions: &[SubscriptionId],
    ) -> Result<TransactionStream, FeedError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| FeedError::Connection(format!("{}: {e}", self.endpoint)))?;
        let (read_half, mut write_half) = stream.into_split();

        let handshake = serde_json::json!({
            "token": self.token,
            "commitment": self.commitment,
            "connection": connection_id,
            "subscriptions": subscriptions,
        });
        let mut line = handshake.to_string();
        line.push('\n');
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;
        info!("🔌 feed connected: {} as {connection_id}", self.endpoint);

        let reader = BufReader::new(read_half);
        let stream = futures::stream::unfold(reader.lines(), |mut lines| async move {
            loop {
                match lines.next_line().await {
                    // Blank lines are keepalives
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let item = serde_json::from_str::<ConfirmedTransaction>(&line)
                            .map_err(|e| FeedError::Malformed(e.to_string()));
                        return Some((item, lines));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(FeedError::Connection(e.to_string())), lines)),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Connector that replays a fixed set of recorded transactions in order and
/// then ends the stream. Used for backfill from captures and as the scripted
/// feed in tests.
#[derive(Clone, Default)]
pub struct ReplayConnector {
    transactions: Arc<parking_lot::Mutex<VecDeque<ConfirmedTransaction>>>,
}

impl ReplayConnector {
    pub fn new(transactions: Vec<ConfirmedTransaction>) -> Self {
        Self {
            transactions: Arc::new(parking_lot::Mutex::new(transactions.into())),
        }
    }

    /// Load a capture file: a JSON array of confirmed-transaction records.
    pub fn from_capture(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let transactions: Vec<ConfirmedTransaction> = serde_json::from_str(&raw)?;
        info!(
            "🎞️ loaded {} transaction(s) from {}",
            transactions.len(),
            path.display()
        );
        Ok(Self::new(transactions))
    }

    /// Queue another transaction for replay.
    pub fn push(&self, tx: ConfirmedTransaction) {
        self.transactions.lock().push_back(tx);
    }

    pub fn remaining(&self) -> usize {
        self.transactions.lock().len()
    }
}

#[async_trait]
impl FeedConnector for ReplayConnector {
    async fn connect(
        &self,
        connection_id: &str,
        _subscriptions: &[SubscriptionId],
    ) -> Result<TransactionStream, FeedError> {
        let drained: Vec<ConfirmedTransaction> = {
            let mut queue = self.transactions.lock();
            queue.drain(..).collect()
        };
        debug!("replaying {} transaction(s) on {connection_id}", drained.len());
        Ok(Box::pin(futures::stream::iter(drained.into_iter().map(Ok))))
    }
}
