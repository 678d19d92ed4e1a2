use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::classifier::ClassifiedEvent;
use crate::trade_handler::TradeHandler;

/// Fans classified events out to a per-mint-sharded pool of handler tasks.
///
/// Shard = hash(mint) mod N, so every event for a given mint lands on the
/// same task and per-mint state transitions are linearized without a global
/// lock. The per-shard queues are bounded; a full queue stalls the caller,
/// which is the back-pressure path up to the connection reader.
#[derive(Clone)]
pub struct Dispatcher {
    senders: Vec<mpsc::Sender<ClassifiedEvent>>,
}

impl Dispatcher {
    /// Spawn `shards` handler tasks; `make_handler` builds the shard-local
    /// handler for each.
    pub fn spawn<F>(
        shards: usize,
        queue_depth: usize,
        mut make_handler: F,
    ) -> (Self, Vec<JoinHandle<()>>)
    where
        F: FnMut(usize) -> TradeHandler,
    {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<ClassifiedEvent>(queue_depth.max(1));
            let mut handler = make_handler(shard);
            workers.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    handler.handle_event(event).await;
                }
                info!("shard {shard} handler stopped");
            }));
            senders.push(tx);
        }

        (Self { senders }, workers)
    }

    /// Route one event to its shard. Suspends when the shard queue is full;
    /// returns false once the shard pool has shut down.
    pub async fn dispatch(&self, event: ClassifiedEvent) -> bool {
        let shard = self.shard_of(&event);
        self.senders[shard].send(event).await.is_ok()
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    fn shard_of(&self, event: &ClassifiedEvent) -> usize {
        let mut hasher = DefaultHasher::new();
        match event.mint() {
            Some(mint) => mint.to_bytes().hash(&mut hasher),
            // Liquidity events have no mint; key them by pool so one pool's
            // events stay ordered, falling back to the signature
            None => match event {
                ClassifiedEvent::AmmDeposit(l)
                | ClassifiedEvent::AmmWithdraw(l)
                | ClassifiedEvent::AmmFee(l) => match l.pool {
                    Some(pool) => pool.to_bytes().hash(&mut hasher),
                    None => l.signature.hash(&mut hasher),
                },
                _ => event.signature().hash(&mut hasher),
            },
        }
        (hasher.finish() % self.senders.len() as u64) as usize
    }
}
