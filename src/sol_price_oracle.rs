use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::constants::WRAPPED_SOL_MINT;
use crate::event_bus::{EventBus, PipelineEvent};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("price request failed: {0}")]
    Http(String),
    #[error("malformed price response: {0}")]
    Malformed(String),
    #[error("reading {reading:.2} outside sanity band around {reference:.2}")]
    OutOfBand { reading: f64, reference: f64 },
}

/// Read side of the oracle. Always answers immediately with the most recent
/// good value (the configured fallback until the first poll lands); the
/// price engine never waits on a fresh reading.
#[derive(Clone)]
pub struct SolPriceHandle {
    price: Arc<RwLock<f64>>,
}

impl SolPriceHandle {
    pub fn with_initial(price_usd: f64) -> Self {
        Self {
            price: Arc::new(RwLock::new(price_usd)),
        }
    }

    pub fn current(&self) -> f64 {
        *self.price.read()
    }

    fn set(&self, price_usd: f64) {
        *self.price.write() = price_usd;
    }
}

/// Polls the configured price endpoint and publishes the last good SOL/USD
/// value. A stale reading is not an error; consumers treat the value as
/// best-effort.
pub struct SolPriceOracle {
    client: reqwest::Client,
    config: OracleConfig,
    handle: SolPriceHandle,
    bus: EventBus,
    /// True once at least one live reading was accepted; before that, the
    /// sanity band does not apply (the fallback is config, not observation)
    seeded: bool,
}

impl SolPriceOracle {
    pub fn new(config: OracleConfig, bus: EventBus) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;
        let handle = SolPriceHandle::with_initial(config.fallback_usd);
        Ok(Self {
            client,
            config,
            handle,
            bus,
            seeded: false,
        })
    }

    pub fn handle(&self) -> SolPriceHandle {
        self.handle.clone()
    }

    /// Poll loop; exits when the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        info!("💱 SOL price oracle started ({})", self.config.endpoint);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(price) => self.accept(price),
                        Err(e) => debug!("oracle poll failed, keeping {:.2}: {e}", self.handle.current()),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("💱 SOL price oracle stopped");
    }

    async fn poll_once(&self) -> Result<f64, OracleError> {
        let response = self
            .client
            .get(&self.config.endpoint)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;

        let price = body
            .get(WRAPPED_SOL_MINT)
            .and_then(|entry| entry.get("usdPrice"))
            .and_then(|p| p.as_f64())
            .ok_or_else(|| OracleError::Malformed(body.to_string()))?;

        self.validate(price)?;
        Ok(price)
    }

    /// A reading must be positive and, once a live reading has been seen,
    /// within the configured change factor of it. A wildly different value
    /// is more likely an endpoint glitch than a real move in one interval.
    fn validate(&self, reading: f64) -> Result<(), OracleError> {
        if !(reading > 0.0) || !reading.is_finite() {
            return Err(OracleError::Malformed(format!("price {reading}")));
        }
        if self.seeded {
            let reference = self.handle.current();
            let factor = self.config.max_change_factor.max(1.0);
            if reading > reference * factor || reading < reference / factor {
                return Err(OracleError::OutOfBand { reading, reference });
            }
        }
        Ok(())
    }

    fn accept(&mut self, price: f64) {
        let previous = self.handle.current();
        self.handle.set(price);
        self.seeded = true;
        if (price - previous).abs() > f64::EPSILON {
            self.bus
                .publish(PipelineEvent::SolPriceUpdated { price_usd: price });
        }
        if (price - previous).abs() / previous.max(1e-9) > 0.05 {
            warn!("💱 SOL price moved {:.2} → {:.2}", previous, price);
        }
    }
}
