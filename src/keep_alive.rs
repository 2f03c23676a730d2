//! Keep-Alive Ticker: periodic probe that catches silent session death.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::qzone::SessionClient;

pub struct KeepAlive {
    client: SessionClient,
    interval: Duration,
}

impl KeepAlive {
    pub fn new(client: SessionClient, interval: Duration) -> Self {
        Self { client, interval }
    }

    /// Runs until `shutdown` fires. The probe runs inline, so a slow probe
    /// swallows the ticks it overlaps instead of stacking them up.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "keep-alive started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        info!("keep-alive stopped");
    }

    /// One probe; on failure routes through the expiry path.
    pub async fn tick(&self) {
        let agent = self.client.agent();
        let generation = agent.generation();
        match self.client.probe().await {
            Ok(()) => debug!(uin = agent.uin(), "keep-alive ok"),
            Err(e) => {
                warn!(error = %e, "keep-alive probe failed");
                if let Err(e) = agent.on_session_expired(generation).await {
                    warn!(error = %e, "keep-alive refresh failed");
                }
            }
        }
    }
}
