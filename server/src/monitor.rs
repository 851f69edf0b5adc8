//! Periodic sweep disconnecting silent clients and reclaiming dead slots

use crate::fault::ServerFault;
use crate::state::{ServerState, CLIENT_TIMEOUT, HANDSHAKE_TIMEOUT};
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time between sweeps
pub const SWEEP_PERIOD: Duration = Duration::from_millis(15);

pub const TIMEOUT_REASON: &str = "Timeout";
pub const CONNECTION_LOST_REASON: &str = "Connection lost";

pub struct TimeoutMonitor {
    state: Arc<ServerState>,
    client_timeout: Duration,
    handshake_timeout: Duration,
}

impl TimeoutMonitor {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            client_timeout: CLIENT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Inspects every slot as of `now`, returning the slots it disconnected
    pub async fn sweep(&self, now: Instant) -> Vec<(usize, &'static str)> {
        let mut disconnected = Vec::new();

        for index in 0..self.state.slots.capacity() {
            let Some(slot) = self.state.slots.get(index) else {
                continue;
            };
            // Read first so a concurrent reclaim-and-claim makes the verdict stale
            let generation = slot.generation();

            let reason = if slot.is_valid() {
                let liveness = slot.liveness();
                if liveness.is_silent(now, self.client_timeout)
                    || liveness.handshake_overdue(now, self.handshake_timeout)
                {
                    Some(TIMEOUT_REASON)
                } else {
                    None
                }
            } else if !slot.can_be_replaced() {
                Some(CONNECTION_LOST_REASON)
            } else {
                None
            };

            if let Some(reason) = reason {
                if self.state.disconnect(index, generation, reason).await {
                    debug!("Monitor disconnected client #{}: {}", index, reason);
                    disconnected.push((index, reason));
                }
            }
        }

        disconnected
    }

    /// Sweeps every [`SWEEP_PERIOD`] until the server shuts down
    pub async fn run(self) -> Result<(), ServerFault> {
        let shutdown = self.state.shutdown_token().clone();
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }
        }

        debug!("Timeout monitor stopped");
        Ok(())
    }
}
