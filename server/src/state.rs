//! Shared server state and the disconnect protocol

use crate::broadcast::Broadcaster;
use crate::fault::FaultCell;
use crate::screenshots::ScreenshotSink;
use crate::settings::ServerSettings;
use crate::slot::SlotTable;
use log::{error, info, warn};
use parking_lot::RwLock;
use shared::SettingsPayload;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a peer silent since its last message keeps its slot
pub const CLIENT_TIMEOUT: Duration = Duration::from_millis(8000);
/// How long a new connection has to complete its handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Upper bound on delivering the CONNECTION_END notice to a departing peer
pub const DISCONNECT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything the accept loop, sessions, monitor and console share
///
/// The slot table, the settings and the fault cell each have their own
/// synchronization; this struct itself is immutable once built.
pub struct ServerState {
    pub slots: SlotTable,
    settings: RwLock<ServerSettings>,
    faults: Arc<FaultCell>,
    screenshots: Option<Arc<dyn ScreenshotSink>>,
    shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(settings: ServerSettings, screenshots: Option<Arc<dyn ScreenshotSink>>) -> Self {
        Self {
            slots: SlotTable::new(settings.max_clients),
            settings: RwLock::new(settings),
            faults: Arc::new(FaultCell::new()),
            screenshots,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut ServerSettings)) {
        update(&mut self.settings.write());
    }

    pub fn faults(&self) -> &Arc<FaultCell> {
        &self.faults
    }

    pub fn screenshot_sink(&self) -> Option<Arc<dyn ScreenshotSink>> {
        if self.settings.read().save_screenshots {
            self.screenshots.clone()
        } else {
            None
        }
    }

    /// Root token; every session token is a child of it
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn broadcaster(&self) -> Broadcaster<'_> {
        Broadcaster::new(&self.slots)
    }

    /// Settings message reflecting the current connected-client count
    pub fn settings_payload(&self) -> SettingsPayload {
        self.settings.read().payload(self.slots.active_count())
    }

    pub fn broadcast_settings(&self) {
        let payload = self.settings_payload();
        if let Err(e) = self.broadcaster().settings_to_all(&payload) {
            error!("Failed to encode settings: {}", e);
        }
    }

    /// Tears down the connection in `index` if it still belongs to `generation`
    ///
    /// Closes the socket (telling the peer `reason`), frees the slot, announces
    /// the departure of a handshaken user and pushes the new settings. Returns
    /// false when the slot was already freed or has since been reused.
    pub async fn disconnect(&self, index: usize, generation: u64, reason: &str) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };

        slot.close(generation, reason, DISCONNECT_SEND_TIMEOUT).await;

        let Some(reclaimed) = self.slots.reclaim(index, generation) else {
            return false;
        };

        if reclaimed.received_handshake {
            info!("Client #{} {} has disconnected: {}", index, reclaimed.username, reason);
            self.broadcaster().server_message_to_all(
                &format!("User {} has disconnected : {}", reclaimed.username, reason),
                Some(index),
            );
        } else {
            info!("Client failed to handshake successfully: {}", reason);
        }

        self.broadcast_settings();
        true
    }

    /// Disconnects whatever connection currently occupies `index`
    pub async fn disconnect_current(&self, index: usize, reason: &str) -> bool {
        match self.slots.get(index) {
            Some(slot) => self.disconnect(index, slot.generation(), reason).await,
            None => false,
        }
    }

    /// Disconnects every ready user whose name matches, ignoring case
    pub async fn kick(&self, username: &str, reason: &str) -> usize {
        let mut kicked = 0;
        while let Some(index) = self.slots.find_ready_by_username(username, None, true) {
            if !self.disconnect_current(index, reason).await {
                warn!("Could not kick {} from slot {}", username, index);
                break;
            }
            kicked += 1;
        }
        if kicked == 0 {
            info!("No connected user named {}", username);
        }
        kicked
    }

    /// Disconnects every claimed slot with the same reason
    pub async fn disconnect_all(&self, reason: &str) -> usize {
        let mut disconnected = 0;
        for index in 0..self.slots.capacity() {
            let claimed = self
                .slots
                .get(index)
                .is_some_and(|slot| !slot.can_be_replaced());
            if claimed && self.disconnect_current(index, reason).await {
                disconnected += 1;
            }
        }
        disconnected
    }
}
