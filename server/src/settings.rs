//! Process-wide server configuration and the cadence values derived from it

use shared::{SettingsPayload, DEFAULT_PORT};
use std::path::PathBuf;

/// Lower bound on the update interval pushed to clients, in milliseconds
pub const MIN_UPDATE_INTERVAL: u32 = 250;
/// Upper bound on the update interval pushed to clients, in milliseconds
pub const MAX_UPDATE_INTERVAL: u32 = 500;

/// Configuration snapshot shared by every server task
///
/// Held behind a single lock in the server state so that fields read
/// together (for example when building a settings payload) stay consistent.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    /// Target number of state updates per second across the whole session
    pub updates_per_second: u32,
    /// Sent to every new connection right after the handshake when non-empty
    pub join_message: String,
    pub screenshot_interval: u32,
    pub save_screenshots: bool,
    pub screenshot_dir: PathBuf,
    /// Whether state updates are also echoed back to the client that sent them
    pub relay_updates_to_sender: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_clients: 32,
            updates_per_second: 60,
            join_message: String::new(),
            screenshot_interval: 3000,
            save_screenshots: false,
            screenshot_dir: PathBuf::from("klfScreenshots"),
            relay_updates_to_sender: false,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Interval each client should wait between updates so that the whole
    /// session produces roughly `updates_per_second` updates
    pub fn update_interval(&self, active_clients: usize) -> u32 {
        compute_update_interval(self.updates_per_second, active_clients)
    }

    /// Builds the settings message for the given number of connected clients
    pub fn payload(&self, active_clients: usize) -> SettingsPayload {
        SettingsPayload {
            update_interval: self.update_interval(active_clients),
            max_queued_updates: max_queued_updates(active_clients),
            screenshot_interval: self.screenshot_interval,
        }
    }
}

/// `round(1000 / (updates_per_second / active_clients))`, clamped to
/// `[MIN_UPDATE_INTERVAL, MAX_UPDATE_INTERVAL]`
pub fn compute_update_interval(updates_per_second: u32, active_clients: usize) -> u32 {
    if active_clients == 0 || updates_per_second == 0 {
        return MIN_UPDATE_INTERVAL;
    }

    let per_client = updates_per_second as f64 / active_clients as f64;
    let interval = (1000.0 / per_client).round();

    if interval < MIN_UPDATE_INTERVAL as f64 {
        MIN_UPDATE_INTERVAL
    } else if interval > MAX_UPDATE_INTERVAL as f64 {
        MAX_UPDATE_INTERVAL
    } else {
        interval as u32
    }
}

/// Inbound updates a client should keep buffered: two per other client
pub fn max_queued_updates(active_clients: usize) -> u32 {
    (active_clients.saturating_sub(1) * 2) as u32
}
