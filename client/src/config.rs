//! Client connection settings

use shared::{DEFAULT_PORT, MAX_USERNAME_LENGTH};
use std::path::PathBuf;

/// Directory shared with the external application
pub const DEFAULT_PLUGIN_DIR: &str = "PluginData/kerballivefeed/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub username: String,
    /// `host:port` of the server
    pub server: String,
    pub plugin_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: "username".to_string(),
            server: format!("127.0.0.1:{}", DEFAULT_PORT),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
        }
    }
}

impl ClientConfig {
    pub fn new(username: &str, server: impl Into<String>, plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            username: clamp_username(username),
            server: server.into(),
            plugin_dir: plugin_dir.into(),
        }
    }
}

/// Trims surrounding whitespace and cuts the name to [`MAX_USERNAME_LENGTH`] characters
pub fn clamp_username(username: &str) -> String {
    username.trim().chars().take(MAX_USERNAME_LENGTH).collect()
}
