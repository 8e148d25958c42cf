use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "amux_protocol::paths::default_control_socket_path")]
    pub control_socket: PathBuf,
    #[serde(default = "amux_protocol::paths::default_hook_socket_path")]
    pub hook_socket: PathBuf,
    #[serde(default = "amux_protocol::paths::state_file_path")]
    pub state_file: PathBuf,
    #[serde(default = "amux_protocol::paths::default_transcripts_root")]
    pub transcripts_root: PathBuf,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    /// Load from the config file when present, fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = amux_protocol::paths::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_socket: amux_protocol::paths::default_control_socket_path(),
            hook_socket: amux_protocol::paths::default_hook_socket_path(),
            state_file: amux_protocol::paths::state_file_path(),
            transcripts_root: amux_protocol::paths::default_transcripts_root(),
            buffer_capacity: default_buffer_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    2 * 1024 * 1024
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}
