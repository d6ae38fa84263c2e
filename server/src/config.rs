use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration of a game server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier reported in metrics, useful when several servers share a store.
    pub server_id: String,
    pub host: String,
    /// 0 lets the OS pick a port.
    pub port: u16,
    /// Game ticks per second.
    pub tick_rate: u32,
    pub save_interval: Duration,
    /// JSON snapshot backing the bundled in-memory store.
    pub snapshot_path: Option<PathBuf>,
    pub install_signal_handlers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "server-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5555,
            tick_rate: 20,
            save_interval: Duration::from_millis(300_000),
            snapshot_path: None,
            install_signal_handlers: true,
        }
    }
}

impl ServerConfig {
    /// Fixed tick period, also the per-tick time budget.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
