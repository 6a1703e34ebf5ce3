use std::time::Duration;

use packline::ServerConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Registry updates per second.
    pub tick_rate: u32,
    pub network: ServerConfig,
}

impl RelayConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tick_rate: 30,
            network: ServerConfig::default(),
        }
    }
}
