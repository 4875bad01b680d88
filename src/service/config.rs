use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Installed once by the binary. Library code takes its parameters explicitly
/// and never reads this.
pub static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

pub fn global_config() -> AppResult<&'static AppConfig> {
    GLOBAL_CONFIG
        .get()
        .ok_or_else(|| AppError::IllegalState("global config has not been set up".into()))
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub listen_backlog: i32,
    /// Capacity of each connection's input ring buffer.
    pub input_buffer_size: usize,
    /// Largest body a peer may declare before the connection is dropped.
    pub max_data_length: u32,
    pub no_delay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 1404,
            listen_backlog: 128,
            input_buffer_size: 8 * 1024,
            max_data_length: 1024 * 1024,
            no_delay: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PingConfig {
    /// Connections opened by each client loop.
    pub connections: usize,
    /// Round trips per connection.
    pub ttl: u32,
    /// 0 means one loop per cpu.
    pub client_loops: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            connections: 100,
            ttl: 50,
            client_loops: 2,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub ping: PingConfig,
}

impl AppConfig {
    pub const ENV_PREFIX: &'static str = "WIRENET";

    /// Reads `path` (optional) and then `WIRENET_`-prefixed environment overrides,
    /// e.g. `WIRENET_NETWORK__PORT=2000`.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AppConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str).required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.network.input_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.input_buffer_size must be greater than 0".into(),
            ));
        }
        if self.network.listen_backlog <= 0 {
            return Err(AppError::InvalidValue(format!(
                "network.listen_backlog {} must be positive",
                self.network.listen_backlog
            )));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}
