pub use app_error::{AppError, AppResult};
pub(crate) use app_error::is_transient;
pub use config::{global_config, AppConfig, NetworkConfig, PingConfig, GLOBAL_CONFIG};
pub use ping::{
    echo_connection_callback, echo_messages, run_ping_loop, ConnectionOptions, PingReport,
    PK_PING,
};
pub use server::{Server, ServerContainer};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod ping;
mod server;
mod tracing_config;
