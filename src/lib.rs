pub mod network;
pub mod reactor;
pub mod service;

pub use network::{
    Address, ClientSocket, InputStream, Message, MessageClientSocket, OutputStream, RingBuffer,
    ServerSocket, Socket,
};
pub use reactor::{EventLoop, LoopHandle, Monitor, Ready};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppConfig, AppError, AppResult, Server,
    ServerContainer, GLOBAL_CONFIG,
};
