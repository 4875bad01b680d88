//! Network Module Implementation
//!
//! Non-blocking sockets, buffered byte streams and length-framed messages,
//! driven by the readiness notifications of a `reactor::EventLoop`.
//!
//! # Components
//!
//! - `Socket`, `ServerSocket`, `ClientSocket`: one owned descriptor each, with
//!   the shared capabilities in the `AsSocket` trait
//! - `RingBuffer` / `InputStream`: fixed-capacity receive buffering, one
//!   `read(2)` per call
//! - `OutputStream`: a queue of shared `Bytes` flushed with one `writev(2)`
//! - `Message`: the `[packet_type | body_length | body]` framing state machine
//! - `MessageClientSocket`: a connection that reassembles and sends messages
//! - `Address` and the resolver functions
//!
//! # Features
//!
//! - "Would block" is never an error: it surfaces as `0`, `None` or `false`
//! - Accept and read drain fully on each edge-triggered notification
//! - One readiness event may complete any number of messages

pub use address::{
    addresses_for_name, addresses_for_uri, interface_addresses_for_port,
    interface_addresses_for_service, Address, Addresses, Service, SocketKind,
};
pub use client_socket::ClientSocket;
pub use input_stream::{InputStream, DEFAULT_INPUT_BUFFER_SIZE};
pub use message::{
    EncodedMessage, Header, Message, WireEncode, DEFAULT_MAX_DATA_LENGTH, HEADER_SIZE,
};
pub use message_client_socket::{MessageCallback, MessageClientSocket};
pub use output_stream::OutputStream;
pub use ring_buffer::RingBuffer;
pub use server_socket::{ConnectionCallback, ServerSocket};
pub use socket::{AsSocket, Socket, SocketHandle};

mod address;
mod client_socket;
mod input_stream;
mod message;
mod message_client_socket;
mod output_stream;
mod ring_buffer;
mod server_socket;
mod socket;
