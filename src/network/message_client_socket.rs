use std::collections::VecDeque;
use std::fmt;
use std::net::Shutdown;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use tracing::{debug, trace};

use super::{
    Address, AsSocket, ClientSocket, EncodedMessage, InputStream, Message, OutputStream,
    SocketHandle,
};
use crate::reactor::{EventLoop, Monitor, Ready};
use crate::{AppError, AppResult};

/// Called with the loop and the connection that triggered it.
pub type MessageCallback = Rc<dyn Fn(&mut EventLoop, &mut MessageClientSocket) -> AppResult<()>>;

/// A stream connection that speaks length-framed messages.
///
/// Reads are drained into an `InputStream` and reassembled into `Message`s;
/// sends are queued on an `OutputStream` and flushed with one vectored write
/// per readiness.
pub struct MessageClientSocket {
    client_socket: ClientSocket,
    input_stream: InputStream,
    output_stream: OutputStream,
    message: Message,
    received: VecDeque<Message>,
    writable: bool,
    connect_pending: bool,
    connected_notified: bool,
    pub message_received_callback: Option<MessageCallback>,
    pub connected_callback: Option<MessageCallback>,
}

impl fmt::Debug for MessageClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageClientSocket")
            .field("client_socket", &self.client_socket)
            .field("available", &self.input_stream.available())
            .field("pending_output", &self.output_stream.pending())
            .field("received", &self.received.len())
            .field("writable", &self.writable)
            .field("connect_pending", &self.connect_pending)
            .finish()
    }
}

impl MessageClientSocket {
    /// Wraps a socket that is connected or has a non-blocking connect in flight.
    pub fn new(client_socket: ClientSocket, connect_pending: bool) -> AppResult<Self> {
        client_socket.set_non_blocking(true)?;
        Ok(MessageClientSocket {
            client_socket,
            input_stream: InputStream::default(),
            output_stream: OutputStream::new(),
            message: Message::new(),
            received: VecDeque::new(),
            writable: false,
            connect_pending,
            connected_notified: false,
            message_received_callback: None,
            connected_callback: None,
        })
    }

    /// Adopts a descriptor handed over by a listening socket.
    pub fn from_handle(handle: SocketHandle, address: Address) -> AppResult<Self> {
        MessageClientSocket::new(ClientSocket::from_handle(handle, address), false)
    }

    /// Starts a non-blocking connect to the first address that accepts one.
    ///
    /// Completion, or failure, is observed on the first write-readiness once
    /// the connection is monitored.
    pub fn connect(addresses: &[Address]) -> AppResult<Self> {
        for address in addresses {
            let mut client_socket = ClientSocket::new();
            match client_socket.connect_non_blocking(address) {
                Ok(connected) => return MessageClientSocket::new(client_socket, !connected),
                Err(err) => debug!("connect to {} failed: {}", address, err),
            }
        }
        Err(AppError::ConnectionError(format!(
            "no address out of {} accepted a connection",
            addresses.len()
        )))
    }

    pub fn with_input_buffer_size(mut self, size: usize) -> Self {
        self.input_stream = InputStream::new(size);
        self
    }

    pub fn with_max_data_length(mut self, max_data_length: usize) -> Self {
        self.message = Message::new().with_max_data_length(max_data_length);
        self
    }

    pub fn on_message(mut self, callback: MessageCallback) -> Self {
        self.message_received_callback = Some(callback);
        self
    }

    pub fn on_connected(mut self, callback: MessageCallback) -> Self {
        self.connected_callback = Some(callback);
        self
    }

    pub fn socket(&self) -> &ClientSocket {
        &self.client_socket
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_connect_pending(&self) -> bool {
        self.connect_pending
    }

    pub fn pending_output(&self) -> usize {
        self.output_stream.pending()
    }

    pub fn received_messages(&mut self) -> &mut VecDeque<Message> {
        &mut self.received
    }

    pub fn pop_message(&mut self) -> Option<Message> {
        self.received.pop_front()
    }

    /// Seals `message` if it has not been sized yet, then queues it.
    pub fn send_message(&mut self, message: &mut Message) -> AppResult<()> {
        if !message.header_complete() {
            message.update_size()?;
        }
        self.send_encoded(message.to_buffers()?)
    }

    /// Queues an already encoded message; the buffers are shared, not copied.
    pub fn send_encoded(&mut self, encoded: EncodedMessage) -> AppResult<()> {
        self.output_stream.append(encoded.header);
        self.output_stream.append(encoded.body);
        if self.writable && !self.connect_pending {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes queued output until the queue is empty or the socket stops
    /// taking bytes.
    pub fn flush(&mut self) -> AppResult<usize> {
        let fd = self.fd()?;
        let mut total = 0;
        while !self.output_stream.is_empty() {
            let written = self.output_stream.write_to(fd)?;
            if written == 0 {
                self.writable = false;
                break;
            }
            total += written;
        }
        Ok(total)
    }

    pub fn shutdown(&self, mode: Shutdown) -> AppResult<()> {
        self.client_socket.shutdown(mode)
    }

    /// Leaves the loop and closes the descriptor. Meant for callbacks running
    /// inside this connection's own dispatch; queued output is abandoned.
    pub fn close(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        let fd = self.fd()?;
        if event_loop.is_monitoring(fd) {
            event_loop.stop_monitoring(fd)?;
        }
        self.client_socket.close()
    }

    fn fd(&self) -> AppResult<RawFd> {
        self.client_socket
            .file_descriptor()
            .ok_or_else(|| AppError::IllegalState("connection is closed".into()))
    }

    fn handle_readable(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        while self.client_socket.is_valid() {
            let fd = self.fd()?;
            match self.input_stream.read_from(fd)? {
                None => break,
                Some(0) => {
                    self.parse_buffered(event_loop)?;
                    return Err(AppError::ConnectionShutdown("read shutdown".into()));
                }
                Some(read) => {
                    trace!(fd, read, "connection read");
                    self.parse_buffered(event_loop)?;
                }
            }
        }
        Ok(())
    }

    /// Feeds buffered bytes into the current message until the buffer is empty,
    /// delivering every message that completes on the way.
    fn parse_buffered(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        while self.input_stream.available() > 0 {
            let consumed = self.message.feed(self.input_stream.buffer().readable())?;
            self.input_stream.consume(consumed)?;
            if self.message.is_complete() {
                self.deliver(event_loop)?;
                if !self.client_socket.is_valid() {
                    break;
                }
            } else if consumed == 0 {
                break;
            }
        }
        Ok(())
    }

    fn deliver(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        let next = Message::new().with_max_data_length(self.message.max_data_length());
        let complete = std::mem::replace(&mut self.message, next);
        trace!(
            packet_type = complete.packet_type(),
            length = complete.data_length(),
            "message received"
        );
        self.received.push_back(complete);
        if let Some(callback) = self.message_received_callback.clone() {
            callback(event_loop, self)?;
        }
        Ok(())
    }

    fn handle_writable(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        if self.connect_pending {
            let code = self.client_socket.socket().socket_specific_error()?;
            if code != 0 {
                return Err(AppError::SystemError {
                    call: "connect",
                    code,
                });
            }
            self.connect_pending = false;
            debug!(
                "connected to {}",
                self.client_socket
                    .remote_address()
                    .map(Address::description)
                    .unwrap_or_default()
            );
        }
        self.writable = true;

        if !self.connected_notified {
            self.connected_notified = true;
            if let Some(callback) = self.connected_callback.clone() {
                callback(event_loop, self)?;
            }
        }
        if self.client_socket.is_valid() {
            self.flush()?;
        }
        Ok(())
    }
}

impl Monitor for MessageClientSocket {
    fn descriptor(&self) -> RawFd {
        self.client_socket.file_descriptor().unwrap_or(-1)
    }

    fn process_events(&mut self, event_loop: &mut EventLoop, events: Ready) -> AppResult<()> {
        // a pending connect resolves on write-readiness, before any read
        if self.connect_pending && events.is_writable() {
            self.handle_writable(event_loop)?;
            if events.is_readable() && self.client_socket.is_valid() {
                self.handle_readable(event_loop)?;
            }
            return Ok(());
        }
        if events.is_readable() {
            self.handle_readable(event_loop)?;
        }
        if events.is_writable() && self.client_socket.is_valid() {
            self.handle_writable(event_loop)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use super::*;
    use crate::network::{Header, HEADER_SIZE};

    fn unix_connection() -> AppResult<(MessageClientSocket, UnixStream)> {
        let (local, remote) = UnixStream::pair()?;
        let handle = SocketHandle::from(OwnedFd::from(local));
        let client_socket = ClientSocket::from(handle);
        Ok((MessageClientSocket::new(client_socket, false)?, remote))
    }

    #[test]
    fn test_one_read_completes_many_messages() -> AppResult<()> {
        let (connection, mut remote) = unix_connection()?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let connection = connection.on_message(Rc::new(
            move |_: &mut EventLoop, socket: &mut MessageClientSocket| -> AppResult<()> {
                while let Some(message) = socket.pop_message() {
                    sink.borrow_mut()
                        .push((message.packet_type(), message.data().to_vec()));
                }
                Ok(())
            },
        ));

        let mut wire = Vec::new();
        for (packet_type, body) in [(1u32, &b"one"[..]), (2, &b""[..]), (3, &b"three"[..])] {
            wire.extend_from_slice(
                &Header {
                    packet_type,
                    body_length: body.len() as u32,
                }
                .to_bytes(),
            );
            wire.extend_from_slice(body);
        }
        // half of the next header stays buffered in the parser
        let next = Header {
            packet_type: 4,
            body_length: 1,
        };
        wire.extend_from_slice(&next.to_bytes()[..5]);
        remote.write_all(&wire)?;

        let mut event_loop = EventLoop::new()?;
        event_loop.monitor(Box::new(connection))?;
        event_loop.run_once(Some(Duration::from_secs(1)))?;

        assert_eq!(
            *seen.borrow(),
            vec![(1, b"one".to_vec()), (2, Vec::new()), (3, b"three".to_vec())]
        );
        Ok(())
    }

    #[test]
    fn test_send_flushes_once_writable() -> AppResult<()> {
        let (connection, mut remote) = unix_connection()?;
        let connection = connection.on_connected(Rc::new(
            |_: &mut EventLoop, socket: &mut MessageClientSocket| -> AppResult<()> {
                let mut message = Message::with_packet_type(0xAF);
                message.insert("hi");
                socket.send_message(&mut message)
            },
        ));

        let mut event_loop = EventLoop::new()?;
        event_loop.monitor(Box::new(connection))?;
        event_loop.run_once(Some(Duration::from_secs(1)))?;

        let mut received = [0u8; HEADER_SIZE + 2];
        remote.read_exact(&mut received)?;
        assert_eq!(&received[..], &[0, 0, 0, 0xAF, 0, 0, 0, 2, b'h', b'i']);
        Ok(())
    }

    #[test]
    fn test_peer_close_tears_down_connection() -> AppResult<()> {
        let (connection, remote) = unix_connection()?;
        let fd = connection.descriptor();
        let mut event_loop = EventLoop::new()?;
        event_loop.monitor(Box::new(connection))?;
        drop(remote);

        event_loop.run_once(Some(Duration::from_secs(1)))?;
        assert!(!event_loop.is_monitoring(fd));
        Ok(())
    }

    #[test]
    fn test_oversized_declaration_drops_connection() -> AppResult<()> {
        let (connection, mut remote) = unix_connection()?;
        let connection = connection.with_max_data_length(4);
        let fd = connection.descriptor();
        let mut event_loop = EventLoop::new()?;
        event_loop.monitor(Box::new(connection))?;

        let oversized = Header {
            packet_type: 9,
            body_length: 5,
        };
        remote.write_all(&oversized.to_bytes())?;
        event_loop.run_once(Some(Duration::from_secs(1)))?;
        assert!(!event_loop.is_monitoring(fd));
        Ok(())
    }
}
