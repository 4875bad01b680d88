use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use bytes::BytesMut;
use socket2::{Domain, Protocol, Type};
use tracing::trace;

use super::Address;
use crate::service::{is_transient, AppError, AppResult};

/// An owned, open descriptor as handed over by `accept`.
pub type SocketHandle = socket2::Socket;

/// Owns at most one OS socket. `None` is the invalid sentinel.
///
/// Dropping a valid socket closes it.
#[derive(Debug, Default)]
pub struct Socket {
    inner: Option<socket2::Socket>,
}

impl From<SocketHandle> for Socket {
    fn from(handle: SocketHandle) -> Self {
        Socket {
            inner: Some(handle),
        }
    }
}

impl Socket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        domain: Domain,
        socket_type: Type,
        protocol: Option<Protocol>,
    ) -> AppResult<()> {
        if self.is_valid() {
            return Err(AppError::IllegalState(
                "open on a socket that is already open".into(),
            ));
        }
        let socket = socket2::Socket::new(domain, socket_type, protocol)
            .map_err(|e| AppError::from_io("socket", e))?;
        trace!(fd = socket.as_raw_fd(), "socket opened");
        self.inner = Some(socket);
        Ok(())
    }

    pub fn open_for(&mut self, address: &Address) -> AppResult<()> {
        self.open(
            address.address_family(),
            address.socket_type(),
            address.socket_protocol(),
        )
    }

    /// Releases the descriptor. Closing an invalid socket is a caller error.
    pub fn close(&mut self) -> AppResult<()> {
        let socket = self
            .inner
            .take()
            .ok_or_else(|| AppError::IllegalState("close on an invalid socket".into()))?;
        let fd = socket.into_raw_fd();
        trace!(fd, "socket closed");
        // SAFETY: `fd` came from `into_raw_fd`, so nothing else owns it.
        if unsafe { libc::close(fd) } == -1 {
            return Err(AppError::last_os_error("close"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn file_descriptor(&self) -> Option<RawFd> {
        self.inner.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn handle(&self) -> AppResult<&socket2::Socket> {
        self.inner
            .as_ref()
            .ok_or_else(|| AppError::IllegalState("operation on an invalid socket".into()))
    }

    pub fn shutdown(&self, mode: Shutdown) -> AppResult<()> {
        self.handle()?
            .shutdown(mode)
            .map_err(|e| AppError::from_io("shutdown", e))
    }

    pub fn set_non_blocking(&self, value: bool) -> AppResult<()> {
        self.handle()?
            .set_nonblocking(value)
            .map_err(|e| AppError::from_io("fcntl", e))
    }

    pub fn set_no_delay(&self, value: bool) -> AppResult<()> {
        self.handle()?
            .set_nodelay(value)
            .map_err(|e| AppError::from_io("setsockopt", e))
    }

    /// Probes the peer name; any failure counts as not connected.
    pub fn is_connected(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|socket| socket.peer_addr().is_ok())
    }

    /// Pending per-socket error (`SO_ERROR`), 0 when there is none.
    pub fn socket_specific_error(&self) -> AppResult<i32> {
        match self.handle()?.take_error() {
            Ok(None) => Ok(0),
            Ok(Some(err)) => Ok(err.raw_os_error().unwrap_or(libc::EIO)),
            Err(e) => Err(AppError::from_io("getsockopt", e)),
        }
    }

    /// Sends `buffer[offset..]`.
    ///
    /// A zero-byte transmit means the write side is closed and is reported as
    /// `ConnectionShutdown`. "Would block" yields `Ok(0)` so the caller can retry
    /// on the next write-readiness.
    pub fn send(&self, buffer: &[u8], offset: usize, flags: i32) -> AppResult<usize> {
        if offset >= buffer.len() {
            return Err(AppError::IllegalState(format!(
                "send offset {} outside buffer of {} bytes",
                offset,
                buffer.len()
            )));
        }
        match self.handle()?.send_with_flags(&buffer[offset..], flags) {
            Ok(0) => Err(AppError::ConnectionShutdown("write shutdown".into())),
            Ok(sent) => Ok(sent),
            Err(err) if is_transient(&err) => Ok(0),
            Err(err) => Err(AppError::from_io("send", err)),
        }
    }

    /// Appends received bytes into the spare capacity of `buffer`.
    ///
    /// Existing content is never overwritten. A zero-byte receive is an orderly
    /// peer close and is reported as `ConnectionShutdown`; "would block" yields
    /// `Ok(0)`.
    pub fn recv(&self, buffer: &mut BytesMut, flags: i32) -> AppResult<usize> {
        let socket = self.handle()?;
        let spare = buffer.spare_capacity_mut();
        if spare.is_empty() {
            return Err(AppError::IllegalState(
                "recv needs reserved space for incoming data".into(),
            ));
        }
        match socket.recv_with_flags(spare, flags) {
            Ok(0) => Err(AppError::ConnectionShutdown("read shutdown".into())),
            Ok(received) => {
                let len = buffer.len();
                // SAFETY: the kernel initialised `received` bytes of the spare capacity.
                unsafe { buffer.set_len(len + received) };
                Ok(received)
            }
            Err(err) if is_transient(&err) => Ok(0),
            Err(err) => Err(AppError::from_io("recv", err)),
        }
    }
}

/// Capabilities shared by the server and client socket roles.
pub trait AsSocket {
    fn socket(&self) -> &Socket;

    fn socket_mut(&mut self) -> &mut Socket;

    fn file_descriptor(&self) -> Option<RawFd> {
        self.socket().file_descriptor()
    }

    fn is_valid(&self) -> bool {
        self.socket().is_valid()
    }

    fn is_connected(&self) -> bool {
        self.socket().is_connected()
    }

    fn set_non_blocking(&self, value: bool) -> AppResult<()> {
        self.socket().set_non_blocking(value)
    }

    fn shutdown(&self, mode: Shutdown) -> AppResult<()> {
        self.socket().shutdown(mode)
    }

    fn close(&mut self) -> AppResult<()> {
        self.socket_mut().close()
    }
}

impl AsSocket for Socket {
    fn socket(&self) -> &Socket {
        self
    }

    fn socket_mut(&mut self) -> &mut Socket {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (Socket, Socket) {
        let (a, b) = UnixStream::pair().expect("socket pair");
        (
            Socket::from(socket2::Socket::from(std::os::fd::OwnedFd::from(a))),
            Socket::from(socket2::Socket::from(std::os::fd::OwnedFd::from(b))),
        )
    }

    #[test]
    fn test_close_invalidates_and_rejects_second_close() -> AppResult<()> {
        let (mut a, _b) = pair();
        assert!(a.is_valid());
        a.close()?;
        assert!(!a.is_valid());
        assert_eq!(a.file_descriptor(), None);
        assert!(matches!(a.close(), Err(AppError::IllegalState(_))));
        Ok(())
    }

    #[test]
    fn test_open_twice_is_rejected() -> AppResult<()> {
        let mut socket = Socket::new();
        socket.open(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        assert!(socket.open(Domain::IPV4, Type::STREAM, None).is_err());
        Ok(())
    }

    #[test]
    fn test_send_and_recv_append() -> AppResult<()> {
        let (a, b) = pair();
        assert_eq!(a.send(b"xxHello", 2, 0)?, 5);

        let mut buffer = BytesMut::with_capacity(64);
        buffer.extend_from_slice(b">");
        assert_eq!(b.recv(&mut buffer, 0)?, 5);
        assert_eq!(&buffer[..], b">Hello");
        Ok(())
    }

    #[test]
    fn test_send_offset_must_be_inside_buffer() {
        let (a, _b) = pair();
        assert!(matches!(a.send(b"abc", 3, 0), Err(AppError::IllegalState(_))));
    }

    #[test]
    fn test_recv_would_block_is_zero() -> AppResult<()> {
        let (a, _b) = pair();
        a.set_non_blocking(true)?;
        let mut buffer = BytesMut::with_capacity(16);
        assert_eq!(a.recv(&mut buffer, 0)?, 0);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_recv_after_peer_close_is_shutdown() {
        let (a, b) = pair();
        drop(b);
        let mut buffer = BytesMut::with_capacity(16);
        assert!(matches!(
            a.recv(&mut buffer, 0),
            Err(AppError::ConnectionShutdown(_))
        ));
    }

    #[test]
    fn test_recv_without_spare_capacity_is_rejected() {
        let (a, _b) = pair();
        let mut buffer = BytesMut::new();
        assert!(matches!(a.recv(&mut buffer, 0), Err(AppError::IllegalState(_))));
    }

    #[test]
    fn test_connected_pair_and_shutdown() -> AppResult<()> {
        let (a, b) = pair();
        assert!(a.is_connected());
        assert_eq!(a.socket_specific_error()?, 0);
        a.shutdown(Shutdown::Write)?;
        let mut buffer = BytesMut::with_capacity(8);
        assert!(matches!(
            b.recv(&mut buffer, 0),
            Err(AppError::ConnectionShutdown(_))
        ));
        assert!(!Socket::new().is_connected());
        Ok(())
    }
}
