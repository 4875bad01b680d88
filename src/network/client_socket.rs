use std::io::ErrorKind;

use tracing::debug;

use super::{Address, AsSocket, Socket, SocketHandle};
use crate::{AppError, AppResult};

/// A connected (or connecting) stream socket.
#[derive(Debug, Default)]
pub struct ClientSocket {
    socket: Socket,
    remote_address: Option<Address>,
}

impl ClientSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a descriptor produced by `ServerSocket::accept`.
    pub fn from_handle(handle: SocketHandle, address: Address) -> Self {
        ClientSocket {
            socket: Socket::from(handle),
            remote_address: Some(address),
        }
    }

    pub fn remote_address(&self) -> Option<&Address> {
        self.remote_address.as_ref()
    }

    /// Opens a socket for `address` and connects, blocking until established.
    ///
    /// On failure the descriptor is released again, so the socket can be reused
    /// for another candidate.
    pub fn connect(&mut self, address: &Address) -> AppResult<bool> {
        self.connect_with(address, false)
    }

    /// Like `connect`, but the socket is non-blocking before the connect is issued.
    ///
    /// Returns `false` when the connect is still in progress: completion shows up
    /// as the first write-readiness, after which `socket_specific_error()` tells
    /// success (0) from failure.
    pub fn connect_non_blocking(&mut self, address: &Address) -> AppResult<bool> {
        self.connect_with(address, true)
    }

    /// Tries each address strictly in order and stops at the first success.
    pub fn connect_any(&mut self, addresses: &[Address]) -> AppResult<bool> {
        if self.socket.is_valid() {
            return Err(AppError::IllegalState(
                "connect on a socket that is already open".into(),
            ));
        }
        for address in addresses {
            match self.connect(address) {
                Ok(_) => return Ok(true),
                Err(err @ (AppError::SystemError { .. } | AppError::ConnectionResetByPeer(_))) => {
                    debug!("connect to {} failed: {}", address.description(), err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    fn connect_with(&mut self, address: &Address, non_blocking: bool) -> AppResult<bool> {
        self.socket.open_for(address)?;
        if non_blocking {
            if let Err(err) = self.socket.set_non_blocking(true) {
                self.socket.close()?;
                return Err(err);
            }
        }

        let result = self.socket.handle()?.connect(address.sock_addr());
        match result {
            Ok(()) => {
                self.remote_address = Some(address.clone());
                Ok(true)
            }
            Err(err)
                if non_blocking
                    && (err.raw_os_error() == Some(libc::EINPROGRESS)
                        || err.kind() == ErrorKind::WouldBlock) =>
            {
                debug!("connect to {} in progress", address.description());
                self.remote_address = Some(address.clone());
                Ok(false)
            }
            Err(err) => {
                self.socket.close()?;
                if err.kind() == ErrorKind::ConnectionReset {
                    Err(AppError::ConnectionResetByPeer("connect error".into()))
                } else {
                    Err(AppError::SystemError {
                        call: "connect",
                        code: err.raw_os_error().unwrap_or(libc::EIO),
                    })
                }
            }
        }
    }
}

impl From<SocketHandle> for ClientSocket {
    fn from(handle: SocketHandle) -> Self {
        ClientSocket {
            socket: Socket::from(handle),
            remote_address: None,
        }
    }
}

impl AsSocket for ClientSocket {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }
}
