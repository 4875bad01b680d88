use std::fmt;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use mio::Interest;
use socket2::Domain;
use tracing::{debug, info, warn};

use super::{Address, AsSocket, Socket, SocketHandle};
use crate::reactor::{EventLoop, Monitor, Ready};
use crate::{AppError, AppResult};

/// Invoked once per accepted connection with the listening socket, the new
/// descriptor and the peer address.
pub type ConnectionCallback =
    Rc<dyn Fn(&mut EventLoop, &ServerSocket, SocketHandle, Address) -> AppResult<()>>;

/// A listening socket.
///
/// On read-readiness it accepts until the backlog is empty: readiness is edge
/// triggered, so one notification may stand for any number of pending peers.
#[derive(Default)]
pub struct ServerSocket {
    socket: Socket,
    bound_address: Option<Address>,
    pub connection_callback: Option<ConnectionCallback>,
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("socket", &self.socket)
            .field("bound_address", &self.bound_address)
            .field("has_callback", &self.connection_callback.is_some())
            .finish()
    }
}

impl ServerSocket {
    /// Binds `address` with address reuse, listens and switches to non-blocking.
    pub fn new(address: &Address, backlog: i32) -> AppResult<Self> {
        let mut server_socket = ServerSocket::default();
        server_socket.bind(address, true)?;
        server_socket.listen(backlog)?;
        server_socket.socket.set_non_blocking(true)?;

        info!(
            "server socket listening on {} ({}) fd: {:?}",
            server_socket.bound_address().map(Address::description).unwrap_or_default(),
            address.address_family_name(),
            server_socket.socket.file_descriptor()
        );
        Ok(server_socket)
    }

    pub fn with_callback(mut self, callback: ConnectionCallback) -> Self {
        self.connection_callback = Some(callback);
        self
    }

    pub fn bind(&mut self, address: &Address, reuse_address: bool) -> AppResult<()> {
        self.socket.open_for(address)?;
        if reuse_address {
            self.set_reuse_address(true)?;
        }
        let handle = self.socket.handle()?;
        if address.address_family() == Domain::IPV6 {
            // lets the IPv4 and IPv6 wildcards share a port
            handle
                .set_only_v6(true)
                .map_err(|e| AppError::from_io("setsockopt", e))?;
        }
        handle
            .bind(address.sock_addr())
            .map_err(|e| AppError::from_io("bind", e))?;

        // record the real address, which differs when binding to port 0
        let local = handle
            .local_addr()
            .map_err(|e| AppError::from_io("getsockname", e))?;
        self.bound_address = Some(Address::with_template(address, local));
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> AppResult<()> {
        self.socket
            .handle()?
            .listen(backlog)
            .map_err(|e| AppError::from_io("listen", e))
    }

    pub fn set_reuse_address(&self, enabled: bool) -> AppResult<()> {
        let handle = self.socket.handle()?;
        handle
            .set_reuse_address(enabled)
            .map_err(|e| AppError::from_io("setsockopt", e))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        handle
            .set_reuse_port(enabled)
            .map_err(|e| AppError::from_io("setsockopt", e))?;
        Ok(())
    }

    pub fn bound_address(&self) -> Option<&Address> {
        self.bound_address.as_ref()
    }

    /// One non-blocking accept. `None` means nothing is pending.
    pub fn accept(&self) -> AppResult<Option<(SocketHandle, Address)>> {
        let handle = self.socket.handle()?;
        let template = self
            .bound_address
            .as_ref()
            .ok_or_else(|| AppError::IllegalState("accept on an unbound socket".into()))?;
        loop {
            match handle.accept() {
                Ok((peer, peer_addr)) => {
                    return Ok(Some((peer, Address::with_template(template, peer_addr))));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(AppError::SystemError {
                        call: "accept",
                        code: err.raw_os_error().unwrap_or(libc::EIO),
                    })
                }
            }
        }
    }
}

impl AsSocket for ServerSocket {
    fn socket(&self) -> &Socket {
        &self.socket
    }

    fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }
}

impl Monitor for ServerSocket {
    fn descriptor(&self) -> RawFd {
        self.socket.file_descriptor().unwrap_or(-1)
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn process_events(&mut self, event_loop: &mut EventLoop, events: Ready) -> AppResult<()> {
        if !events.is_readable() {
            return Ok(());
        }
        let callback = self.connection_callback.clone().ok_or_else(|| {
            AppError::IllegalState("server socket has no connection callback".into())
        })?;

        let mut accepted = 0usize;
        loop {
            let (handle, address) = match self.accept() {
                Ok(Some(peer)) => peer,
                Ok(None) => break,
                // the peer gave up before we got to it; the rest of the backlog is fine
                Err(AppError::SystemError { code, .. })
                    if code == libc::ECONNABORTED || code == libc::EPROTO =>
                {
                    debug!("skipping aborted connection: {}", code);
                    continue;
                }
                Err(err) => {
                    debug!(accepted, "accept failed: {}", err);
                    return Err(err);
                }
            };
            accepted += 1;
            debug!("accepted connection from {}", address.description());
            if let Err(err) = callback(event_loop, self, handle, address) {
                warn!("connection setup failed: {}", err);
            }
        }
        debug!(accepted, "accept drained");
        Ok(())
    }
}
