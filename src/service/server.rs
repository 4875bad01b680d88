use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::network::{
    interface_addresses_for_service, Address, ConnectionCallback, ServerSocket, Service,
    SocketKind,
};
use crate::reactor::{EventLoop, LoopHandle, Monitor};
use crate::{AppError, AppResult};

/// A set of listening sockets on one event loop sharing a connection callback.
#[derive(Debug)]
pub struct Server {
    bound_addresses: Vec<Address>,
    descriptors: Vec<RawFd>,
}

impl Server {
    /// Binds and monitors one listening socket per address.
    ///
    /// Addresses that cannot be bound (e.g. IPv6 on a host without it) are
    /// skipped; it is an error only if none can be bound.
    pub fn bind_to_addresses(
        event_loop: &mut EventLoop,
        addresses: &[Address],
        backlog: i32,
        on_connection: ConnectionCallback,
    ) -> AppResult<Server> {
        let mut server = Server {
            bound_addresses: Vec::with_capacity(addresses.len()),
            descriptors: Vec::with_capacity(addresses.len()),
        };
        let mut last_error = None;

        for address in addresses {
            let server_socket = match ServerSocket::new(address, backlog) {
                Ok(server_socket) => server_socket.with_callback(on_connection.clone()),
                Err(err) => {
                    warn!("cannot listen on {}: {}", address, err);
                    last_error = Some(err);
                    continue;
                }
            };
            if let Some(bound) = server_socket.bound_address() {
                server.bound_addresses.push(bound.clone());
            }
            server.descriptors.push(server_socket.descriptor());
            event_loop.monitor(Box::new(server_socket))?;
        }

        if server.descriptors.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                AppError::InvalidValue("no address given to listen on".into())
            }));
        }
        info!(
            "server listening on {}",
            server
                .bound_addresses
                .iter()
                .map(Address::description)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(server)
    }

    /// Listens on the wildcard addresses of every family for `service`.
    pub fn bind_to_service(
        event_loop: &mut EventLoop,
        service: &Service,
        kind: SocketKind,
        backlog: i32,
        on_connection: ConnectionCallback,
    ) -> AppResult<Server> {
        let addresses = interface_addresses_for_service(service, kind)?;
        Server::bind_to_addresses(event_loop, &addresses, backlog, on_connection)
    }

    /// Actual addresses, with OS-assigned ports filled in.
    pub fn bound_addresses(&self) -> &[Address] {
        &self.bound_addresses
    }

    /// Stops monitoring and closes every listening socket. Accepted
    /// connections are not affected.
    pub fn shutdown(self, event_loop: &mut EventLoop) -> AppResult<()> {
        for fd in self.descriptors {
            // a listener whose accept failed has already been dropped by the loop
            if event_loop.is_monitoring(fd) {
                drop(event_loop.stop_monitoring(fd)?);
            }
        }
        debug!("server shut down");
        Ok(())
    }
}

/// Runs an event loop on a dedicated, named thread.
#[derive(Debug)]
pub struct ServerContainer {
    name: String,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<AppResult<()>>>,
}

impl ServerContainer {
    /// Spawns the thread, runs `setup` against its fresh loop and then runs the
    /// loop until `stop`. Whatever `setup` returns (or the error it fails
    /// with) is handed back to the caller.
    pub fn start<F, T>(name: &str, setup: F) -> AppResult<(ServerContainer, T)>
    where
        F: FnOnce(&mut EventLoop) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (setup_tx, setup_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || -> AppResult<()> {
                let mut event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        let _ = setup_tx.send(Err(err));
                        return Ok(());
                    }
                };
                match setup(&mut event_loop) {
                    Ok(value) => {
                        if setup_tx.send(Ok((event_loop.handle(), value))).is_err() {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        let _ = setup_tx.send(Err(err));
                        return Ok(());
                    }
                }
                event_loop.run_forever()
            })?;

        match setup_rx.recv() {
            Ok(Ok((handle, value))) => {
                debug!("server container {} started", name);
                Ok((
                    ServerContainer {
                        name: name.to_string(),
                        handle: Some(handle),
                        thread: Some(thread),
                    },
                    value,
                ))
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AppError::IllegalState(format!(
                    "server container {} exited during setup",
                    name
                )))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the loop and waits for the thread. Calling it again is a no-op.
    pub fn stop(&mut self) -> AppResult<()> {
        if let Some(handle) = self.handle.take() {
            handle.stop()?;
        }
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| {
                AppError::IllegalState(format!("server container {} panicked", self.name))
            })??;
            debug!("server container {} stopped", self.name);
        }
        Ok(())
    }
}

impl Drop for ServerContainer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("server container {} stop failed: {}", self.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::network::{ClientSocket, SocketHandle};

    fn loopback() -> Address {
        Address::from_socket_addr("127.0.0.1:0".parse().unwrap(), SocketKind::Stream)
    }

    fn ignore_connections() -> ConnectionCallback {
        Rc::new(
            |_: &mut EventLoop, _: &ServerSocket, _: SocketHandle, _: Address| -> AppResult<()> {
                Ok(())
            },
        )
    }

    #[test]
    fn test_bound_address_reports_assigned_port() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let server =
            Server::bind_to_addresses(&mut event_loop, &[loopback()], 16, ignore_connections())?;
        let bound = &server.bound_addresses()[0];
        assert_ne!(bound.port(), Some(0));
        assert_eq!(event_loop.monitored_count(), 1);

        server.shutdown(&mut event_loop)?;
        assert_eq!(event_loop.monitored_count(), 0);
        Ok(())
    }

    #[test]
    fn test_no_addresses_is_an_error() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        assert!(Server::bind_to_addresses(&mut event_loop, &[], 16, ignore_connections()).is_err());
        Ok(())
    }

    #[test]
    fn test_container_reports_setup_value_and_stops() -> AppResult<()> {
        let (mut container, address) = ServerContainer::start("test-server", |event_loop| {
            let server =
                Server::bind_to_addresses(event_loop, &[loopback()], 16, ignore_connections())?;
            Ok(server.bound_addresses()[0].clone())
        })?;
        assert_eq!(container.name(), "test-server");

        let mut client = ClientSocket::new();
        assert!(client.connect(&address)?);
        container.stop()?;
        container.stop()?;
        Ok(())
    }

    #[test]
    fn test_container_setup_failure_is_returned() {
        let result = ServerContainer::start("failing-server", |_| -> AppResult<()> {
            Err(AppError::InvalidValue("no".into()))
        });
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
    }
}
