use std::ffi::CString;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Mutex;

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::{AppError, AppResult};

/// `getservbyname` returns a pointer into static storage.
static SERVICES_DB_LOCK: Mutex<()> = Mutex::new(());

/// Transport flavour of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    pub fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            SocketKind::Stream => Protocol::TCP,
            SocketKind::Datagram => Protocol::UDP,
        }
    }

    fn services_db_name(self) -> &'static str {
        match self {
            SocketKind::Stream => "tcp",
            SocketKind::Datagram => "udp",
        }
    }
}

/// A port number or a name from the services database (`"http"`, `"imap"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    Port(u16),
    Name(String),
}

impl From<u16> for Service {
    fn from(port: u16) -> Self {
        Service::Port(port)
    }
}

impl From<&str> for Service {
    fn from(name: &str) -> Self {
        match name.parse::<u16>() {
            Ok(port) => Service::Port(port),
            Err(_) => Service::Name(name.to_string()),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Port(port) => write!(f, "{}", port),
            Service::Name(name) => f.write_str(name),
        }
    }
}

impl Service {
    pub fn port(&self, kind: SocketKind) -> AppResult<u16> {
        match self {
            Service::Port(port) => Ok(*port),
            Service::Name(name) => lookup_service_port(name, kind),
        }
    }
}

fn lookup_service_port(name: &str, kind: SocketKind) -> AppResult<u16> {
    let c_name = CString::new(name)
        .map_err(|_| AppError::AddressResolution(format!("invalid service name {:?}", name)))?;
    let c_proto = CString::new(kind.services_db_name())
        .map_err(|_| AppError::AddressResolution("invalid protocol name".into()))?;

    let _guard = SERVICES_DB_LOCK
        .lock()
        .map_err(|_| AppError::IllegalState("services database lock poisoned".into()))?;
    // SAFETY: both strings are NUL terminated and outlive the call; the returned
    // entry is only read while the lock is held.
    let port = unsafe {
        let entry = libc::getservbyname(c_name.as_ptr(), c_proto.as_ptr());
        if entry.is_null() {
            None
        } else {
            Some(u16::from_be((*entry).s_port as u16))
        }
    };
    port.ok_or_else(|| {
        AppError::AddressResolution(format!(
            "unknown service {}/{}",
            name,
            kind.services_db_name()
        ))
    })
}

/// An endpoint: family, transport and raw socket address, copied by value.
#[derive(Clone)]
pub struct Address {
    domain: Domain,
    socket_type: Type,
    protocol: Option<Protocol>,
    sock_addr: SockAddr,
}

impl Address {
    pub fn new(sock_addr: SockAddr, socket_type: Type, protocol: Option<Protocol>) -> Self {
        Address {
            domain: sock_addr.domain(),
            socket_type,
            protocol,
            sock_addr,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, kind: SocketKind) -> Self {
        Address::new(
            SockAddr::from(addr),
            kind.socket_type(),
            Some(kind.protocol()),
        )
    }

    /// An address of the same transport as `template`, e.g. an accepted peer
    /// inheriting the listener's type and protocol.
    pub fn with_template(template: &Address, sock_addr: SockAddr) -> Self {
        Address::new(sock_addr, template.socket_type, template.protocol)
    }

    pub fn address_family(&self) -> Domain {
        self.domain
    }

    pub fn socket_type(&self) -> Type {
        self.socket_type
    }

    pub fn socket_protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn sock_addr(&self) -> &SockAddr {
        &self.sock_addr
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.sock_addr.as_socket()
    }

    pub fn port(&self) -> Option<u16> {
        self.socket_addr().map(|addr| addr.port())
    }

    pub fn address_family_name(&self) -> &'static str {
        if self.domain == Domain::IPV4 {
            "IPv4"
        } else if self.domain == Domain::IPV6 {
            "IPv6"
        } else if self.domain == Domain::UNIX {
            "Unix"
        } else {
            "Unknown"
        }
    }

    pub fn description(&self) -> String {
        match self.socket_addr() {
            Some(addr) => addr.to_string(),
            None => format!("<{} address>", self.address_family_name()),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("family", &self.address_family_name())
            .field("type", &self.socket_type)
            .field("protocol", &self.protocol)
            .field("address", &self.description())
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain
            && self.socket_type == other.socket_type
            && self.protocol == other.protocol
            && self.sock_addr.as_socket() == other.sock_addr.as_socket()
    }
}

pub type Addresses = Vec<Address>;

/// Resolves `host` and `service` to every matching endpoint, in resolver order.
pub fn addresses_for_name(host: &str, service: &Service, kind: SocketKind) -> AppResult<Addresses> {
    let port = service.port(kind)?;
    let resolved = (host, port).to_socket_addrs().map_err(|e| {
        AppError::AddressResolution(format!("{}:{} ({})", host, service, e))
    })?;
    let addresses: Addresses = resolved
        .map(|addr| Address::from_socket_addr(addr, kind))
        .collect();
    if addresses.is_empty() {
        return Err(AppError::AddressResolution(format!(
            "{}:{} resolved to no addresses",
            host, service
        )));
    }
    Ok(addresses)
}

/// Wildcard listen addresses (IPv4 then IPv6) for `port`.
pub fn interface_addresses_for_port(port: u16, kind: SocketKind) -> Addresses {
    [IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)]
        .into_iter()
        .map(|ip| Address::from_socket_addr(SocketAddr::new(ip, port), kind))
        .collect()
}

pub fn interface_addresses_for_service(
    service: &Service,
    kind: SocketKind,
) -> AppResult<Addresses> {
    Ok(interface_addresses_for_port(service.port(kind)?, kind))
}

/// Resolves `scheme://host[:port][/path]`; without a port the scheme names the service.
pub fn addresses_for_uri(uri: &str) -> AppResult<Addresses> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| AppError::AddressResolution(format!("uri without scheme: {}", uri)))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
        return Err(AppError::AddressResolution(format!("uri without host: {}", uri)));
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(|| {
            AppError::AddressResolution(format!("unterminated IPv6 host in {}", uri))
        })?;
        if !tail.is_empty() && !tail.starts_with(':') {
            return Err(AppError::AddressResolution(format!(
                "unexpected {:?} after IPv6 host in {}",
                tail, uri
            )));
        }
        (host, tail.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            // an IPv6 literal needs brackets, otherwise its last group reads as the port
            Some((host, _)) if host.contains(':') => {
                return Err(AppError::AddressResolution(format!(
                    "IPv6 host must be bracketed in {}",
                    uri
                )));
            }
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let service = match port {
        Some(port) => Service::Port(port.parse().map_err(|_| {
            AppError::AddressResolution(format!("invalid port {:?} in {}", port, uri))
        })?),
        None => Service::Name(scheme.to_string()),
    };
    addresses_for_name(host, &service, SocketKind::Stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_addresses_include_ipv4() {
        let addresses = interface_addresses_for_port(1024, SocketKind::Stream);
        assert!(!addresses.is_empty());
        assert!(addresses
            .iter()
            .any(|a| a.address_family() == Domain::IPV4 && a.port() == Some(1024)));
        assert_eq!(addresses[0].address_family_name(), "IPv4");
        assert_eq!(addresses[1].address_family_name(), "IPv6");
    }

    #[test]
    fn test_unknown_service_fails_to_resolve() {
        let result = addresses_for_name(
            "localhost",
            &Service::from("ThisServiceDoesNotExist"),
            SocketKind::Stream,
        );
        assert!(matches!(result, Err(AppError::AddressResolution(_))));
    }

    #[test]
    fn test_numeric_service_resolves_localhost() -> AppResult<()> {
        let addresses =
            addresses_for_name("localhost", &Service::from("7979"), SocketKind::Stream)?;
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(|a| a.port() == Some(7979)));
        assert!(addresses.iter().all(|a| a.socket_type() == Type::STREAM));
        Ok(())
    }

    #[test]
    fn test_uri_with_explicit_port() -> AppResult<()> {
        let addresses = addresses_for_uri("http://127.0.0.1:8080/index.html")?;
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].description(), "127.0.0.1:8080");

        let addresses = addresses_for_uri("tcp://[::1]:9000")?;
        assert_eq!(addresses[0].description(), "[::1]:9000");
        Ok(())
    }

    #[test]
    fn test_malformed_uri_is_rejected() {
        assert!(addresses_for_uri("localhost").is_err());
        assert!(addresses_for_uri("http://").is_err());
        assert!(addresses_for_uri("http://localhost:notaport").is_err());
        assert!(addresses_for_uri("tcp://[::1]9000").is_err());
    }

    #[test]
    fn test_unbracketed_ipv6_uri_is_rejected() {
        for uri in ["tcp://::1", "tcp://::1:9000", "tcp://fe80::1/path"] {
            assert!(
                matches!(addresses_for_uri(uri), Err(AppError::AddressResolution(_))),
                "{} should be rejected",
                uri
            );
        }
    }

    #[test]
    fn test_peer_address_inherits_template_transport() {
        let listener =
            Address::from_socket_addr("127.0.0.1:0".parse().unwrap(), SocketKind::Stream);
        let peer = Address::with_template(
            &listener,
            SockAddr::from("127.0.0.1:5555".parse::<SocketAddr>().unwrap()),
        );
        assert_eq!(peer.socket_type(), Type::STREAM);
        assert_eq!(peer.socket_protocol(), Some(Protocol::TCP));
        assert_eq!(peer.to_string(), "127.0.0.1:5555");
    }
}
