//! DNS resolution and address comparison.

use std::net::{SocketAddr, ToSocketAddrs};

use super::Error;

/// A resolved backend address, kept alongside the host/port it was
/// resolved from so candidates can be re-resolved on the next
/// discovery cycle and compared against what's currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetAddress(pub SocketAddr);

impl TargetAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

/// Resolve `host:port` to a single [`SocketAddr`], preferring the
/// first result `getaddrinfo` returns (the same policy the original
/// source's `resolve_addr` uses).
pub fn resolve(host: &str, port: &str) -> Result<TargetAddress, Error> {
    let query = format!("{host}:{port}");
    let mut addrs = query
        .to_socket_addrs()
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            port: port.to_string(),
            source,
        })?;

    addrs
        .next()
        .map(TargetAddress)
        .ok_or_else(|| Error::NoAddress {
            host: host.to_string(),
            port: port.to_string(),
        })
}

/// Resolve a listen host/port pair to the ordered list of
/// [`SocketAddr`]s a listener should try binding, in preference
/// order. `::` expands to `[::, 0.0.0.0]` so a gateway configured for
/// dual-stack still comes up on IPv4-only hosts.
pub fn resolve_listen_addrs(host: &str, port: &str) -> std::io::Result<Vec<SocketAddr>> {
    let port: u16 = port
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid port"))?;

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_unspecified() && ip.is_ipv6() {
            return Ok(vec![
                SocketAddr::new(ip, port),
                SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port),
            ]);
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    if host == "localhost" {
        return Ok(vec![
            SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), port),
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port),
        ]);
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|source| {
            std::io::Error::new(source.kind(), format!("resolving {host}:{port}: {source}"))
        })?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;
    Ok(vec![addr])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_loopback() {
        let addr = resolve("127.0.0.1", "5432").unwrap();
        assert_eq!(addr.socket_addr().port(), 5432);
        assert!(addr.socket_addr().ip().is_loopback());
    }

    #[test]
    fn test_resolve_bad_port() {
        let err = resolve("127.0.0.1", "not-a-port");
        assert!(err.is_err());
    }
}
