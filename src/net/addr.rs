use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Thin wrapper over `std::net::SocketAddr`; exists as a named type at the public API boundary
/// the way the original's `InetAddress` is, rather than exposing `std::net` types directly
/// everywhere a host/port pair is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    pub fn new(addr: SocketAddr) -> InetAddr {
        InetAddr(addr)
    }

    /// Resolve `host:port` (or any other `ToSocketAddrs`-accepted string) to the first address
    /// it yields.
    pub fn resolve(hostport: &str) -> io::Result<InetAddr> {
        hostport
            .to_socket_addrs()?
            .next()
            .map(InetAddr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip_port(&self) -> String {
        self.0.to_string()
    }

    /// Set the scope id used to disambiguate a link-local IPv6 address across interfaces.
    /// No-op for IPv4.
    pub fn set_scope_id(&mut self, scope_id: u32) {
        if let SocketAddr::V6(v6) = &mut self.0 {
            v6.set_scope_id(scope_id);
        }
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> InetAddr {
        InetAddr(addr)
    }
}

impl std::fmt::Display for InetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_localhost() {
        let addr = InetAddr::resolve("127.0.0.1:0").unwrap();
        assert_eq!(addr.socket_addr().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn scope_id_is_noop_for_v4() {
        let mut addr = InetAddr::new("127.0.0.1:80".parse().unwrap());
        addr.set_scope_id(3);
        assert_eq!(addr.ip_port(), "127.0.0.1:80");
    }
}
