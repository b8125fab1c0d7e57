use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::macros::syscall;
use crate::net::addr::InetAddr;

/// RAII wrapper over a raw socket fd: closes on `Drop`, matching the original's `Socket`
/// destructor. All socket-option setters are best-effort (`io::Result<()>` propagated to the
/// caller; none of them are load-bearing enough to justify process abort on failure).
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Open a non-blocking, close-on-exec TCP socket matching `addr`'s family.
    pub fn new_tcp(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = if addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        ))?;
        Ok(Socket {
            // SAFETY: socket(2) just returned a freshly owned fd.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wrap an fd this process already owns (e.g. returned by `accept4`).
    ///
    /// # Safety
    /// `fd` must be a valid, open, uniquely-owned file descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Releases ownership of the underlying fd to the caller, who becomes responsible for
    /// closing it. Used when handing the fd off to a `Channel`-owning object that manages its
    /// own lifetime (e.g. `TcpConnection`).
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = sockaddr_of(addr);
        syscall!(bind(self.fd(), &raw as *const _ as *const libc::sockaddr, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd(), backlog))?;
        Ok(())
    }

    /// Non-blocking accept. `Ok(None)` means `EAGAIN`/`EWOULDBLOCK` — no pending connection.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        match syscall!(accept4(
            self.fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        )) {
            Ok(fd) => {
                let peer = sockaddr_to_std(&storage)?;
                Ok(Some((unsafe { Socket::from_raw_fd(fd) }, peer)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = sockaddr_of(addr);
        syscall!(connect(self.fd(), &raw as *const _ as *const libc::sockaddr, len))?;
        Ok(())
    }

    /// Half-close the write side (`SHUT_WR`).
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<InetAddr> {
        getsockname(self.fd(), libc::getsockname)
    }

    pub fn peer_addr(&self) -> io::Result<InetAddr> {
        getsockname(self.fd(), libc::getpeername)
    }

    /// Reads and clears the pending `SO_ERROR`, the standard way to learn whether a
    /// non-blocking `connect(2)` actually succeeded once the socket becomes writable.
    pub fn socket_error(&self) -> io::Result<i32> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len
        ))?;
        Ok(err)
    }
}

fn set_bool_opt(fd: RawFd, level: i32, name: i32, on: bool) -> io::Result<()> {
    let value: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
    Ok(())
}

fn getsockname(
    fd: RawFd,
    call: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
) -> io::Result<InetAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = unsafe { call(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(InetAddr::new(sockaddr_to_std(&storage)?))
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let mut sa = std::net::SocketAddrV6::new(ip, u16::from_be(sin6.sin6_port), 0, sin6.sin6_scope_id);
            sa.set_flowinfo(sin6.sin6_flowinfo);
            Ok(SocketAddr::V6(sa))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_round_trip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::new_tcp(&addr).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(16).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_tcp(&addr).unwrap();
        let _ = client.connect(&bound.socket_addr());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = listener.accept().unwrap();
        assert!(accepted.is_some());
    }
}
