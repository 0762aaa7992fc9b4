//! A small, owned wrapper around `SocketAddrV4`/`SocketAddrV6`, kept
//! separate from `std::net::SocketAddr` so the rest of the crate has one
//! conversion point into and out of `libc::sockaddr_in`/`sockaddr_in6`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// An IPv4 or IPv6 endpoint. Cheap to copy; constructed either from a
/// parsed/looked-up address or directly from a `libc::sockaddr_storage`
/// returned by `accept`/`getsockname`/`getpeername`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetAddress {
    addr: SocketAddr,
}

impl InetAddress {
    pub fn new(ip: IpAddr, port: u16) -> InetAddress {
        InetAddress {
            addr: SocketAddr::new(ip, port),
        }
    }

    /// A loopback address on `port`, for listening sockets that should
    /// only accept same-host connections.
    pub fn loopback(port: u16) -> InetAddress {
        InetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A wildcard address on `port`, for listening sockets that should
    /// accept connections on every local interface.
    pub fn any(port: u16) -> InetAddress {
        InetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    pub fn to_std(self) -> SocketAddr {
        self.addr
    }

    /// Fills `storage` with the `sockaddr_in`/`sockaddr_in6` representation
    /// of this address and returns its length, for passing to `bind`,
    /// `connect`, or `accept`.
    pub(crate) fn to_raw(self, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
        match self.addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                let ptr = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe { *ptr = sin };
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
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
                let ptr = storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                unsafe { *ptr = sin6 };
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
            }
        }
    }

    /// Recovers an `InetAddress` from a `sockaddr_storage` as filled in by
    /// `accept`/`getsockname`/`getpeername`.
    pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> InetAddress {
        let family = storage.ss_family as i32;
        let addr = if family == libc::AF_INET6 {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            )
        } else {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())),
                u16::from_be(sin.sin_port),
            )
        };
        InetAddress { addr }
    }
}

impl From<SocketAddr> for InetAddress {
    fn from(addr: SocketAddr) -> InetAddress {
        InetAddress { addr }
    }
}

impl std::fmt::Display for InetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}
