//! An owned, non-blocking TCP socket. Thin wrapper over the raw fd and the
//! handful of `setsockopt`/`getsockopt` calls the reactor needs; closes the
//! fd on drop.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::net::address::InetAddress;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Creates a non-blocking TCP socket for the address family matching
    /// `addr`.
    pub fn new_tcp(addr: InetAddress) -> io::Result<Socket> {
        let domain = if addr.is_ipv6() {
            libc::AF_INET6
        } else {
            libc::AF_INET
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        Ok(Socket { fd })
    }

    /// Wraps an already-created fd (e.g. one returned by `accept4`).
    pub(crate) fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_opt(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let value: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub fn bind(&self, addr: InetAddress) -> io::Result<()> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = addr.to_raw(&mut storage);
        syscall!(bind(
            self.fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd, backlog)).map(|_| ())
    }

    /// Accepts one pending connection, returning the new socket and the
    /// peer's address, or `WouldBlock` if nothing is pending.
    pub fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        Ok((Socket::from_raw_fd(fd), InetAddress::from_raw(&storage)))
    }

    /// Begins a non-blocking connect. Callers should treat `WouldBlock` /
    /// `EINPROGRESS` as "in progress" rather than an error; see
    /// `classify_connect_errno`.
    pub fn connect(&self, addr: InetAddress) -> io::Result<()> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = addr.to_raw(&mut storage);
        syscall!(connect(
            self.fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }

    /// Half-closes the write side, leaving reads open until the peer also
    /// closes.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR)).map(|_| ())
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        self.addr_via(libc::getsockname)
    }

    pub fn peer_addr(&self) -> io::Result<InetAddress> {
        self.addr_via(libc::getpeername)
    }

    fn addr_via(
        &self,
        f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    ) -> io::Result<InetAddress> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe { f(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(InetAddress::from_raw(&storage))
    }

    /// Reads and clears `SO_ERROR`, the pending-error slot a non-blocking
    /// `connect` resolves into once the socket becomes writable.
    pub fn take_error(&self) -> io::Result<Option<i32>> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(if value == 0 { None } else { Some(value) })
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}
