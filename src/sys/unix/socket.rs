use std::io;
use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::sys::unix::net::{socket_addr, to_socket_addr};

/// An owned, non-blocking, close-on-exec socket.
///
/// Creation and configuration go through methods; the hot data path
/// (recv/send during readiness drains) uses the free functions below on a
/// copied `RawFd` so the loop can hand `&mut` access to user callbacks
/// while a drain is in progress.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn new(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<Socket> {
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

        let fd = syscall!(socket(domain, socket_type, 0))?;
        let socket = unsafe { Socket::from_raw_fd(fd) };

        // Darwin does not have SOCK_NONBLOCK or SOCK_CLOEXEC; set the flags
        // with additional `fcntl` calls. `socket` owns the fd, so an error
        // here closes it on drop.
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        {
            syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        }

        Ok(socket)
    }

    pub(crate) fn for_addr(addr: SocketAddr, socket_type: libc::c_int) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new(domain, socket_type)
    }

    pub(crate) fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = socket_addr(&addr);
        syscall!(bind(self.fd, storage.as_ptr(), len)).map(|_| ())
    }

    pub(crate) fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        syscall!(listen(self.fd, backlog)).map(|_| ())
    }

    /// Starts a non-blocking connect. `EINPROGRESS` is not an error; the
    /// result arrives as writability plus `SO_ERROR`.
    pub(crate) fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = socket_addr(&addr);
        match syscall!(connect(self.fd, storage.as_ptr(), len)) {
            Ok(_) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        let storage_ptr = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr;

        // On platforms that support it, `accept4(2)` sets `NONBLOCK` and
        // `CLOEXEC` in the accept call itself.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux",
            target_os = "openbsd"
        ))]
        let fd = syscall!(accept4(
            self.fd,
            storage_ptr,
            &mut len,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        ))?;

        // BSD-derived OSes inherit the non-blocking flag from the listener,
        // so only `CLOEXEC` needs to be set explicitly.
        #[cfg(any(target_os = "ios", target_os = "macos", target_os = "netbsd"))]
        let fd = {
            let fd = syscall!(accept(self.fd, storage_ptr, &mut len))?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            fd
        };

        let socket = unsafe { Socket::from_raw_fd(fd) };
        let addr = unsafe { to_socket_addr(&storage)? };
        Ok((socket, addr))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(&storage) }
    }

    /// Reads and clears the socket's pending error (`SO_ERROR`).
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub(crate) fn set_reuse_address(&self) -> io::Result<()> {
        let yes: libc::c_int = 1;
        syscall!(setsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn set_only_v6(&self, only: bool) -> io::Result<()> {
        let val: libc::c_int = only as libc::c_int;
        syscall!(setsockopt(
            self.fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &val as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn set_membership_v4(
        &self,
        multiaddr: std::net::Ipv4Addr,
        interface: std::net::Ipv4Addr,
        join: bool,
    ) -> io::Result<()> {
        let mreq = libc::ip_mreq {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(multiaddr.octets()),
            },
            imr_interface: libc::in_addr {
                s_addr: u32::from_ne_bytes(interface.octets()),
            },
        };
        let optname = if join {
            libc::IP_ADD_MEMBERSHIP
        } else {
            libc::IP_DROP_MEMBERSHIP
        };
        syscall!(setsockopt(
            self.fd,
            libc::IPPROTO_IP,
            optname,
            &mreq as *const libc::ip_mreq as *const libc::c_void,
            mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn set_membership_v6(
        &self,
        multiaddr: std::net::Ipv6Addr,
        interface: u32,
        join: bool,
    ) -> io::Result<()> {
        let mreq = libc::ipv6_mreq {
            ipv6mr_multiaddr: libc::in6_addr {
                s6_addr: multiaddr.octets(),
            },
            ipv6mr_interface: interface as _,
        };
        let optname = if join {
            libc::IPV6_ADD_MEMBERSHIP
        } else {
            libc::IPV6_DROP_MEMBERSHIP
        };
        syscall!(setsockopt(
            self.fd,
            libc::IPPROTO_IPV6,
            optname,
            &mreq as *const libc::ipv6_mreq as *const libc::c_void,
            mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    /// `shutdown(2)` of the write side.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR)).map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Nothing sensible to do with a close error here.
        let _ = syscall!(close(self.fd));
    }
}

/*
 *
 * ===== Data path =====
 *
 */

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
    ))
    .map(|n| n as usize)
}

/// Gathering write of `bufs` starting `skip` bytes into the logical
/// concatenation. Used for the immediate-send attempt so fully accepted
/// writes never copy.
pub(crate) fn writev(fd: RawFd, bufs: &[&[u8]], skip: usize) -> io::Result<usize> {
    const MAX_IOV: usize = 64;

    let mut iovecs: [MaybeUninit<libc::iovec>; MAX_IOV] = unsafe { MaybeUninit::uninit().assume_init() };
    let mut n_iovecs = 0;
    let mut remaining_skip = skip;

    for buf in bufs {
        if n_iovecs == MAX_IOV {
            break;
        }
        if remaining_skip >= buf.len() {
            remaining_skip -= buf.len();
            continue;
        }
        let buf = &buf[remaining_skip..];
        remaining_skip = 0;
        iovecs[n_iovecs] = MaybeUninit::new(libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        });
        n_iovecs += 1;
    }

    if n_iovecs == 0 {
        return Ok(0);
    }

    syscall!(writev(
        fd,
        iovecs[0].as_ptr(),
        n_iovecs as libc::c_int,
    ))
    .map(|n| n as usize)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // MSG_NOSIGNAL: a peer reset must surface as EPIPE, not kill the
    // process.
    #[cfg(not(any(target_os = "ios", target_os = "macos")))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    let flags = 0;

    syscall!(send(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        flags,
    ))
    .map(|n| n as usize)
}

pub(crate) fn sendto(fd: RawFd, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let (storage, len) = socket_addr(&addr);
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        storage.as_ptr(),
        len,
    ))
    .map(|n| n as usize)
}

pub(crate) fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { MaybeUninit::zeroed().assume_init() };
    let mut addrlen = mem::size_of_val(&storage) as libc::socklen_t;

    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut addrlen,
    ))?;
    let addr = unsafe { to_socket_addr(&storage)? };
    Ok((n as usize, addr))
}
