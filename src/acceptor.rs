//! Blocking acceptor thread.
//!
//! One thread sits in `accept4` on the listening socket and hands accepted
//! sockets to the dispatchers round-robin. Accepted fds arrive already
//! non-blocking (`SOCK_NONBLOCK`), so they go straight into a dispatcher's
//! selector. Shutdown closes the listen fd out from under the blocked
//! `accept4`, which returns an error and ends the loop.

use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::ConnShared;
use crate::dispatcher::{DispatcherSet, Registration};
use crate::error::Error;
use crate::pipeline::{HandlerFactory, StagePlan};

/// Create the listening socket: bound, blocking (for the acceptor's
/// `accept4`), SO_REUSEADDR.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    Ok(fd)
}

/// The address the listener actually bound (resolves port 0).
pub(crate) fn listener_addr(fd: RawFd) -> Result<SocketAddr, Error> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    sockaddr_to_socket_addr(&storage)
        .ok_or_else(|| Error::Io(std::io::Error::other("unsupported address family")))
}

pub(crate) struct AcceptorConfig {
    pub listen_fd: RawFd,
    pub set: Arc<DispatcherSet>,
    pub factory: Arc<dyn HandlerFactory>,
    pub plan: StagePlan,
    pub config: Arc<Config>,
}

/// Run the accept loop. Returns when the listen fd is closed or every
/// dispatcher is gone.
pub(crate) fn run_acceptor(acceptor: AcceptorConfig) {
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    debug!("acceptor started");

    loop {
        let mut addr_len: libc::socklen_t =
            std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let fd = unsafe {
            libc::accept4(
                acceptor.listen_fd,
                &mut addr_storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    // Out of fds; back off briefly rather than spin.
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                _ => {
                    // Listen fd closed (shutdown) or fatal accept error.
                    debug!("acceptor stopped");
                    return;
                }
            }
        }

        if acceptor.config.tcp_nodelay {
            let optval: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        }

        let peer_addr = sockaddr_to_socket_addr(&addr_storage)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        crate::metrics::CONNECTIONS_ACCEPTED.increment();
        trace!(peer = %peer_addr, "accepted");

        // SOCK_NONBLOCK is already set, so the std stream wrap is safe to
        // convert straight into a mio stream.
        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let stream = mio::net::TcpStream::from_std(stream);

        let shared = Arc::new(ConnShared::new(
            peer_addr,
            local_addr,
            acceptor.config.idle_timeout,
            acceptor.config.connection_timeout,
        ));
        let registration = Registration {
            stream,
            plan: acceptor.plan.clone(),
            handler: acceptor.factory.create(),
            shared,
        };
        if acceptor.set.next_handle().register(registration).is_err() {
            warn!("all dispatchers gone, acceptor exiting");
            return;
        }
    }
}

/// Closes the listen fd to unblock the acceptor.
pub(crate) struct ShutdownHandle {
    listen_fd: RawFd,
}

impl ShutdownHandle {
    pub fn new(listen_fd: RawFd) -> Self {
        ShutdownHandle { listen_fd }
    }

    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.listen_fd, libc::SHUT_RDWR);
            libc::close(self.listen_fd);
        }
    }
}

fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_and_reports_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listener(addr, 16).unwrap();
        let bound = listener_addr(fd).unwrap();
        assert_eq!(bound.ip(), addr.ip());
        assert_ne!(bound.port(), 0);
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:4567".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn shutdown_unblocks_accept() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let fd = create_listener(addr, 16).unwrap();
        let handle = ShutdownHandle::new(fd);
        let t = std::thread::spawn(move || {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        handle.shutdown();
        let ret = t.join().unwrap();
        assert!(ret < 0);
    }
}
