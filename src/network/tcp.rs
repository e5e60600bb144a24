// src/network/tcp.rs
//! Non-blocking TCP connect plumbing
//!
//! Pool connections must never stall the supervisor loop, so the connect is
//! issued on a non-blocking socket and completed later, when the readiness
//! wait reports the descriptor writable. Name resolution stays synchronous,
//! as in every stratum client this was modeled on.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use thiserror::Error;

/// Why a pool connect attempt could not even be started
///
/// Surfaced to upper layers so the operator log can tell a DNS problem from
/// a refused handshake. All of these count as hard failures for the
/// reconnect backoff.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// The pool host did not resolve to any address
    #[error("could not resolve pool host")]
    FailedResolve,

    /// A socket could not be created or configured
    #[error("could not create a new socket")]
    BadSocket,

    /// The OS rejected the connection attempt outright
    #[error("could not initiate connection")]
    FailedConnect,

    /// Resolution succeeded but produced no usable routes
    #[error("no routes to pool host")]
    NoRoutes,
}

/// Starts a non-blocking connect to `host:port`
///
/// # Returns
/// A `TcpStream` whose connection is still in progress. The caller must
/// wait for writability and then call [`finish_connect`] to learn whether
/// the handshake succeeded.
///
/// # Errors
/// Returns a [`ConnectError`] naming the failed stage.
pub fn begin_connect(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| ConnectError::FailedResolve)?;
    let addr = addrs.next().ok_or(ConnectError::NoRoutes)?;

    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(ConnectError::BadSocket);
    }
    if let Err(()) = set_nonblocking(fd) {
        unsafe { libc::close(fd) };
        return Err(ConnectError::BadSocket);
    }

    let res = match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            unsafe {
                libc::connect(
                    fd,
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            unsafe {
                libc::connect(
                    fd,
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };

    if res != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(ConnectError::FailedConnect);
        }
    }
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Completes a connect started by [`begin_connect`]
///
/// Call once the descriptor polls writable. Reads `SO_ERROR` to learn the
/// outcome of the in-flight handshake.
pub fn finish_connect(stream: &TcpStream) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), ()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 { Err(()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::poll::{ReadinessSet, wait};
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn unresolvable_host_fails_resolve() {
        let got = begin_connect("host.invalid.", 3333);
        assert!(matches!(got, Err(ConnectError::FailedResolve)));
    }

    #[test]
    fn connect_to_listener_completes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = begin_connect("127.0.0.1", port).unwrap();

        let mut read = ReadinessSet::new();
        let mut write = ReadinessSet::new();
        write.push(stream.as_raw_fd());
        wait(&mut read, &mut write, 1000).unwrap();
        assert!(write.is_ready(stream.as_raw_fd()));
        assert!(finish_connect(&stream).is_ok());
    }

    #[test]
    fn refused_connect_surfaces_on_completion() {
        // Bind then drop to get a port with (very likely) nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stream = match begin_connect("127.0.0.1", port) {
            Ok(stream) => stream,
            // Some kernels refuse synchronously, which is also a valid outcome.
            Err(ConnectError::FailedConnect) => return,
            Err(other) => panic!("unexpected connect error {:?}", other),
        };
        let mut read = ReadinessSet::new();
        let mut write = ReadinessSet::new();
        write.push(stream.as_raw_fd());
        wait(&mut read, &mut write, 1000).unwrap();
        assert!(finish_connect(&stream).is_err());
    }
}
