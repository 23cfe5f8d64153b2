//! Per-scheme socket opening.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::debug;

use crate::error::SockError;
use crate::uri::{SockScheme, SockSpec};

/// Which end of the connection to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Open the descriptor of a sockspec: a listening socket for servers, a
/// connected one for clients.
pub fn open_spec(spec: &SockSpec, side: Side) -> Result<OwnedFd, SockError> {
    match spec.scheme {
        SockScheme::Tcp => open_tcp(&spec.rest, side),
        SockScheme::Unix => open_unix(&spec.rest, side),
        SockScheme::Systemd => open_systemd(&spec.rest),
        SockScheme::Vsock => Err(SockError::Unsupported("l4vsock".to_string())),
        SockScheme::Char => open_char(&spec.rest),
    }
}

fn open_tcp(rest: &str, side: Side) -> Result<OwnedFd, SockError> {
    // `host:port[/…]` — everything after the first '/' names APIs, not
    // the endpoint.
    let endpoint = rest.split('/').next().unwrap_or(rest);
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or(SockError::BadUri("tcp needs host:port"))?;
    let port: u16 = port.parse().map_err(|_| SockError::BadUri("bad port"))?;
    match side {
        Side::Server => {
            let host = if host.is_empty() || host == "*" {
                "0.0.0.0"
            } else {
                host
            };
            let listener = TcpListener::bind((host, port))?;
            debug!(%host, port, "tcp listener bound");
            Ok(owned(listener.into_raw_fd()))
        }
        Side::Client => {
            let addrs = (host, port)
                .to_socket_addrs()
                .map_err(|_| SockError::BadUri("unresolvable host"))?;
            let mut last = std::io::Error::from(std::io::ErrorKind::AddrNotAvailable);
            for addr in addrs {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(owned(stream.into_raw_fd()));
                    }
                    Err(e) => last = e,
                }
            }
            Err(SockError::Io(last))
        }
    }
}

fn open_unix(rest: &str, side: Side) -> Result<OwnedFd, SockError> {
    if let Some(name) = rest.strip_prefix('@') {
        // Abstract namespace.
        let addr = UnixAddr::new_abstract(name.as_bytes())?;
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;
        match side {
            Side::Server => {
                socket::bind(fd.as_raw_fd(), &addr)?;
                socket::listen(&fd, socket::Backlog::new(8).unwrap())?;
            }
            Side::Client => {
                nix::sys::socket::connect(fd.as_raw_fd(), &addr)?;
            }
        }
        Ok(fd)
    } else {
        match side {
            Side::Server => {
                // Stale socket files block bind.
                let _ = std::fs::remove_file(rest);
                let listener = UnixListener::bind(rest)?;
                debug!(path = %rest, "unix listener bound");
                Ok(owned(listener.into_raw_fd()))
            }
            Side::Client => {
                let stream = UnixStream::connect(rest)?;
                Ok(owned(stream.into_raw_fd()))
            }
        }
    }
}

/// Sockets inherited through the systemd listen-fds protocol.
fn open_systemd(name: &str) -> Result<OwnedFd, SockError> {
    let pid_ok = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());
    let count: usize = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if !pid_ok || count == 0 {
        return Err(SockError::NoInheritedFd(name.to_string()));
    }
    let names = std::env::var("LISTEN_FDNAMES").unwrap_or_default();
    let index = names
        .split(':')
        .position(|n| n == name)
        .ok_or_else(|| SockError::NoInheritedFd(name.to_string()))?;
    if index >= count {
        return Err(SockError::NoInheritedFd(name.to_string()));
    }
    // Inherited descriptors start right after stderr.
    let fd = 3 + index as i32;
    let dup = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
    Ok(dup)
}

fn open_char(path: &str) -> Result<OwnedFd, SockError> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)?;
    Ok(OwnedFd::from(file))
}

fn owned(fd: i32) -> OwnedFd {
    // The raw fd comes straight from an into_raw_fd/open we own.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

/// Put `fd` into non-blocking mode.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> Result<(), SockError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(SockError::Io(std::io::Error::last_os_error()));
    }
    let flags = flags | libc::O_NONBLOCK;
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags) } < 0 {
        return Err(SockError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn tcp_server_then_client_round_trip() {
        let spec = SockSpec::parse("tcp:127.0.0.1:0/x").unwrap();
        let listener_fd = open_spec(&spec, Side::Server).unwrap();
        let listener = unsafe { TcpListener::from_raw_fd(listener_fd.into_raw_fd()) };
        let port = listener.local_addr().unwrap().port();

        let uri = format!("tcp:127.0.0.1:{port}/x");
        let spec = SockSpec::parse(&uri).unwrap();
        let client_fd = open_spec(&spec, Side::Client).unwrap();
        let mut client = unsafe { TcpStream::from_raw_fd(client_fd.into_raw_fd()) };

        let (mut peer, _) = listener.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn unix_path_server_and_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let uri = format!("unix:{}", path.display());
        let spec = SockSpec::parse(&uri).unwrap();
        let listener_fd = open_spec(&spec, Side::Server).unwrap();
        let listener =
            unsafe { std::os::unix::net::UnixListener::from_raw_fd(listener_fd.into_raw_fd()) };

        let client_fd = open_spec(&spec, Side::Client).unwrap();
        let mut client =
            unsafe { std::os::unix::net::UnixStream::from_raw_fd(client_fd.into_raw_fd()) };
        let (mut peer, _) = listener.accept().unwrap();
        client.write_all(b"yo").unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"yo");
    }

    #[test]
    fn vsock_reports_unsupported() {
        let spec = SockSpec::parse("l4vsock:2:77/x").unwrap();
        assert!(matches!(
            open_spec(&spec, Side::Client),
            Err(SockError::Unsupported(_))
        ));
    }

    #[test]
    fn systemd_without_environment_fails_cleanly() {
        let spec = SockSpec::parse("sd:myapi").unwrap();
        assert!(matches!(
            open_spec(&spec, Side::Server),
            Err(SockError::NoInheritedFd(_))
        ));
    }
}
