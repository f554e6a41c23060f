/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::config::Settings;
use log::debug;
use openssl::ssl::SslStream;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

fn is_bsd() -> bool {
    cfg!(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))
}

#[cfg(target_os = "linux")]
fn set_defer_accept(socket: &Socket) -> io::Result<()> {
    let timeout: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &timeout as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_defer_accept(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Builds the listening socket per the configured bind parameters. Returns
/// the listener, its local address, and whether deferred accept is in
/// effect (requested and supported by the platform).
pub fn build_listener(settings: &Settings) -> io::Result<(TcpListener, SocketAddr, bool)> {
    // family selection: explicit v6 addresses and the wildcard on
    // non-BSD/non-windows platforms get an unspecified (dual-stack) family,
    // everything else is plain IPv4
    let (domain, ip, dual_stack) = match &settings.address {
        Some(s) => {
            let ip: IpAddr = s.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid bind address: {}", s),
                )
            })?;

            match ip {
                IpAddr::V4(_) => (Domain::IPV4, ip, false),
                IpAddr::V6(_) => (Domain::IPV6, ip, false),
            }
        }
        None => {
            if cfg!(windows) || is_bsd() {
                (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED), false)
            } else {
                (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED), true)
            }
        }
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if dual_stack {
        socket.set_only_v6(false)?;
    }

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    // firewalls tend to drop inactive sockets
    socket.set_keepalive(true)?;

    socket.bind(&SocketAddr::new(ip, settings.port).into())?;
    socket.listen(settings.backlog)?;

    #[cfg(windows)]
    socket.set_reuse_address(true)?;

    let defer_accept = if settings.defer_accept {
        match set_defer_accept(&socket) {
            Ok(()) => true,
            Err(e) => {
                // unsupported platforms silently fall back to plain accept
                if e.kind() != io::ErrorKind::Unsupported {
                    debug!("failed to set deferred accept: {}", e);
                }

                false
            }
        }
    } else {
        false
    };

    let listener: TcpListener = socket.into();
    let local_addr = listener.local_addr()?;

    Ok((listener, local_addr, defer_accept))
}

enum Stream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

/// An accepted connection. The stream starts out plain and may have TLS
/// attached by the handshake step. A `Conn` is owned by exactly one
/// pipeline stage at a time and closes its socket on drop.
pub struct Conn {
    stream: Option<Stream>,
    peer_addr: SocketAddr,
}

impl Conn {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Some(Stream::Tls(_)))
    }

    /// Whether the underlying socket has been taken out of this value, by
    /// `detach` or by a failed handshake.
    pub fn is_detached(&self) -> bool {
        self.stream.is_none()
    }

    /// Takes the connection out of the endpoint's ownership. The worker
    /// treats a detached connection as handed off: it will not close or
    /// re-register it.
    pub fn detach(&mut self) -> Option<Conn> {
        let stream = self.stream.take()?;

        Some(Conn {
            stream: Some(stream),
            peer_addr: self.peer_addr,
        })
    }

    fn tcp(&self) -> &TcpStream {
        match self.stream.as_ref().expect("connection is detached") {
            Stream::Plain(s) => s,
            Stream::Tls(s) => s.get_ref(),
        }
    }

    pub(crate) fn take_plain(&mut self) -> Option<TcpStream> {
        match self.stream.take() {
            Some(Stream::Plain(s)) => Some(s),
            Some(other) => {
                self.stream = Some(other);
                None
            }
            None => None,
        }
    }

    pub(crate) fn set_tls(&mut self, stream: SslStream<TcpStream>) {
        self.stream = Some(Stream::Tls(stream));
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.tcp().set_nodelay(nodelay)
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> io::Result<()> {
        SockRef::from(self.tcp()).set_linger(linger)
    }

    /// Applies an I/O timeout with the usual native-socket semantics: 0
    /// makes the socket non-blocking, a positive value means blocking reads
    /// and writes with that many milliseconds of timeout, and a negative
    /// value means blocking without a timeout.
    pub fn set_io_timeout(&self, timeout_ms: i64) -> io::Result<()> {
        let tcp = self.tcp();

        if timeout_ms == 0 {
            tcp.set_nonblocking(true)
        } else {
            tcp.set_nonblocking(false)?;

            let timeout = if timeout_ms > 0 {
                Some(Duration::from_millis(timeout_ms as u64))
            } else {
                None
            };

            tcp.set_read_timeout(timeout)?;
            tcp.set_write_timeout(timeout)
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(Stream::Plain(s)) => s.read(buf),
            Some(Stream::Tls(s)) => s.read(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(Stream::Plain(s)) => s.write(buf),
            Some(Stream::Tls(s)) => s.write(buf),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(Stream::Plain(s)) => s.flush(),
            Some(Stream::Tls(s)) => s.flush(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl AsRawFd for Conn {
    fn as_raw_fd(&self) -> RawFd {
        self.tcp().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();

        (Conn::new(server, peer_addr), client)
    }

    #[test]
    fn listener_binds_ephemeral() {
        let settings = Settings {
            address: Some("127.0.0.1".to_string()),
            ..Default::default()
        };

        let (_listener, addr, _defer) = build_listener(&settings).unwrap();

        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn listener_rejects_bad_address() {
        let settings = Settings {
            address: Some("not an address".to_string()),
            ..Default::default()
        };

        let e = build_listener(&settings).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn conn_passthrough() {
        let (mut conn, mut client) = pair();

        client.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        conn.write_all(b"world").unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn io_timeout_modes() {
        let (mut conn, _client) = pair();

        // non-blocking: a read with no data fails immediately
        conn.set_io_timeout(0).unwrap();
        let mut buf = [0u8; 16];
        let e = conn.read(&mut buf).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::WouldBlock);

        // blocking with timeout: a read with no data fails after the timeout
        conn.set_io_timeout(20).unwrap();
        let e = conn.read(&mut buf).unwrap_err();
        assert!(
            e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut,
            "unexpected error kind: {:?}",
            e.kind()
        );

        // back to blocking without timeout
        conn.set_io_timeout(-1).unwrap();
        assert_eq!(conn.tcp().read_timeout().unwrap(), None);
    }

    #[test]
    fn detach_moves_ownership() {
        let (mut conn, mut client) = pair();

        let mut detached = conn.detach().unwrap();
        assert!(conn.is_detached());
        assert!(conn.detach().is_none());

        // original wrapper no longer reads
        let mut buf = [0u8; 4];
        assert!(conn.read(&mut buf).is_err());

        // the detached connection is still live
        client.write_all(b"ping").unwrap();
        detached.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
