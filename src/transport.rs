//! # Socket Transport
//!
//! A thin wrapper over blocking TCP sockets used by the driver/worker
//! protocol (C9) and the sandbox's internal result transport (C6). Blocking
//! I/O is deliberate: the sandbox runner forks and installs signal handlers
//! around this transport, and an async runtime's worker threads do not
//! survive a `fork()` cleanly.
//!
//! Every byte moved through [`Transport::send`]/[`Transport::recv`] is
//! reported to the resource tracker's network counters (C4) — this is how
//! network accounting is achieved without libc interposition (§2.1).

use crate::tracker;
use anyhow::{anyhow, Context, Result};
use nix::poll::{poll, PollFd, PollFlags};
use socket2::{Domain, Socket, Type};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::time::Duration;

/// Largest single chunk attempted before backing off on `EMSGSIZE`.
const INITIAL_MTU: usize = 65536;

/// A connected, blocking TCP socket.
pub struct Transport {
    stream: TcpStream,
    mtu: usize,
}

impl Transport {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Transport { stream, mtu: INITIAL_MTU })
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Transport { stream, mtu: INITIAL_MTU })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Transport { stream: self.stream.try_clone()?, mtu: self.mtu })
    }

    /// Send the full buffer, chunked to `self.mtu`, shrinking the MTU on
    /// `EMSGSIZE` the way the original implementation backs off: halve down
    /// toward 8000 bytes, then drop to 512 and decay by one byte at a time
    /// down to a floor of 1 byte.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let chunk_len = self.mtu.min(data.len() - offset);
            let chunk = &data[offset..offset + chunk_len];
            match self.stream.write_all(chunk) {
                Ok(()) => {
                    tracker::record_send(chunk_len);
                    offset += chunk_len;
                }
                Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                    self.shrink_mtu();
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn shrink_mtu(&mut self) {
        self.mtu = if self.mtu > 8000 {
            (self.mtu / 2).max(8000)
        } else if self.mtu > 512 {
            512
        } else {
            self.mtu.saturating_sub(1).max(1)
        };
    }

    /// Read exactly `buf.len()` bytes, reporting the total to the tracker.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        tracker::record_recv(buf.len());
        Ok(())
    }

    /// Non-blocking attempt to read up to `buf.len()` bytes. Returns `Ok(0)`
    /// on a would-block condition so callers can distinguish "nothing yet"
    /// from a closed connection (`Ok(n)` with a short read) or an error.
    pub fn try_recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.set_nonblocking(true)?;
        let result = match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        };
        self.stream.set_nonblocking(false)?;
        if let Ok(n) = result {
            if n > 0 {
                tracker::record_recv(n);
            }
        }
        result
    }

    pub fn as_raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    pub fn shutdown(&self) -> Result<()> {
        Ok(self.stream.shutdown(std::net::Shutdown::Both)?)
    }
}

/// A listening socket plus the set of already-accepted connections, with a
/// single-threaded `poll(2)`-based multiplexer so one thread can service a
/// listener and many peers without async.
pub struct Listener {
    listener: TcpListener,
    connections: Vec<Transport>,
}

impl Listener {
    /// Bind an ephemeral port on `127.0.0.1`.
    pub fn bind_ephemeral() -> Result<Self> {
        Self::bind("127.0.0.1:0".parse().unwrap())
    }

    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        Ok(Listener { listener, connections: Vec::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Poll the listener and all open connections at once; return the first
    /// readable connection's index, accepting new connections as they
    /// arrive. Dead connections are disposed automatically. `None` on
    /// timeout.
    pub fn poll_or_accept(&mut self, timeout: Duration) -> Result<Option<usize>> {
        loop {
            let mut fds: Vec<PollFd> = Vec::with_capacity(self.connections.len() + 1);
            let listener_fd = self.listener.as_fd();
            fds.push(PollFd::new(listener_fd, PollFlags::POLLIN));
            let conn_fds: Vec<BorrowedFd> = self.connections.iter().map(|c| {
                // SAFETY: the fd outlives this poll call; connections are
                // never dropped during it.
                unsafe { BorrowedFd::borrow_raw(c.as_raw_fd()) }
            }).collect();
            for fd in &conn_fds {
                fds.push(PollFd::new(*fd, PollFlags::POLLIN));
            }

            let timeout_ms: i32 = timeout.as_millis().try_into().unwrap_or(i32::MAX);
            let n = poll(&mut fds, timeout_ms).context("poll")?;
            if n == 0 {
                return Ok(None);
            }

            if let Some(revents) = fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    if let Ok((stream, _)) = self.listener.accept() {
                        stream.set_nonblocking(true).ok();
                        self.connections.push(Transport::from_stream(stream)?);
                    }
                }
            }

            let mut dead = Vec::new();
            for (i, pfd) in fds.iter().enumerate().skip(1) {
                let idx = i - 1;
                if let Some(revents) = pfd.revents() {
                    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                        dead.push(idx);
                    } else if revents.contains(PollFlags::POLLIN) {
                        return Ok(Some(idx));
                    }
                }
            }
            for idx in dead.into_iter().rev() {
                self.connections.remove(idx);
            }
            // Nothing readable this round. If the listener just produced a
            // fresh connection, loop once more so it gets a chance to show
            // up as readable; otherwise this round was a pure timeout.
            if fds[0].revents().map_or(false, |r| r.contains(PollFlags::POLLIN)) {
                continue;
            }
            return Ok(None);
        }
    }

    pub fn connection(&mut self, idx: usize) -> &mut Transport {
        &mut self.connections[idx]
    }

    pub fn dispose(&mut self, idx: usize) -> Transport {
        self.connections.remove(idx)
    }

    pub fn accept_blocking(&mut self) -> Result<Transport> {
        self.listener.set_nonblocking(false)?;
        let (stream, _) = self.listener.accept()?;
        self.listener.set_nonblocking(true)?;
        Transport::from_stream(stream)
    }
}

/// A connectionless UDP socket (§4.4, §4.8). Unlike [`Transport`], sends
/// through this type are subject to the resource tracker's faulty-network
/// simulation when a test has configured one — stream sockets never are.
pub struct Datagram {
    socket: std::net::UdpSocket,
}

impl Datagram {
    pub fn bind_ephemeral() -> Result<Self> {
        Ok(Datagram { socket: std::net::UdpSocket::bind("127.0.0.1:0")? })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends `data` to `addr` unless the tracker's dropper decides this
    /// datagram is lost; a drop is reported as a successful send to the
    /// caller (the whole point is that the peer never sees it) but is not
    /// counted toward network-send accounting.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if tracker::should_drop_datagram() {
            return Ok(());
        }
        self.socket.send_to(data, addr)?;
        tracker::record_send(data.len());
        Ok(())
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (n, addr) = self.socket.recv_from(buf)?;
        tracker::record_recv(n);
        Ok((n, addr))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout)?)
    }
}

/// Resolve a `host:port` string the way the CLI does.
pub fn parse_addr(s: &str) -> Result<SocketAddr> {
    s.parse().map_err(|_| anyhow!("invalid address: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_recv_round_trips() {
        let mut listener = Listener::bind_ephemeral().unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = Transport::connect(addr).unwrap();
        let mut server = listener.accept_blocking().unwrap();

        client.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        server.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn datagram_with_no_faulty_network_configured_always_arrives() {
        tracker::disable_faulty_network();
        let server = Datagram::bind_ephemeral().unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Datagram::bind_ephemeral().unwrap();

        client.send_to(b"ping", server_addr).unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn datagram_drops_everything_at_zero_faulty_network_chance() {
        tracker::configure_faulty_network(0.0, Duration::from_millis(1));
        let server = Datagram::bind_ephemeral().unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Datagram::bind_ephemeral().unwrap();
        server.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        client.send_to(b"ping", server_addr).unwrap();
        let mut buf = [0u8; 4];
        assert!(server.recv_from(&mut buf).is_err());
        tracker::disable_faulty_network();
    }

    #[test]
    fn poll_or_accept_finds_a_readable_connection() {
        let mut listener = Listener::bind_ephemeral().unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = Transport::connect(addr).unwrap();
        client.send(b"hi").unwrap();

        // First poll accepts the pending connection; loop until data is
        // actually readable on it (accept and data-ready can straddle two
        // poll rounds on a loopback socket).
        let mut found = None;
        for _ in 0..20 {
            if let Some(idx) = listener.poll_or_accept(Duration::from_millis(200)).unwrap() {
                found = Some(idx);
                break;
            }
        }
        let idx = found.expect("expected a readable connection within the retry budget");
        let mut buf = [0u8; 2];
        listener.connection(idx).recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn try_recv_returns_zero_when_nothing_pending() {
        let mut listener = Listener::bind_ephemeral().unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = Transport::connect(addr).unwrap();
        let mut server = listener.accept_blocking().unwrap();
        let mut buf = [0u8; 16];
        let n = server.try_recv(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
