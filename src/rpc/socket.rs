//! Non-blocking UDP socket abstraction.

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;

use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

/// Size of the buffer datagrams are received into.
pub const RECEIVE_BUFFER_SIZE: usize = 5 * 1024;

/// A non-blocking datagram socket that can be registered with a [mio::Registry].
///
/// `send_to` and `recv_from` return [io::ErrorKind::WouldBlock] instead of blocking.
pub trait Udp: Debug + Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn reregister(&self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;
    fn deregister(&self, registry: &Registry) -> io::Result<()>;
}

/// Bind a non-blocking UDP socket with address reuse enabled.
pub fn bind(addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(mio::net::UdpSocket::from_std(socket.into()))
}

#[cfg(unix)]
impl Udp for mio::net::UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        mio::net::UdpSocket::recv_from(self, buf)
    }
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, addr)
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::UdpSocket::local_addr(self)
    }

    // The socket is shared between threads, so it is registered through its
    // raw fd rather than through `&mut self`.
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        registry.register(&mut mio::unix::SourceFd(&self.as_raw_fd()), token, interest)
    }
    fn reregister(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        registry.reregister(&mut mio::unix::SourceFd(&self.as_raw_fd()), token, interest)
    }
    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        registry.deregister(&mut mio::unix::SourceFd(&self.as_raw_fd()))
    }
}

/// IP and UDP header overhead of a datagram, counted in the byte statistics.
pub fn header_length(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 20 + 8,
        SocketAddr::V6(_) => 40 + 8,
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn bind_with_reuse_address() {
        let socket = bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        let local_addr = Udp::local_addr(&socket).unwrap();

        assert_ne!(local_addr.port(), 0);

        let mut buf = [0u8; 16];
        let error = Udp::recv_from(&socket, &mut buf).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn header_lengths() {
        assert_eq!(header_length(&"1.2.3.4:1".parse().unwrap()), 28);
        assert_eq!(header_length(&"[::1]:1".parse().unwrap()), 48);
    }
}
