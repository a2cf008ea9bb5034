//! TCP socket options for client channels and the server listener.
//!
//! A channel that is abandoned after a timeout must not linger: pending
//! outbound bytes are dropped and the connection is reset, so a late reply
//! can never be read on a later exchange.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

/// Options applied to every stream and listener.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable `SO_REUSEADDR` on the listener so a restarted server can rebind
    /// immediately. Default: true on Linux/macOS, false on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 16.
    pub backlog: i32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 16,
        }
    }
}

/// Apply options to a connected stream.
pub fn configure_stream(stream: &TcpStream, options: &SocketOptions) -> std::io::Result<()> {
    stream.set_nodelay(options.tcp_nodelay)
}

/// Set a zero linger so closing the stream resets it instead of draining.
pub fn set_discard_on_close(stream: &TcpStream) -> std::io::Result<()> {
    SockRef::from(stream).set_linger(Some(Duration::ZERO))
}

/// Create a bound, listening socket for the server.
pub fn create_listener(addr: SocketAddr, options: &SocketOptions) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if options.reuse_addr {
        socket.set_reuse_address(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
