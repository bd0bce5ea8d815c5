use crate::error::{Error, Result};
use crate::quic;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};

/// Total tries, the first one on the preferred port, the rest on port 0.
pub(crate) const BIND_ATTEMPTS: usize = 5;

const BACKLOG: u32 = 1024;

/// TCP listener and QUIC endpoint bound to the same port number.
pub(crate) struct DualListener {
    pub(crate) addr: SocketAddr,
    pub(crate) tcp: TcpListener,
    pub(crate) udp: quinn::Endpoint,
}

impl DualListener {
    pub(crate) fn bind(preferred_port: u16) -> Result<Self> {
        retry(preferred_port, Self::bind_both)
    }

    fn bind_both(port: u16) -> io::Result<Self> {
        let tcp = Self::bind_tcp(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let addr = SocketAddr::from(([0, 0, 0, 0], tcp.local_addr()?.port()));

        // tcp is dropped, and so closed, before the caller retries
        let udp = quic::endpoint(Self::bind_udp(addr)?)?;

        Ok(Self { addr, tcp, udp })
    }

    fn bind_tcp(local_addr: SocketAddr) -> io::Result<TcpListener> {
        let s = match local_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }?;

        s.set_reuseaddr(true)?;
        s.bind(local_addr)?;
        s.listen(BACKLOG)
    }

    pub(crate) fn bind_udp(local_addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;

        Ok(socket.into())
    }
}

/// Run `bind` on `preferred_port` then on port 0 until it succeeds or
/// [`BIND_ATTEMPTS`] are used up.
pub(crate) fn retry<T, F>(preferred_port: u16, mut bind: F) -> Result<T>
where
    F: FnMut(u16) -> io::Result<T>,
{
    let mut port = preferred_port;
    let mut attempt = 1;

    loop {
        match bind(port) {
            Ok(bound) => return Ok(bound),
            Err(e) if attempt >= BIND_ATTEMPTS => {
                log::debug!("bind attempt {} on port {} failed: {}", attempt, port, e);
                return Err(Error::BindExhausted {
                    attempts: attempt,
                    source: Arc::new(e),
                });
            }
            Err(e) => {
                log::debug!("bind attempt {} on port {} failed: {}", attempt, port, e);
                attempt += 1;
                port = 0;
            }
        }
    }
}
