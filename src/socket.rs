use socket2::{SockRef, Socket};
use std::collections::HashMap;
use std::fmt;
use std::io::Result;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Which transport carries a [`PeerSocket`].
///
/// Delivery guarantees differ: `Tcp` is a kernel stream, `Udp` is a
/// reliable stream running over datagrams, usually after a holepunch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn is_tcp(self) -> bool {
        self == Transport::Tcp
    }
}

enum Io {
    Tcp(TcpStream),
    Udp {
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    },
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

/// Lets the registry tear a socket down without owning its stream.
enum Handle {
    Tcp(Socket),
    Udp(quinn::Connection),
    #[cfg(test)]
    Mem,
}

impl Handle {
    fn destroy(&self) {
        match self {
            Handle::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Handle::Udp(conn) => conn.close(0u32.into(), b"destroyed"),
            #[cfg(test)]
            Handle::Mem => {}
        }
    }
}

#[derive(Default)]
struct Table {
    handles: HashMap<u64, Handle>,
    closed: bool,
}

type Sockets = Mutex<Table>;

/// A bidirectional byte stream to a peer, over either transport.
///
/// Dropping the socket closes it and removes it from the owning
/// resource's registry.
pub struct PeerSocket {
    id: u64,
    transport: Transport,
    peer_addr: SocketAddr,
    io: Io,
    handle: Option<Handle>,
    registry: Option<Weak<Sockets>>,
}

impl PeerSocket {
    pub(crate) fn tcp(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let handle = SockRef::from(&stream).try_clone()?;

        Ok(Self::new(
            Transport::Tcp,
            peer_addr,
            Io::Tcp(stream),
            Handle::Tcp(handle),
        ))
    }

    pub(crate) fn udp(
        conn: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        Self::new(
            Transport::Udp,
            conn.remote_address(),
            Io::Udp { send, recv },
            Handle::Udp(conn),
        )
    }

    #[cfg(test)]
    pub(crate) fn pair(transport: Transport) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        (
            Self::new(transport, addr, Io::Mem(a), Handle::Mem),
            Self::new(transport, addr, Io::Mem(b), Handle::Mem),
        )
    }

    fn new(transport: Transport, peer_addr: SocketAddr, io: Io, handle: Handle) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Relaxed),
            transport,
            peer_addr,
            io,
            handle: Some(handle),
            registry: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Drop for PeerSocket {
    fn drop(&mut self) {
        if let Some(sockets) = self.registry.take().and_then(|r| r.upgrade()) {
            sockets.lock().unwrap().handles.remove(&self.id);
        }
    }
}

impl fmt::Debug for PeerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSocket")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl AsyncRead for PeerSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        match &mut self.get_mut().io {
            Io::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Io::Udp { recv, .. } => AsyncRead::poll_read(Pin::new(recv), cx, buf),
            #[cfg(test)]
            Io::Mem(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerSocket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        match &mut self.get_mut().io {
            Io::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Io::Udp { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
            #[cfg(test)]
            Io::Mem(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match &mut self.get_mut().io {
            Io::Tcp(s) => Pin::new(s).poll_flush(cx),
            Io::Udp { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
            #[cfg(test)]
            Io::Mem(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match &mut self.get_mut().io {
            Io::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Io::Udp { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
            #[cfg(test)]
            Io::Mem(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Every socket a resource owns while open, keyed by socket id.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    sockets: Arc<Sockets>,
}

impl Registry {
    /// Take ownership of `socket`. Once the registry is closed the socket is
    /// destroyed instead and `false` is returned.
    pub(crate) fn insert(&self, socket: &mut PeerSocket) -> bool {
        let handle = match socket.handle.take() {
            Some(handle) => handle,
            None => return socket.registry.is_some(),
        };

        let mut table = self.sockets.lock().unwrap();
        if table.closed {
            drop(table);
            log::debug!("registry closed, destroy socket {}", socket.id);
            handle.destroy();
            return false;
        }

        table.handles.insert(socket.id, handle);
        socket.registry = Some(Arc::downgrade(&self.sockets));
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.sockets.lock().unwrap().handles.len()
    }

    /// Tear down every registered socket, without waiting on the peers, and
    /// refuse any socket inserted afterwards.
    pub(crate) fn destroy_all(&self) {
        let sockets: Vec<_> = {
            let mut table = self.sockets.lock().unwrap();
            table.closed = true;
            table.handles.drain().collect()
        };

        for (id, handle) in sockets {
            log::debug!("destroy socket {}", id);
            handle.destroy();
        }
    }
}
