use crate::discovery::{
    AnnounceOptions, Discovery, DiscoveryFactory, Session, SessionConfig, Subscription,
    DEFAULT_BOOTSTRAP,
};
use crate::error::{Error, Result};
use crate::lifecycle::{Entry, Lifecycle, Phase};
use crate::listener::DualListener;
use crate::peer::{local_ip, PeerDescriptor, Topic};
use crate::quic;
use crate::racer::{self, Dialer};
use crate::socket::{PeerSocket, Registry, Transport};
use async_trait::async_trait;
use std::io::{self, ErrorKind::NotConnected};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::oneshot::Receiver;
use tokio::task::{JoinHandle, JoinSet};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type BoundCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;
type ClosedCallback = Arc<dyn Fn() + Send + Sync>;
type SocketCallback = Arc<dyn Fn(PeerSocket, Transport) + Send + Sync>;

/// Construction options of a [`NetworkResource`].
#[derive(Clone)]
pub struct Options {
    preferred_port: u16,
    bootstrap: Vec<String>,
    ephemeral: bool,
    announce_local_address: bool,
    connect_timeout: Duration,
    on_bound: Option<BoundCallback>,
    on_closed: Option<ClosedCallback>,
    on_socket: Option<SocketCallback>,
    discovery: Option<DiscoveryFactory>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            preferred_port: 0,
            bootstrap: DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
            ephemeral: true,
            announce_local_address: false,
            connect_timeout: CONNECT_TIMEOUT,
            on_bound: None,
            on_closed: None,
            on_socket: None,
            discovery: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port tried first when binding, 0 lets the OS pick.
    pub fn preferred_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    pub fn bootstrap<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// A non-ephemeral node stays registered with the rendezvous nodes for
    /// as long as the resource is open.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    /// Advertise the LAN address too, so peers behind the same NAT connect
    /// locally.
    pub fn announce_local_address(mut self, announce: bool) -> Self {
        self.announce_local_address = announce;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn on_bound<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.on_bound = Some(Arc::new(f));
        self
    }

    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_closed = Some(Arc::new(f));
        self
    }

    /// Called with every accepted socket. The socket is closed when the
    /// callback drops it.
    pub fn on_socket<F>(mut self, f: F) -> Self
    where
        F: Fn(PeerSocket, Transport) + Send + Sync + 'static,
    {
        self.on_socket = Some(Arc::new(f));
        self
    }

    /// Replace the rendezvous [`Session`] created on bind.
    pub fn discovery<F>(mut self, factory: F) -> Self
    where
        F: Fn(SessionConfig) -> io::Result<Arc<dyn Discovery>> + Send + Sync + 'static,
    {
        self.discovery = Some(Arc::new(factory));
        self
    }
}

/// A tcp listener and a udp endpoint sharing one port, plus a discovery
/// session, owned as one unit.
///
/// The handle is cheap to clone, every clone refers to the same resource.
/// A closed resource cannot be bound again.
#[derive(Clone)]
pub struct NetworkResource {
    inner: Arc<Inner>,
}

struct Inner {
    options: Options,
    preferred_port: AtomicU16,
    lifecycle: Mutex<Lifecycle>,
    bound: Mutex<Option<Bound>>,
    registry: Registry,
}

struct Bound {
    addr: SocketAddr,
    endpoint: quinn::Endpoint,
    discovery: Arc<dyn Discovery>,
    tcp_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
}

impl NetworkResource {
    pub fn new(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                preferred_port: AtomicU16::new(options.preferred_port),
                options,
                lifecycle: Default::default(),
                bound: Default::default(),
                registry: Default::default(),
            }),
        }
    }

    /// Bind both transports and start the discovery session.
    ///
    /// Concurrent calls share one bind sequence and its result.
    pub async fn bind(&self) -> Result<()> {
        let entry = self.inner.lifecycle.lock().unwrap().open();

        match entry {
            Entry::Ready(result) => result,
            Entry::Wait(rx) | Entry::Settle(rx) => wait(rx).await,
            Entry::Start(rx) => {
                let result = self.inner.open();
                if let (Ok(addr), Some(cb)) = (&result, &self.inner.options.on_bound) {
                    cb(*addr);
                }

                self.inner.lifecycle.lock().unwrap().opened(result.map(|_| ()));
                wait(rx).await
            }
        }
    }

    pub async fn bind_port(&self, port: u16) -> Result<()> {
        self.inner.preferred_port.store(port, Relaxed);
        self.bind().await
    }

    /// Address of the tcp listener, the udp endpoint uses the same port.
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().unwrap().as_ref().map(|b| b.addr)
    }

    /// Connect to `peer`, directly and, when it has a referrer, through a
    /// holepunch at the same time. The first path to connect wins.
    pub async fn connect(&self, peer: &PeerDescriptor) -> Result<(PeerSocket, Transport)> {
        let (mut socket, transport) =
            racer::race(self.clone(), peer.clone(), self.inner.options.connect_timeout).await?;
        if !self.inner.registry.insert(&mut socket) {
            return Err(Error::Closed);
        }
        Ok((socket, transport))
    }

    /// Announce this resource on `topic`. With `lookup` the subscription
    /// also yields the other peers announcing it.
    pub fn announce(&self, topic: Topic, lookup: bool) -> Result<Subscription> {
        let (discovery, addr) = self.inner.session("announce")?;
        let opts = AnnounceOptions {
            local_port: addr.port(),
            local_address: self.inner.local_address(addr).map(|a| a.ip()),
            lookup,
        };

        log::debug!("announce {:?} on port {}", topic, addr.port());
        Ok(discovery.announce(topic, opts))
    }

    pub async fn lookup_one(&self, topic: Topic) -> Result<PeerDescriptor> {
        let (discovery, addr) = self.inner.session("lookup_one")?;
        discovery
            .lookup_one(topic, self.inner.local_address(addr))
            .await
            .map_err(Error::discovery)
    }

    pub fn lookup(&self, topic: Topic) -> Result<Subscription> {
        let (discovery, addr) = self.inner.session("lookup")?;
        Ok(discovery.lookup(topic, self.inner.local_address(addr)))
    }

    /// Leave the discovery network, destroy every socket, then close both
    /// listeners. Concurrent calls share one close sequence.
    pub async fn close(&self) -> Result<()> {
        loop {
            let entry = self.inner.lifecycle.lock().unwrap().close();

            match entry {
                Entry::Ready(result) => {
                    // sockets connected without ever binding
                    self.inner.registry.destroy_all();
                    return result;
                }
                Entry::Wait(rx) => return wait(rx).await,
                Entry::Settle(rx) => {
                    let _ = rx.await;
                }
                Entry::Start(rx) => {
                    // runs to completion even if the caller goes away
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.shutdown().await;
                        if let Some(cb) = &inner.options.on_closed {
                            cb();
                        }
                        inner.lifecycle.lock().unwrap().closed(Ok(()));
                    });
                    return wait(rx).await;
                }
            }
        }
    }

    /// Number of open sockets owned by this resource.
    pub fn connections(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.lifecycle.lock().unwrap().phase(),
            Phase::Closing | Phase::Closed
        )
    }

    fn endpoint(&self) -> io::Result<quinn::Endpoint> {
        self.inner
            .bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.endpoint.clone())
            .ok_or_else(|| io::Error::new(NotConnected, "network resource not bound"))
    }
}

async fn wait(rx: Receiver<Result<()>>) -> Result<()> {
    rx.await.unwrap_or(Err(Error::Closed))
}

impl Inner {
    fn open(&self) -> Result<SocketAddr> {
        let listener = DualListener::bind(self.preferred_port.load(Relaxed))?;
        let addr = listener.addr;
        log::debug!("bound tcp and udp on {}", addr);

        let config = SessionConfig {
            bootstrap: self.options.bootstrap.clone(),
            ephemeral: self.options.ephemeral,
            local_addr: addr,
        };
        let discovery = match &self.options.discovery {
            Some(factory) => factory(config),
            None => Session::new(config).map(|s| Arc::new(s) as Arc<dyn Discovery>),
        }
        .map_err(Error::discovery)?;

        let on_socket = self.options.on_socket.clone();
        let tcp_task = tokio::spawn(accept_tcp(
            listener.tcp,
            self.registry.clone(),
            on_socket.clone(),
        ));
        let udp_task = tokio::spawn(accept_udp(
            listener.udp.clone(),
            self.registry.clone(),
            on_socket,
        ));

        *self.bound.lock().unwrap() = Some(Bound {
            addr,
            endpoint: listener.udp,
            discovery,
            tcp_task,
            udp_task,
        });

        Ok(addr)
    }

    async fn shutdown(&self) {
        let bound = match self.bound.lock().unwrap().take() {
            Some(bound) => bound,
            None => return,
        };

        bound.discovery.destroy().await;
        log::debug!("discovery on {} destroyed", bound.addr);

        let Bound {
            addr,
            endpoint,
            discovery,
            tcp_task,
            udp_task,
        } = bound;

        // no accept loop may register a socket past this point
        tcp_task.abort();
        udp_task.abort();
        let _ = tcp_task.await;
        let _ = udp_task.await;

        self.registry.destroy_all();

        // the tcp listener went with its task
        endpoint.close(0u32.into(), b"closed");
        endpoint.wait_idle().await;

        drop(discovery);
        log::debug!("listeners on {} closed", addr);
    }

    fn session(&self, op: &'static str) -> Result<(Arc<dyn Discovery>, SocketAddr)> {
        self.bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| (b.discovery.clone(), b.addr))
            .ok_or(Error::NotBound(op))
    }

    fn local_address(&self, bound: SocketAddr) -> Option<SocketAddr> {
        if !self.options.announce_local_address {
            return None;
        }
        local_ip().map(|ip| SocketAddr::new(ip, bound.port()))
    }
}

fn emit(on_socket: &Option<SocketCallback>, socket: PeerSocket, transport: Transport) {
    log::debug!(
        "accepted {:?} socket {} from {}",
        transport,
        socket.id(),
        socket.peer_addr()
    );
    if let Some(cb) = on_socket {
        cb(socket, transport);
    }
}

async fn accept_tcp(listener: TcpListener, registry: Registry, on_socket: Option<SocketCallback>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::debug!("tcp accept failed: {}", e);
                continue;
            }
        };

        match PeerSocket::tcp(stream) {
            Ok(mut socket) => {
                if registry.insert(&mut socket) {
                    emit(&on_socket, socket, Transport::Tcp);
                }
            }
            Err(e) => log::debug!("tcp accept failed: {}", e),
        }
    }
}

async fn accept_udp(
    endpoint: quinn::Endpoint,
    registry: Registry,
    on_socket: Option<SocketCallback>,
) {
    let mut pending = JoinSet::new();

    loop {
        select! {
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => {
                    pending.spawn(quic::accept(incoming));
                }
                None => break,
            },
            Some(accepted) = pending.join_next() => match accepted {
                Ok(Ok((conn, send, recv))) => {
                    let mut socket = PeerSocket::udp(conn, send, recv);
                    if registry.insert(&mut socket) {
                        emit(&on_socket, socket, Transport::Udp);
                    }
                }
                Ok(Err(e)) => log::debug!("udp accept failed: {}", e),
                Err(_) => {}
            },
        }
    }
}

#[async_trait]
impl Dialer for NetworkResource {
    fn is_closed(&self) -> bool {
        NetworkResource::is_closed(self)
    }

    async fn open(&self) -> Result<()> {
        self.bind().await
    }

    async fn holepunch(&self, peer: &PeerDescriptor) -> io::Result<()> {
        let (discovery, _) = self
            .inner
            .session("holepunch")
            .map_err(|e| io::Error::new(NotConnected, e))?;
        discovery.holepunch(peer).await
    }

    async fn dial_tcp(&self, peer: &PeerDescriptor) -> io::Result<PeerSocket> {
        let stream = TcpStream::connect(peer.resolve().await?).await?;
        PeerSocket::tcp(stream)
    }

    async fn dial_udp(&self, peer: &PeerDescriptor) -> io::Result<PeerSocket> {
        let endpoint = self.endpoint()?;
        let (conn, send, recv) = quic::dial(&endpoint, peer.resolve().await?).await?;
        Ok(PeerSocket::udp(conn, send, recv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TopicEvent;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Discovery that knows no nodes and rejects holepunches.
    struct NoDiscovery {
        destroyed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Discovery for NoDiscovery {
        fn announce(&self, _topic: Topic, _opts: AnnounceOptions) -> Subscription {
            let (tx, rx) = mpsc::channel(1);
            Subscription::new(
                rx,
                tokio::spawn(async move {
                    let _ = tx.send(TopicEvent::Update).await;
                }),
            )
        }

        async fn lookup_one(
            &self,
            _topic: Topic,
            _local_address: Option<SocketAddr>,
        ) -> io::Result<PeerDescriptor> {
            Err(io::Error::new(ErrorKind::NotFound, "no peers"))
        }

        fn lookup(&self, _topic: Topic, _local_address: Option<SocketAddr>) -> Subscription {
            let (_tx, rx) = mpsc::channel(1);
            Subscription::new(rx, tokio::spawn(async {}))
        }

        async fn holepunch(&self, _peer: &PeerDescriptor) -> io::Result<()> {
            Err(io::Error::new(ErrorKind::ConnectionRefused, "peer unknown"))
        }

        async fn destroy(&self) {
            self.destroyed.fetch_add(1, SeqCst);
        }
    }

    fn options(destroyed: Arc<AtomicUsize>) -> Options {
        Options::new().discovery(move |_| {
            Ok(Arc::new(NoDiscovery {
                destroyed: destroyed.clone(),
            }) as Arc<dyn Discovery>)
        })
    }

    /// Skips the tcp path so the udp dial is exercised alone. The holepunch
    /// only goes through discovery when `punch` is set.
    #[derive(Clone)]
    struct UdpOnly {
        resource: NetworkResource,
        punch: bool,
    }

    #[async_trait]
    impl Dialer for UdpOnly {
        fn is_closed(&self) -> bool {
            self.resource.is_closed()
        }

        async fn open(&self) -> Result<()> {
            self.resource.bind().await
        }

        async fn holepunch(&self, peer: &PeerDescriptor) -> io::Result<()> {
            if self.punch {
                Dialer::holepunch(&self.resource, peer).await
            } else {
                Ok(())
            }
        }

        async fn dial_tcp(&self, _peer: &PeerDescriptor) -> io::Result<PeerSocket> {
            Err(io::Error::new(ErrorKind::ConnectionRefused, "refused"))
        }

        async fn dial_udp(&self, peer: &PeerDescriptor) -> io::Result<PeerSocket> {
            self.resource.dial_udp(peer).await
        }
    }

    fn echo(socket: PeerSocket, _transport: Transport) {
        tokio::spawn(async move {
            let mut socket = socket;
            let mut buf = [0u8; 1];
            if socket.read_exact(&mut buf).await.is_ok() {
                let _ = socket.write_all(b"b").await;
                let _ = socket.flush().await;
                // hold the socket until the peer closes it
                let _ = socket.read(&mut buf).await;
            }
        });
    }

    #[tokio::test]
    async fn test_bind_close() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let bound = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (b, c) = (bound.clone(), closed.clone());
        let r = NetworkResource::new(
            options(destroyed.clone())
                .on_bound(move |_| {
                    b.fetch_add(1, SeqCst);
                })
                .on_closed(move || {
                    c.fetch_add(1, SeqCst);
                }),
        );
        assert!(r.address().is_none());

        let (x, y) = tokio::join!(r.bind(), r.bind());
        x.unwrap();
        y.unwrap();
        assert_eq!(bound.load(SeqCst), 1);
        assert_ne!(r.address().unwrap().port(), 0);

        let (x, y) = tokio::join!(r.close(), r.close());
        x.unwrap();
        y.unwrap();
        assert_eq!(closed.load(SeqCst), 1);
        assert_eq!(destroyed.load(SeqCst), 1);
        assert!(r.address().is_none());
        assert!(r.is_closed());

        assert!(matches!(r.bind().await, Err(Error::Closed)));
        r.close().await.unwrap();
        assert_eq!(closed.load(SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bound_callback_before_bind_returns() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let r = NetworkResource::new(options(Default::default()).on_bound(move |_| {
            std::thread::sleep(Duration::from_millis(50));
            f.fetch_add(1, SeqCst);
        }));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let (r, fired) = (r.clone(), fired.clone());
                tokio::spawn(async move {
                    r.bind().await.unwrap();
                    fired.load(SeqCst)
                })
            })
            .collect();
        for t in tasks {
            assert_eq!(t.await.unwrap(), 1);
        }

        r.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unopened() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let r = NetworkResource::new(options(Default::default()).on_closed(move || {
            c.fetch_add(1, SeqCst);
        }));

        r.close().await.unwrap();
        assert!(r.is_closed());
        assert_eq!(closed.load(SeqCst), 0);
        assert!(matches!(r.bind().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_not_bound() {
        let r = NetworkResource::new(options(Default::default()));
        let topic = Topic::random();

        assert!(matches!(
            r.announce(topic, false),
            Err(Error::NotBound("announce"))
        ));
        assert!(matches!(r.lookup(topic), Err(Error::NotBound("lookup"))));
        assert!(matches!(
            r.lookup_one(topic).await,
            Err(Error::NotBound("lookup_one"))
        ));
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_bind() {
        let r = NetworkResource::new(
            Options::new().discovery(|_| Err(io::Error::new(ErrorKind::Other, "no nodes"))),
        );
        assert!(matches!(r.bind().await, Err(Error::Discovery(_))));
        assert!(r.address().is_none());
        assert!(!r.is_closed());
    }

    #[tokio::test]
    async fn test_announce_through_discovery() {
        let r = NetworkResource::new(options(Default::default()));
        r.bind().await.unwrap();

        let mut sub = r.announce(Topic::random(), false).unwrap();
        assert_eq!(sub.next().await, Some(TopicEvent::Update));
        assert!(r.lookup_one(Topic::random()).await.is_err());

        r.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_holepunch() {
        let a = NetworkResource::new(options(Default::default()));
        a.bind().await.unwrap();
        let port = a.address().unwrap().port();
        a.close().await.unwrap();

        // nothing listens on the port any more, and the referrer rejects
        let b = NetworkResource::new(options(Default::default()));
        let peer = PeerDescriptor::new("127.0.0.1", port).with_referrer("127.0.0.1", 8888);
        assert!(matches!(
            b.connect(&peer).await,
            Err(Error::CouldNotEstablish)
        ));
        assert!(b.address().is_some());

        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_connect() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let n = accepted.clone();
        let a = NetworkResource::new(options(Default::default()).on_socket(move |s, t| {
            assert_eq!(t, Transport::Udp);
            n.fetch_add(1, SeqCst);
            echo(s, t);
        }));
        a.bind().await.unwrap();
        let port = a.address().unwrap().port();

        let b = NetworkResource::new(options(Default::default()));
        let peer = PeerDescriptor::new("127.0.0.1", port).with_referrer("127.0.0.1", 8888);
        let dialer = UdpOnly {
            resource: b.clone(),
            punch: false,
        };
        let (mut socket, transport) = racer::race(dialer, peer, CONNECT_TIMEOUT).await.unwrap();
        assert_eq!(transport, Transport::Udp);
        assert!(!transport.is_tcp());

        socket.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");
        assert_eq!(accepted.load(SeqCst), 1);
        assert_eq!(a.connections(), 1);

        drop(socket);
        b.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.connections(), 0);
    }

    #[cfg(feature = "server")]
    #[tokio::test]
    async fn test_holepunch_through_rendezvous() {
        let server = crate::Server::new("127.0.0.1:0").await.unwrap();
        let node = server.local_addr().unwrap();
        let server = tokio::spawn(server.run());
        let bootstrap = vec![node.to_string()];

        let a = NetworkResource::new(Options::new().bootstrap(bootstrap.clone()).on_socket(echo));
        a.bind().await.unwrap();
        let topic = Topic::random();
        let mut sub = a.announce(topic, false).unwrap();
        assert_eq!(sub.next().await, Some(TopicEvent::Update));

        let b = NetworkResource::new(Options::new().bootstrap(bootstrap));
        b.bind().await.unwrap();
        let peer = b.lookup_one(topic).await.unwrap();
        assert_eq!(peer.port, a.address().unwrap().port());
        assert_eq!(peer.referrer, Some(crate::Referrer::from(node)));

        let dialer = UdpOnly {
            resource: b.clone(),
            punch: true,
        };
        let (mut socket, transport) = racer::race(dialer, peer, CONNECT_TIMEOUT).await.unwrap();
        assert_eq!(transport, Transport::Udp);

        socket.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"b");

        drop(socket);
        drop(sub);
        b.close().await.unwrap();
        a.close().await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_close_destroys_sockets() {
        let a = NetworkResource::new(options(Default::default()).on_socket(echo));
        a.bind().await.unwrap();
        let port = a.address().unwrap().port();

        let b = NetworkResource::new(options(Default::default()));
        let peer = PeerDescriptor::new("127.0.0.1", port);

        let mut sockets = vec![];
        for _ in 0..3 {
            let (mut socket, transport) = b.connect(&peer).await.unwrap();
            assert_eq!(transport, Transport::Tcp);
            socket.write_all(b"a").await.unwrap();
            let mut buf = [0u8; 1];
            socket.read_exact(&mut buf).await.unwrap();
            sockets.push(socket);
        }
        assert_eq!(b.connections(), 3);
        assert_eq!(a.connections(), 3);

        a.close().await.unwrap();
        assert_eq!(a.connections(), 0);

        for socket in &mut sockets {
            let mut buf = [0u8; 1];
            assert_eq!(socket.read(&mut buf).await.unwrap_or(0), 0);
        }

        b.close().await.unwrap();
        assert_eq!(b.connections(), 0);
    }
}
