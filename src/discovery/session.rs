use super::{AnnounceOptions, Discovery, SessionConfig, Subscription, TopicEvent};
use crate::peer::{PeerDescriptor, Referrer, Topic};
use crate::proto::rendezvous::{
    request::Cmd as ReqCmd, response::Cmd as RespCmd, Announce, Bye, Isync, Lookup, Ping, Request,
    Response, Rsync,
};
use async_trait::async_trait;
use protobuf::Message;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::{
    Error,
    ErrorKind::{ConnectionRefused, InvalidInput, NotConnected, NotFound, Other, TimedOut},
    Result,
};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};

const TRIES: usize = 3;
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const REFRESH: Duration = Duration::from_secs(10);

/// Discovery over rendezvous nodes.
///
/// Every node gets its own udp socket, bound to the resource's shared port
/// and connected to the node, so the node observes the same address the
/// udp endpoint listens on.
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    bootstrap: Vec<SocketAddr>,
    links: Mutex<HashMap<SocketAddr, Arc<Link>>>,
    tasks: Mutex<Vec<AbortHandle>>,
    seq: AtomicU32,
    closed: AtomicBool,
}

struct Link {
    addr: SocketAddr,
    socket: UdpSocket,
    pending: Mutex<HashMap<u32, oneshot::Sender<Response>>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let bootstrap = config
            .bootstrap
            .iter()
            .filter_map(|node| match node.to_socket_addrs() {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    log::warn!("bootstrap node {} resolve fail: {}", node, e);
                    None
                }
            })
            .collect();

        let inner = Arc::new(Inner {
            local_addr: config.local_addr,
            bootstrap,
            links: Default::default(),
            tasks: Default::default(),
            seq: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        for addr in &inner.bootstrap {
            inner.link(*addr)?;
        }

        if !config.ephemeral {
            let task = tokio::spawn(inner.clone().keepalive());
            inner.track(task.abort_handle());
        }

        Ok(Self { inner })
    }

    pub fn bootstrap(&self) -> &[SocketAddr] {
        &self.inner.bootstrap
    }

    fn subscribe<F, Fut>(&self, f: F) -> Subscription
    where
        F: FnOnce(Arc<Inner>, Sender<TopicEvent>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = channel(16);
        let task = tokio::spawn(f(self.inner.clone(), tx));
        self.inner.track(task.abort_handle());
        Subscription::new(rx, task)
    }
}

#[async_trait]
impl Discovery for Session {
    fn announce(&self, topic: Topic, opts: AnnounceOptions) -> Subscription {
        self.subscribe(move |inner, tx| inner.announce_loop(topic, opts, tx))
    }

    async fn lookup_one(
        &self,
        topic: Topic,
        local_address: Option<SocketAddr>,
    ) -> Result<PeerDescriptor> {
        for node in &self.inner.bootstrap {
            match self.inner.lookup(*node, &topic, local_address).await {
                Ok(peers) => {
                    if let Some(peer) = peers.into_iter().next() {
                        return Ok(peer);
                    }
                }
                Err(e) => log::debug!("lookup on {} failed: {}", node, e),
            }
        }

        Err(Error::new(NotFound, "no peers found for topic"))
    }

    fn lookup(&self, topic: Topic, local_address: Option<SocketAddr>) -> Subscription {
        self.subscribe(move |inner, tx| async move {
            let mut seen = HashSet::new();
            while inner.emit_peers(&topic, local_address, &mut seen, &tx).await {
                sleep(REFRESH).await;
            }
        })
    }

    async fn holepunch(&self, peer: &PeerDescriptor) -> Result<()> {
        let referrer = peer
            .referrer
            .as_ref()
            .ok_or_else(|| Error::new(InvalidInput, "peer has no referrer"))?
            .resolve()
            .await?;
        let target = peer.resolve().await?;

        let isync = Isync {
            addr: target.to_string(),
            ..Default::default()
        };

        match self.inner.request(referrer, ReqCmd::Isync(isync)).await?.cmd {
            Some(RespCmd::Redirect(rdr)) if !rdr.addr.is_empty() => {
                log::debug!("holepunch {} via {} done", rdr.addr, referrer);
                Ok(())
            }
            Some(RespCmd::Redirect(_)) => Err(Error::new(ConnectionRefused, "target not found")),
            _ => Err(Error::new(Other, "invalid rendezvous response")),
        }
    }

    async fn destroy(&self) {
        self.inner.closed.store(true, Relaxed);

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let links: Vec<_> = self.inner.links.lock().unwrap().drain().collect();
        for (_, link) in links {
            let seq = self.inner.next_seq();
            link.send(seq, ReqCmd::Bye(Bye::new())).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.closed.store(true, Relaxed);
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Relaxed)
    }

    fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn link(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Link>> {
        if self.closed.load(Relaxed) {
            return Err(Error::new(NotConnected, "discovery session destroyed"));
        }

        let mut links = self.links.lock().unwrap();
        if let Some(link) = links.get(&addr) {
            return Ok(link.clone());
        }

        let link = Arc::new(Link {
            addr,
            socket: Link::connect_server(self.local_addr.port(), addr)?,
            pending: Default::default(),
        });

        let reader = tokio::spawn(link.clone().read_loop());
        self.track(reader.abort_handle());
        links.insert(addr, link.clone());

        Ok(link)
    }

    async fn request(self: &Arc<Self>, node: SocketAddr, cmd: ReqCmd) -> Result<Response> {
        let link = self.link(node)?;
        link.request(self.next_seq(), cmd).await
    }

    async fn lookup(
        self: &Arc<Self>,
        node: SocketAddr,
        topic: &Topic,
        local_address: Option<SocketAddr>,
    ) -> Result<Vec<PeerDescriptor>> {
        let lookup = Lookup {
            topic: topic.as_bytes().to_vec(),
            local_addr: local_address.map(|a| a.to_string()).unwrap_or_default(),
            ..Default::default()
        };

        match self.request(node, ReqCmd::Lookup(lookup)).await?.cmd {
            Some(RespCmd::Peers(peers)) => Ok(peers
                .addrs
                .iter()
                .filter_map(|addr| addr.parse::<SocketAddr>().ok())
                .map(|addr| PeerDescriptor {
                    referrer: Some(Referrer::from(node)),
                    ..PeerDescriptor::from(addr)
                })
                .collect()),
            _ => Err(Error::new(Other, "invalid rendezvous response")),
        }
    }

    /// Send peers not seen before. Returns false once nobody listens.
    async fn emit_peers(
        self: &Arc<Self>,
        topic: &Topic,
        local_address: Option<SocketAddr>,
        seen: &mut HashSet<PeerDescriptor>,
        tx: &Sender<TopicEvent>,
    ) -> bool {
        for node in &self.bootstrap {
            let peers = match self.lookup(*node, topic, local_address).await {
                Ok(peers) => peers,
                Err(e) => {
                    log::debug!("lookup on {} failed: {}", node, e);
                    continue;
                }
            };

            for peer in peers {
                if seen.insert(peer.clone()) && tx.send(TopicEvent::Peer(peer)).await.is_err() {
                    return false;
                }
            }
        }

        !tx.is_closed()
    }

    async fn announce_loop(
        self: Arc<Self>,
        topic: Topic,
        opts: AnnounceOptions,
        tx: Sender<TopicEvent>,
    ) {
        let local_addr = opts
            .local_address
            .map(|ip| SocketAddr::new(ip, opts.local_port).to_string())
            .unwrap_or_default();
        let mut updated = false;
        let mut seen = HashSet::new();

        loop {
            let mut announced = false;
            for node in &self.bootstrap {
                let announce = Announce {
                    topic: topic.as_bytes().to_vec(),
                    local_addr: local_addr.clone(),
                    ..Default::default()
                };

                match self.request(*node, ReqCmd::Announce(announce)).await {
                    Ok(_) => announced = true,
                    Err(e) => log::debug!("announce on {} failed: {}", node, e),
                }
            }

            if announced && !updated {
                updated = true;
                if tx.send(TopicEvent::Update).await.is_err() {
                    return;
                }
            }

            if opts.lookup && !self.emit_peers(&topic, None, &mut seen, &tx).await {
                return;
            }

            sleep(REFRESH).await;
        }
    }

    async fn keepalive(self: Arc<Self>) {
        loop {
            for node in &self.bootstrap {
                let ping = Ping {
                    ephemeral: false,
                    ..Default::default()
                };
                if let Err(e) = self.request(*node, ReqCmd::Ping(ping)).await {
                    log::debug!("ping {} failed: {}", node, e);
                }
            }

            sleep(REFRESH).await;
        }
    }
}

impl Link {
    fn connect_server(port: u16, server_addr: SocketAddr) -> Result<UdpSocket> {
        let local_addr: SocketAddr = match server_addr {
            SocketAddr::V4(_) => ([0, 0, 0, 0], port).into(),
            SocketAddr::V6(_) => ([0u16; 8], port).into(),
        };

        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.connect(&server_addr.into())?;
        socket.set_nonblocking(true)?;

        UdpSocket::from_std(socket.into())
    }

    async fn send(&self, seq: u32, cmd: ReqCmd) {
        let req = Request {
            seq,
            cmd: Some(cmd),
            ..Default::default()
        };

        match req.write_to_bytes() {
            Ok(buf) => {
                let _ = self.socket.send(&buf).await;
            }
            Err(e) => log::debug!("encode request failed: {}", e),
        }
    }

    async fn request(&self, seq: u32, cmd: ReqCmd) -> Result<Response> {
        let req = Request {
            seq,
            cmd: Some(cmd),
            ..Default::default()
        };
        let buf = req.write_to_bytes()?;

        for _ in 0..TRIES {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(seq, tx);
            self.socket.send(&buf).await?;

            if let Ok(Ok(resp)) = timeout(REPLY_TIMEOUT, rx).await {
                return Ok(resp);
            }
        }

        self.pending.lock().unwrap().remove(&seq);
        Err(Error::new(TimedOut, "no response from rendezvous node"))
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = [0u8; 1500];

        loop {
            let n = match self.socket.recv(&mut buf).await {
                Ok(n) => n,
                // icmp unreachable from an earlier send
                Err(e) if e.kind() == ConnectionRefused => continue,
                Err(e) => {
                    log::debug!("rendezvous link {} closed: {}", self.addr, e);
                    break;
                }
            };

            let resp = match Response::parse_from_bytes(&buf[..n]) {
                Ok(resp) => resp,
                Err(_) => continue,
            };

            if let Some(RespCmd::Fsync(fsync)) = &resp.cmd {
                self.punch(resp.seq, &fsync.addr).await;
                continue;
            }

            if let Some(tx) = self.pending.lock().unwrap().remove(&resp.seq) {
                let _ = tx.send(resp);
            }
        }
    }

    /// A peer asked this node for a path: send it a packet from the shared
    /// port so our NAT lets its packets in, then tell the rendezvous node.
    async fn punch(&self, seq: u32, addr: &str) {
        let peer_addr: SocketAddr = match addr.parse() {
            Ok(addr) => addr,
            Err(_) => {
                log::debug!("invalid fsync addr {}", addr);
                return;
            }
        };
        log::debug!("fsync from {}, punching {}", self.addr, peer_addr);

        let req = Request {
            seq,
            cmd: Some(ReqCmd::Rsync(Rsync {
                addr: addr.to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };

        if let Ok(buf) = req.write_to_bytes() {
            let _ = self.socket.send_to(&buf, peer_addr).await;
            let _ = self.socket.send(&buf).await;
        }
    }
}
