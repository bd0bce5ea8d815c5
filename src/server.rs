use protobuf::Message;
use std::collections::HashMap;
use std::io::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::{timeout, Instant};

use crate::proto::rendezvous::{
    request::Cmd as ReqCmd, response::Cmd as RespCmd, Announce, Fsync, Isync, Lookup, Peers, Ping,
    Pong, Redirect, Request, Response, Rsync,
};

const EXPIRE: Duration = Duration::from_secs(60);
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Node {
    last_seen: Instant,
    ephemeral: bool,
}

struct Announcer {
    local_addr: Option<SocketAddr>,
    last_seen: Instant,
}

/// Udp rendezvous server
///
/// Keeps track of nodes and the topics they announce, answers lookups and
/// forwards holepunch requests.
pub struct Server {
    socket: UdpSocket,
    nodes: HashMap<SocketAddr, Node>,
    topics: HashMap<Vec<u8>, HashMap<SocketAddr, Announcer>>,
    next_gc: Instant,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket,
            nodes: Default::default(),
            topics: Default::default(),
            next_gc: Self::next_gc(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0; 1500];

        loop {
            if let Ok(Ok((size, addr))) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)).await
            {
                if let Ok(req) = Request::parse_from_bytes(&buf[..size]) {
                    for (to, resp) in self.handle_request(req, addr) {
                        self.send_response(resp, to).await;
                    }
                }
            }

            if Instant::now() > self.next_gc {
                self.gc();
            }
        }
    }

    fn handle_request(&mut self, req: Request, addr: SocketAddr) -> Vec<(SocketAddr, Response)> {
        let seq = req.seq;
        let cmd = match req.cmd {
            Some(ReqCmd::Ping(ping)) => self.handle_ping(ping, addr),
            Some(ReqCmd::Announce(announce)) => self.handle_announce(announce, addr),
            Some(ReqCmd::Lookup(lookup)) => self.handle_lookup(lookup, addr),
            Some(ReqCmd::Isync(isync)) => return self.handle_isync(seq, isync, addr),
            Some(ReqCmd::Rsync(rsync)) => return self.handle_rsync(seq, rsync, addr),
            Some(ReqCmd::Bye(_)) => {
                self.handle_bye(addr);
                return vec![];
            }
            _ => {
                log::debug!("unknown cmd from {} seq {}", addr, seq);
                return vec![];
            }
        };

        vec![(addr, Self::response(seq, cmd))]
    }

    fn response(seq: u32, cmd: RespCmd) -> Response {
        Response {
            seq,
            cmd: Some(cmd),
            ..Default::default()
        }
    }

    async fn send_response(&self, resp: Response, addr: SocketAddr) {
        match resp.write_to_bytes() {
            Ok(vec) => {
                let _ = self.socket.send_to(vec.as_ref(), addr).await;
            }
            Err(e) => log::debug!("encode response failed: {}", e),
        }
    }

    fn touch(&mut self, addr: SocketAddr, ephemeral: bool) {
        let node = self.nodes.entry(addr).or_insert_with(|| {
            log::debug!("new node {}", addr);
            Node {
                last_seen: Instant::now(),
                ephemeral,
            }
        });
        node.last_seen = Instant::now();
        node.ephemeral &= ephemeral;
    }

    fn handle_ping(&mut self, ping: Ping, addr: SocketAddr) -> RespCmd {
        log::trace!("ping {}", addr);
        self.touch(addr, ping.ephemeral);
        RespCmd::Pong(Pong::new())
    }

    fn handle_announce(&mut self, announce: Announce, addr: SocketAddr) -> RespCmd {
        log::trace!("announce {} on {:02x?}", addr, &announce.topic[..]);
        self.touch(addr, true);

        let announcers = self.topics.entry(announce.topic).or_default();
        announcers.insert(
            addr,
            Announcer {
                local_addr: announce.local_addr.parse().ok(),
                last_seen: Instant::now(),
            },
        );

        RespCmd::Pong(Pong::new())
    }

    fn handle_lookup(&mut self, lookup: Lookup, addr: SocketAddr) -> RespCmd {
        self.touch(addr, true);

        let same_lan = !lookup.local_addr.is_empty();
        let addrs = self
            .topics
            .get(&lookup.topic)
            .map(|announcers| {
                announcers
                    .iter()
                    .filter(|(a, _)| **a != addr)
                    .map(|(a, announcer)| match announcer.local_addr {
                        Some(local) if same_lan && a.ip() == addr.ip() => local.to_string(),
                        _ => a.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        log::trace!("lookup from {} found {:?}", addr, addrs);

        RespCmd::Peers(Peers {
            addrs,
            ..Default::default()
        })
    }

    fn handle_isync(
        &mut self,
        seq: u32,
        isync: Isync,
        addr: SocketAddr,
    ) -> Vec<(SocketAddr, Response)> {
        log::debug!("isync {} -> {}", addr, isync.addr);
        self.touch(addr, true);

        match isync.addr.parse::<SocketAddr>() {
            Ok(target) if self.nodes.contains_key(&target) => {
                let fsync = Fsync {
                    addr: addr.to_string(),
                    ..Default::default()
                };
                vec![(target, Self::response(seq, RespCmd::Fsync(fsync)))]
            }
            _ => {
                log::debug!("target {} not found", isync.addr);
                vec![(addr, Self::response(seq, RespCmd::Redirect(Redirect::new())))]
            }
        }
    }

    fn handle_rsync(
        &mut self,
        seq: u32,
        rsync: Rsync,
        addr: SocketAddr,
    ) -> Vec<(SocketAddr, Response)> {
        log::debug!("rsync {} -> {}", addr, rsync.addr);
        self.touch(addr, true);

        match rsync.addr.parse::<SocketAddr>() {
            Ok(requester) => {
                let rdr = Redirect {
                    addr: addr.to_string(),
                    ..Default::default()
                };
                vec![(requester, Self::response(seq, RespCmd::Redirect(rdr)))]
            }
            Err(_) => {
                log::debug!("rsync invalid target {}", rsync.addr);
                vec![]
            }
        }
    }

    fn handle_bye(&mut self, addr: SocketAddr) {
        log::debug!("bye {}", addr);
        self.nodes.remove(&addr);
        for announcers in self.topics.values_mut() {
            announcers.remove(&addr);
        }
        self.topics.retain(|_, announcers| !announcers.is_empty());
    }

    fn next_gc() -> Instant {
        Instant::now() + EXPIRE
    }

    /// Drop entries not refreshed within [`EXPIRE`], and ephemeral nodes
    /// that no longer announce anything.
    fn gc(&mut self) {
        let now = Instant::now();
        let alive = |last_seen: Instant| now.duration_since(last_seen) < EXPIRE;

        for announcers in self.topics.values_mut() {
            announcers.retain(|_, a| alive(a.last_seen));
        }
        self.topics.retain(|_, announcers| !announcers.is_empty());

        let topics = &self.topics;
        let announcing = |addr: &SocketAddr| topics.values().any(|a| a.contains_key(addr));

        self.nodes.retain(|addr, node| {
            if !alive(node.last_seen) {
                log::debug!("expired {}", addr);
                return false;
            }
            if node.ephemeral && !announcing(addr) {
                log::debug!("ephemeral {} stopped announcing", addr);
                return false;
            }
            true
        });

        self.next_gc = Self::next_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(seq: u32, cmd: ReqCmd) -> Request {
        Request {
            seq,
            cmd: Some(cmd),
            ..Default::default()
        }
    }

    fn announce(topic: &[u8], local_addr: &str) -> ReqCmd {
        ReqCmd::Announce(Announce {
            topic: topic.to_vec(),
            local_addr: local_addr.to_string(),
            ..Default::default()
        })
    }

    fn lookup(topic: &[u8], local_addr: &str) -> ReqCmd {
        ReqCmd::Lookup(Lookup {
            topic: topic.to_vec(),
            local_addr: local_addr.to_string(),
            ..Default::default()
        })
    }

    fn peers(replies: Vec<(SocketAddr, Response)>) -> Vec<String> {
        match replies.into_iter().next().and_then(|(_, r)| r.cmd) {
            Some(RespCmd::Peers(p)) => p.addrs,
            _ => panic!("expected peers"),
        }
    }

    async fn server() -> Server {
        Server::new("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_lookup_excludes_requester() {
        let mut s = server().await;
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "5.6.7.8:2000".parse().unwrap();

        s.handle_request(req(1, announce(b"t", "")), a);
        assert!(peers(s.handle_request(req(2, lookup(b"t", "")), a)).is_empty());
        assert_eq!(
            peers(s.handle_request(req(3, lookup(b"t", "")), b)),
            vec!["1.2.3.4:1000".to_string()]
        );
        assert!(peers(s.handle_request(req(4, lookup(b"other", "")), b)).is_empty());
    }

    #[tokio::test]
    async fn test_lookup_same_lan() {
        let mut s = server().await;
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "1.2.3.4:2000".parse().unwrap();
        let c: SocketAddr = "9.9.9.9:3000".parse().unwrap();

        s.handle_request(req(1, announce(b"t", "192.168.1.2:1000")), a);

        let same = peers(s.handle_request(req(2, lookup(b"t", "192.168.1.3:2000")), b));
        assert_eq!(same, vec!["192.168.1.2:1000".to_string()]);

        // no local address from the requester, keep the public one
        let public = peers(s.handle_request(req(3, lookup(b"t", "")), b));
        assert_eq!(public, vec!["1.2.3.4:1000".to_string()]);

        let remote = peers(s.handle_request(req(4, lookup(b"t", "10.0.0.1:3000")), c));
        assert_eq!(remote, vec!["1.2.3.4:1000".to_string()]);
    }

    #[tokio::test]
    async fn test_isync_rsync() {
        let mut s = server().await;
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "5.6.7.8:2000".parse().unwrap();

        s.handle_request(req(1, ReqCmd::Ping(Ping::new())), a);

        let isync = Isync {
            addr: a.to_string(),
            ..Default::default()
        };
        let replies = s.handle_request(req(7, ReqCmd::Isync(isync)), b);
        assert_eq!(replies.len(), 1);
        let (to, resp) = &replies[0];
        assert_eq!(*to, a);
        assert_eq!(resp.seq, 7);
        match &resp.cmd {
            Some(RespCmd::Fsync(f)) => assert_eq!(f.addr, b.to_string()),
            _ => panic!("expected fsync"),
        }

        let rsync = Rsync {
            addr: b.to_string(),
            ..Default::default()
        };
        let replies = s.handle_request(req(7, ReqCmd::Rsync(rsync)), a);
        let (to, resp) = &replies[0];
        assert_eq!(*to, b);
        assert_eq!(resp.seq, 7);
        match &resp.cmd {
            Some(RespCmd::Redirect(r)) => assert_eq!(r.addr, a.to_string()),
            _ => panic!("expected redirect"),
        }
    }

    #[tokio::test]
    async fn test_isync_unknown_target() {
        let mut s = server().await;
        let b: SocketAddr = "5.6.7.8:2000".parse().unwrap();

        let isync = Isync {
            addr: "1.2.3.4:1000".to_string(),
            ..Default::default()
        };
        let replies = s.handle_request(req(3, ReqCmd::Isync(isync)), b);
        let (to, resp) = &replies[0];
        assert_eq!(*to, b);
        match &resp.cmd {
            Some(RespCmd::Redirect(r)) => assert!(r.addr.is_empty()),
            _ => panic!("expected empty redirect"),
        }
    }

    #[tokio::test]
    async fn test_bye_forgets_node() {
        let mut s = server().await;
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "5.6.7.8:2000".parse().unwrap();

        s.handle_request(req(1, announce(b"t", "")), a);
        s.handle_request(req(2, ReqCmd::Bye(Default::default())), a);

        assert!(s.nodes.is_empty());
        assert!(peers(s.handle_request(req(3, lookup(b"t", "")), b)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc() {
        let mut s = server().await;
        let a: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let b: SocketAddr = "5.6.7.8:2000".parse().unwrap();

        s.handle_request(req(1, announce(b"t", "")), a);
        tokio::time::advance(Duration::from_secs(30)).await;
        s.handle_request(req(2, ReqCmd::Ping(Ping::new())), b);
        tokio::time::advance(Duration::from_secs(31)).await;
        s.gc();

        assert!(!s.nodes.contains_key(&a));
        assert!(s.nodes.contains_key(&b));
        assert!(s.topics.is_empty());
    }

    #[tokio::test]
    async fn test_gc_ephemeral_nodes() {
        let mut s = server().await;
        let announcer: SocketAddr = "1.2.3.4:1000".parse().unwrap();
        let looker: SocketAddr = "5.6.7.8:2000".parse().unwrap();
        let relay: SocketAddr = "9.9.9.9:3000".parse().unwrap();

        s.handle_request(req(1, announce(b"t", "")), announcer);
        s.handle_request(req(2, lookup(b"t", "")), looker);
        let ping = Ping {
            ephemeral: false,
            ..Default::default()
        };
        s.handle_request(req(3, ReqCmd::Ping(ping)), relay);
        s.gc();

        assert!(s.nodes.contains_key(&announcer));
        assert!(!s.nodes.contains_key(&looker));
        assert!(s.nodes.contains_key(&relay));
    }
}
