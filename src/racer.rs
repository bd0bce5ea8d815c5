//! Race a direct tcp connect against a holepunched udp connect.
//!
//! Each path runs as its own task and reports progress over a channel. A
//! single [`Attempt`] record consumes those events and decides the outcome,
//! so the counter and flags are only touched in one place.

use crate::error::{Error, Result};
use crate::peer::PeerDescriptor;
use crate::socket::{PeerSocket, Transport};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinSet;
use tokio::{select, time::sleep};

/// The operations a connection attempt needs from its resource.
#[async_trait]
pub(crate) trait Dialer: Clone + Send + Sync + 'static {
    /// Whether the resource went away, winners are then discarded.
    fn is_closed(&self) -> bool;

    /// Make sure the listeners and discovery session exist.
    async fn open(&self) -> Result<()>;

    async fn holepunch(&self, peer: &PeerDescriptor) -> io::Result<()>;

    async fn dial_tcp(&self, peer: &PeerDescriptor) -> io::Result<PeerSocket>;

    async fn dial_udp(&self, peer: &PeerDescriptor) -> io::Result<PeerSocket>;
}

#[derive(Debug)]
pub(crate) enum PathEvent {
    Tcp(io::Result<PeerSocket>),
    /// The resource could not be opened, no holepunch was requested.
    Unbound(Error),
    Punching,
    PunchFailed(io::Error),
    /// Holepunch done, the udp dial is under way.
    Punched,
    Udp(io::Result<PeerSocket>),
}

/// How far the holepunch path got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Direct,
    Requested,
    Racing,
}

#[derive(Debug)]
pub(crate) enum Step {
    Pending,
    Won(PeerSocket, Transport),
    Failed(Error),
}

#[derive(Debug)]
pub(crate) struct Attempt {
    remaining: u8,
    progress: Progress,
    connected: bool,
    timed_out: bool,
}

impl Attempt {
    pub(crate) fn new() -> Self {
        Self {
            remaining: 1,
            progress: Progress::Direct,
            connected: false,
            timed_out: false,
        }
    }

    /// Reserve the holepunch path.
    pub(crate) fn reserve(&mut self) {
        self.remaining += 1;
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.connected || self.timed_out || self.remaining == 0
    }

    /// Feed one path event. Sockets arriving after the attempt settled are
    /// dropped here, which closes them.
    pub(crate) fn on_event(&mut self, event: PathEvent) -> Step {
        if self.is_settled() {
            return Step::Pending;
        }

        match event {
            PathEvent::Tcp(Ok(socket)) => self.win(socket, Transport::Tcp),
            PathEvent::Udp(Ok(socket)) => self.win(socket, Transport::Udp),
            PathEvent::Punching => {
                self.progress = Progress::Requested;
                Step::Pending
            }
            PathEvent::Punched => {
                self.progress = Progress::Racing;
                Step::Pending
            }
            PathEvent::Tcp(Err(e)) => self.terminate("tcp", &e),
            PathEvent::Udp(Err(e)) => self.terminate("udp", &e),
            PathEvent::PunchFailed(e) => self.terminate("holepunch", &e),
            PathEvent::Unbound(e) => self.terminate("bind", &e),
        }
    }

    /// The deadline passed. Returns the error to report, if still pending.
    pub(crate) fn expire(&mut self) -> Option<Error> {
        if self.is_settled() {
            return None;
        }
        self.timed_out = true;
        Some(Error::Timeout)
    }

    fn win(&mut self, socket: PeerSocket, transport: Transport) -> Step {
        self.connected = true;
        Step::Won(socket, transport)
    }

    fn terminate(&mut self, path: &str, e: &dyn std::fmt::Display) -> Step {
        log::debug!("{} path ended: {}", path, e);

        self.remaining -= 1;
        if self.remaining > 0 {
            return Step::Pending;
        }

        Step::Failed(match self.progress {
            Progress::Direct => Error::ConnectionFailed,
            Progress::Requested => Error::CouldNotEstablish,
            Progress::Racing => Error::AllPathsFailed,
        })
    }
}

/// Connect to `peer`, returning the first socket that connects.
///
/// Losing candidates are aborted when this returns, so a socket that
/// connects late is dropped before anyone can see it.
pub(crate) async fn race<D: Dialer>(
    dialer: D,
    peer: PeerDescriptor,
    deadline: Duration,
) -> Result<(PeerSocket, Transport)> {
    let (tx, mut rx) = unbounded_channel();
    let mut paths = JoinSet::new();
    let mut attempt = Attempt::new();

    {
        let (dialer, peer, tx) = (dialer.clone(), peer.clone(), tx.clone());
        paths.spawn(async move {
            let _ = tx.send(PathEvent::Tcp(dialer.dial_tcp(&peer).await));
        });
    }

    if peer.referrer.is_some() {
        attempt.reserve();
        let (dialer, peer, tx) = (dialer.clone(), peer.clone(), tx.clone());
        paths.spawn(punch_path(dialer, peer, tx));
    }

    let timeout = sleep(deadline);
    tokio::pin!(timeout);

    loop {
        let event = select! {
            _ = &mut timeout => match attempt.expire() {
                Some(e) => {
                    log::debug!("connect to {}:{} timed out", peer.host, peer.port);
                    paths.abort_all();
                    return Err(e);
                }
                None => continue,
            },
            event = rx.recv() => match event {
                Some(event) => event,
                None => continue,
            },
        };

        let event = match event {
            PathEvent::Tcp(Ok(_)) if dialer.is_closed() => PathEvent::Tcp(Err(closed())),
            PathEvent::Udp(Ok(_)) if dialer.is_closed() => PathEvent::Udp(Err(closed())),
            event => event,
        };

        match attempt.on_event(event) {
            Step::Pending => continue,
            Step::Won(socket, transport) => {
                log::debug!("connected to {} over {:?}", socket.peer_addr(), transport);
                paths.abort_all();
                return Ok((socket, transport));
            }
            Step::Failed(e) => return Err(e),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "network resource closed")
}

async fn punch_path<D: Dialer>(dialer: D, peer: PeerDescriptor, tx: UnboundedSender<PathEvent>) {
    if let Err(e) = dialer.open().await {
        let _ = tx.send(PathEvent::Unbound(e));
        return;
    }

    let _ = tx.send(PathEvent::Punching);
    if let Err(e) = dialer.holepunch(&peer).await {
        let _ = tx.send(PathEvent::PunchFailed(e));
        return;
    }

    let _ = tx.send(PathEvent::Punched);
    let _ = tx.send(PathEvent::Udp(dialer.dial_udp(&peer).await));
}
