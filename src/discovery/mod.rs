//! Topic announce/lookup and holepunching through rendezvous nodes.
//!
//! [`Discovery`] is what a [`NetworkResource`](crate::NetworkResource)
//! needs from the rendezvous network. [`Session`] implements it with the
//! rendezvous protocol served by [`Server`](crate::Server).

mod session;
pub use session::Session;

use crate::peer::{PeerDescriptor, Topic};
use async_trait::async_trait;
use std::io::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

/// Rendezvous nodes used when none are configured, a [`Server`](crate::Server)
/// on its default port.
pub const DEFAULT_BOOTSTRAP: &[&str] = &["127.0.0.1:8888"];

/// What a discovery session is created with once the resource is bound.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bootstrap: Vec<String>,
    pub ephemeral: bool,
    /// Address shared by the tcp listener and the udp endpoint.
    pub local_addr: SocketAddr,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceOptions {
    pub local_port: u16,
    /// LAN address to advertise next to the public one.
    pub local_address: Option<IpAddr>,
    /// Also emit the peers announcing the same topic.
    pub lookup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// The first announce round reached a rendezvous node.
    Update,
    Peer(PeerDescriptor),
}

/// A running announce or lookup. Dropping it stops it.
#[derive(Debug)]
pub struct Subscription {
    events: Receiver<TopicEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(events: Receiver<TopicEvent>, task: JoinHandle<()>) -> Self {
        Self { events, task }
    }

    pub async fn next(&mut self) -> Option<TopicEvent> {
        self.events.recv().await
    }

    /// Skip updates, wait for the next peer.
    pub async fn next_peer(&mut self) -> Option<PeerDescriptor> {
        loop {
            match self.next().await? {
                TopicEvent::Peer(peer) => return Some(peer),
                TopicEvent::Update => continue,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait Discovery: Send + Sync {
    fn announce(&self, topic: Topic, opts: AnnounceOptions) -> Subscription;

    async fn lookup_one(
        &self,
        topic: Topic,
        local_address: Option<SocketAddr>,
    ) -> Result<PeerDescriptor>;

    fn lookup(&self, topic: Topic, local_address: Option<SocketAddr>) -> Subscription;

    /// Ask `peer.referrer` to open a udp path to the peer.
    async fn holepunch(&self, peer: &PeerDescriptor) -> Result<()>;

    /// Leave the rendezvous network. Returns once torn down.
    async fn destroy(&self);
}

/// Creates the discovery session of a resource when it binds.
pub type DiscoveryFactory =
    Arc<dyn Fn(SessionConfig) -> Result<Arc<dyn Discovery>> + Send + Sync>;
