//!Peer to peer connections over tcp and udp, with rendezvous discovery and hole punching.
//!
//!A [`NetworkResource`] binds a tcp listener and a udp endpoint to the same port number, so a peer can
//!reach it over either transport at one advertised address. Peers find each other by announcing and
//!looking up a [`Topic`] on rendezvous nodes.
//!
//!## How connect works
//![`NetworkResource::connect`] always tries a direct tcp connect. When the peer descriptor carries a
//!referrer, a node both sides already talk to, it also asks the referrer to holepunch: the referrer tells
//!the peer our address, the peer sends us a throwaway packet from its shared port, which opens its firewall or
//!nat rule for us, and we dial it over udp. Whichever path connects first wins, the other is dropped.
//!
//!The udp path carries QUIC streams, so both transports hand out a reliable byte stream, a [`PeerSocket`].
//!Ordering and delivery are per stream, the [`Transport`] returned tells which one you got.
//!
//!Punching only works if rendezvous nodes see the very port peers will dial. The tcp listener, the udp
//!endpoint and one connected udp socket per rendezvous node therefore share a port through SO_REUSEADDR.
//!On Linux a datagram goes to the connected socket matching its source first, anything else reaches the
//!endpoint. Platforms that dispatch differently may not punch reliably.
//!
//!## Feature flags
//!- `server`: rendezvous [`Server`]
//!- `cli`: the `netguts` binary

#[doc(hidden)]
pub mod proto;

pub mod discovery;
mod error;
mod lifecycle;
mod listener;
mod peer;
mod quic;
mod racer;
mod resource;
#[cfg(feature = "server")]
mod server;
mod socket;

pub use discovery::{Discovery, Subscription, TopicEvent};
pub use error::{Error, Result};
pub use peer::{local_ip, PeerDescriptor, Referrer, Topic};
pub use resource::{NetworkResource, Options};
#[cfg(feature = "server")]
pub use server::Server;
pub use socket::{PeerSocket, Transport};
