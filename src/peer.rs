use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Error, ErrorKind::Other, Result};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tokio::net::lookup_host;

/// A peer already known to both sides, used to broker a holepunch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Referrer {
    pub host: String,
    pub port: u16,
}

/// Where to reach a peer.
///
/// A `referrer` means the peer may not be directly reachable and a
/// holepunch through the referrer is attempted alongside the direct
/// connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    pub host: String,
    pub port: u16,
    pub referrer: Option<Referrer>,
}

impl PeerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            referrer: None,
        }
    }

    pub fn with_referrer(mut self, host: impl Into<String>, port: u16) -> Self {
        self.referrer = Some(Referrer {
            host: host.into(),
            port,
        });
        self
    }

    pub(crate) async fn resolve(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port).await
    }
}

impl From<SocketAddr> for PeerDescriptor {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Referrer {
    pub(crate) async fn resolve(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port).await
    }
}

impl From<SocketAddr> for Referrer {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::new(Other, "peer name resolve fail"))
}

/// A 32 byte discovery key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; 32]);

impl Topic {
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Derive a topic from a human readable name.
    pub fn from_name(name: &str) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(name.as_bytes()));
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Topic {
    fn from(key: [u8; 32]) -> Self {
        Self(key)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// First non-loopback IPv4 address of this host.
///
/// Connecting a udp socket sends nothing, it only makes the OS pick the
/// outgoing interface.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();

    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
