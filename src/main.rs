use netguts::{NetworkResource, Options, PeerSocket, Server, Topic, Transport};
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use structopt::StructOpt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(StructOpt, Debug)]
#[structopt(name = "netguts")]
enum Opt {
    /// Run a rendezvous server
    Server(ServerOpt),
    /// Announce a topic and echo whatever peers send
    Announce(AnnounceOpt),
    /// Look up a topic, connect to the first peer and send a message
    Connect(ConnectOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:8888")]
    listen_addr: SocketAddr,
}

#[derive(StructOpt, Debug)]
struct PeerOpt {
    #[structopt(long = "topic")]
    topic: String,

    #[structopt(long = "bootstrap", default_value = "127.0.0.1:8888")]
    bootstrap: Vec<String>,

    #[structopt(long = "announce-local-address")]
    announce_local_address: bool,
}

#[derive(StructOpt, Debug)]
struct AnnounceOpt {
    #[structopt(flatten)]
    peer: PeerOpt,

    #[structopt(long = "port", default_value = "0")]
    port: u16,
}

#[derive(StructOpt, Debug)]
struct ConnectOpt {
    #[structopt(flatten)]
    peer: PeerOpt,

    #[structopt(long = "message", default_value = "hello")]
    message: String,
}

impl PeerOpt {
    fn options(&self) -> Options {
        Options::new()
            .bootstrap(self.bootstrap.clone())
            .announce_local_address(self.announce_local_address)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Announce(opt) => run_announce(opt).await,
        Opt::Connect(opt) => run_connect(opt).await,
    }
}

fn other(e: netguts::Error) -> Error {
    Error::new(ErrorKind::Other, e)
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    let s = Server::new(opt.listen_addr).await?;
    log::info!("rendezvous server on {}", s.local_addr()?);
    s.run().await
}

fn echo(mut socket: PeerSocket, transport: Transport) {
    tokio::spawn(async move {
        log::info!("{:?} peer {} connected", transport, socket.peer_addr());

        let mut buf = [0u8; 1500];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }

        log::info!("peer {} gone", socket.peer_addr());
    });
}

async fn run_announce(opt: AnnounceOpt) -> Result<()> {
    let r = NetworkResource::new(opt.peer.options().preferred_port(opt.port).on_socket(echo));
    r.bind().await.map_err(other)?;
    log::info!("listening on {:?}", r.address());

    let mut sub = r
        .announce(Topic::from_name(&opt.peer.topic), false)
        .map_err(other)?;

    tokio::select! {
        _ = async { while sub.next().await.is_some() {} } => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    drop(sub);
    r.close().await.map_err(other)
}

async fn run_connect(opt: ConnectOpt) -> Result<()> {
    let r = NetworkResource::new(opt.peer.options());
    r.bind().await.map_err(other)?;

    let peer = r
        .lookup_one(Topic::from_name(&opt.peer.topic))
        .await
        .map_err(other)?;
    log::info!("found peer {}:{}", peer.host, peer.port);

    let (mut socket, transport) = r.connect(&peer).await.map_err(other)?;
    log::info!("connected over {:?}", transport);

    socket.write_all(opt.message.as_bytes()).await?;
    let mut buf = vec![0u8; opt.message.len()];
    socket.read_exact(&mut buf).await?;
    println!("{}", String::from_utf8_lossy(&buf));

    drop(socket);
    r.close().await.map_err(other)
}
