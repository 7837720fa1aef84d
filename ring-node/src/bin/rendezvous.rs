// Ring chat rendezvous: registers names, points joiners at the head, sweeps for crashed peers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ring_core::{PeerAddress, Rendezvous, MAX_DATAGRAM_LEN};
use ring_node::{config, shutdown_signal, transport};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ring chat rendezvous server")]
struct Args {
    /// Address of the ring head.
    #[arg(long)]
    head: SocketAddr,
    /// Username the head runs under (reserved).
    #[arg(long, default_value = "head")]
    head_username: String,
    /// Listen address (default: rendezvous address from config).
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    ring_node::init_tracing();
    let args = Args::parse();
    let cfg = config::load(args.config.as_deref())?;
    let listen = args.listen.unwrap_or(cfg.rendezvous);
    let socket = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let mut server = Rendezvous::new(
        PeerAddress::from(args.head),
        args.head_username.clone(),
        cfg.ring_config(),
    );
    info!(%listen, head = %args.head, "rendezvous starting");

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];

    loop {
        let result = tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let Some((len, from)) = transport::received(received) else {
                    continue;
                };
                server.on_datagram(from, &buf[..len])
            }
            _ = ticker.tick() => server.tick(),
            res = &mut shutdown => {
                res?;
                info!(members = server.members().len(), "shutting down");
                break;
            }
        };
        match result {
            Ok(actions) => transport::perform(&socket, actions).await,
            Err(err) => warn!("{err}"),
        }
    }
    Ok(())
}
