// Ring chat peer: joins a ring through the rendezvous, or runs as its head.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ring_core::{Disposition, Notice, OutboundAction, PeerAddress, RingCore, MAX_DATAGRAM_LEN};
use ring_node::console::{Command, LineParser};
use ring_node::{config, shutdown_signal, transport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ring chat peer")]
struct Args {
    /// Name shown on your messages; must be unique in the ring.
    #[arg(short, long)]
    username: String,
    /// Run as the ring head: sequences joins and never leaves.
    #[arg(long)]
    head: bool,
    /// Rendezvous server address (overrides config).
    #[arg(long)]
    rendezvous: Option<SocketAddr>,
    /// Bind exactly this port instead of searching the configured range.
    #[arg(short, long)]
    port: Option<u16>,
    /// Config file (default: ~/.config/ringchat/config.toml, then /etc/ringchat/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    ring_node::init_tracing();
    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(rendezvous) = args.rendezvous {
        cfg.rendezvous = rendezvous;
    }

    let socket = match args.port {
        Some(port) => transport::bind_exact(cfg.host, port).await,
        None => transport::bind_in_range(cfg.host, cfg.port_min, cfg.port_max).await,
    }
    .context("binding peer socket")?;
    let own = PeerAddress::from(socket.local_addr()?);
    let rendezvous = PeerAddress::from(cfg.rendezvous);
    let mut core = if args.head {
        RingCore::head(args.username.clone(), own, rendezvous, cfg.ring_config())
    } else {
        RingCore::member(args.username.clone(), own, rendezvous, cfg.ring_config())
    };
    info!(username = %args.username, addr = %own, head = args.head, "peer starting");
    transport::perform(&socket, core.connect()?).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut parser = LineParser::default();
    let mut stdin_open = true;
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
                core.on_datagram(from, &buf[..len])
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("reading stdin")? else {
                    stdin_open = false;
                    continue;
                };
                let command = parser.feed(&line);
                if let Some(prompt) = parser.prompt() {
                    println!("{prompt}");
                }
                match command {
                    Some(Command::Broadcast(text)) => core.send_global(&text),
                    Some(Command::Direct { target, text }) => core.send_direct(&target, &text),
                    Some(Command::Leave) => core.leave(),
                    None => continue,
                }
            }
            _ = ticker.tick() => core.tick(),
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                if core.is_joined() && !core.is_head() {
                    match core.leave() {
                        Ok(actions) => transport::perform(&socket, actions).await,
                        Err(err) => warn!("leaving without notice: {err}"),
                    }
                }
                break;
            }
        };
        match result {
            Ok(actions) => {
                let left = actions.contains(&OutboundAction::Notify(Notice::Left));
                transport::perform(&socket, actions).await;
                if left {
                    break;
                }
            }
            Err(err) => match err.disposition() {
                Disposition::Continue => warn!("{err}"),
                Disposition::Rejoin => {
                    warn!("{err}");
                    transport::perform(&socket, core.rejoin()?).await;
                }
                Disposition::Exit => return Err(err.into()),
            },
        }
    }
    Ok(())
}
