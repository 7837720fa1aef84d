//! UDP socket setup and action dispatch.

use std::io;
use std::net::{IpAddr, SocketAddr};

use chrono::Utc;
use ring_core::{OutboundAction, PeerAddress};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::console::{render_line, render_notice};

/// Bind the first free port in `min..=max` on `host`.
pub async fn bind_in_range(host: IpAddr, min: u16, max: u16) -> io::Result<UdpSocket> {
    for port in min..=max {
        match UdpSocket::bind(SocketAddr::new(host, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port in {min}..={max} on {host}"),
    ))
}

pub async fn bind_exact(host: IpAddr, port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(host, port)).await
}

/// Send datagrams and print user-facing output. Send failures are logged; a lost datagram is
/// indistinguishable from a dropped one and the protocol retries on its own.
pub async fn perform(socket: &UdpSocket, actions: Vec<OutboundAction>) {
    for action in actions {
        match action {
            OutboundAction::SendMessage(to, bytes) => {
                match socket.send_to(&bytes, to.socket_addr()).await {
                    Ok(n) => debug!(%to, bytes = n, "sent"),
                    Err(e) => warn!(%to, "send failed: {e}"),
                }
            }
            OutboundAction::Display(line) => {
                println!("{}", render_line(&line, Utc::now().time()))
            }
            OutboundAction::Notify(notice) => println!("{}", render_notice(&notice)),
        }
    }
}

/// Unwrap a `recv_from` result. Receive errors are logged and skipped; the socket stays usable.
pub fn received(result: io::Result<(usize, SocketAddr)>) -> Option<(usize, PeerAddress)> {
    match result {
        Ok((len, from)) => Some((len, PeerAddress::from(from))),
        Err(e) => {
            warn!("receive failed: {e}");
            None
        }
    }
}
