//! Receive loop and expiry sweep.
//!
//! One task owns the receive side of the socket. Every datagram is decoded,
//! fed to the coordinator, and the resulting replies are sent back to the
//! datagram's source. Bad datagrams and transient receive errors are logged
//! and skipped; only a closed or broken socket ends the loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tally_core::wire::{self, DecodeError, Decoded};
use tally_core::{Action, Coordinator, Delivery, Message, Registry};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("transport closed: {0}")]
    TransportClosed(#[from] io::Error),
}

/// Datagram endpoint the receive loop reads from and replies through.
pub trait Datagrams: Send + Sync {
    fn recv_from(&self, buf: &mut [u8])
        -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Datagrams for UdpSocket {
    fn recv_from(&self, buf: &mut [u8])
        -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send_to(self, buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Receive errors that say nothing about the socket itself. An ICMP
/// port-unreachable for an earlier send surfaces as a reset on some platforms.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Run until `shutdown` flips (clean exit) or the socket fails.
pub async fn run_listener<S: Datagrams>(
    socket: Arc<S>,
    coordinator: Arc<Coordinator>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    let mut buf = vec![0u8; 65536];
    info!(local = ?socket.local_addr().ok(), "listener started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let (n, from) = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok(x) => x,
                Err(e) if *shutdown.borrow() => {
                    debug!(error = %e, "receive failed during shutdown");
                    break;
                }
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, kind = ?e.kind(), "transient receive error, continuing");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "receive failed, stopping listener");
                    return Err(e.into());
                }
            },
        };
        handle_datagram(&*socket, &coordinator, &deliveries, &buf[..n], from).await;
    }
    info!("listener stopped");
    Ok(())
}

async fn handle_datagram<S: Datagrams>(
    socket: &S,
    coordinator: &Coordinator,
    deliveries: &mpsc::UnboundedSender<Delivery>,
    bytes: &[u8],
    from: SocketAddr,
) {
    let decoded = match decode_with_fallback(bytes, &coordinator.session().decode_keys()) {
        Ok(d) => d,
        Err(e) => {
            if e.is_schema() {
                warn!(from = %from, error = %e, "dropping malformed message");
            } else {
                warn!(from = %from, bytes = bytes.len(), error = %e, "dropping undecodable datagram");
            }
            return;
        }
    };
    debug!(from = %from, action = %decoded.message.action, "datagram received");

    let actions = match coordinator.on_datagram(&decoded) {
        Ok(actions) => actions,
        Err(e) => {
            warn!(from = %from, error = %e, "dropping message with missing fields");
            return;
        }
    };
    for action in actions {
        match action {
            Action::Send(msg) => send_reply(socket, coordinator, &msg, from).await,
            Action::Deliver(d) => {
                if deliveries.send(d).is_err() {
                    debug!("no consumer for delivered push");
                }
            }
        }
    }
}

/// Try each key in order; the last error is returned if none decodes.
fn decode_with_fallback(bytes: &[u8], keys: &[String]) -> Result<Decoded, DecodeError> {
    let mut last = DecodeError::MissingKey;
    for key in keys {
        match wire::decode(bytes, key) {
            Ok(d) => return Ok(d),
            Err(e) => last = e,
        }
    }
    Err(last)
}

async fn send_reply<S: Datagrams>(socket: &S, coordinator: &Coordinator, msg: &Message, to: SocketAddr) {
    let key = coordinator.session().active_key();
    let bytes = match wire::encode(msg, &key) {
        Ok(b) => b,
        Err(e) => {
            error!(action = %msg.action, error = %e, "cannot encode reply");
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, to).await {
        warn!(to = %to, action = %msg.action, error = %e, "reply send failed");
    } else {
        debug!(to = %to, action = %msg.action, "reply sent");
    }
}

/// Periodically drop expired transactions so nothing outlives its deadline.
pub async fn run_sweeper(registry: Arc<Registry>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let expired = registry.expire(Instant::now());
                if !expired.is_empty() {
                    debug!(count = expired.len(), "expired transactions removed");
                }
            }
        }
    }
}
