//! Pending submission API: send a request and wait for its handshake outcome.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tally_core::registry::Pending;
use tally_core::wire::{self, EncodeError};
use tally_core::{Coordinator, Message, Outcome};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::Config;

/// Local failures only. Protocol outcomes, timeouts included, are an [`Outcome`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve server address {0}")]
    Resolve(String),
    #[error("transaction dropped without an outcome")]
    Closed,
}

pub struct Client {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    coordinator: Arc<Coordinator>,
    timeout: Duration,
}

impl Client {
    /// Bind the local socket from `cfg` and resolve the server address.
    pub async fn connect(cfg: &Config, coordinator: Arc<Coordinator>) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(&cfg.bind).await?;
        let server = tokio::net::lookup_host(cfg.server())
            .await?
            .next()
            .ok_or_else(|| ClientError::Resolve(cfg.server()))?;
        Ok(Self::new(
            Arc::new(socket),
            server,
            coordinator,
            cfg.handshake_timeout(),
        ))
    }

    pub fn new(
        socket: Arc<UdpSocket>,
        server: SocketAddr,
        coordinator: Arc<Coordinator>,
        timeout: Duration,
    ) -> Self {
        Self {
            socket,
            server,
            coordinator,
            timeout,
        }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Send `msg` and wait for the peer to finish the handshake or for the deadline.
    /// The transaction is gone from the registry when this returns.
    pub async fn submit(&self, msg: &Message) -> Result<Outcome, ClientError> {
        let text = wire::to_text(msg)?;
        let key = self.coordinator.session().key_for(&msg.action);
        let datagram = wire::seal(&text, &key)?;

        let registry = self.coordinator.registry();
        let Pending {
            temp_key,
            deadline,
            mut receiver,
        } = registry.register_outbound(&msg.action, text, self.timeout);
        let tx_key = tally_core::CorrelationKey::Temp(temp_key);
        // Already decided: the registry was cleared for shutdown.
        if let Ok(outcome) = receiver.try_recv() {
            return Ok(outcome);
        }

        if let Err(e) = self.socket.send_to(&datagram, self.server).await {
            registry.remove(&tx_key);
            return Err(e.into());
        }
        registry.mark_sent(temp_key);
        debug!(temp_key = %temp_key, action = %msg.action, bytes = datagram.len(), "request sent");

        let deadline = tokio::time::Instant::from_std(deadline);
        let outcome = match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                registry.remove(&tx_key);
                return Err(ClientError::Closed);
            }
            Err(_) => {
                if registry.remove(&tx_key).is_some() {
                    warn!(temp_key = %temp_key, action = %msg.action, "request timed out");
                    Outcome::TimedOut
                } else {
                    // Someone else took the entry; its outcome is on the way.
                    receiver.await.unwrap_or(Outcome::TimedOut)
                }
            }
        };
        registry.remove(&tx_key);
        Ok(outcome)
    }
}
