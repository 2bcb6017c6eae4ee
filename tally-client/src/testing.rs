//! Loopback peer and client harness for async tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tally_core::wire::{self, Decoded};
use tally_core::{Coordinator, Delivery, Message, Registry, Session, PRE_SESSION_KEY};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::listener::{self, ListenerError};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Plays the remote side over a loopback socket.
pub struct Peer {
    socket: UdpSocket,
    key: String,
    client_addr: SocketAddr,
}

impl Peer {
    /// Bind a loopback socket that talks to the client at `client_addr`.
    pub async fn bind(client_addr: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            key: PRE_SESSION_KEY.to_owned(),
            client_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn use_key(&mut self, key: &str) {
        self.key = key.to_owned();
    }

    pub async fn send(&self, msg: &Message, to: SocketAddr) {
        let bytes = wire::encode(msg, &self.key).unwrap();
        self.socket.send_to(&bytes, to).await.unwrap();
    }

    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) {
        self.socket.send_to(bytes, to).await.unwrap();
    }

    /// Next datagram, decoded with the current key or the pre-session key.
    pub async fn recv(&self) -> (Decoded, SocketAddr) {
        let (bytes, from) = self.recv_bytes().await;
        let decoded = wire::decode(&bytes, &self.key)
            .or_else(|_| wire::decode(&bytes, PRE_SESSION_KEY))
            .unwrap();
        (decoded, from)
    }

    /// Next datagram; panics unless it decodes with the current key.
    pub async fn recv_with_key_only(&self) -> (Decoded, SocketAddr) {
        let (bytes, from) = self.recv_bytes().await;
        (wire::decode(&bytes, &self.key).unwrap(), from)
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_silent(&self, wait: Duration) -> bool {
        let mut buf = vec![0u8; 65536];
        tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .is_err()
    }

    async fn recv_bytes(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 65536];
        let (n, from) = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("peer timed out waiting for a datagram")
            .unwrap();
        buf.truncate(n);
        (buf, from)
    }
}

/// A client wired to a [`Peer`], with its listener and sweeper running.
pub struct Harness {
    pub client: Arc<Client>,
    pub peer: Peer,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<Result<(), ListenerError>>,
    sweeper: JoinHandle<()>,
}

impl Harness {
    pub async fn start(timeout: Duration) -> Self {
        let client_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = Peer::bind(client_socket.local_addr().unwrap()).await;

        let registry = Arc::new(Registry::new());
        let coordinator = Arc::new(Coordinator::new(registry.clone(), Arc::new(Session::default())));
        let client = Arc::new(Client::new(
            client_socket.clone(),
            peer.local_addr(),
            coordinator.clone(),
            timeout,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (deliver_tx, deliveries) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listener::run_listener(
            client_socket,
            coordinator,
            deliver_tx,
            shutdown_rx.clone(),
        ));
        let sweeper = tokio::spawn(listener::run_sweeper(
            registry,
            Duration::from_millis(50),
            shutdown_rx,
        ));

        Self {
            client,
            peer,
            deliveries,
            shutdown,
            listener,
            sweeper,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.client.coordinator().registry()
    }

    /// Signal shutdown and check that both loops exit cleanly.
    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let res = tokio::time::timeout(RECV_TIMEOUT, self.listener)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(res.is_ok());
        tokio::time::timeout(RECV_TIMEOUT, self.sweeper)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
