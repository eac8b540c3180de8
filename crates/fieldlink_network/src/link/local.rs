//! Local link: UDP broadcast/unicast on the LAN.
//!
//! One socket bound to `0.0.0.0:<port>` both listens and sends. Frames use
//! the nested wire shape. A datagram that fails to decode is dropped with a
//! warning; the receive loop keeps running.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_core::{LinkMode, LocalLinkConfig};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{InboundFrame, Link, LinkContext, LinkState, Route, StateCell};
use crate::codec;
use crate::error::NetworkError;
use crate::message::Envelope;

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct LocalLink {
    config: LocalLinkConfig,
    state: StateCell,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    /// Receive loop; it holds a socket clone until it exits.
    task: Mutex<Option<JoinHandle<()>>>,
    peers: RwLock<Vec<SocketAddr>>,
}

impl LocalLink {
    pub fn new(config: LocalLinkConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .filter_map(|p| match p.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring invalid local peer '{p}': {e}");
                    None
                }
            })
            .collect();
        Self {
            config,
            state: StateCell::new(LinkMode::Local),
            socket: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
            peers: RwLock::new(peers),
        }
    }

    /// Address the socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Add a host that always receives broadcasts.
    pub fn add_peer(&self, addr: SocketAddr) {
        let mut peers = self.peers.write();
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    pub fn remove_peer(&self, addr: SocketAddr) {
        self.peers.write().retain(|p| *p != addr);
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().clone()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, NetworkError> {
        self.socket.lock().clone().ok_or(NetworkError::NotConnected)
    }

    /// Send raw bytes to one host.
    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        let socket = self.socket()?;
        socket
            .send_to(bytes, addr)
            .await
            .map_err(|e| NetworkError::Transport(format!("Send to {addr}: {e}")))?;
        Ok(())
    }

    /// Send raw bytes to the broadcast address and every configured peer.
    /// Succeeds if at least one destination accepted the datagram.
    pub async fn broadcast(&self, bytes: &[u8]) -> Result<(), NetworkError> {
        let mut targets = self.peers();
        match format!("{}:{}", self.config.broadcast_address, self.config.port).parse() {
            Ok(addr) => targets.insert(0, addr),
            Err(e) => warn!(
                "Invalid broadcast address '{}': {e}",
                self.config.broadcast_address
            ),
        }
        self.send_all(bytes, &targets, "Broadcast").await
    }

    /// Send to every target, logging each failure. Fails only when no
    /// target accepted the datagram.
    async fn send_all(
        &self,
        bytes: &[u8],
        targets: &[SocketAddr],
        what: &str,
    ) -> Result<(), NetworkError> {
        let socket = self.socket()?;
        let mut sent = 0;
        let mut last_error = None;
        for addr in targets {
            match socket.send_to(bytes, *addr).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!("{what} to {addr} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        match (sent, last_error) {
            (0, Some(e)) => Err(NetworkError::Transport(format!("{what} failed: {e}"))),
            _ => Ok(()),
        }
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        inbound: mpsc::Sender<InboundFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src_addr)) => match codec::decode_nested(&buf[..len]) {
                            Ok(envelope) => {
                                let frame = InboundFrame {
                                    envelope,
                                    origin_host: Some(src_addr),
                                    mode: LinkMode::Local,
                                };
                                if inbound.send(frame).await.is_err() {
                                    debug!("Inbound channel closed; local receiver exiting");
                                    break;
                                }
                            }
                            Err(e) => warn!("Malformed datagram from {src_addr}: {e}"),
                        },
                        Err(e) => warn!("Local link recv error: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Local link receiver shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Link for LocalLink {
    fn mode(&self) -> LinkMode {
        LinkMode::Local
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn start(&self, ctx: LinkContext) -> Result<(), NetworkError> {
        if self.socket.lock().is_some() {
            return Ok(());
        }
        self.state.attach(ctx.status.clone());
        self.state.set(LinkState::Connecting);

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                self.state.set(LinkState::Error(format!("Bind failed: {e}")));
                return Err(NetworkError::Transport(format!("Bind {bind_addr}: {e}")));
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            self.state.set(LinkState::Error(format!("Set broadcast: {e}")));
            return Err(NetworkError::Transport(format!("Set broadcast: {e}")));
        }
        let socket = Arc::new(socket);
        let bound = socket.local_addr().unwrap_or(bind_addr);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::recv_loop(socket.clone(), ctx.inbound, shutdown_rx));

        *self.socket.lock() = Some(socket);
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.task.lock() = Some(task);
        self.state.set(LinkState::Connected);
        info!("Local link listening on {bound}");
        Ok(())
    }

    /// Stop receiving and release the port. Waits for the receive loop so
    /// its socket clone is dropped before this returns.
    async fn stop(&self) {
        self.socket.lock().take();
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Local receiver ended abnormally: {e}");
            }
        }
        self.state.set(LinkState::Disconnected);
        info!("Local link stopped");
    }

    async fn transmit(&self, envelope: &Envelope, route: &Route) -> Result<(), NetworkError> {
        let bytes = codec::encode_nested(envelope)?;
        match route {
            Route::Hosts(hosts) => self.send_all(&bytes, hosts, "Unicast").await,
            Route::Broadcast => self.broadcast(&bytes).await,
            Route::Topic(topic) => Err(NetworkError::UnsupportedRoute(format!(
                "local link cannot publish to topic {topic}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use serde_json::{Map, Value};
    use std::time::Duration;

    fn loopback_config() -> LocalLinkConfig {
        LocalLinkConfig {
            port: 0,
            broadcast_address: "127.0.0.1".into(),
            peers: Vec::new(),
        }
    }

    fn context() -> (LinkContext, mpsc::Receiver<InboundFrame>) {
        let (inbound, rx) = mpsc::channel(16);
        let (status, _) = broadcast::channel(16);
        (LinkContext { inbound, status }, rx)
    }

    fn envelope() -> Envelope {
        let mut payload = Map::new();
        payload.insert("callsign".into(), Value::from("ALPHA"));
        payload.insert("lat".into(), Value::from(51.5));
        payload.insert("lon".into(), Value::from(-0.25));
        Envelope::new(MessageKind::Position, "dev-a", payload)
    }

    #[tokio::test]
    async fn test_transmit_before_start_refused() {
        let link = LocalLink::new(loopback_config());
        let err = link.transmit(&envelope(), &Route::Broadcast).await.unwrap_err();
        assert!(matches!(err, NetworkError::NotConnected));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_unicast_loopback() {
        let (ctx_a, _rx_a) = context();
        let (ctx_b, mut rx_b) = context();
        let a = LocalLink::new(loopback_config());
        let b = LocalLink::new(loopback_config());
        a.start(ctx_a).await.unwrap();
        b.start(ctx_b).await.unwrap();
        assert_eq!(a.state(), LinkState::Connected);

        let b_port = b.local_addr().unwrap().port();
        let target: SocketAddr = format!("127.0.0.1:{b_port}").parse().unwrap();
        let sent = envelope();
        a.transmit(&sent, &Route::Hosts(vec![target])).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(frame.envelope, sent);
        assert_eq!(frame.mode, LinkMode::Local);
        assert_eq!(
            frame.origin_host.unwrap().port(),
            a.local_addr().unwrap().port()
        );

        a.stop().await;
        b.stop().await;
        assert_eq!(a.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_added_peer() {
        let (ctx_a, _rx_a) = context();
        let (ctx_b, mut rx_b) = context();
        let a = LocalLink::new(loopback_config());
        let b = LocalLink::new(loopback_config());
        a.start(ctx_a).await.unwrap();
        b.start(ctx_b).await.unwrap();

        let b_port = b.local_addr().unwrap().port();
        let peer: SocketAddr = format!("127.0.0.1:{b_port}").parse().unwrap();
        a.add_peer(peer);
        a.add_peer(peer);
        assert_eq!(a.peers().len(), 1);

        a.transmit(&envelope(), &Route::Broadcast).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(frame.envelope.kind, MessageKind::Position);

        a.remove_peer(peer);
        assert!(a.peers().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_dropped() {
        let (ctx, mut rx) = context();
        let link = LocalLink::new(loopback_config());
        link.start(ctx).await.unwrap();
        let port = link.local_addr().unwrap().port();
        let target: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"{not json", target).await.unwrap();
        let good = codec::encode_nested(&envelope()).unwrap();
        sender.send_to(&good, target).await.unwrap();

        // The garbage is skipped and the valid frame still arrives.
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(frame.envelope.origin_device_id, "dev-a");
    }

    #[tokio::test]
    async fn test_topic_route_unsupported() {
        let (ctx, _rx) = context();
        let link = LocalLink::new(loopback_config());
        link.start(ctx).await.unwrap();
        let err = link
            .transmit(&envelope(), &Route::Topic("fieldlink/v1/pos".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedRoute(_)));
    }

    async fn free_port() -> u16 {
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_restart_on_same_port() {
        let config = LocalLinkConfig {
            port: free_port().await,
            ..loopback_config()
        };
        let link = LocalLink::new(config);

        let (ctx, _rx) = context();
        link.start(ctx).await.unwrap();
        link.stop().await;
        assert_eq!(link.state(), LinkState::Disconnected);

        let (ctx, _rx) = context();
        link.start(ctx).await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        link.stop().await;
    }

    #[tokio::test]
    async fn test_unicast_skips_failing_host() {
        let (ctx_a, _rx_a) = context();
        let (ctx_b, mut rx_b) = context();
        let a = LocalLink::new(loopback_config());
        let b = LocalLink::new(loopback_config());
        a.start(ctx_a).await.unwrap();
        b.start(ctx_b).await.unwrap();

        // An IPv6 target cannot be reached from the IPv4 socket.
        let unreachable: SocketAddr = "[::1]:4242".parse().unwrap();
        let b_port = b.local_addr().unwrap().port();
        let reachable: SocketAddr = format!("127.0.0.1:{b_port}").parse().unwrap();

        a.transmit(&envelope(), &Route::Hosts(vec![unreachable, reachable]))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(frame.envelope.kind, MessageKind::Position);

        let err = a
            .transmit(&envelope(), &Route::Hosts(vec![unreachable]))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Transport(_)));
    }

    #[test]
    fn test_invalid_config_peers_skipped() {
        let mut config = loopback_config();
        config.peers = vec!["10.0.0.9:4242".into(), "not-an-addr".into()];
        let link = LocalLink::new(config);
        assert_eq!(link.peers().len(), 1);
    }
}
