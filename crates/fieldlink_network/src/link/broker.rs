//! Broker link: MQTT publish/subscribe via `rumqttc`.
//!
//! One persistent session. On every ConnAck the link subscribes to the full
//! fixed topic set at QoS 1. Reconnection after a drop is left to the
//! client's event loop, which reconnects on the next poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_core::{BrokerConfig, LinkMode};
use parking_lot::Mutex;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter, TlsConfiguration,
    Transport,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{InboundFrame, Link, LinkContext, LinkState, Route, StateCell};
use crate::codec::{self, TopicMap};
use crate::error::NetworkError;
use crate::message::Envelope;

/// Pause between polls after a connection error.
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Smallest keep-alive the client accepts.
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const REQUEST_CAPACITY: usize = 64;

pub struct BrokerLink {
    config: BrokerConfig,
    /// Used as the client id when the config leaves it empty.
    fallback_client_id: String,
    topics: TopicMap,
    state: Arc<StateCell>,
    client: Mutex<Option<AsyncClient>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerLink {
    pub fn new(
        config: BrokerConfig,
        topics: TopicMap,
        fallback_client_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            fallback_client_id: fallback_client_id.into(),
            topics,
            state: Arc::new(StateCell::new(LinkMode::Broker)),
            client: Mutex::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    fn client_id(&self) -> String {
        if self.config.client_id.trim().is_empty() {
            self.fallback_client_id.clone()
        } else {
            self.config.client_id.clone()
        }
    }

    /// Client options for the configured broker.
    pub fn mqtt_options(&self) -> Result<MqttOptions, NetworkError> {
        let mut options = MqttOptions::new(self.client_id(), &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(
            self.config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        options.set_clean_session(false);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }

        if self.config.use_tls {
            // The broker certificate and hostname are NOT validated. Field
            // brokers commonly run self-signed certificates, so this keeps
            // them reachable at the cost of server authentication.
            warn!(
                "TLS to broker {}:{} accepts any certificate; the server is not authenticated",
                self.config.host, self.config.port
            );
            options.set_transport(Transport::tls_with_config(accept_any_tls()));
        }
        Ok(options)
    }

    /// Open the session and start the event loop.
    pub async fn connect(&self, ctx: LinkContext) -> Result<(), NetworkError> {
        if self.client.lock().is_some() {
            return Ok(());
        }
        self.state.attach(ctx.status.clone());
        if self.config.host.trim().is_empty() {
            let reason = "broker host not configured".to_string();
            self.state.set(LinkState::Error(reason.clone()));
            return Err(NetworkError::Transport(reason));
        }

        let options = match self.mqtt_options() {
            Ok(options) => options,
            Err(e) => {
                self.state.set(LinkState::Error(e.to_string()));
                return Err(e);
            }
        };
        self.state.set(LinkState::Connecting);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::event_loop(
            eventloop,
            client.clone(),
            self.topics.clone(),
            self.state.clone(),
            ctx.inbound,
            shutdown_rx,
        ));

        *self.client.lock() = Some(client);
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.task.lock() = Some(task);
        info!(
            "Broker link connecting to {}:{} as {}",
            self.config.host,
            self.config.port,
            self.client_id()
        );
        Ok(())
    }

    /// End the session. Waits for the event loop to exit so no late
    /// transition lands after `Disconnected`.
    pub async fn disconnect(&self) {
        if let Some(client) = self.client.lock().take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Broker disconnect request failed: {e}");
            }
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Broker event loop ended abnormally: {e}");
            }
        }
        self.state.set(LinkState::Disconnected);
        info!("Broker link stopped");
    }

    /// Publish one envelope, flattened, to `topic` at QoS 1.
    pub fn publish(&self, envelope: &Envelope, topic: &str) -> Result<(), NetworkError> {
        if !self.state.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let client = self.client.lock().clone().ok_or(NetworkError::NotConnected)?;
        let bytes = codec::encode_flat(envelope)?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, bytes)
            .map_err(|e| NetworkError::Transport(format!("Publish to {topic}: {e}")))
    }

    /// Subscribe `client` to `topics` at QoS 1.
    pub fn subscribe(client: &AsyncClient, topics: &[String]) -> Result<(), NetworkError> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce))
            .collect();
        client
            .try_subscribe_many(filters)
            .map_err(|e| NetworkError::Transport(format!("Subscribe: {e}")))
    }

    async fn event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        topics: TopicMap,
        state: Arc<StateCell>,
        inbound: mpsc::Sender<InboundFrame>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let subscriptions = topics.subscriptions();
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        state.set(LinkState::Connected);
                        match Self::subscribe(&client, &subscriptions) {
                            Ok(()) => debug!("Subscribed to {} topics", subscriptions.len()),
                            Err(e) => warn!("{e}"),
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match codec::decode_flat(&publish.payload, &publish.topic, &topics) {
                            Ok(envelope) => {
                                let frame = InboundFrame {
                                    envelope,
                                    origin_host: None,
                                    mode: LinkMode::Broker,
                                };
                                if inbound.send(frame).await.is_err() {
                                    debug!("Inbound channel closed; broker loop exiting");
                                    break;
                                }
                            }
                            Err(e) => warn!("Malformed message on {}: {e}", publish.topic),
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        state.set(LinkState::Connecting);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Broker connection error: {e}");
                        state.set(LinkState::Error(e.to_string()));
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                            _ = shutdown.recv() => break,
                        }
                        state.set(LinkState::Connecting);
                    }
                },
                _ = shutdown.recv() => {
                    debug!("Broker event loop shutting down");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

/// Client TLS config that trusts whatever certificate the broker presents.
fn accept_any_tls() -> TlsConfiguration {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

/// Verifier that skips chain, hostname and handshake signature checks.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rumqttc::tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rumqttc::tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rumqttc::tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[async_trait]
impl Link for BrokerLink {
    fn mode(&self) -> LinkMode {
        LinkMode::Broker
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn start(&self, ctx: LinkContext) -> Result<(), NetworkError> {
        self.connect(ctx).await
    }

    async fn stop(&self) {
        self.disconnect().await
    }

    async fn transmit(&self, envelope: &Envelope, route: &Route) -> Result<(), NetworkError> {
        match route {
            Route::Topic(topic) => self.publish(envelope, topic),
            other => Err(NetworkError::UnsupportedRoute(format!(
                "broker link needs a topic, got {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
