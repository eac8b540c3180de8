//! TransportCoordinator: owns the active link and runs the inbound pass.
//!
//! [`TransportCoordinator`] is the primary public API of fieldlink_network:
//! - exactly one active link (local or broker), switched with `set_mode`
//! - outbound routing to the active link's address scheme
//! - inbound self-echo suppression, age filtering and kind dispatch
//! - listener slots and delivery tracking through the handler context
//!
//! Sends are best-effort. A send the active link refuses is logged and
//! dropped, and nothing is queued or retried above the link itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use fieldlink_core::{DeliveryStore, FieldConfig, LinkMode, RecipientStatusRow};
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::codec::TopicMap;
use crate::error::NetworkError;
use crate::handlers::{HandlerContext, register_builtin};
use crate::identity::DeviceIdentity;
use crate::link::{InboundFrame, Link, LinkContext, LinkState, LinkStatus, Route};
use crate::listener::ListenerSlots;
use crate::message::{Envelope, MessageKind};
use crate::payload::{DiscoveryHello, Profile, TacticalMessage};
use crate::peer::PeerDirectory;
use crate::replay::ReplayFilter;
use crate::router::{MessageHandler, MessageRouter, Received};
use crate::seal::EnvelopeSealer;
use crate::store::{ChatStore, LinkedFormStore, MarkerStore};
use crate::sync::SyncWindow;
use crate::tracker::DeliveryTracker;

const INBOUND_CAPACITY: usize = 256;
const STATUS_CAPACITY: usize = 64;

/// Explicitly constructed coordinator; clone to share.
#[derive(Clone)]
pub struct TransportCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    handlers: HandlerContext,
    router: RwLock<MessageRouter>,
    replay: ReplayFilter,
    topics: TopicMap,
    links: HashMap<LinkMode, Arc<dyn Link>>,
    mode: RwLock<LinkMode>,
    /// Serializes start/stop/set_mode.
    lifecycle: Mutex<()>,
    sealer: RwLock<Option<Arc<dyn EnvelopeSealer>>>,
    link_ctx: LinkContext,
    sync_window_duration: Duration,
}

impl TransportCoordinator {
    /// Wire a coordinator around two links. The initial mode comes from
    /// `config.link_mode`; nothing is started until [`start`](Self::start).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        identity: DeviceIdentity,
        config: &FieldConfig,
        store: Arc<dyn DeliveryStore>,
        local: Arc<dyn Link>,
        broker: Arc<dyn Link>,
    ) -> Self {
        let tracker = Arc::new(DeliveryTracker::new(store, identity.device_id.clone()));
        let handlers = HandlerContext::new(identity, tracker);

        let mut router = MessageRouter::new();
        register_builtin(&mut router);

        let mut links: HashMap<LinkMode, Arc<dyn Link>> = HashMap::new();
        links.insert(LinkMode::Local, local);
        links.insert(LinkMode::Broker, broker);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);

        let inner = Arc::new(Inner {
            handlers,
            router: RwLock::new(router),
            replay: ReplayFilter::new(config.max_message_age_minutes),
            topics: TopicMap::new(&config.topic_namespace),
            links,
            mode: RwLock::new(config.link_mode),
            lifecycle: Mutex::new(()),
            sealer: RwLock::new(None),
            link_ctx: LinkContext {
                inbound: inbound_tx,
                status: status_tx,
            },
            sync_window_duration: Duration::from_secs(config.sync_window_secs),
        });

        tokio::spawn(Self::inbound_pump(Arc::downgrade(&inner), inbound_rx));

        Self { inner }
    }

    /// Drains link frames until the coordinator is dropped.
    async fn inbound_pump(inner: Weak<Inner>, mut rx: mpsc::Receiver<InboundFrame>) {
        while let Some(frame) = rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let coordinator = TransportCoordinator { inner };
            coordinator
                .on_receive(frame.envelope, frame.origin_host)
                .await;
        }
        debug!("Inbound pump stopped");
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.handlers.identity
    }

    pub fn local_device_id(&self) -> &str {
        self.inner.handlers.local_device_id()
    }

    pub fn mode(&self) -> LinkMode {
        *self.inner.mode.read()
    }

    fn active_link(&self) -> Option<Arc<dyn Link>> {
        self.inner.links.get(&self.mode()).cloned()
    }

    /// Mode and state of the active link.
    pub fn status(&self) -> LinkStatus {
        let mode = self.mode();
        let state = self
            .inner
            .links
            .get(&mode)
            .map(|l| l.state())
            .unwrap_or(LinkState::Disconnected);
        LinkStatus { mode, state }
    }

    /// State transitions of both links, in the order they happened.
    pub fn subscribe_status(&self) -> broadcast::Receiver<LinkStatus> {
        self.inner.link_ctx.status.subscribe()
    }

    pub fn listeners(&self) -> &ListenerSlots {
        &self.inner.handlers.listeners
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.inner.handlers.tracker
    }

    pub fn chats(&self) -> &Arc<ChatStore> {
        &self.inner.handlers.chats
    }

    pub fn markers(&self) -> &Arc<MarkerStore> {
        &self.inner.handlers.markers
    }

    pub fn linked_forms(&self) -> &Arc<LinkedFormStore> {
        &self.inner.handlers.forms
    }

    pub fn sync_window(&self) -> &Arc<SyncWindow> {
        &self.inner.handlers.sync_window
    }

    pub fn sync_window_duration(&self) -> Duration {
        self.inner.sync_window_duration
    }

    pub fn topics(&self) -> &TopicMap {
        &self.inner.topics
    }

    pub fn peers(&self) -> &Arc<RwLock<PeerDirectory>> {
        &self.inner.handlers.peers
    }

    /// Replace the built-in handler for `kind`.
    pub fn register_handler(&self, kind: MessageKind, handler: MessageHandler) {
        self.inner.router.write().register(kind, handler);
    }

    /// Profile sent in answer to discovery hellos.
    pub fn set_local_profile(&self, profile: Profile) {
        *self.inner.handlers.local_profile.write() = profile;
    }

    /// Engage the signing/encryption collaborator.
    pub fn set_sealer(&self, sealer: Arc<dyn EnvelopeSealer>) {
        *self.inner.sealer.write() = Some(sealer);
    }

    pub fn statuses(&self, report_id: &str) -> Result<Vec<RecipientStatusRow>, NetworkError> {
        self.inner.handlers.tracker.statuses(report_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the active link.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let _guard = self.inner.lifecycle.lock().await;
        let Some(link) = self.active_link() else {
            return Err(NetworkError::NotConnected);
        };
        link.start(self.inner.link_ctx.clone()).await?;
        info!(
            "Coordinator started on {} link (device {})",
            self.mode(),
            self.local_device_id()
        );
        Ok(())
    }

    /// Stop the active link.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if let Some(link) = self.active_link() {
            link.stop().await;
        }
        info!("Coordinator stopped");
    }

    /// Switch links. Same mode is a no-op; otherwise the current link is
    /// stopped (not paused) before the new one starts. A send racing the
    /// switch may land on either link or be dropped.
    pub async fn set_mode(&self, mode: LinkMode) -> Result<(), NetworkError> {
        let _guard = self.inner.lifecycle.lock().await;
        let current = self.mode();
        if current == mode {
            return Ok(());
        }
        info!("Switching link {current} -> {mode}");
        if let Some(old) = self.inner.links.get(&current) {
            old.stop().await;
        }
        *self.inner.mode.write() = mode;
        match self.inner.links.get(&mode) {
            Some(new) => new.start(self.inner.link_ctx.clone()).await,
            None => Err(NetworkError::NotConnected),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Hand `envelope` to the active link. `recipients` narrows local-link
    /// delivery to known hosts; the broker always publishes to the kind's
    /// topic. Failures are logged, never returned.
    pub async fn send(&self, mut envelope: Envelope, recipients: &[String]) {
        let sealer = self.inner.sealer.read().clone();
        if let Some(sealer) = sealer {
            if let Err(e) = sealer.seal(&mut envelope) {
                warn!("Dropping outbound {}: {e}", envelope.kind);
                return;
            }
        }

        let mode = self.mode();
        let Some(link) = self.inner.links.get(&mode).cloned() else {
            warn!("No {mode} link configured; dropping {}", envelope.kind);
            return;
        };
        let route = self.route_for(mode, envelope.kind, recipients);
        match link.transmit(&envelope, &route).await {
            Ok(()) => debug!("Sent {} via {mode} ({route:?})", envelope.kind),
            Err(e) => warn!("Dropping outbound {} on {mode} link: {e}", envelope.kind),
        }
    }

    fn route_for(&self, mode: LinkMode, kind: MessageKind, recipients: &[String]) -> Route {
        match mode {
            LinkMode::Broker => Route::Topic(self.inner.topics.topic_for(kind)),
            LinkMode::Local if recipients.is_empty() => Route::Broadcast,
            LinkMode::Local => {
                let hosts = self.inner.handlers.peers.read().resolve_all(recipients);
                if hosts.is_empty() {
                    Route::Broadcast
                } else {
                    Route::Hosts(hosts)
                }
            }
        }
    }

    /// Send a typed message from this device.
    ///
    /// Reports get one status row per recipient before they leave. Our own
    /// chats, markers and forms are kept in the local stores.
    pub async fn send_message(&self, message: TacticalMessage) -> Result<(), NetworkError> {
        let ctx = &self.inner.handlers;
        let envelope = message.into_envelope(ctx.local_device_id())?;

        if let Some((kind, report_id, recipients)) = message.report_parts() {
            ctx.tracker.create_statuses(kind, report_id, recipients)?;
        }
        match &message {
            TacticalMessage::Chat(chat) => {
                ctx.chats.insert(chat.clone(), ctx.local_device_id());
            }
            TacticalMessage::MarkerAdd(marker) => ctx.markers.upsert(marker.clone()),
            TacticalMessage::MarkerDelete(delete) => {
                ctx.markers.remove(&delete.id);
            }
            TacticalMessage::LinkedForm(form) => ctx.forms.upsert(form.clone()),
            _ => {}
        }

        self.send(envelope, &message.recipients()).await;
        Ok(())
    }

    /// Mark an incoming report read. Sends one read ack to its sender on
    /// the first call; later calls are no-ops. Returns whether an ack went
    /// out.
    pub async fn mark_report_read(&self, report_id: &str) -> Result<bool, NetworkError> {
        let Some(ack) = self.inner.handlers.tracker.mark_local_report_read(report_id)? else {
            return Ok(false);
        };
        let to = ack.to_device_id.clone();
        let envelope = TacticalMessage::ReportAck(ack).into_envelope(self.local_device_id())?;
        self.send(envelope, &[to]).await;
        Ok(true)
    }

    /// Broadcast a discovery hello; peers answer with their profiles.
    pub async fn announce(&self) -> Result<(), NetworkError> {
        let hello = DiscoveryHello {
            callsign: self.identity().callsign.clone(),
        };
        self.send_message(TacticalMessage::DiscoveryHello(hello)).await
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Entry point for every envelope a link receives.
    pub async fn on_receive(&self, mut envelope: Envelope, origin_host: Option<SocketAddr>) {
        let ctx = &self.inner.handlers;
        if envelope.origin_device_id == ctx.local_device_id() {
            return;
        }

        let sealer = self.inner.sealer.read().clone();
        if let Some(sealer) = sealer {
            if let Err(e) = sealer.open(&mut envelope) {
                warn!(
                    "Dropping {} from {}: {e}",
                    envelope.kind, envelope.origin_device_id
                );
                return;
            }
        }

        if !self.inner.replay.admits(envelope.timestamp_millis) {
            debug!(
                "Dropping stale {} from {} (ts {})",
                envelope.kind, envelope.origin_device_id, envelope.timestamp_millis
            );
            return;
        }

        if let Some(host) = origin_host {
            ctx.peers.write().learn(&envelope.origin_device_id, host);
        }

        let received = Received {
            envelope,
            origin_host,
        };
        let result = {
            let router = self.inner.router.read();
            router.dispatch(ctx, &received)
        };
        match result {
            Ok(Some(reply)) => self.send(reply.envelope, &reply.recipients).await,
            Ok(None) => {}
            Err(e) => warn!(
                "Dropping {} from {}: {e}",
                received.envelope.kind, received.envelope.origin_device_id
            ),
        }
    }
}
