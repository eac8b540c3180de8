//! Link adapters: the two mutually exclusive transports.
//!
//! Both links speak [`Envelope`]s to the coordinator and differ only in
//! addressing ([`Route`]) and wire shape. Inbound traffic is pushed into
//! the coordinator's channel as [`InboundFrame`]s; state transitions are
//! published on a broadcast channel in the order they happen.

pub mod broker;
pub mod local;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use fieldlink_core::LinkMode;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::NetworkError;
use crate::message::Envelope;

pub use broker::BrokerLink;
pub use local::LocalLink;

/// Connection state of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// A state transition, tagged with the link it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub mode: LinkMode,
    pub state: LinkState,
}

/// Where a link should deliver an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Broker topic.
    Topic(String),
    /// Explicit local-link hosts.
    Hosts(Vec<SocketAddr>),
    /// Every reachable local-link peer.
    Broadcast,
}

/// An envelope as received by a link.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub envelope: Envelope,
    pub origin_host: Option<SocketAddr>,
    pub mode: LinkMode,
}

/// Channels a link reports into while it runs.
#[derive(Clone)]
pub struct LinkContext {
    pub inbound: mpsc::Sender<InboundFrame>,
    pub status: broadcast::Sender<LinkStatus>,
}

/// A transport the coordinator can make active.
#[async_trait]
pub trait Link: Send + Sync {
    fn mode(&self) -> LinkMode;

    fn state(&self) -> LinkState;

    /// Bring the link up. Calling `start` on a running link is a no-op.
    async fn start(&self, ctx: LinkContext) -> Result<(), NetworkError>;

    /// Tear the link down and release its resources. The link ends in
    /// [`LinkState::Disconnected`].
    async fn stop(&self);

    /// Encode and hand `envelope` to the transport. Never queues: a link
    /// that is not up refuses with [`NetworkError::NotConnected`].
    async fn transmit(&self, envelope: &Envelope, route: &Route) -> Result<(), NetworkError>;
}

// ---------------------------------------------------------------------------
// State cell
// ---------------------------------------------------------------------------

struct StateInner {
    state: LinkState,
    publisher: Option<broadcast::Sender<LinkStatus>>,
}

/// Current link state plus its publisher. Setting and publishing happen
/// under one lock so observers see transitions in order.
pub struct StateCell {
    mode: LinkMode,
    inner: Mutex<StateInner>,
}

impl StateCell {
    pub fn new(mode: LinkMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(StateInner {
                state: LinkState::Disconnected,
                publisher: None,
            }),
        }
    }

    pub fn attach(&self, publisher: broadcast::Sender<LinkStatus>) {
        self.inner.lock().publisher = Some(publisher);
    }

    pub fn get(&self) -> LinkState {
        self.inner.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == LinkState::Connected
    }

    /// Set the state; repeated identical states are not republished.
    pub fn set(&self, state: LinkState) {
        let mut inner = self.inner.lock();
        if inner.state == state {
            return;
        }
        debug!("{} link: {} -> {state}", self.mode, inner.state);
        inner.state = state.clone();
        if let Some(publisher) = &inner.publisher {
            // No receivers is fine.
            let _ = publisher.send(LinkStatus {
                mode: self.mode,
                state,
            });
        }
    }
}
