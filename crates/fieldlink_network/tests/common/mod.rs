#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_core::{FieldConfig, LinkMode, MemoryDeliveryStore};
use fieldlink_network::link::{InboundFrame, LinkContext, StateCell};
use fieldlink_network::{
    DeviceIdentity, Envelope, Link, LinkState, NetworkError, Route, TransportCoordinator,
};
use parking_lot::Mutex;

/// In-memory link that records every transmit.
pub struct RecordingLink {
    mode: LinkMode,
    state: StateCell,
    ctx: Mutex<Option<LinkContext>>,
    sent: Mutex<Vec<(Envelope, Route)>>,
    starts: Mutex<usize>,
}

impl RecordingLink {
    pub fn new(mode: LinkMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            state: StateCell::new(mode),
            ctx: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            starts: Mutex::new(0),
        })
    }

    pub fn sent(&self) -> Vec<(Envelope, Route)> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    pub fn starts(&self) -> usize {
        *self.starts.lock()
    }

    /// Push an envelope into the coordinator as if it arrived on this link.
    pub async fn deliver(&self, envelope: Envelope) {
        let ctx = self.ctx.lock().clone().expect("link not started");
        ctx.inbound
            .send(InboundFrame {
                envelope,
                origin_host: None,
                mode: self.mode,
            })
            .await
            .expect("coordinator gone");
    }
}

#[async_trait]
impl Link for RecordingLink {
    fn mode(&self) -> LinkMode {
        self.mode
    }

    fn state(&self) -> LinkState {
        self.state.get()
    }

    async fn start(&self, ctx: LinkContext) -> Result<(), NetworkError> {
        *self.starts.lock() += 1;
        self.state.attach(ctx.status.clone());
        *self.ctx.lock() = Some(ctx);
        self.state.set(LinkState::Connecting);
        self.state.set(LinkState::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.state.set(LinkState::Disconnected);
    }

    async fn transmit(&self, envelope: &Envelope, route: &Route) -> Result<(), NetworkError> {
        if self.state.get() != LinkState::Connected {
            return Err(NetworkError::NotConnected);
        }
        self.sent.lock().push((envelope.clone(), route.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: TransportCoordinator,
    pub local: Arc<RecordingLink>,
    pub broker: Arc<RecordingLink>,
}

pub fn harness(device_id: &str) -> Harness {
    harness_with(device_id, FieldConfig::default())
}

pub fn harness_with(device_id: &str, config: FieldConfig) -> Harness {
    let local = RecordingLink::new(LinkMode::Local);
    let broker = RecordingLink::new(LinkMode::Broker);
    let coordinator = TransportCoordinator::new(
        DeviceIdentity::new(device_id, "ALPHA"),
        &config,
        Arc::new(MemoryDeliveryStore::new()),
        local.clone(),
        broker.clone(),
    );
    Harness {
        coordinator,
        local,
        broker,
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Shared event sink for listener slots.
pub fn collector<E: Send + 'static>() -> (Arc<Mutex<Vec<E>>>, Arc<impl Fn(E) + Send + Sync>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, Arc::new(move |event: E| sink.lock().push(event)))
}
