//! Fieldlink Network: tactical message transport between field devices.
//!
//! One message model travels over two mutually exclusive links and is
//! serialized the same way on both. Report-like kinds are tracked through a
//! delivered/read acknowledgment lifecycle per recipient.
//!
//! # Architecture
//!
//! - **Local link**: UDP broadcast/unicast on the LAN, nested JSON frames.
//! - **Broker link**: MQTT publish/subscribe (via `rumqttc`), one topic per
//!   kind, flat JSON frames.
//! - **Coordinator**: owns the active link, filters self-echo and stale
//!   traffic, dispatches by kind, and routes outbound sends.
//! - **Tracker**: per-recipient delivered/read status for reports.
//!
//! Delivery is best-effort and at-least-once. Consumers are idempotent.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fieldlink_core::{FieldConfig, MemoryDeliveryStore};
//! use fieldlink_network::{BrokerLink, DeviceIdentity, LocalLink, TopicMap, TransportCoordinator};
//!
//! # async fn example() {
//! let config = FieldConfig::default();
//! let identity = DeviceIdentity::generate("ALPHA");
//! let local = Arc::new(LocalLink::new(config.local.clone()));
//! let broker = Arc::new(BrokerLink::new(
//!     config.broker.clone(),
//!     TopicMap::new(&config.topic_namespace),
//!     identity.device_id.clone(),
//! ));
//! let coordinator = TransportCoordinator::new(
//!     identity,
//!     &config,
//!     Arc::new(MemoryDeliveryStore::new()),
//!     local,
//!     broker,
//! );
//!
//! coordinator.start().await.unwrap();
//! // ... send and receive ...
//! coordinator.stop().await;
//! # }
//! ```

pub mod codec;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod link;
pub mod listener;
pub mod message;
pub mod payload;
pub mod peer;
pub mod replay;
pub mod router;
pub mod seal;
pub mod store;
pub mod sync;
pub mod tracker;

// Re-exports for convenience

pub use codec::TopicMap;
pub use coordinator::TransportCoordinator;
pub use error::{CodecError, NetworkError, PayloadError};
pub use identity::DeviceIdentity;
pub use link::{BrokerLink, Link, LinkState, LinkStatus, LocalLink, Route};
pub use listener::{ChatEvent, Inbound, Listener, MarkerEvent, ReportEvent};
pub use message::{Envelope, MessageKind, ReportKind};
pub use payload::TacticalMessage;
pub use peer::PeerDirectory;
pub use replay::ReplayFilter;
pub use seal::EnvelopeSealer;
pub use sync::{LinkedFormProvider, MarkerProvider, SyncCoordinator};
pub use tracker::{AckOutcome, DeliveryTracker};
