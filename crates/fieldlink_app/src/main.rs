use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use fieldlink_core::config::FieldConfig;
use fieldlink_core::logging;
use fieldlink_core::persistence::SqliteDeliveryStore;
use fieldlink_network::{
    BrokerLink, ChatEvent, DeviceIdentity, LocalLink, MarkerEvent, PeerDirectory, SyncCoordinator,
    TopicMap, TransportCoordinator,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Peers silent for longer than this are not written back to disk.
const PEER_RETENTION_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

fn build_coordinator(config: &FieldConfig) -> anyhow::Result<TransportCoordinator> {
    let identity = DeviceIdentity::load_or_generate(&FieldConfig::identity_path()?, &config.callsign);
    info!(
        "Device {} ({})",
        identity.device_id,
        if identity.callsign.is_empty() { "no callsign" } else { identity.callsign.as_str() }
    );

    let store = SqliteDeliveryStore::open().context("Failed to open delivery database")?;

    let local = Arc::new(LocalLink::new(config.local.clone()));
    let broker = Arc::new(BrokerLink::new(
        config.broker.clone(),
        TopicMap::new(&config.topic_namespace),
        identity.device_id.clone(),
    ));

    let coordinator =
        TransportCoordinator::new(identity, config, Arc::new(store), local, broker);

    let peers = PeerDirectory::load_or_default(&FieldConfig::peers_path()?);
    info!("Loaded {} known peers", peers.len());
    *coordinator.peers().write() = peers;

    Ok(coordinator)
}

fn save_peers(coordinator: &TransportCoordinator) {
    let path = match FieldConfig::peers_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("Cannot resolve peers path: {e}");
            return;
        }
    };
    let mut peers = coordinator.peers().write();
    let pruned = peers.prune_older_than(chrono::Duration::days(PEER_RETENTION_DAYS));
    if pruned > 0 {
        info!("Pruned {pruned} stale peers");
    }
    if let Err(e) = peers.save_to_file(&path) {
        warn!("Failed to save peers: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FieldConfig::load_or_default(&FieldConfig::config_path()?);
    let _log_guard = logging::init_logging(&config).context("Failed to initialize logging")?;
    info!("Starting fieldlinkd v{VERSION}");

    for warning in config.validate() {
        warn!("Config: {warning}");
    }

    let coordinator = build_coordinator(&config)?;
    let sync = Arc::new(SyncCoordinator::from_stores(coordinator.clone()));

    // Answer peers that ask for our markers.
    let marker_listener = {
        let sync = sync.clone();
        let identity = coordinator.identity().clone();
        Arc::new(move |event: MarkerEvent| {
            if let MarkerEvent::SyncRequested { callsign, .. } = event {
                info!("{callsign} requested markers");
                let sync = sync.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    if let Err(e) = sync
                        .answer_marker_request(&identity.callsign, &identity.device_id)
                        .await
                    {
                        warn!("Marker sync answer failed: {e}");
                    }
                });
            }
        })
    };
    coordinator.listeners().marker.register(&marker_listener);

    let chat_listener = Arc::new(|event: ChatEvent| match event {
        ChatEvent::Message(chat) => info!(
            "Chat from {}: {}",
            chat.message.from_callsign, chat.message.text
        ),
        ChatEvent::Delivered { message_id, by_device_id } => {
            info!("Chat {message_id} delivered to {by_device_id}")
        }
    });
    coordinator.listeners().chat.register(&chat_listener);

    let mut status = coordinator.subscribe_status();
    tokio::spawn(async move {
        while let Ok(s) = status.recv().await {
            info!("{} link {}", s.mode, s.state);
        }
    });

    if let Err(e) = coordinator.start().await {
        error!("Link failed to start: {e}");
    }

    if let Err(e) = coordinator.announce().await {
        warn!("Announce failed: {e}");
    }
    let identity = coordinator.identity().clone();
    if let Err(e) = sync
        .request_all_from_network(&identity.callsign, &identity.device_id)
        .await
    {
        warn!("Marker request failed: {e}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    coordinator.stop().await;
    save_peers(&coordinator);
    Ok(())
}
