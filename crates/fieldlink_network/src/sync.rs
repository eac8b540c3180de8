//! Sync helpers: marker and linked-form re-publication.
//!
//! A device joining late asks peers for their markers with a marker
//! request and opens a short acceptance window. Markers arriving while the
//! window is open are tagged as sync traffic for the marker listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fieldlink_core::MAX_SYNC_WINDOW_SECS;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::coordinator::TransportCoordinator;
use crate::error::NetworkError;
use crate::payload::{LinkedForm, MapMarker, MarkerRequest, TacticalMessage};

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Source of every locally known marker.
pub trait MarkerProvider: Send + Sync {
    fn all_markers(&self) -> Vec<MapMarker>;
}

/// Source of every locally known linked form.
pub trait LinkedFormProvider: Send + Sync {
    fn all_linked_forms(&self) -> Vec<LinkedForm>;
}

// ---------------------------------------------------------------------------
// Acceptance window
// ---------------------------------------------------------------------------

/// Deadline until which inbound markers count as a sync response.
#[derive(Debug, Default)]
pub struct SyncWindow {
    until: Mutex<Option<Instant>>,
}

impl SyncWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) the window for `duration` from now, capped at
    /// `MAX_SYNC_WINDOW_SECS`.
    pub fn open(&self, duration: Duration) {
        let capped = duration.min(Duration::from_secs(MAX_SYNC_WINDOW_SECS));
        *self.until.lock() = Some(Instant::now() + capped);
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.until.lock(), Some(until) if Instant::now() < until)
    }

    pub fn close(&self) {
        self.until.lock().take();
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    transport: TransportCoordinator,
    markers: Arc<dyn MarkerProvider>,
    forms: Arc<dyn LinkedFormProvider>,
}

impl SyncCoordinator {
    pub fn new(
        transport: TransportCoordinator,
        markers: Arc<dyn MarkerProvider>,
        forms: Arc<dyn LinkedFormProvider>,
    ) -> Self {
        Self {
            transport,
            markers,
            forms,
        }
    }

    /// Uses the coordinator's own marker and form stores as providers.
    pub fn from_stores(transport: TransportCoordinator) -> Self {
        let markers = transport.markers().clone();
        let forms = transport.linked_forms().clone();
        Self::new(transport, markers, forms)
    }

    /// Re-publish every known marker and linked form, one send per item.
    /// Items with no author are stamped with `callsign`. Returns how many
    /// items were handed to the active link.
    pub async fn sync_all(&self, callsign: &str, device_id: &str) -> Result<usize, NetworkError> {
        let markers = self.publish_markers(callsign, device_id).await?;

        let mut forms = 0;
        for mut form in self.forms.all_linked_forms() {
            if form.callsign.is_empty() {
                form.callsign = callsign.to_string();
            }
            self.publish(TacticalMessage::LinkedForm(form), device_id)
                .await?;
            forms += 1;
        }

        info!("Sync: re-published {markers} markers and {forms} linked forms");
        Ok(markers + forms)
    }

    /// Open the acceptance window, then ask every peer for its markers.
    pub async fn request_all_from_network(
        &self,
        callsign: &str,
        device_id: &str,
    ) -> Result<(), NetworkError> {
        let window = self.transport.sync_window_duration();
        self.transport.sync_window().open(window);
        debug!("Sync window open for {}s", window.as_secs());

        let request = MarkerRequest {
            callsign: callsign.to_string(),
        };
        self.publish(TacticalMessage::MarkerRequest(request), device_id)
            .await
    }

    /// Answer a peer's marker request with every local marker.
    pub async fn answer_marker_request(
        &self,
        callsign: &str,
        device_id: &str,
    ) -> Result<usize, NetworkError> {
        self.publish_markers(callsign, device_id).await
    }

    async fn publish_markers(&self, callsign: &str, device_id: &str) -> Result<usize, NetworkError> {
        let mut count = 0;
        for mut marker in self.markers.all_markers() {
            if marker.created_by.is_empty() {
                marker.created_by = callsign.to_string();
            }
            self.publish(TacticalMessage::MarkerAdd(marker), device_id)
                .await?;
            count += 1;
        }
        Ok(count)
    }

    async fn publish(&self, message: TacticalMessage, device_id: &str) -> Result<(), NetworkError> {
        let envelope = message.into_envelope(device_id)?;
        self.transport.send(envelope, &[]).await;
        Ok(())
    }
}
