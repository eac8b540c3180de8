//! Delivery/read tracker: per-recipient status for outgoing reports and
//! the read flag for incoming ones.
//!
//! All state lives in a [`DeliveryStore`]; the tracker writes through on
//! every mutation and keeps nothing of its own.

use std::sync::Arc;

use fieldlink_core::{DeliveryStore, IncomingReportRow, RecipientStatusRow};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::message::{ReportKind, now_millis};
use crate::payload::{AckType, ReportAck};

/// What happened to an inbound ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The matching row, after the ack was applied.
    Applied(RecipientStatusRow),
    /// No row exists for the `(report, recipient)` pair; nothing changed.
    Unknown,
}

pub struct DeliveryTracker {
    store: Arc<dyn DeliveryStore>,
    local_device_id: String,
    /// Serializes read-modify-write on status rows.
    write_lock: Mutex<()>,
}

fn storage(err: anyhow::Error) -> NetworkError {
    NetworkError::Storage(format!("{err:#}"))
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn DeliveryStore>, local_device_id: impl Into<String>) -> Self {
        Self {
            store,
            local_device_id: local_device_id.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn local_device_id(&self) -> &str {
        &self.local_device_id
    }

    /// One row per distinct recipient, `sent_at = now`. Rows that already
    /// exist are left alone. Returns how many rows were created.
    pub fn create_statuses(
        &self,
        kind: ReportKind,
        report_id: &str,
        recipients: &[String],
    ) -> Result<usize, NetworkError> {
        let sent_at = now_millis();
        let mut created = 0;
        for recipient in recipients {
            let row = RecipientStatusRow {
                report_id: report_id.to_string(),
                recipient_id: recipient.clone(),
                kind: kind.wire_name().to_string(),
                sent_at_millis: sent_at,
                delivered_at_millis: None,
                read_at_millis: None,
            };
            if self.store.insert_status(&row).map_err(storage)? {
                created += 1;
            } else {
                debug!("Status row for {report_id}/{recipient} already exists");
            }
        }
        Ok(created)
    }

    /// Apply a delivered/read ack from `ack.from_device_id`.
    ///
    /// Each ack type overwrites its own timestamp (last write wins). A read
    /// ack is accepted whether or not a delivered ack was seen first.
    pub fn apply_ack(&self, ack: &ReportAck) -> Result<AckOutcome, NetworkError> {
        let _guard = self.write_lock.lock();

        let Some(mut row) = self
            .store
            .get_status(&ack.report_id, &ack.from_device_id)
            .map_err(storage)?
        else {
            warn!(
                "Discarding {} ack for unknown report {} / recipient {}",
                ack.ack_type.wire_name(),
                ack.report_id,
                ack.from_device_id
            );
            return Ok(AckOutcome::Unknown);
        };

        match ack.ack_type {
            AckType::Delivered => row.delivered_at_millis = Some(ack.timestamp_millis),
            AckType::Read => row.read_at_millis = Some(ack.timestamp_millis),
        }
        self.store.update_status(&row).map_err(storage)?;
        Ok(AckOutcome::Applied(row))
    }

    /// Remember an incoming report. Returns `false` for a duplicate.
    pub fn record_incoming(
        &self,
        kind: ReportKind,
        report_id: &str,
        sender_id: &str,
    ) -> Result<bool, NetworkError> {
        let row = IncomingReportRow {
            report_id: report_id.to_string(),
            kind: kind.wire_name().to_string(),
            sender_id: sender_id.to_string(),
            received_at_millis: now_millis(),
            read: false,
        };
        self.store.record_incoming(&row).map_err(storage)
    }

    /// Flip an incoming report to read. Returns the read ack to send to the
    /// original sender, only on the unread → read transition.
    pub fn mark_local_report_read(
        &self,
        report_id: &str,
    ) -> Result<Option<ReportAck>, NetworkError> {
        let Some(incoming) = self.store.get_incoming(report_id).map_err(storage)? else {
            warn!("mark-as-read for unknown incoming report {report_id}");
            return Ok(None);
        };
        if !self.store.mark_incoming_read(report_id).map_err(storage)? {
            debug!("Report {report_id} already read");
            return Ok(None);
        }
        let Some(kind) = ReportKind::from_wire_name(&incoming.kind) else {
            warn!("Incoming report {report_id} has unknown kind {}", incoming.kind);
            return Ok(None);
        };
        Ok(Some(ReportAck::new(
            kind,
            report_id,
            self.local_device_id.clone(),
            incoming.sender_id,
            AckType::Read,
        )))
    }

    pub fn statuses(&self, report_id: &str) -> Result<Vec<RecipientStatusRow>, NetworkError> {
        self.store.statuses_for_report(report_id).map_err(storage)
    }

    pub fn incoming(&self, report_id: &str) -> Result<Option<IncomingReportRow>, NetworkError> {
        self.store.get_incoming(report_id).map_err(storage)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
