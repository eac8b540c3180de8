//! Built-in per-kind handlers.
//!
//! Every handler decodes its typed payload first; a missing required field
//! fails the whole envelope before any state is touched.

use std::sync::Arc;

use fieldlink_core::RecipientStatusRow;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::PayloadError;
use crate::identity::DeviceIdentity;
use crate::listener::{
    ChatEvent, Inbound, ListenerSlot, ListenerSlots, MarkerEvent, Notifier, ReportEvent,
};
use crate::message::{MessageKind, ReportKind, now_millis};
use crate::payload::{
    AckType, CasualtyHandover, ChatAck, ChatMessage, DiscoveryHello, EmergencyNotice, LinkedForm,
    MapMarker, MarkerDelete, MarkerRequest, Order, Photo, PositionUpdate, Profile, Report,
    ReportAck, StatusReport, TacticalMessage, decode_payload,
};
use crate::peer::PeerDirectory;
use crate::router::{HandlerResult, MessageHandler, MessageRouter, Outbound, Received};
use crate::store::{ChatStore, LinkedFormStore, MarkerStore};
use crate::sync::SyncWindow;
use crate::tracker::{AckOutcome, DeliveryTracker};

/// Everything a handler may read or mutate.
pub struct HandlerContext {
    pub identity: DeviceIdentity,
    /// Sent in reply to discovery hellos.
    pub local_profile: RwLock<Profile>,
    pub tracker: Arc<DeliveryTracker>,
    pub listeners: Arc<ListenerSlots>,
    pub notifier: Notifier,
    pub chats: Arc<ChatStore>,
    pub markers: Arc<MarkerStore>,
    pub forms: Arc<LinkedFormStore>,
    pub sync_window: Arc<SyncWindow>,
    pub peers: Arc<RwLock<PeerDirectory>>,
}

impl HandlerContext {
    /// A context with empty stores around `identity` and `tracker`.
    /// Must be called inside a tokio runtime.
    pub fn new(identity: DeviceIdentity, tracker: Arc<DeliveryTracker>) -> Self {
        let profile = Profile::for_callsign(identity.callsign.clone());
        Self {
            identity,
            local_profile: RwLock::new(profile),
            tracker,
            listeners: Arc::new(ListenerSlots::default()),
            notifier: Notifier::spawn(),
            chats: Arc::new(ChatStore::new()),
            markers: Arc::new(MarkerStore::new()),
            forms: Arc::new(LinkedFormStore::new()),
            sync_window: Arc::new(SyncWindow::new()),
            peers: Arc::new(RwLock::new(PeerDirectory::new())),
        }
    }

    pub fn local_device_id(&self) -> &str {
        &self.identity.device_id
    }

    fn inbound<T>(&self, received: &Received, message: T) -> Inbound<T> {
        Inbound {
            from_device_id: received.envelope.origin_device_id.clone(),
            origin_host: received.origin_host,
            message,
        }
    }

    fn reply(&self, message: TacticalMessage, to: &str) -> HandlerResult {
        Ok(Some(Outbound {
            envelope: message.into_envelope(self.local_device_id())?,
            recipients: vec![to.to_string()],
        }))
    }

    fn notify_status(&self, kind: ReportKind, row: RecipientStatusRow) {
        let slots = &self.listeners;
        match kind {
            ReportKind::Order => self.notifier.notify(&slots.order, ReportEvent::StatusChanged(row)),
            ReportKind::StatusReport => self
                .notifier
                .notify(&slots.status_report, ReportEvent::StatusChanged(row)),
            ReportKind::EmergencyNotice => self
                .notifier
                .notify(&slots.emergency_notice, ReportEvent::StatusChanged(row)),
            ReportKind::CasualtyHandover => self
                .notifier
                .notify(&slots.casualty_handover, ReportEvent::StatusChanged(row)),
        }
    }
}

/// Register a handler for every message kind.
pub fn register_builtin(router: &mut MessageRouter) {
    router.register(MessageKind::Position, Arc::new(handle_position));
    router.register(MessageKind::MarkerAdd, Arc::new(handle_marker_add));
    router.register(MessageKind::MarkerDelete, Arc::new(handle_marker_delete));
    router.register(MessageKind::MarkerRequest, Arc::new(handle_marker_request));
    router.register(MessageKind::Profile, Arc::new(handle_profile));
    router.register(MessageKind::DiscoveryHello, Arc::new(handle_hello));
    router.register(MessageKind::Chat, Arc::new(handle_chat));
    router.register(MessageKind::ChatAck, Arc::new(handle_chat_ack));
    router.register(MessageKind::Order, report_handler::<Order>(|s| &s.order));
    router.register(
        MessageKind::StatusReport,
        report_handler::<StatusReport>(|s| &s.status_report),
    );
    router.register(
        MessageKind::EmergencyNotice,
        report_handler::<EmergencyNotice>(|s| &s.emergency_notice),
    );
    router.register(
        MessageKind::CasualtyHandover,
        report_handler::<CasualtyHandover>(|s| &s.casualty_handover),
    );
    for kind in ReportKind::ALL {
        router.register(kind.ack_kind(), ack_handler(kind));
    }
    router.register(MessageKind::LinkedForm, Arc::new(handle_linked_form));
    router.register(MessageKind::Photo, Arc::new(handle_photo));
}

// ---------------------------------------------------------------------------
// Situational awareness
// ---------------------------------------------------------------------------

fn handle_position(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let position: PositionUpdate = decode_payload(&r.envelope)?;
    ctx.notifier
        .notify(&ctx.listeners.position, ctx.inbound(r, position));
    Ok(None)
}

fn handle_marker_add(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let marker: MapMarker = decode_payload(&r.envelope)?;
    ctx.markers.upsert(marker.clone());
    let event = MarkerEvent::Upserted {
        marker: ctx.inbound(r, marker),
        via_sync: ctx.sync_window.is_open(),
    };
    ctx.notifier.notify(&ctx.listeners.marker, event);
    Ok(None)
}

fn handle_marker_delete(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let delete: MarkerDelete = decode_payload(&r.envelope)?;
    ctx.markers.remove(&delete.id);
    let event = MarkerEvent::Deleted {
        id: delete.id,
        from_device_id: r.envelope.origin_device_id.clone(),
    };
    ctx.notifier.notify(&ctx.listeners.marker, event);
    Ok(None)
}

fn handle_marker_request(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let request: MarkerRequest = decode_payload(&r.envelope)?;
    let event = MarkerEvent::SyncRequested {
        callsign: request.callsign,
        from_device_id: r.envelope.origin_device_id.clone(),
    };
    ctx.notifier.notify(&ctx.listeners.marker, event);
    Ok(None)
}

fn handle_profile(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let profile: Profile = decode_payload(&r.envelope)?;
    ctx.peers
        .write()
        .set_callsign(&r.envelope.origin_device_id, &profile.callsign);
    ctx.notifier
        .notify(&ctx.listeners.profile, ctx.inbound(r, profile));
    Ok(None)
}

fn handle_hello(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let hello: DiscoveryHello = decode_payload(&r.envelope)?;
    ctx.notifier
        .notify(&ctx.listeners.discovery, ctx.inbound(r, hello));
    let profile = ctx.local_profile.read().clone();
    ctx.reply(TacticalMessage::Profile(profile), &r.envelope.origin_device_id)
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

fn handle_chat(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let chat: ChatMessage = decode_payload(&r.envelope)?;
    let local = ctx.local_device_id();
    let addressed_to_us = match chat.to_device_id.as_deref() {
        None => false,
        Some(to) if to == local => true,
        Some(to) => {
            debug!("Chat {} is for {to}, not us", chat.id);
            return Ok(None);
        }
    };

    if !ctx.chats.insert(chat.clone(), &r.envelope.origin_device_id) {
        debug!("Duplicate chat {}", chat.id);
        return Ok(None);
    }

    let message_id = chat.id.clone();
    ctx.notifier
        .notify(&ctx.listeners.chat, ChatEvent::Message(ctx.inbound(r, chat)));

    if !addressed_to_us {
        return Ok(None);
    }
    let ack = ChatAck {
        message_id,
        from_device_id: local.to_string(),
        timestamp_millis: now_millis(),
    };
    ctx.reply(TacticalMessage::ChatAck(ack), &r.envelope.origin_device_id)
}

fn handle_chat_ack(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let ack: ChatAck = decode_payload(&r.envelope)?;
    // Only our own messages are tracked for delivery.
    let ours = ctx
        .chats
        .get(&ack.message_id)
        .is_some_and(|c| c.from_device_id == ctx.local_device_id());
    if !ours {
        debug!("Ignoring chat ack for {}", ack.message_id);
        return Ok(None);
    }
    ctx.chats.mark_delivered(&ack.message_id);
    let event = ChatEvent::Delivered {
        message_id: ack.message_id,
        by_device_id: ack.from_device_id,
    };
    ctx.notifier.notify(&ctx.listeners.chat, event);
    Ok(None)
}

// ---------------------------------------------------------------------------
// Reports and their acks
// ---------------------------------------------------------------------------

type ReportSlot<R> = fn(&ListenerSlots) -> &ListenerSlot<ReportEvent<R>>;

/// Handler for one report kind: record, notify, and answer with exactly
/// one delivered ack on first receipt.
fn report_handler<R: Report>(slot: ReportSlot<R>) -> MessageHandler {
    Arc::new(move |ctx: &HandlerContext, r: &Received| -> HandlerResult {
        let report: R = decode_payload(&r.envelope)?;
        if report.recipients().is_empty() {
            return Err(PayloadError::MissingField {
                kind: R::KIND,
                field: "recipients".into(),
            }
            .into());
        }
        let local = ctx.local_device_id();
        if !report.recipients().iter().any(|id| id == local) {
            debug!("{} {} not addressed to us", R::KIND, report.report_id());
            return Ok(None);
        }

        let origin = &r.envelope.origin_device_id;
        let first = ctx
            .tracker
            .record_incoming(R::REPORT_KIND, report.report_id(), origin)?;
        if !first {
            debug!("Duplicate {} {}", R::KIND, report.report_id());
            return Ok(None);
        }

        let ack = ReportAck::new(
            R::REPORT_KIND,
            report.report_id(),
            local,
            origin.clone(),
            AckType::Delivered,
        );
        ctx.notifier
            .notify(slot(&ctx.listeners), ReportEvent::Received(ctx.inbound(r, report)));
        ctx.reply(TacticalMessage::ReportAck(ack), origin)
    })
}

fn ack_handler(kind: ReportKind) -> MessageHandler {
    Arc::new(move |ctx: &HandlerContext, r: &Received| -> HandlerResult {
        let ack = ReportAck::from_payload(kind, &r.envelope.payload)?;
        if ack.to_device_id != ctx.local_device_id() {
            debug!("{} for {} is not ours", kind.ack_kind(), ack.to_device_id);
            return Ok(None);
        }
        if let AckOutcome::Applied(row) = ctx.tracker.apply_ack(&ack)? {
            ctx.notify_status(kind, row);
        }
        Ok(None)
    })
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

fn handle_linked_form(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let form: LinkedForm = decode_payload(&r.envelope)?;
    ctx.forms.upsert(form.clone());
    ctx.notifier
        .notify(&ctx.listeners.linked_form, ctx.inbound(r, form));
    Ok(None)
}

fn handle_photo(ctx: &HandlerContext, r: &Received) -> HandlerResult {
    let photo: Photo = decode_payload(&r.envelope)?;
    ctx.notifier.notify(&ctx.listeners.photo, ctx.inbound(r, photo));
    Ok(None)
}

#[cfg(test)]
pub(crate) fn test_context(device_id: &str) -> HandlerContext {
    let store = Arc::new(fieldlink_core::MemoryDeliveryStore::new());
    let tracker = Arc::new(DeliveryTracker::new(store, device_id));
    HandlerContext::new(DeviceIdentity::new(device_id, "TEST"), tracker)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::message::Envelope;
    use crate::payload::{KindPayload, encode_payload};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn router() -> MessageRouter {
        let mut router = MessageRouter::new();
        register_builtin(&mut router);
        router
    }

    fn received<T: KindPayload>(from: &str, record: &T) -> Received {
        Received {
            envelope: Envelope::new(T::KIND, from, encode_payload(record).unwrap()),
            origin_host: None,
        }
    }

    fn report(recipients: &[&str]) -> StatusReport {
        StatusReport {
            report_id: "rep-1".into(),
            sender_callsign: "ALPHA".into(),
            recipients: recipients.iter().map(|s| s.to_string()).collect(),
            status: "GREEN".into(),
            personnel: None,
            ammunition: None,
            notes: String::new(),
            created_at_millis: 1,
        }
    }

    #[tokio::test]
    async fn test_every_kind_has_a_handler() {
        let router = router();
        for kind in MessageKind::ALL {
            assert!(router.has_handler(kind), "no handler for {kind}");
        }
    }

    #[tokio::test]
    async fn test_report_to_us_acks_once() {
        let ctx = test_context("HQ");
        let router = router();
        let r = received("dev-a", &report(&["HQ", "R2"]));

        let reply = router.dispatch(&ctx, &r).unwrap().unwrap();
        assert_eq!(reply.envelope.kind, MessageKind::StatusReportAck);
        assert_eq!(reply.recipients, vec!["dev-a".to_string()]);
        let ack = ReportAck::from_payload(ReportKind::StatusReport, &reply.envelope.payload).unwrap();
        assert_eq!(ack.ack_type, AckType::Delivered);
        assert_eq!(ack.from_device_id, "HQ");
        assert_eq!(ack.to_device_id, "dev-a");

        // Redelivery of the same report does not ack again.
        assert!(router.dispatch(&ctx, &r).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_not_for_us_ignored() {
        let ctx = test_context("HQ");
        let r = received("dev-a", &report(&["R1"]));
        assert!(router().dispatch(&ctx, &r).unwrap().is_none());
        assert!(ctx.tracker.incoming("rep-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_without_recipients_is_malformed() {
        let ctx = test_context("HQ");
        let r = received("dev-a", &report(&[]));
        let err = router().dispatch(&ctx, &r).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Payload(PayloadError::MissingField { ref field, .. }) if field == "recipients"
        ));
    }

    #[tokio::test]
    async fn test_missing_field_touches_nothing() {
        let ctx = test_context("HQ");
        let mut payload = encode_payload(&report(&["HQ"])).unwrap();
        payload.remove("reportId");
        let r = Received {
            envelope: Envelope::new(MessageKind::StatusReport, "dev-a", payload),
            origin_host: None,
        };
        assert!(router().dispatch(&ctx, &r).is_err());
        assert!(ctx.tracker.incoming("rep-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_updates_tracker_and_notifies() {
        let ctx = test_context("HQ");
        ctx.tracker
            .create_statuses(ReportKind::Order, "ord-1", &["R1".into()])
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Arc::new(move |e: ReportEvent<Order>| sink.lock().push(e));
        ctx.listeners.order.register(&listener);

        let ack = ReportAck {
            report_kind: ReportKind::Order,
            report_id: "ord-1".into(),
            from_device_id: "R1".into(),
            to_device_id: "HQ".into(),
            ack_type: AckType::Read,
            timestamp_millis: 99,
        };
        let r = Received {
            envelope: Envelope::new(MessageKind::OrderAck, "R1", ack.to_payload()),
            origin_host: None,
        };
        assert!(router().dispatch(&ctx, &r).unwrap().is_none());
        assert_eq!(ctx.tracker.statuses("ord-1").unwrap()[0].read_at_millis, Some(99));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            seen.lock().as_slice(),
            [ReportEvent::StatusChanged(row)] if row.recipient_id == "R1"
        ));
    }

    #[tokio::test]
    async fn test_ack_for_someone_else_ignored() {
        let ctx = test_context("HQ");
        ctx.tracker
            .create_statuses(ReportKind::Order, "ord-1", &["R1".into()])
            .unwrap();
        let ack = ReportAck::new(ReportKind::Order, "ord-1", "R1", "OTHER", AckType::Delivered);
        let r = Received {
            envelope: Envelope::new(MessageKind::OrderAck, "R1", ack.to_payload()),
            origin_host: None,
        };
        router().dispatch(&ctx, &r).unwrap();
        assert!(ctx.tracker.statuses("ord-1").unwrap()[0].delivered_at_millis.is_none());
    }

    #[tokio::test]
    async fn test_direct_chat_is_acked_once() {
        let ctx = test_context("HQ");
        let chat = ChatMessage::new("ALPHA", "status?").to_device("HQ");
        let r = received("dev-a", &chat);

        let reply = router().dispatch(&ctx, &r).unwrap().unwrap();
        assert_eq!(reply.envelope.kind, MessageKind::ChatAck);
        assert_eq!(reply.envelope.payload_str("messageId"), Some(chat.id.as_str()));

        assert!(router().dispatch(&ctx, &r).unwrap().is_none());
        assert_eq!(ctx.chats.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_chat_not_acked() {
        let ctx = test_context("HQ");
        let r = received("dev-a", &ChatMessage::new("ALPHA", "all stations"));
        assert!(router().dispatch(&ctx, &r).unwrap().is_none());
        assert_eq!(ctx.chats.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_ack_marks_our_message() {
        let ctx = test_context("HQ");
        let chat = ChatMessage::new("HQ", "move out").to_device("R1");
        ctx.chats.insert(chat.clone(), "HQ");

        let ack = ChatAck {
            message_id: chat.id.clone(),
            from_device_id: "R1".into(),
            timestamp_millis: 5,
        };
        router().dispatch(&ctx, &received("R1", &ack)).unwrap();
        assert!(ctx.chats.get(&chat.id).unwrap().delivered);
    }

    #[tokio::test]
    async fn test_hello_answered_with_profile() {
        let ctx = test_context("HQ");
        ctx.local_profile.write().unit = Some("1 PARA".into());
        let hello = DiscoveryHello {
            callsign: "ALPHA".into(),
        };
        let reply = router()
            .dispatch(&ctx, &received("dev-a", &hello))
            .unwrap()
            .unwrap();
        assert_eq!(reply.envelope.kind, MessageKind::Profile);
        assert_eq!(reply.envelope.payload_str("unit"), Some("1 PARA"));
        assert_eq!(reply.envelope.origin_device_id, "HQ");
    }

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let ctx = test_context("HQ");
        let marker = MapMarker {
            id: "m1".into(),
            lat: 1.0,
            lon: 2.0,
            nato_type: "hostile".into(),
            name: "Bunker".into(),
            description: None,
            created_by: "ALPHA".into(),
            created_at_millis: 1,
        };
        router().dispatch(&ctx, &received("dev-a", &marker)).unwrap();
        assert!(ctx.markers.get("m1").is_some());

        let delete = MarkerDelete { id: "m1".into() };
        router().dispatch(&ctx, &received("dev-a", &delete)).unwrap();
        assert!(ctx.markers.get("m1").is_none());
    }
}
