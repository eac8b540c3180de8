mod common;

use std::net::SocketAddr;

use common::{collector, eventually, harness, harness_with};
use fieldlink_core::{FieldConfig, LinkMode};
use fieldlink_network::message::now_millis;
use fieldlink_network::payload::{AckType, ChatMessage, PositionUpdate, ReportAck, StatusReport};
use fieldlink_network::{
    ChatEvent, Envelope, EnvelopeSealer, Link, LinkState, LinkStatus, MessageKind, NetworkError,
    ReportEvent, ReportKind, Route, TacticalMessage,
};
use serde_json::Map;

const MINUTE: i64 = 60_000;

fn position() -> TacticalMessage {
    TacticalMessage::Position(PositionUpdate {
        callsign: "ALPHA".into(),
        lat: 51.5,
        lon: -0.12,
        altitude: None,
        heading: Some(90.0),
        speed: None,
        accuracy: None,
    })
}

fn status_report(id: &str, recipients: &[&str]) -> StatusReport {
    StatusReport {
        report_id: id.into(),
        sender_callsign: "ALPHA".into(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        status: "GREEN".into(),
        personnel: Some(12),
        ammunition: None,
        notes: String::new(),
        created_at_millis: now_millis(),
    }
}

fn from(message: TacticalMessage, device_id: &str) -> Envelope {
    message.into_envelope(device_id).unwrap()
}

fn ack(id: &str, from_device: &str, to_device: &str, ack_type: AckType) -> Envelope {
    let ack = ReportAck::new(ReportKind::StatusReport, id, from_device, to_device, ack_type);
    from(TacticalMessage::ReportAck(ack), from_device)
}

// ---------------------------------------------------------------------------
// Link selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_only_active_link_carries_traffic() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    assert_eq!(h.coordinator.mode(), LinkMode::Local);

    h.coordinator.send_message(position()).await.unwrap();
    let local = h.local.sent();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].1, Route::Broadcast);
    assert!(h.broker.sent().is_empty());

    h.coordinator.set_mode(LinkMode::Broker).await.unwrap();
    assert_eq!(h.local.state(), LinkState::Disconnected);
    assert_eq!(h.broker.state(), LinkState::Connected);

    h.coordinator.send_message(position()).await.unwrap();
    assert_eq!(h.local.sent().len(), 1);
    let broker = h.broker.sent();
    assert_eq!(broker.len(), 1);
    assert_eq!(broker[0].1, Route::Topic("fieldlink/v1/pos".into()));
}

#[tokio::test]
async fn test_set_same_mode_is_noop() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    assert_eq!(h.local.starts(), 1);

    h.coordinator.set_mode(LinkMode::Local).await.unwrap();
    assert_eq!(h.local.starts(), 1);
    assert_eq!(h.local.state(), LinkState::Connected);
    assert_eq!(h.broker.starts(), 0);
}

#[tokio::test]
async fn test_send_while_stopped_is_dropped() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    h.coordinator.stop().await;

    // No error reaches the caller; the message is simply gone.
    h.coordinator.send_message(position()).await.unwrap();
    assert!(h.local.sent().is_empty());
    assert!(h.broker.sent().is_empty());
}

#[tokio::test]
async fn test_status_transitions_observed_in_order() {
    let h = harness("dev-a");
    let mut rx = h.coordinator.subscribe_status();

    h.coordinator.start().await.unwrap();
    h.coordinator.set_mode(LinkMode::Broker).await.unwrap();

    let seen: Vec<LinkStatus> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    let expected = [
        (LinkMode::Local, LinkState::Connecting),
        (LinkMode::Local, LinkState::Connected),
        (LinkMode::Local, LinkState::Disconnected),
        (LinkMode::Broker, LinkState::Connecting),
        (LinkMode::Broker, LinkState::Connected),
    ]
    .map(|(mode, state)| LinkStatus { mode, state });
    assert_eq!(seen, expected);

    let status = h.coordinator.status();
    assert_eq!(status.mode, LinkMode::Broker);
    assert_eq!(status.state, LinkState::Connected);
}

#[tokio::test]
async fn test_local_route_uses_learned_hosts() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    let host: SocketAddr = "10.0.0.7:4242".parse().unwrap();
    h.coordinator
        .on_receive(from(position(), "dev-b"), Some(host))
        .await;

    let chat = ChatMessage::new("ALPHA", "on my way").to_device("dev-b");
    h.coordinator
        .send_message(TacticalMessage::Chat(chat))
        .await
        .unwrap();
    let stranger = ChatMessage::new("ALPHA", "anyone?").to_device("dev-z");
    h.coordinator
        .send_message(TacticalMessage::Chat(stranger))
        .await
        .unwrap();

    let sent = h.local.sent();
    assert_eq!(sent[0].1, Route::Hosts(vec![host]));
    assert_eq!(sent[1].1, Route::Broadcast);
}

// ---------------------------------------------------------------------------
// Inbound filtering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_self_echo_dropped() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    let chat = ChatMessage::new("ALPHA", "echo").to_device("dev-a");
    h.coordinator
        .on_receive(from(TacticalMessage::Chat(chat), "dev-a"), None)
        .await;

    assert!(h.coordinator.chats().is_empty());
    assert!(h.local.sent().is_empty());
}

#[tokio::test]
async fn test_stale_messages_dropped() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    let stale = from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "old")), "dev-b")
        .with_timestamp(now_millis() - 400 * MINUTE);
    h.coordinator.on_receive(stale, None).await;
    assert!(h.coordinator.chats().is_empty());

    let fresh = from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "new")), "dev-b")
        .with_timestamp(now_millis() - 300 * MINUTE);
    h.coordinator.on_receive(fresh, None).await;
    assert_eq!(h.coordinator.chats().len(), 1);
}

#[tokio::test]
async fn test_age_check_disabled() {
    let config = FieldConfig {
        max_message_age_minutes: 0,
        ..FieldConfig::default()
    };
    let h = harness_with("dev-a", config);
    h.coordinator.start().await.unwrap();

    for minutes in [400, 300] {
        let env = from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "x")), "dev-b")
            .with_timestamp(now_millis() - minutes * MINUTE);
        h.coordinator.on_receive(env, None).await;
    }
    assert_eq!(h.coordinator.chats().len(), 2);
}

#[tokio::test]
async fn test_frames_from_link_reach_handlers() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    h.local
        .deliver(from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "hi")), "dev-b"))
        .await;
    let coordinator = &h.coordinator;
    assert!(eventually(|| async move { coordinator.chats().len() == 1 }).await);
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_chat_processed_once() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    let (events, listener) = collector::<ChatEvent>();
    h.coordinator.listeners().chat.register(&listener);

    let chat = ChatMessage::new("BRAVO", "contact north").to_device("dev-a");
    let env = from(TacticalMessage::Chat(chat.clone()), "dev-b");
    h.coordinator.on_receive(env.clone(), None).await;
    h.coordinator.on_receive(env, None).await;

    assert_eq!(h.coordinator.chats().len(), 1);
    let acks: Vec<_> = h
        .local
        .sent()
        .into_iter()
        .filter(|(e, _)| e.kind == MessageKind::ChatAck)
        .collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0.payload_str("messageId"), Some(chat.id.as_str()));

    let seen = &events;
    assert!(eventually(|| async move { seen.lock().len() == 1 }).await);
}

#[tokio::test]
async fn test_own_chat_marked_delivered_on_ack() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    let chat = ChatMessage::new("ALPHA", "radio check").to_device("dev-b");
    let id = chat.id.clone();
    h.coordinator
        .send_message(TacticalMessage::Chat(chat))
        .await
        .unwrap();
    assert!(!h.coordinator.chats().get(&id).unwrap().delivered);

    let ack = fieldlink_network::payload::ChatAck {
        message_id: id.clone(),
        from_device_id: "dev-b".into(),
        timestamp_millis: now_millis(),
    };
    h.coordinator
        .on_receive(from(TacticalMessage::ChatAck(ack), "dev-b"), None)
        .await;
    assert!(h.coordinator.chats().get(&id).unwrap().delivered);
}

// ---------------------------------------------------------------------------
// Report acknowledgments
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_report_ack_fan_out() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    let (events, listener) = collector::<ReportEvent<StatusReport>>();
    h.coordinator.listeners().status_report.register(&listener);

    h.coordinator
        .send_message(TacticalMessage::StatusReport(status_report("rep-1", &["R1", "R2"])))
        .await
        .unwrap();
    let rows = h.coordinator.statuses("rep-1").unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.delivered_at_millis.is_none() && r.read_at_millis.is_none()));

    h.coordinator
        .on_receive(ack("rep-1", "R1", "dev-a", AckType::Delivered), None)
        .await;
    let rows = h.coordinator.statuses("rep-1").unwrap();
    assert!(rows[0].delivered_at_millis.is_some());
    assert!(rows[1].delivered_at_millis.is_none());

    // A read ack is accepted even though no delivered ack was seen.
    h.coordinator
        .on_receive(ack("rep-1", "R2", "dev-a", AckType::Read), None)
        .await;
    let rows = h.coordinator.statuses("rep-1").unwrap();
    assert_eq!(rows[1].recipient_id, "R2");
    assert!(rows[1].read_at_millis.is_some());
    assert!(rows[1].delivered_at_millis.is_none());

    // Unknown recipient: discarded, no row created.
    h.coordinator
        .on_receive(ack("rep-1", "R3", "dev-a", AckType::Delivered), None)
        .await;
    assert_eq!(h.coordinator.statuses("rep-1").unwrap().len(), 2);

    let seen = &events;
    assert!(eventually(|| async move { seen.lock().len() == 2 }).await);
    assert!(events
        .lock()
        .iter()
        .all(|e| matches!(e, ReportEvent::StatusChanged(_))));
}

#[tokio::test]
async fn test_incoming_report_acked_then_read_once() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();

    let report = from(
        TacticalMessage::StatusReport(status_report("rep-9", &["dev-a"])),
        "HQ",
    );
    h.coordinator.on_receive(report.clone(), None).await;
    h.coordinator.on_receive(report, None).await;

    let sent = h.local.sent();
    assert_eq!(sent.len(), 1);
    let delivered = ReportAck::from_payload(ReportKind::StatusReport, &sent[0].0.payload).unwrap();
    assert_eq!(delivered.ack_type, AckType::Delivered);
    assert_eq!(delivered.to_device_id, "HQ");

    assert!(h.coordinator.mark_report_read("rep-9").await.unwrap());
    assert!(!h.coordinator.mark_report_read("rep-9").await.unwrap());

    let sent = h.local.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].0.kind, MessageKind::StatusReportAck);
    let read = ReportAck::from_payload(ReportKind::StatusReport, &sent[1].0.payload).unwrap();
    assert_eq!(read.ack_type, AckType::Read);
    assert_eq!(read.from_device_id, "dev-a");
}

#[tokio::test]
async fn test_mark_unknown_report_read() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    assert!(!h.coordinator.mark_report_read("nope").await.unwrap());
    assert!(h.local.sent().is_empty());
}

// ---------------------------------------------------------------------------
// Sealer
// ---------------------------------------------------------------------------

/// Moves the payload into `encrypted_payload` as a JSON string.
struct Stash;

impl EnvelopeSealer for Stash {
    fn seal(&self, envelope: &mut Envelope) -> Result<(), NetworkError> {
        let body = serde_json::to_string(&envelope.payload)
            .map_err(|e| NetworkError::Seal(e.to_string()))?;
        envelope.payload = Map::new();
        envelope.encrypted = true;
        envelope.encrypted_payload = Some(body);
        Ok(())
    }

    fn open(&self, envelope: &mut Envelope) -> Result<(), NetworkError> {
        let Some(body) = envelope.encrypted_payload.take() else {
            return Err(NetworkError::Seal("missing body".into()));
        };
        envelope.payload =
            serde_json::from_str(&body).map_err(|e| NetworkError::Seal(e.to_string()))?;
        envelope.encrypted = false;
        Ok(())
    }
}

#[tokio::test]
async fn test_sealer_runs_both_ways() {
    let h = harness("dev-a");
    h.coordinator.start().await.unwrap();
    h.coordinator.set_sealer(std::sync::Arc::new(Stash));

    h.coordinator.send_message(position()).await.unwrap();
    let sent = h.local.sent();
    assert!(sent[0].0.encrypted);
    assert!(sent[0].0.payload.is_empty());

    let mut sealed = from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "quiet")), "dev-b");
    Stash.seal(&mut sealed).unwrap();
    h.coordinator.on_receive(sealed, None).await;
    assert_eq!(h.coordinator.chats().len(), 1);

    // An envelope the sealer cannot open is dropped.
    let plain = from(TacticalMessage::Chat(ChatMessage::new("BRAVO", "loud")), "dev-b");
    h.coordinator.on_receive(plain, None).await;
    assert_eq!(h.coordinator.chats().len(), 1);
}
