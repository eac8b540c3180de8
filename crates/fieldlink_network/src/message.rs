//! Message envelope: the wire-neutral unit of transport.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of message kinds carried in an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    // ── Situational awareness ──────────────────────────────────────
    /// Periodic position update.
    #[serde(rename = "pos")]
    Position,
    /// Map marker created or updated.
    #[serde(rename = "pin")]
    MarkerAdd,
    /// Map marker removed.
    #[serde(rename = "pin_delete")]
    MarkerDelete,
    /// Ask peers to publish all of their markers.
    #[serde(rename = "pin_req")]
    MarkerRequest,
    /// Operator profile.
    #[serde(rename = "profile")]
    Profile,
    /// Discovery hello; peers answer with their profile.
    #[serde(rename = "hello")]
    DiscoveryHello,

    // ── Chat ────────────────────────────────────────────────────────
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "chat_ack")]
    ChatAck,

    // ── Reports (recipient-tracked) ─────────────────────────────────
    #[serde(rename = "order")]
    Order,
    #[serde(rename = "order_ack")]
    OrderAck,
    #[serde(rename = "report")]
    StatusReport,
    #[serde(rename = "report_ack")]
    StatusReportAck,
    /// METHANE emergency notice.
    #[serde(rename = "methane")]
    EmergencyNotice,
    #[serde(rename = "methane_ack")]
    EmergencyNoticeAck,
    /// MEDEVAC casualty handover.
    #[serde(rename = "medevac")]
    CasualtyHandover,
    #[serde(rename = "medevac_ack")]
    CasualtyHandoverAck,

    // ── Attachments ─────────────────────────────────────────────────
    #[serde(rename = "linkedform")]
    LinkedForm,
    #[serde(rename = "photo")]
    Photo,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 18] = [
        Self::Position,
        Self::MarkerAdd,
        Self::MarkerDelete,
        Self::MarkerRequest,
        Self::Profile,
        Self::DiscoveryHello,
        Self::Chat,
        Self::ChatAck,
        Self::Order,
        Self::OrderAck,
        Self::StatusReport,
        Self::StatusReportAck,
        Self::EmergencyNotice,
        Self::EmergencyNoticeAck,
        Self::CasualtyHandover,
        Self::CasualtyHandoverAck,
        Self::LinkedForm,
        Self::Photo,
    ];

    /// The value of the wire `type` field.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Position => "pos",
            Self::MarkerAdd => "pin",
            Self::MarkerDelete => "pin_delete",
            Self::MarkerRequest => "pin_req",
            Self::Profile => "profile",
            Self::DiscoveryHello => "hello",
            Self::Chat => "chat",
            Self::ChatAck => "chat_ack",
            Self::Order => "order",
            Self::OrderAck => "order_ack",
            Self::StatusReport => "report",
            Self::StatusReportAck => "report_ack",
            Self::EmergencyNotice => "methane",
            Self::EmergencyNoticeAck => "methane_ack",
            Self::CasualtyHandover => "medevac",
            Self::CasualtyHandoverAck => "medevac_ack",
            Self::LinkedForm => "linkedform",
            Self::Photo => "photo",
        }
    }

    /// Parse a wire `type` value.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_name() == name)
    }

    /// The report family this kind belongs to, for reports and their acks.
    pub fn report_kind(&self) -> Option<ReportKind> {
        match self {
            Self::Order | Self::OrderAck => Some(ReportKind::Order),
            Self::StatusReport | Self::StatusReportAck => Some(ReportKind::StatusReport),
            Self::EmergencyNotice | Self::EmergencyNoticeAck => Some(ReportKind::EmergencyNotice),
            Self::CasualtyHandover | Self::CasualtyHandoverAck => {
                Some(ReportKind::CasualtyHandover)
            }
            _ => None,
        }
    }

    /// Whether this is one of the four recipient-tracked report kinds.
    pub fn is_report(&self) -> bool {
        matches!(
            self,
            Self::Order | Self::StatusReport | Self::EmergencyNotice | Self::CasualtyHandover
        )
    }

    /// Whether this is an acknowledgment of a report.
    pub fn is_report_ack(&self) -> bool {
        matches!(
            self,
            Self::OrderAck
                | Self::StatusReportAck
                | Self::EmergencyNoticeAck
                | Self::CasualtyHandoverAck
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The four report-like kinds that carry a recipient list and take part in
/// the delivered/read acknowledgment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Order,
    StatusReport,
    EmergencyNotice,
    CasualtyHandover,
}

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        Self::Order,
        Self::StatusReport,
        Self::EmergencyNotice,
        Self::CasualtyHandover,
    ];

    /// The kind carrying the report itself.
    pub fn message_kind(&self) -> MessageKind {
        match self {
            Self::Order => MessageKind::Order,
            Self::StatusReport => MessageKind::StatusReport,
            Self::EmergencyNotice => MessageKind::EmergencyNotice,
            Self::CasualtyHandover => MessageKind::CasualtyHandover,
        }
    }

    /// The kind carrying acknowledgments for this report.
    pub fn ack_kind(&self) -> MessageKind {
        match self {
            Self::Order => MessageKind::OrderAck,
            Self::StatusReport => MessageKind::StatusReportAck,
            Self::EmergencyNotice => MessageKind::EmergencyNoticeAck,
            Self::CasualtyHandover => MessageKind::CasualtyHandoverAck,
        }
    }

    /// Payload field that holds the report id, both in the report and in
    /// its acks. Correlation depends on this matching exactly.
    pub fn id_field(&self) -> &'static str {
        match self {
            Self::Order => "orderId",
            Self::StatusReport => "reportId",
            Self::EmergencyNotice => "methaneId",
            Self::CasualtyHandover => "medevacId",
        }
    }

    /// Older senders use these names for the id field.
    pub fn id_field_aliases(&self) -> &'static [&'static str] {
        match self {
            Self::EmergencyNotice => &["requestId"],
            _ => &[],
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.message_kind().wire_name() == name)
    }

    pub fn wire_name(&self) -> &'static str {
        self.message_kind().wire_name()
    }
}

/// A transport envelope carrying a kind-specific payload.
///
/// `payload` keys are never validated here; each handler checks its own
/// required fields when it decodes the typed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Device id of the sender.
    pub origin_device_id: String,
    /// Sender-side send time, used by the age filter.
    pub timestamp_millis: i64,
    pub payload: Map<String, Value>,
    /// Populated only when the signing collaborator is engaged.
    pub signature: Option<String>,
    pub public_key: Option<String>,
    pub encrypted: bool,
    pub encrypted_payload: Option<String>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(
        kind: MessageKind,
        origin_device_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind,
            origin_device_id: origin_device_id.into(),
            timestamp_millis: now_millis(),
            payload,
            signature: None,
            public_key: None,
            encrypted: false,
            encrypted_payload: None,
        }
    }

    /// Override the send timestamp.
    pub fn with_timestamp(mut self, timestamp_millis: i64) -> Self {
        self.timestamp_millis = timestamp_millis;
        self
    }

    /// Read a string payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
