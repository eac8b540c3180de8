//! Typed payloads: one strongly-typed record per message kind.
//!
//! Envelopes carry an open JSON map so that both links can move them
//! unchanged. Handlers never read that map directly: they decode it into the
//! record for their kind through [`TacticalMessage::decode`] (or
//! [`decode_payload`] when the kind is already known), and a missing
//! required field surfaces as [`PayloadError::MissingField`] instead of a
//! silent default.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PayloadError;
use crate::message::{Envelope, MessageKind, ReportKind, now_millis};

/// A record bound to exactly one message kind.
pub trait KindPayload: Serialize + DeserializeOwned {
    const KIND: MessageKind;
}

/// A report-like record carrying an explicit recipient list.
pub trait Report: KindPayload + Clone + Send + Sync + 'static {
    const REPORT_KIND: ReportKind;

    fn report_id(&self) -> &str;
    fn recipients(&self) -> &[String];
}

/// Decode the payload of `envelope` as `T`, checking the kind first.
pub fn decode_payload<T: KindPayload>(envelope: &Envelope) -> Result<T, PayloadError> {
    if envelope.kind != T::KIND {
        return Err(PayloadError::WrongKind {
            expected: T::KIND,
            actual: envelope.kind,
        });
    }
    serde_json::from_value(Value::Object(envelope.payload.clone()))
        .map_err(|e| PayloadError::from_serde(T::KIND, e))
}

/// Serialize a record into a payload map.
pub fn encode_payload<T: KindPayload>(record: &T) -> Result<Map<String, Value>, PayloadError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(PayloadError::Malformed {
            kind: T::KIND,
            reason: format!("record serialized to {other}, not an object"),
        }),
        Err(e) => Err(PayloadError::from_serde(T::KIND, e)),
    }
}

macro_rules! bind_kind {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl KindPayload for $ty {
            const KIND: MessageKind = MessageKind::$kind;
        })*
    };
}

// ---------------------------------------------------------------------------
// Situational awareness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub callsign: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// A map marker. `nato_type` travels as `type` in the payload map and is
/// renamed to `natoType` on the flat broker wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMarker {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "type")]
    pub nato_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: String,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerDelete {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerRequest {
    pub callsign: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub callsign: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Profile {
    pub fn for_callsign(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            nickname: None,
            unit: None,
            role: None,
            phone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryHello {
    pub callsign: String,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub from_callsign: String,
    pub text: String,
    /// Direct recipient; `None` means the message is for everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub created_at_millis: i64,
}

impl ChatMessage {
    pub fn new(from_callsign: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from_callsign: from_callsign.into(),
            text: text.into(),
            to_device_id: None,
            thread_id: None,
            created_at_millis: now_millis(),
        }
    }

    pub fn to_device(mut self, device_id: impl Into<String>) -> Self {
        self.to_device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    pub message_id: String,
    pub from_device_id: String,
    pub timestamp_millis: i64,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub sender_callsign: String,
    pub recipients: Vec<String>,
    pub order_type: String,
    #[serde(default)]
    pub situation: String,
    pub mission: String,
    #[serde(default)]
    pub execution: String,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub report_id: String,
    pub sender_callsign: String,
    pub recipients: Vec<String>,
    /// Readiness label, e.g. `GREEN`, `AMBER`, `RED`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personnel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ammunition: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at_millis: i64,
}

/// METHANE emergency notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyNotice {
    #[serde(alias = "requestId")]
    pub methane_id: String,
    pub sender_callsign: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub major_incident: bool,
    pub exact_location: String,
    pub incident_type: String,
    #[serde(default)]
    pub hazards: String,
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub casualties: u32,
    #[serde(default)]
    pub services: Vec<String>,
    pub created_at_millis: i64,
}

/// MEDEVAC casualty handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasualtyHandover {
    pub medevac_id: String,
    pub sender_callsign: String,
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub mechanism: String,
    pub injuries: String,
    #[serde(default)]
    pub signs: String,
    #[serde(default)]
    pub treatment: String,
    /// Evacuation priority, e.g. `URGENT`, `PRIORITY`, `ROUTINE`.
    pub priority: String,
    pub created_at_millis: i64,
}

macro_rules! impl_report {
    ($ty:ty, $kind:ident, $id:ident) => {
        impl Report for $ty {
            const REPORT_KIND: ReportKind = ReportKind::$kind;

            fn report_id(&self) -> &str {
                &self.$id
            }

            fn recipients(&self) -> &[String] {
                &self.recipients
            }
        }
    };
}

impl_report!(Order, Order, order_id);
impl_report!(StatusReport, StatusReport, report_id);
impl_report!(EmergencyNotice, EmergencyNotice, methane_id);
impl_report!(CasualtyHandover, CasualtyHandover, medevac_id);

// ---------------------------------------------------------------------------
// Report acknowledgments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckType {
    Delivered,
    Read,
}

impl AckType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
        }
    }
}

/// A delivered/read acknowledgment for one report and one recipient.
///
/// The id field name depends on the report kind (see
/// [`ReportKind::id_field`]), so this type is mapped by hand rather than
/// through derive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportAck {
    pub report_kind: ReportKind,
    pub report_id: String,
    /// The recipient acknowledging.
    pub from_device_id: String,
    /// The original report sender.
    pub to_device_id: String,
    pub ack_type: AckType,
    pub timestamp_millis: i64,
}

impl ReportAck {
    pub fn new(
        report_kind: ReportKind,
        report_id: impl Into<String>,
        from_device_id: impl Into<String>,
        to_device_id: impl Into<String>,
        ack_type: AckType,
    ) -> Self {
        Self {
            report_kind,
            report_id: report_id.into(),
            from_device_id: from_device_id.into(),
            to_device_id: to_device_id.into(),
            ack_type,
            timestamp_millis: now_millis(),
        }
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            self.report_kind.id_field().to_string(),
            Value::from(self.report_id.clone()),
        );
        map.insert("fromDeviceId".into(), Value::from(self.from_device_id.clone()));
        map.insert("toDeviceId".into(), Value::from(self.to_device_id.clone()));
        map.insert(
            "ackType".into(),
            Value::from(self.ack_type.wire_name()),
        );
        map.insert("timestampMillis".into(), Value::from(self.timestamp_millis));
        map
    }

    pub fn from_payload(
        report_kind: ReportKind,
        payload: &Map<String, Value>,
    ) -> Result<Self, PayloadError> {
        let kind = report_kind.ack_kind();
        let missing = |field: &str| PayloadError::MissingField {
            kind,
            field: field.to_string(),
        };
        let string_field = |field: &'static str| {
            payload
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| missing(field))
        };

        let report_id = std::iter::once(report_kind.id_field())
            .chain(report_kind.id_field_aliases().iter().copied())
            .find_map(|field| payload.get(field).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| missing(report_kind.id_field()))?;

        let ack_type = payload
            .get("ackType")
            .ok_or_else(|| missing("ackType"))
            .and_then(|v| {
                serde_json::from_value::<AckType>(v.clone()).map_err(|e| {
                    PayloadError::Malformed {
                        kind,
                        reason: format!("ackType: {e}"),
                    }
                })
            })?;

        let timestamp_millis = payload
            .get("timestampMillis")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("timestampMillis"))?;

        Ok(Self {
            report_kind,
            report_id,
            from_device_id: string_field("fromDeviceId")?,
            to_device_id: string_field("toDeviceId")?,
            ack_type,
            timestamp_millis,
        })
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// A form (e.g. a SALUTE or range card) linked to a marker or order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedForm {
    pub id: String,
    pub form_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_id: Option<String>,
    /// Form contents as a JSON document string.
    pub form_data: String,
    #[serde(default)]
    pub callsign: String,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: String,
    pub callsign: String,
    pub image_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    pub created_at_millis: i64,
}

bind_kind! {
    PositionUpdate => Position,
    MapMarker => MarkerAdd,
    MarkerDelete => MarkerDelete,
    MarkerRequest => MarkerRequest,
    Profile => Profile,
    DiscoveryHello => DiscoveryHello,
    ChatMessage => Chat,
    ChatAck => ChatAck,
    Order => Order,
    StatusReport => StatusReport,
    EmergencyNotice => EmergencyNotice,
    CasualtyHandover => CasualtyHandover,
    LinkedForm => LinkedForm,
    Photo => Photo,
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// Every message the core understands, one variant per kind (the four
/// report acks share [`ReportAck`]).
#[derive(Debug, Clone, PartialEq)]
pub enum TacticalMessage {
    Position(PositionUpdate),
    MarkerAdd(MapMarker),
    MarkerDelete(MarkerDelete),
    MarkerRequest(MarkerRequest),
    Profile(Profile),
    DiscoveryHello(DiscoveryHello),
    Chat(ChatMessage),
    ChatAck(ChatAck),
    Order(Order),
    StatusReport(StatusReport),
    EmergencyNotice(EmergencyNotice),
    CasualtyHandover(CasualtyHandover),
    ReportAck(ReportAck),
    LinkedForm(LinkedForm),
    Photo(Photo),
}

impl TacticalMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Position(_) => MessageKind::Position,
            Self::MarkerAdd(_) => MessageKind::MarkerAdd,
            Self::MarkerDelete(_) => MessageKind::MarkerDelete,
            Self::MarkerRequest(_) => MessageKind::MarkerRequest,
            Self::Profile(_) => MessageKind::Profile,
            Self::DiscoveryHello(_) => MessageKind::DiscoveryHello,
            Self::Chat(_) => MessageKind::Chat,
            Self::ChatAck(_) => MessageKind::ChatAck,
            Self::Order(_) => MessageKind::Order,
            Self::StatusReport(_) => MessageKind::StatusReport,
            Self::EmergencyNotice(_) => MessageKind::EmergencyNotice,
            Self::CasualtyHandover(_) => MessageKind::CasualtyHandover,
            Self::ReportAck(ack) => ack.report_kind.ack_kind(),
            Self::LinkedForm(_) => MessageKind::LinkedForm,
            Self::Photo(_) => MessageKind::Photo,
        }
    }

    /// Kind-dispatched decoder.
    pub fn decode(envelope: &Envelope) -> Result<Self, PayloadError> {
        Ok(match envelope.kind {
            MessageKind::Position => Self::Position(decode_payload(envelope)?),
            MessageKind::MarkerAdd => Self::MarkerAdd(decode_payload(envelope)?),
            MessageKind::MarkerDelete => Self::MarkerDelete(decode_payload(envelope)?),
            MessageKind::MarkerRequest => Self::MarkerRequest(decode_payload(envelope)?),
            MessageKind::Profile => Self::Profile(decode_payload(envelope)?),
            MessageKind::DiscoveryHello => Self::DiscoveryHello(decode_payload(envelope)?),
            MessageKind::Chat => Self::Chat(decode_payload(envelope)?),
            MessageKind::ChatAck => Self::ChatAck(decode_payload(envelope)?),
            MessageKind::Order => Self::Order(decode_payload(envelope)?),
            MessageKind::StatusReport => Self::StatusReport(decode_payload(envelope)?),
            MessageKind::EmergencyNotice => Self::EmergencyNotice(decode_payload(envelope)?),
            MessageKind::CasualtyHandover => Self::CasualtyHandover(decode_payload(envelope)?),
            MessageKind::OrderAck
            | MessageKind::StatusReportAck
            | MessageKind::EmergencyNoticeAck
            | MessageKind::CasualtyHandoverAck => {
                let report_kind =
                    envelope
                        .kind
                        .report_kind()
                        .ok_or_else(|| PayloadError::Malformed {
                            kind: envelope.kind,
                            reason: "ack kind without a report family".into(),
                        })?;
                Self::ReportAck(ReportAck::from_payload(report_kind, &envelope.payload)?)
            }
            MessageKind::LinkedForm => Self::LinkedForm(decode_payload(envelope)?),
            MessageKind::Photo => Self::Photo(decode_payload(envelope)?),
        })
    }

    pub fn to_payload(&self) -> Result<Map<String, Value>, PayloadError> {
        match self {
            Self::Position(r) => encode_payload(r),
            Self::MarkerAdd(r) => encode_payload(r),
            Self::MarkerDelete(r) => encode_payload(r),
            Self::MarkerRequest(r) => encode_payload(r),
            Self::Profile(r) => encode_payload(r),
            Self::DiscoveryHello(r) => encode_payload(r),
            Self::Chat(r) => encode_payload(r),
            Self::ChatAck(r) => encode_payload(r),
            Self::Order(r) => encode_payload(r),
            Self::StatusReport(r) => encode_payload(r),
            Self::EmergencyNotice(r) => encode_payload(r),
            Self::CasualtyHandover(r) => encode_payload(r),
            Self::ReportAck(ack) => Ok(ack.to_payload()),
            Self::LinkedForm(r) => encode_payload(r),
            Self::Photo(r) => encode_payload(r),
        }
    }

    /// Wrap in an envelope from `origin_device_id`, stamped now.
    pub fn into_envelope(&self, origin_device_id: &str) -> Result<Envelope, PayloadError> {
        Ok(Envelope::new(self.kind(), origin_device_id, self.to_payload()?))
    }

    /// `(report kind, report id, recipients)` for the four report kinds.
    pub fn report_parts(&self) -> Option<(ReportKind, &str, &[String])> {
        fn parts<R: Report>(r: &R) -> (ReportKind, &str, &[String]) {
            (R::REPORT_KIND, r.report_id(), r.recipients())
        }
        match self {
            Self::Order(r) => Some(parts(r)),
            Self::StatusReport(r) => Some(parts(r)),
            Self::EmergencyNotice(r) => Some(parts(r)),
            Self::CasualtyHandover(r) => Some(parts(r)),
            _ => None,
        }
    }

    /// Device ids this message is explicitly addressed to, if any.
    pub fn recipients(&self) -> Vec<String> {
        match self {
            Self::Chat(chat) => chat.to_device_id.iter().cloned().collect(),
            Self::ReportAck(ack) => vec![ack.to_device_id.clone()],
            _ => self
                .report_parts()
                .map(|(_, _, recipients)| recipients.to_vec())
                .unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
