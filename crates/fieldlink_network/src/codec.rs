//! Wire codecs for both links, plus the kind → topic map.
//!
//! The broker link carries a *flat* object: envelope fields are hoisted to
//! the top level and every payload key is merged in beside them. The local
//! link carries a *nested* object with the payload under `payload`. Both
//! decode into the same [`Envelope`].

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::CodecError;
use crate::message::{Envelope, MessageKind, now_millis};

const KEY_TYPE: &str = "type";
const KEY_DEVICE: &str = "deviceId";
const KEY_TS: &str = "ts";
const KEY_PAYLOAD: &str = "payload";
const KEY_SIGNATURE: &str = "signature";
const KEY_PUBLIC_KEY: &str = "publicKey";
const KEY_ENCRYPTED: &str = "encrypted";
const KEY_ENCRYPTED_PAYLOAD: &str = "encryptedPayload";

/// Wire name for the payload `type` field on the flat wire.
const KEY_NATO_TYPE: &str = "natoType";

/// Keys a payload may not use on the flat wire.
const RESERVED_FLAT_KEYS: [&str; 8] = [
    KEY_DEVICE,
    KEY_TS,
    KEY_SIGNATURE,
    KEY_PUBLIC_KEY,
    KEY_ENCRYPTED,
    KEY_ENCRYPTED_PAYLOAD,
    KEY_NATO_TYPE,
    KEY_PAYLOAD,
];

/// Timestamp fields in priority order.
const TIMESTAMP_KEYS: [&str; 3] = ["ts", "createdAtMillis", "timestamp"];

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Last topic level for a kind. Requests and acks share a topic with their
/// primary kind where the table pairs them.
pub fn topic_suffix(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Position => "pos",
        MessageKind::MarkerAdd | MessageKind::MarkerDelete => "pin",
        MessageKind::MarkerRequest => "pin_req",
        MessageKind::Profile => "profile",
        MessageKind::DiscoveryHello => "profile_req",
        MessageKind::Chat | MessageKind::ChatAck => "chat",
        MessageKind::Order => "order",
        MessageKind::OrderAck => "order_ack",
        MessageKind::StatusReport => "report",
        MessageKind::StatusReportAck => "report_ack",
        MessageKind::EmergencyNotice => "methane",
        MessageKind::EmergencyNoticeAck => "methane_ack",
        MessageKind::CasualtyHandover => "medevac",
        MessageKind::CasualtyHandoverAck => "medevac_ack",
        MessageKind::LinkedForm => "linkedform",
        MessageKind::Photo => "photo",
    }
}

/// Maps kinds to broker topics under `<namespace>/v1/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    prefix: String,
}

impl TopicMap {
    pub fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("{}/v1/", namespace.trim_end_matches('/')),
        }
    }

    pub fn topic_for(&self, kind: MessageKind) -> String {
        format!("{}{}", self.prefix, topic_suffix(kind))
    }

    /// Infer the kind of an inbound message from its topic.
    ///
    /// The topic decides the family. `wire_type` may pick another kind only
    /// when that kind lives on the same topic; anything else falls back to
    /// the topic's primary kind.
    pub fn kind_for_topic(
        &self,
        topic: &str,
        wire_type: Option<&str>,
    ) -> Result<MessageKind, CodecError> {
        let suffix = topic
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| CodecError::UnknownTopic(topic.to_string()))?;

        let mut family = MessageKind::ALL
            .into_iter()
            .filter(|k| topic_suffix(*k) == suffix);
        let primary = family
            .next()
            .ok_or_else(|| CodecError::UnknownTopic(topic.to_string()))?;

        let Some(wire_type) = wire_type else {
            return Ok(primary);
        };
        match MessageKind::from_wire_name(wire_type) {
            Some(kind) if topic_suffix(kind) == suffix => Ok(kind),
            _ => {
                debug!("Ignoring type `{wire_type}` outside topic {topic}; using {primary}");
                Ok(primary)
            }
        }
    }

    /// The full fixed subscription set, one entry per distinct topic.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for kind in MessageKind::ALL {
            let topic = self.topic_for(kind);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// First timestamp found in `map` by priority: `ts`, `createdAtMillis`,
/// `timestamp`. Accepts integers and floats.
pub fn extract_timestamp(map: &Map<String, Value>) -> Option<i64> {
    TIMESTAMP_KEYS.iter().find_map(|key| {
        let value = map.get(*key)?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    })
}

// ---------------------------------------------------------------------------
// Shared envelope fields
// ---------------------------------------------------------------------------

fn write_header(out: &mut Map<String, Value>, envelope: &Envelope) {
    out.insert(KEY_TYPE.into(), Value::from(envelope.kind.wire_name()));
    out.insert(KEY_DEVICE.into(), Value::from(envelope.origin_device_id.clone()));
    out.insert(KEY_TS.into(), Value::from(envelope.timestamp_millis));
    if let Some(signature) = &envelope.signature {
        out.insert(KEY_SIGNATURE.into(), Value::from(signature.clone()));
    }
    if let Some(public_key) = &envelope.public_key {
        out.insert(KEY_PUBLIC_KEY.into(), Value::from(public_key.clone()));
    }
    if envelope.encrypted {
        out.insert(KEY_ENCRYPTED.into(), Value::Bool(true));
    }
    if let Some(encrypted_payload) = &envelope.encrypted_payload {
        out.insert(
            KEY_ENCRYPTED_PAYLOAD.into(),
            Value::from(encrypted_payload.clone()),
        );
    }
}

struct Header {
    origin_device_id: String,
    signature: Option<String>,
    public_key: Option<String>,
    encrypted: bool,
    encrypted_payload: Option<String>,
}

/// Remove and return the envelope fields other than `type` and `ts`.
fn take_header(map: &mut Map<String, Value>) -> Result<Header, CodecError> {
    let origin_device_id = match map.remove(KEY_DEVICE) {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => return Err(CodecError::MissingField(KEY_DEVICE)),
    };
    let take_string = |map: &mut Map<String, Value>, key: &str| match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let signature = take_string(map, KEY_SIGNATURE);
    let public_key = take_string(map, KEY_PUBLIC_KEY);
    let encrypted_payload = take_string(map, KEY_ENCRYPTED_PAYLOAD);
    let encrypted = map
        .remove(KEY_ENCRYPTED)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(Header {
        origin_device_id,
        signature,
        public_key,
        encrypted,
        encrypted_payload,
    })
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, CodecError> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(CodecError::NotAnObject),
    }
}

fn assemble(
    kind: MessageKind,
    header: Header,
    timestamp: Option<i64>,
    payload: Map<String, Value>,
) -> Envelope {
    Envelope {
        kind,
        origin_device_id: header.origin_device_id,
        timestamp_millis: timestamp.unwrap_or_else(now_millis),
        payload,
        signature: header.signature,
        public_key: header.public_key,
        encrypted: header.encrypted,
        encrypted_payload: header.encrypted_payload,
    }
}

// ---------------------------------------------------------------------------
// Flat (broker) wire
// ---------------------------------------------------------------------------

/// Serialize an envelope for the broker link.
pub fn encode_flat(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut out = Map::new();
    for (key, value) in &envelope.payload {
        if RESERVED_FLAT_KEYS.contains(&key.as_str()) {
            return Err(CodecError::ReservedKey(key.clone()));
        }
        let wire_key = if key == KEY_TYPE { KEY_NATO_TYPE } else { key.as_str() };
        out.insert(wire_key.to_string(), value.clone());
    }
    write_header(&mut out, envelope);
    Ok(serde_json::to_vec(&Value::Object(out))?)
}

/// Parse a broker message received on `topic`.
pub fn decode_flat(bytes: &[u8], topic: &str, topics: &TopicMap) -> Result<Envelope, CodecError> {
    let mut map = parse_object(bytes)?;

    let wire_type = match map.remove(KEY_TYPE) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let kind = topics.kind_for_topic(topic, wire_type.as_deref())?;
    let timestamp = extract_timestamp(&map);
    map.remove(KEY_TS);
    let header = take_header(&mut map)?;

    if let Some(nato_type) = map.remove(KEY_NATO_TYPE) {
        map.insert(KEY_TYPE.into(), nato_type);
    }

    Ok(assemble(kind, header, timestamp, map))
}

// ---------------------------------------------------------------------------
// Nested (local) wire
// ---------------------------------------------------------------------------

/// Serialize an envelope for the local link.
pub fn encode_nested(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut out = Map::new();
    write_header(&mut out, envelope);
    out.insert(KEY_PAYLOAD.into(), Value::Object(envelope.payload.clone()));
    Ok(serde_json::to_vec(&Value::Object(out))?)
}

/// Parse a local-link datagram.
pub fn decode_nested(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let mut map = parse_object(bytes)?;

    let kind = match map.remove(KEY_TYPE) {
        Some(Value::String(name)) => {
            MessageKind::from_wire_name(&name).ok_or(CodecError::UnknownKind(name))?
        }
        _ => return Err(CodecError::MissingField(KEY_TYPE)),
    };
    let payload = match map.remove(KEY_PAYLOAD) {
        Some(Value::Object(payload)) => payload,
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(CodecError::NotAnObject),
    };
    let timestamp = extract_timestamp(&map).or_else(|| extract_timestamp(&payload));
    let header = take_header(&mut map)?;

    Ok(assemble(kind, header, timestamp, payload))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
