use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Symbolic event tag. Baseline tags are closed; anything else must live in
/// the `custom:` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Op,
    Cursor,
    Presence,
    Metric,
    Status,
    /// Full tag including the `custom:` prefix.
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Op => "op",
            Self::Cursor => "cursor",
            Self::Presence => "presence",
            Self::Metric => "metric",
            Self::Status => "status",
            Self::Custom(tag) => tag,
        }
    }

    pub fn is_baseline(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// Coalescing applies only to state-overwrite tags: an old cursor
    /// position or presence ping carries no value once a newer one exists.
    pub fn coalescible(&self) -> bool {
        matches!(self, Self::Cursor | Self::Presence)
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "op" => Self::Op,
            "cursor" => Self::Cursor,
            "presence" => Self::Presence,
            "metric" => Self::Metric,
            "status" => Self::Status,
            _ => Self::Custom(tag),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_owned()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit the system carries end to end.
///
/// `data` stays in serialized form: the plane only routes on the headers,
/// so the payload is never re-parsed on the hot path.
///
/// ```
/// use relay_common::{EventEnvelope, EventType, Principal};
///
/// let data = serde_json::value::to_raw_value(&serde_json::json!({"n": 1})).expect("raw");
/// let env = EventEnvelope::seal(&Principal::new("u1", "t1"), "doc:123", EventType::Metric, data, None);
/// assert_eq!(env.seq, 0);
/// assert_eq!(env.sender_id, "u1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: Uuid,
    pub topic_id: String,
    pub tenant_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Box<RawValue>,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl EventEnvelope {
    /// Seal a new envelope from authenticated context. `seq` starts at 0 and
    /// is overwritten by the topic manager at append time; a zero `seq`
    /// never reaches subscribers.
    pub fn seal(
        principal: &crate::Principal,
        topic_id: impl Into<String>,
        event_type: EventType,
        data: Box<RawValue>,
        priority: Option<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic_id: topic_id.into(),
            tenant_id: principal.tenant_id.clone(),
            sender_id: principal.user_id.clone(),
            event_type,
            data,
            seq: 0,
            ts: Utc::now(),
            priority,
        }
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_wire(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
