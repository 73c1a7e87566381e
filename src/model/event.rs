//! Normalized activity event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Canonical event type.
///
/// Producers have spelled these several ways over time ("activity.created",
/// "ACTIVITY.CREATED", "Created"). Everything is folded into the three
/// canonical values on deserialization; anything else is kept, uppercased, as
/// [`EventType::Unknown`] so the projector can reject it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Unknown(String),
}

impl EventType {
    /// Map a producer spelling onto the canonical type (case-insensitive).
    pub fn canonicalize(raw: &str) -> Self {
        // The bare verbs are this type's own serialized form ("CREATE"); they
        // must read back as the known variant, not as an unknown pass-through.
        match raw.trim().to_ascii_lowercase().as_str() {
            "activity.created" | "created" | "create" => Self::Create,
            "activity.updated" | "updated" | "update" => Self::Update,
            "activity.deleted" | "deleted" | "delete" => Self::Delete,
            _ => Self::Unknown(raw.trim().to_uppercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown(raw) => raw,
        }
    }

    /// Outbox `event_type` column value for this type.
    pub fn outbox_name(&self) -> String {
        match self {
            Self::Create => "activity.created".to_string(),
            Self::Update => "activity.updated".to_string(),
            Self::Delete => "activity.deleted".to_string(),
            Self::Unknown(raw) => format!("activity.{}", raw.to_ascii_lowercase()),
        }
    }
}

impl From<String> for EventType {
    fn from(raw: String) -> Self {
        Self::canonicalize(&raw)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized domain event for one activity.
///
/// The display fields (`employee_name`, `urgency_title`, `urgency_level`) are
/// denormalized by the producer so the read side never has to join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(alias = "aggregate_id", deserialize_with = "lenient_id")]
    pub aggregate_id: u64,
    #[serde(default, alias = "urgency_id", deserialize_with = "lenient_id")]
    pub urgency_id: u64,
    #[serde(default, alias = "employee_id", deserialize_with = "lenient_id")]
    pub employee_id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "employee_name")]
    pub employee_name: String,
    #[serde(default, alias = "urgency_title")]
    pub urgency_title: String,
    #[serde(default, alias = "urgency_level")]
    pub urgency_level: String,
}

impl DomainEvent {
    /// Read-store key for this event's aggregate.
    pub fn read_key(&self) -> String {
        self.aggregate_id.to_string()
    }
}

/// Accept ids as JSON numbers or as digit-only strings.
///
/// Anything else (negative numbers, "activity-12", floats) fails, which makes
/// the enclosing strategy not match.
fn lenient_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => Ok(n),
        RawId::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id: {s:?}"))),
    }
}
