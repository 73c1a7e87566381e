//! Multi-strategy event parser.
//!
//! Producers and message formats evolved over time, so an inbound payload may
//! be any of:
//!
//! | Shape | Example |
//! |-------|---------|
//! | Envelope | `{"eventType":..,"aggregateId":..,"eventData":{..}}` |
//! | Envelope, quoted data | `{"eventType":..,"eventData":"{\"type\":..}"}` |
//! | Legacy | the normalized event object itself |
//!
//! and each shape may arrive wrapped as a JSON string (quoted once) and/or
//! base64 (padded or unpadded). Strategies are tried in a fixed order and the
//! first match wins, so the same bytes always resolve to the same strategy:
//!
//! 1. envelope, then legacy, on the raw payload
//! 2. the same on the payload unquoted once
//! 3. the same (plus the quoted variant) on standard base64
//! 4. the same (plus the quoted variant) on unpadded base64
//!
//! A decoded event with aggregate id 0 never matches. There is deliberately no
//! attempt to recover the id from transport attributes or the envelope's
//! string `aggregateId`: a zero id is a producer bug and must surface.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::bus::EVENT_TYPE_ATTR;
use crate::model::{DomainEvent, EventType};

/// Errors returned when no strategy produced an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Empty payload")]
    Empty,

    #[error("Payload decoded but aggregate id is zero or missing")]
    MissingAggregateId,

    #[error("Unrecognized payload ({len} bytes) after all strategies")]
    Unrecognized { len: usize },
}

/// How the payload was wrapped around the JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wrapping {
    Plain,
    Quoted,
    Base64,
    Base64Quoted,
    Base64Raw,
    Base64RawQuoted,
}

impl Wrapping {
    fn prefix(self) -> &'static str {
        match self {
            Self::Plain => "",
            Self::Quoted => "quoted/",
            Self::Base64 => "base64/",
            Self::Base64Quoted => "base64/quoted/",
            Self::Base64Raw => "base64-raw/",
            Self::Base64RawQuoted => "base64-raw/quoted/",
        }
    }
}

/// Which document shape matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Envelope,
    EnvelopeQuotedData,
    Legacy,
}

impl Shape {
    fn label(self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::EnvelopeQuotedData => "envelope-quoted-data",
            Self::Legacy => "legacy",
        }
    }
}

/// The strategy that resolved a payload. `Display` gives the log label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Strategy {
    pub wrapping: Wrapping,
    pub shape: Shape,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.wrapping.prefix(), self.shape.label())
    }
}

/// A successfully parsed message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event: DomainEvent,
    pub strategy: Strategy,
}

/// Parse an inbound payload into a normalized event.
///
/// `attributes` are the transport attributes. They are never used to fill in
/// missing data; a disagreeing `eventType` attribute is only logged.
pub fn parse(
    payload: &[u8],
    attributes: &HashMap<String, String>,
) -> Result<ParsedEvent, ParseError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let mut zero_id_seen = false;
    let Some(parsed) = resolve(payload, &mut zero_id_seen) else {
        return Err(if zero_id_seen {
            ParseError::MissingAggregateId
        } else {
            ParseError::Unrecognized {
                len: payload.len(),
            }
        });
    };

    if let Some(attr) = attributes.get(EVENT_TYPE_ATTR) {
        let attr_type = EventType::canonicalize(attr);
        if attr_type != parsed.event.event_type {
            warn!(
                attribute = %attr,
                parsed = %parsed.event.event_type,
                strategy = %parsed.strategy,
                "eventType attribute disagrees with payload"
            );
        }
    }

    Ok(parsed)
}

fn resolve(payload: &[u8], zero_id_seen: &mut bool) -> Option<ParsedEvent> {
    if let Some(parsed) = try_shapes(payload, Wrapping::Plain, zero_id_seen) {
        return Some(parsed);
    }

    if let Some(inner) = unquote(payload) {
        if let Some(parsed) = try_shapes(&inner, Wrapping::Quoted, zero_id_seen) {
            return Some(parsed);
        }
    }

    let trimmed = payload.trim_ascii();
    let engines = [
        (&STANDARD, Wrapping::Base64, Wrapping::Base64Quoted),
        (&STANDARD_NO_PAD, Wrapping::Base64Raw, Wrapping::Base64RawQuoted),
    ];
    for (engine, wrapping, quoted_wrapping) in engines {
        let Ok(decoded) = engine.decode(trimmed) else {
            continue;
        };
        if let Some(parsed) = try_shapes(&decoded, wrapping, zero_id_seen) {
            return Some(parsed);
        }
        if let Some(inner) = unquote(&decoded) {
            if let Some(parsed) = try_shapes(&inner, quoted_wrapping, zero_id_seen) {
                return Some(parsed);
            }
        }
    }

    None
}

/// Outcome of one shape decoder.
enum Decoded {
    Match(DomainEvent, Shape),
    ZeroId,
    NoMatch,
}

fn try_shapes(bytes: &[u8], wrapping: Wrapping, zero_id_seen: &mut bool) -> Option<ParsedEvent> {
    for decoder in [decode_envelope, decode_legacy] {
        match decoder(bytes) {
            Decoded::Match(event, shape) => {
                return Some(ParsedEvent {
                    event,
                    strategy: Strategy { wrapping, shape },
                })
            }
            Decoded::ZeroId => *zero_id_seen = true,
            Decoded::NoMatch => {}
        }
    }
    None
}

/// Envelope fields we care about. Unknown fields are ignored.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default, alias = "event_type")]
    event_type: Option<String>,
    #[serde(default, alias = "event_data")]
    event_data: Option<Value>,
}

fn decode_envelope(bytes: &[u8]) -> Decoded {
    let Ok(envelope) = serde_json::from_slice::<RawEnvelope>(bytes) else {
        return Decoded::NoMatch;
    };

    let (data, shape) = match envelope.event_data {
        Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
            Ok(inner) => (inner, Shape::EnvelopeQuotedData),
            Err(_) => return Decoded::NoMatch,
        },
        Some(data @ Value::Object(_)) => (data, Shape::Envelope),
        _ => return Decoded::NoMatch,
    };

    let Value::Object(mut fields) = data else {
        return Decoded::NoMatch;
    };
    if !fields.contains_key("type") {
        if let Some(event_type) = envelope.event_type {
            fields.insert("type".to_string(), Value::String(event_type));
        }
    }

    match serde_json::from_value::<DomainEvent>(Value::Object(fields)) {
        Ok(event) if event.aggregate_id == 0 => Decoded::ZeroId,
        Ok(event) => Decoded::Match(event, shape),
        Err(_) => Decoded::NoMatch,
    }
}

fn decode_legacy(bytes: &[u8]) -> Decoded {
    match serde_json::from_slice::<DomainEvent>(bytes) {
        Ok(event) if event.aggregate_id == 0 => Decoded::ZeroId,
        Ok(event) => Decoded::Match(event, Shape::Legacy),
        Err(_) => Decoded::NoMatch,
    }
}

/// If the bytes are a JSON string literal, return its contents.
fn unquote(bytes: &[u8]) -> Option<Vec<u8>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::String(inner)) => Some(inner.into_bytes()),
        _ => None,
    }
}
