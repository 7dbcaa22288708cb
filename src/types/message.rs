//! Stream message types and the msgpack field codec
//!
//! The capture service sends every datum as a multi-part ZeroMQ message:
//!
//! ```text
//! part 0: topic (UTF-8), e.g. "frame.world" or "pupil.0.2d"
//! part 1: msgpack map of fields
//! part 2..: raw trailing payloads (world-camera pixels)
//! ```
//!
//! [`FieldValue`] carries its own serde impls instead of deriving them, so that msgpack
//! `bin` payloads survive decoding and integers keep their signedness.

use bytes::Bytes;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::{CaptureError, Result};

/// Decoded msgpack map of a message's fields
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Dynamically-typed msgpack value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldValue>),
    Map(FieldMap),
}

impl FieldValue {
    /// Integer view; unsigned values above `i64::MAX` do not fit.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int(v) => Some(v),
            FieldValue::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            FieldValue::Int(v) => u64::try_from(v).ok(),
            FieldValue::UInt(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view, widening integers to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Float(v) => Some(v),
            FieldValue::Int(v) => Some(v as f64),
            FieldValue::UInt(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Type name used in drop reasons
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Nil => "nil",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) | FieldValue::UInt(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "str",
            FieldValue::Bytes(_) => "bin",
            FieldValue::Array(_) => "array",
            FieldValue::Map(_) => "map",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::Nil => serializer.serialize_unit(),
            FieldValue::Bool(v) => serializer.serialize_bool(*v),
            FieldValue::Int(v) => serializer.serialize_i64(*v),
            FieldValue::UInt(v) => serializer.serialize_u64(*v),
            FieldValue::Float(v) => serializer.serialize_f64(*v),
            FieldValue::Str(v) => serializer.serialize_str(v),
            FieldValue::Bytes(v) => serializer.serialize_bytes(v),
            FieldValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            FieldValue::Map(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct FieldValueVisitor;

impl<'de> Visitor<'de> for FieldValueVisitor {
    type Value = FieldValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a msgpack value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Nil)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<FieldValue, D::Error> {
        FieldValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<FieldValue, E> {
        // Keep non-negative values that fit in i64 as Int so equality is representation-free
        Ok(i64::try_from(v).map(FieldValue::Int).unwrap_or(FieldValue::UInt(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<FieldValue, E> {
        Ok(FieldValue::Bytes(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<FieldValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(FieldValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<FieldValue, A::Error> {
        let mut fields = FieldMap::new();
        while let Some((key, value)) = map.next_entry::<String, FieldValue>()? {
            fields.insert(key, value);
        }
        Ok(FieldValue::Map(fields))
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(FieldValueVisitor)
    }
}

/// Decode a msgpack-encoded map payload.
pub fn decode_fields(payload: &[u8]) -> std::result::Result<FieldMap, rmp_serde::decode::Error> {
    rmp_serde::from_slice(payload)
}

/// Encode a field map as msgpack (string keys, `bin` for byte payloads).
pub fn encode_fields(fields: &FieldMap) -> std::result::Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(fields)
}

/// Raw transport unit: every part of one multi-part message, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Multipart {
    pub parts: Vec<Bytes>,
}

impl Multipart {
    pub fn new(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    /// Topic part decoded as UTF-8, if present
    pub fn topic(&self) -> Option<&str> {
        self.parts.first().and_then(|p| std::str::from_utf8(p).ok())
    }
}

impl From<Vec<Bytes>> for Multipart {
    fn from(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }
}

/// Topic class used for dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `frame.world`
    WorldFrame,
    /// Any `pupil.*` topic
    Pupil,
    /// Everything else (ignored)
    Other,
}

impl TopicKind {
    pub fn classify(topic: &str) -> Self {
        if topic == "frame.world" {
            TopicKind::WorldFrame
        } else if topic.starts_with("pupil.") {
            TopicKind::Pupil
        } else {
            TopicKind::Other
        }
    }
}

/// One decoded stream message
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    /// Topic label, e.g. `frame.world`
    pub topic: String,

    /// Decoded field map (second part)
    pub fields: FieldMap,

    /// Raw trailing parts (third part onwards)
    pub trailing: Vec<Bytes>,
}

impl TopicMessage {
    /// Decode a raw multi-part message.
    ///
    /// Fails with [`CaptureError::Malformed`] when the topic is missing or not UTF-8,
    /// the field part is missing, or the field part is not a msgpack map.
    pub fn decode(message: Multipart) -> Result<Self> {
        let mut parts = message.parts.into_iter();

        let topic_bytes = parts.next().ok_or_else(|| CaptureError::malformed("", "empty message"))?;
        let topic = String::from_utf8(topic_bytes.to_vec())
            .map_err(|_| CaptureError::malformed("", "topic is not valid UTF-8"))?;

        let payload =
            parts.next().ok_or_else(|| CaptureError::malformed(&topic, "missing field payload"))?;
        let fields = decode_fields(&payload)
            .map_err(|e| CaptureError::malformed(&topic, format!("undecodable payload: {e}")))?;

        Ok(Self { topic, fields, trailing: parts.collect() })
    }

    pub fn kind(&self) -> TopicKind {
        TopicKind::classify(&self.topic)
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
