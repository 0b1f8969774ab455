use std::collections::BTreeMap;
use std::fmt::{self, Formatter};

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::ser::ValueSerializer;
use crate::EncodeError;

/// Deepest nesting of sequences and mappings an encoded document may hold.
///
/// The decoder refuses anything deeper, so the encoder enforces the same bound.
pub const MAX_NESTING_DEPTH: usize = 127;

/// Local variables captured alongside a trace event, keyed by name.
pub type Locals = BTreeMap<String, TraceValue>;

/// A dynamically shaped value captured by the tracer.
///
/// Mappings are kept in key order so that encoding the same value twice always
/// yields the same text.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TraceValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<TraceValue>),
    Map(BTreeMap<String, TraceValue>),
}

impl TraceValue {
    /// Converts any serde-serializable value into a `TraceValue`.
    ///
    /// # Errors
    /// Returns an [`EncodeError`] when the value holds something the trace
    /// encoding cannot represent (non-finite floats, integers outside `i64`,
    /// non-string map keys, or a `Serialize` impl that fails).
    pub fn from_serialize<T>(value: &T) -> Result<Self, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(ValueSerializer)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, TraceValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "mapping",
        }
    }

    /// Walks the value and rejects anything the text encoding would silently
    /// alter or could not read back.
    ///
    /// # Errors
    /// Returns [`EncodeError::NonFiniteNumber`] for NaN or infinite floats and
    /// [`EncodeError::NestingTooDeep`] when sequences and mappings nest more
    /// than [`MAX_NESTING_DEPTH`] levels.
    pub fn ensure_representable(&self) -> Result<(), EncodeError> {
        self.check_representable(0)
    }

    /// `enclosing` counts the containers already wrapped around `self` in the
    /// encoded document.
    pub(crate) fn check_representable(&self, enclosing: usize) -> Result<(), EncodeError> {
        match self {
            Self::Float(value) if !value.is_finite() => {
                Err(EncodeError::NonFiniteNumber { value: *value })
            }
            Self::Seq(_) | Self::Map(_) if enclosing >= MAX_NESTING_DEPTH => {
                Err(EncodeError::NestingTooDeep {
                    limit: MAX_NESTING_DEPTH,
                })
            }
            Self::Seq(items) => items
                .iter()
                .try_for_each(|item| item.check_representable(enclosing + 1)),
            Self::Map(entries) => entries
                .values()
                .try_for_each(|value| value.check_representable(enclosing + 1)),
            _ => Ok(()),
        }
    }
}

impl From<bool> for TraceValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for TraceValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TraceValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for TraceValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for TraceValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TraceValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<T: Into<TraceValue>> From<Option<T>> for TraceValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<Vec<TraceValue>> for TraceValue {
    fn from(value: Vec<TraceValue>) -> Self {
        Self::Seq(value)
    }
}

impl From<BTreeMap<String, TraceValue>> for TraceValue {
    fn from(value: BTreeMap<String, TraceValue>) -> Self {
        Self::Map(value)
    }
}

impl<K: Into<String>, V: Into<TraceValue>> FromIterator<(K, V)> for TraceValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl Serialize for TraceValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(value) => serializer.serialize_bool(*value),
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Float(value) if value.is_finite() => serializer.serialize_f64(*value),
            Self::Float(value) => Err(ser::Error::custom(format!(
                "non-finite number {value} cannot be encoded"
            ))),
            Self::Str(value) => serializer.serialize_str(value),
            Self::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for TraceValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TraceValueVisitor)
    }
}

struct TraceValueVisitor;

impl<'de> Visitor<'de> for TraceValueVisitor {
    type Value = TraceValue;

    fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("a null, boolean, number, string, sequence, or string-keyed mapping")
    }

    fn visit_unit<E: de::Error>(self) -> Result<TraceValue, E> {
        Ok(TraceValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<TraceValue, E> {
        Ok(TraceValue::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<TraceValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        TraceValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<TraceValue, E> {
        Ok(TraceValue::Bool(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<TraceValue, E> {
        Ok(TraceValue::Int(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<TraceValue, E> {
        i64::try_from(value)
            .map(TraceValue::Int)
            .map_err(|_| E::custom(format!("integer {value} is outside the i64 range")))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<TraceValue, E> {
        Ok(TraceValue::Float(value))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<TraceValue, E> {
        Ok(TraceValue::Str(value.to_string()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<TraceValue, E> {
        Ok(TraceValue::Str(value))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<TraceValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(TraceValue::Seq(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<TraceValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<String, TraceValue>()? {
            entries.insert(key, value);
        }
        Ok(TraceValue::Map(entries))
    }
}
