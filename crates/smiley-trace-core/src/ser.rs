//! serde `Serializer` that lowers arbitrary Rust values into [`TraceValue`].

use std::collections::BTreeMap;

use serde::ser::{self, Impossible, Serialize};

use crate::{EncodeError, TraceValue};

pub(crate) struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = TraceValue;
    type Error = EncodeError;

    type SerializeSeq = SerializeVec;
    type SerializeTuple = SerializeVec;
    type SerializeTupleStruct = SerializeVec;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeEntries;
    type SerializeStruct = SerializeEntries;
    type SerializeStructVariant = SerializeStructVariant;

    fn serialize_bool(self, v: bool) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<TraceValue, EncodeError> {
        i64::try_from(v)
            .map(TraceValue::Int)
            .map_err(|_| EncodeError::IntegerOutOfRange(v.to_string()))
    }

    fn serialize_u8(self, v: u8) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_u16(self, v: u16) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Int(i64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> Result<TraceValue, EncodeError> {
        i64::try_from(v)
            .map(TraceValue::Int)
            .map_err(|_| EncodeError::IntegerOutOfRange(v.to_string()))
    }

    fn serialize_u128(self, v: u128) -> Result<TraceValue, EncodeError> {
        i64::try_from(v)
            .map(TraceValue::Int)
            .map_err(|_| EncodeError::IntegerOutOfRange(v.to_string()))
    }

    fn serialize_f32(self, v: f32) -> Result<TraceValue, EncodeError> {
        ser::Serializer::serialize_f64(self, f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<TraceValue, EncodeError> {
        if v.is_finite() {
            Ok(TraceValue::Float(v))
        } else {
            Err(EncodeError::NonFiniteNumber { value: v })
        }
    }

    fn serialize_char(self, v: char) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Str(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Seq(
            v.iter().map(|byte| TraceValue::Int(i64::from(*byte))).collect(),
        ))
    }

    fn serialize_none(self) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Null)
    }

    fn serialize_some<T>(self, value: &T) -> Result<TraceValue, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Str(variant.to_string()))
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<TraceValue, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<TraceValue, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let mut entries = BTreeMap::new();
        entries.insert(variant.to_string(), value.serialize(ValueSerializer)?);
        Ok(TraceValue::Map(entries))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeVec, EncodeError> {
        Ok(SerializeVec {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SerializeVec, EncodeError> {
        ser::Serializer::serialize_seq(self, Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeVec, EncodeError> {
        ser::Serializer::serialize_seq(self, Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SerializeTupleVariant, EncodeError> {
        Ok(SerializeTupleVariant {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeEntries, EncodeError> {
        Ok(SerializeEntries {
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SerializeEntries, EncodeError> {
        ser::Serializer::serialize_map(self, Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SerializeStructVariant, EncodeError> {
        Ok(SerializeStructVariant {
            variant,
            entries: BTreeMap::new(),
        })
    }
}

pub(crate) struct SerializeVec {
    items: Vec<TraceValue>,
}

impl ser::SerializeSeq for SerializeVec {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Seq(self.items))
    }
}

impl ser::SerializeTuple for SerializeVec {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeVec {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        ser::SerializeSeq::end(self)
    }
}

pub(crate) struct SerializeTupleVariant {
    variant: &'static str,
    items: Vec<TraceValue>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        let mut entries = BTreeMap::new();
        entries.insert(self.variant.to_string(), TraceValue::Seq(self.items));
        Ok(TraceValue::Map(entries))
    }
}

pub(crate) struct SerializeEntries {
    entries: BTreeMap<String, TraceValue>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for SerializeEntries {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_key<T>(&mut self, key: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.pending_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        let key = self.pending_key.take().ok_or_else(|| {
            EncodeError::Unrepresentable("map value serialized before its key".to_string())
        })?;
        self.entries.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Map(self.entries))
    }
}

impl ser::SerializeStruct for SerializeEntries {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        Ok(TraceValue::Map(self.entries))
    }
}

pub(crate) struct SerializeStructVariant {
    variant: &'static str,
    entries: BTreeMap<String, TraceValue>,
}

impl ser::SerializeStructVariant for SerializeStructVariant {
    type Ok = TraceValue;
    type Error = EncodeError;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<(), EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<TraceValue, EncodeError> {
        let mut outer = BTreeMap::new();
        outer.insert(self.variant.to_string(), TraceValue::Map(self.entries));
        Ok(TraceValue::Map(outer))
    }
}

/// Map keys must end up as strings. Integers and chars are rendered the way a
/// JSON encoder would render them; anything else is refused.
struct KeySerializer;

fn unsupported_key(kind: &str) -> EncodeError {
    EncodeError::UnsupportedKey(kind.to_string())
}

impl ser::Serializer for KeySerializer {
    type Ok = String;
    type Error = EncodeError;

    type SerializeSeq = Impossible<String, EncodeError>;
    type SerializeTuple = Impossible<String, EncodeError>;
    type SerializeTupleStruct = Impossible<String, EncodeError>;
    type SerializeTupleVariant = Impossible<String, EncodeError>;
    type SerializeMap = Impossible<String, EncodeError>;
    type SerializeStruct = Impossible<String, EncodeError>;
    type SerializeStructVariant = Impossible<String, EncodeError>;

    fn serialize_bool(self, _v: bool) -> Result<String, EncodeError> {
        Err(unsupported_key("bool"))
    }

    fn serialize_i8(self, v: i8) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_i128(self, v: i128) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_u128(self, v: u128) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> Result<String, EncodeError> {
        Err(unsupported_key("float"))
    }

    fn serialize_f64(self, _v: f64) -> Result<String, EncodeError> {
        Err(unsupported_key("float"))
    }

    fn serialize_char(self, v: char) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<String, EncodeError> {
        Ok(v.to_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, EncodeError> {
        Err(unsupported_key("bytes"))
    }

    fn serialize_none(self) -> Result<String, EncodeError> {
        Err(unsupported_key("none"))
    }

    fn serialize_some<T>(self, _value: &T) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        Err(unsupported_key("option"))
    }

    fn serialize_unit(self) -> Result<String, EncodeError> {
        Err(unsupported_key("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<String, EncodeError> {
        Err(unsupported_key(name))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<String, EncodeError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, EncodeError>
    where
        T: Serialize + ?Sized,
    {
        Err(unsupported_key(name))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, EncodeError> {
        Err(unsupported_key("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, EncodeError> {
        Err(unsupported_key("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, EncodeError> {
        Err(unsupported_key(name))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, EncodeError> {
        Err(unsupported_key(name))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, EncodeError> {
        Err(unsupported_key("mapping"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, EncodeError> {
        Err(unsupported_key(name))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, EncodeError> {
        Err(unsupported_key(name))
    }
}
