//! Conversion between `serde_json::Value` payloads and dynamic Protobuf
//! messages, with transparent custom-scalar wrapping.
//!
//! Encoding rejects unknown object keys and out-of-range numerics. Decoding
//! renders proto3 defaults for absent implicit fields and `null` for absent
//! presence-carrying fields; unknown wire fields are ignored.

use std::collections::HashMap;

use prost_reflect::{
    DynamicMessage, EnumDescriptor, FieldDescriptor, Kind, MapKey, MessageDescriptor,
    ReflectMessage, Value,
};
use serde_json::Value as Json;

use crate::codec::scalars::{ScalarDescriptor, ScalarRegistry};
use crate::error::{BusError, Result};

pub(crate) fn json_to_message(
    desc: &MessageDescriptor,
    json: &Json,
    scalars: &ScalarRegistry,
) -> Result<DynamicMessage> {
    let mut message = DynamicMessage::new(desc.clone());
    let object = match json {
        Json::Null => return Ok(message),
        Json::Object(object) => object,
        other => {
            return Err(BusError::invalid_message(format!(
                "{} expects an object, got {other}",
                desc.full_name()
            )))
        }
    };

    for (key, value) in object {
        let field = desc.get_field_by_name(key).ok_or_else(|| {
            BusError::invalid_message(format!("unknown field '{key}' on {}", desc.full_name()))
        })?;
        if value.is_null() {
            continue;
        }
        let encoded = encode_field(&field, value, scalars)?;
        message.set_field(&field, encoded);
    }
    Ok(message)
}

fn encode_field(field: &FieldDescriptor, json: &Json, scalars: &ScalarRegistry) -> Result<Value> {
    if field.is_map() {
        return encode_map(field, json, scalars);
    }
    if field.is_list() {
        let Json::Array(items) = json else {
            return Err(BusError::invalid_message(format!(
                "field '{}' expects an array",
                field.name()
            )));
        };
        let values = items
            .iter()
            .map(|item| encode_single(&field.kind(), item, scalars))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::List(values));
    }
    encode_single(&field.kind(), json, scalars)
}

fn encode_map(field: &FieldDescriptor, json: &Json, scalars: &ScalarRegistry) -> Result<Value> {
    let Json::Object(entries) = json else {
        return Err(BusError::invalid_message(format!(
            "map field '{}' expects an object",
            field.name()
        )));
    };
    let Kind::Message(entry) = field.kind() else {
        return Err(BusError::internal_error("map field without entry message"));
    };
    let key_field = entry.map_entry_key_field();
    let value_field = entry.map_entry_value_field();

    let mut map = HashMap::new();
    for (key, value) in entries {
        let map_key = encode_map_key(&key_field.kind(), key)?;
        let map_value = encode_single(&value_field.kind(), value, scalars)?;
        map.insert(map_key, map_value);
    }
    Ok(Value::Map(map))
}

fn encode_map_key(kind: &Kind, key: &str) -> Result<MapKey> {
    let parse_err = || BusError::invalid_message(format!("bad map key '{key}'"));
    match kind {
        Kind::String => Ok(MapKey::String(key.to_string())),
        Kind::Bool => key.parse().map(MapKey::Bool).map_err(|_| parse_err()),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            key.parse().map(MapKey::I32).map_err(|_| parse_err())
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            key.parse().map(MapKey::I64).map_err(|_| parse_err())
        }
        Kind::Uint32 | Kind::Fixed32 => key.parse().map(MapKey::U32).map_err(|_| parse_err()),
        Kind::Uint64 | Kind::Fixed64 => key.parse().map(MapKey::U64).map_err(|_| parse_err()),
        other => Err(BusError::invalid_message(format!(
            "unsupported map key kind {other:?}"
        ))),
    }
}

fn encode_single(kind: &Kind, json: &Json, scalars: &ScalarRegistry) -> Result<Value> {
    match kind {
        Kind::Message(desc) => {
            if let Some(scalar) = wrapper_scalar(desc, scalars) {
                let wire = (scalar.encode)(json)?;
                return wrap(desc, wire);
            }
            Ok(Value::Message(json_to_message(desc, json, scalars)?))
        }
        Kind::Enum(desc) => encode_enum(desc, json),
        Kind::Bool => match json {
            Json::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(type_error("bool", other)),
        },
        Kind::String => match json {
            Json::String(s) => Ok(Value::String(s.clone())),
            other => Err(type_error("string", other)),
        },
        Kind::Bytes => encode_bytes(json),
        Kind::Double => number(json)?
            .as_f64()
            .map(Value::F64)
            .ok_or_else(|| type_error("double", json)),
        Kind::Float => number(json)?
            .as_f64()
            .map(|f| Value::F32(f as f32))
            .ok_or_else(|| type_error("float", json)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            let n = integer(json)?;
            i32::try_from(n)
                .map(Value::I32)
                .map_err(|_| type_error("int32", json))
        }
        Kind::Uint32 | Kind::Fixed32 => {
            let n = unsigned(json)?;
            u32::try_from(n)
                .map(Value::U32)
                .map_err(|_| type_error("uint32", json))
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => integer(json).map(Value::I64),
        Kind::Uint64 | Kind::Fixed64 => unsigned(json).map(Value::U64),
    }
}

fn wrap(desc: &MessageDescriptor, wire: Value) -> Result<Value> {
    let field = desc
        .get_field(1)
        .ok_or_else(|| BusError::internal_error("scalar wrapper missing field 1"))?;
    let mut wrapper = DynamicMessage::new(desc.clone());
    wrapper.set_field(&field, wire);
    Ok(Value::Message(wrapper))
}

fn wrapper_scalar<'a>(
    desc: &MessageDescriptor,
    scalars: &'a ScalarRegistry,
) -> Option<&'a ScalarDescriptor> {
    if desc.package_name().is_empty() {
        scalars.get(desc.name())
    } else {
        None
    }
}

fn encode_enum(desc: &EnumDescriptor, json: &Json) -> Result<Value> {
    match json {
        Json::String(name) => desc
            .get_value_by_name(name)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| {
                BusError::invalid_message(format!("'{name}' is not a value of {}", desc.full_name()))
            }),
        Json::Number(_) => {
            let n = integer(json)?;
            i32::try_from(n)
                .map(Value::EnumNumber)
                .map_err(|_| type_error("enum", json))
        }
        other => Err(type_error("enum", other)),
    }
}

fn encode_bytes(json: &Json) -> Result<Value> {
    match json {
        Json::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| type_error("bytes", json))
                })
                .collect::<Result<Vec<u8>>>()?;
            Ok(Value::Bytes(bytes.into()))
        }
        Json::String(s) => Ok(Value::Bytes(s.clone().into_bytes().into())),
        other => Err(type_error("bytes", other)),
    }
}

fn number(json: &Json) -> Result<&serde_json::Number> {
    match json {
        Json::Number(n) => Ok(n),
        other => Err(type_error("number", other)),
    }
}

fn integer(json: &Json) -> Result<i64> {
    match json {
        Json::Number(n) => n.as_i64().ok_or_else(|| type_error("integer", json)),
        Json::String(s) => s
            .parse()
            .map_err(|_| type_error("integer", json)),
        other => Err(type_error("integer", other)),
    }
}

fn unsigned(json: &Json) -> Result<u64> {
    match json {
        Json::Number(n) => n.as_u64().ok_or_else(|| type_error("unsigned", json)),
        Json::String(s) => s
            .parse()
            .map_err(|_| type_error("unsigned", json)),
        other => Err(type_error("unsigned", other)),
    }
}

fn type_error(expected: &str, got: &Json) -> BusError {
    BusError::invalid_message(format!("expected {expected}, got {got}"))
}

pub(crate) fn message_to_json(msg: &DynamicMessage, scalars: &ScalarRegistry) -> Result<Json> {
    let desc = msg.descriptor();
    let mut object = serde_json::Map::new();
    for field in desc.fields() {
        let json = if field.supports_presence() && !msg.has_field(&field) {
            Json::Null
        } else {
            decode_field(&field, msg.get_field(&field).as_ref(), scalars)?
        };
        object.insert(field.name().to_string(), json);
    }
    Ok(Json::Object(object))
}

fn decode_field(field: &FieldDescriptor, value: &Value, scalars: &ScalarRegistry) -> Result<Json> {
    if field.is_map() {
        let Value::Map(map) = value else {
            return Err(BusError::internal_error("map field holds a non-map value"));
        };
        let Kind::Message(entry) = field.kind() else {
            return Err(BusError::internal_error("map field without entry message"));
        };
        let value_kind = entry.map_entry_value_field().kind();
        let mut object = serde_json::Map::new();
        for (key, item) in map {
            object.insert(map_key_string(key), decode_single(&value_kind, item, scalars)?);
        }
        return Ok(Json::Object(object));
    }
    if field.is_list() {
        let Value::List(items) = value else {
            return Err(BusError::internal_error("list field holds a non-list value"));
        };
        let kind = field.kind();
        let decoded = items
            .iter()
            .map(|item| decode_single(&kind, item, scalars))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Json::Array(decoded));
    }
    decode_single(&field.kind(), value, scalars)
}

fn map_key_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

fn decode_single(kind: &Kind, value: &Value, scalars: &ScalarRegistry) -> Result<Json> {
    match value {
        Value::Message(inner) => {
            let desc = inner.descriptor();
            if let Some(scalar) = wrapper_scalar(&desc, scalars) {
                let field = desc
                    .get_field(1)
                    .ok_or_else(|| BusError::internal_error("scalar wrapper missing field 1"))?;
                return (scalar.decode)(inner.get_field(&field).as_ref());
            }
            message_to_json(inner, scalars)
        }
        Value::EnumNumber(n) => match kind {
            Kind::Enum(desc) => Ok(desc
                .get_value(*n)
                .map(|v| Json::String(v.name().to_string()))
                .unwrap_or_else(|| Json::from(*n))),
            _ => Ok(Json::from(*n)),
        },
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::I32(n) => Ok(Json::from(*n)),
        Value::I64(n) => Ok(Json::from(*n)),
        Value::U32(n) => Ok(Json::from(*n)),
        Value::U64(n) => Ok(Json::from(*n)),
        Value::F32(f) => Ok(serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null)),
        Value::F64(f) => Ok(serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null)),
        Value::String(s) => Ok(Json::String(s.clone())),
        Value::Bytes(bytes) => Ok(Json::Array(
            bytes.iter().map(|b| Json::from(*b)).collect(),
        )),
        Value::List(items) => {
            let decoded = items
                .iter()
                .map(|item| decode_single(kind, item, scalars))
                .collect::<Result<Vec<_>>>()?;
            Ok(Json::Array(decoded))
        }
        Value::Map(_) => Err(BusError::internal_error("unexpected bare map value")),
    }
}
