//! Custom pseudo-scalar registry.
//!
//! A custom scalar is referenced in schema source by its lowercase name
//! (`bigint balance = 3;`). On the wire it travels as a single-field wrapper
//! message whose field 1 carries the scalar's wire kind; the codec applies
//! the encoder/decoder pair transparently, so callers only ever see the
//! user-facing value.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use num_bigint::BigUint;
use prost_reflect::Value;
use serde_json::Value as Json;

use crate::error::{BusError, Result};

/// Name of the synthetic schema file holding the wrapper messages.
pub(crate) const SCALARS_FILE: &str = "protobus/scalars.proto";

const BIGINT_WIDTH: usize = 32;

/// Wire representation of a custom scalar's single wrapper field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Bytes,
    Int64,
    Uint64,
    String,
    Int32,
    Uint32,
    Double,
}

impl WireKind {
    fn proto_type(self) -> &'static str {
        match self {
            WireKind::Bytes => "bytes",
            WireKind::Int64 => "int64",
            WireKind::Uint64 => "uint64",
            WireKind::String => "string",
            WireKind::Int32 => "int32",
            WireKind::Uint32 => "uint32",
            WireKind::Double => "double",
        }
    }
}

pub type ScalarEncodeFn = Arc<dyn Fn(&Json) -> Result<Value> + Send + Sync>;
pub type ScalarDecodeFn = Arc<dyn Fn(&Value) -> Result<Json> + Send + Sync>;

/// One registered pseudo-scalar: a name, a wire kind, and the codec pair.
#[derive(Clone)]
pub struct ScalarDescriptor {
    pub name: String,
    pub wire: WireKind,
    pub encode: ScalarEncodeFn,
    pub decode: ScalarDecodeFn,
}

impl fmt::Debug for ScalarDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarDescriptor")
            .field("name", &self.name)
            .field("wire", &self.wire)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScalarRegistry {
    scalars: HashMap<String, ScalarDescriptor>,
}

impl ScalarRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry
            .register(bigint_scalar())
            .expect("builtin bigint registration");
        registry
            .register(timestamp_scalar())
            .expect("builtin timestamp registration");
        registry
    }

    pub fn register(&mut self, descriptor: ScalarDescriptor) -> Result<()> {
        let name = descriptor.name.as_str();
        let valid = !name.is_empty()
            && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(BusError::config_error(format!(
                "custom scalar name '{name}' must be a lowercase identifier"
            )));
        }
        self.scalars.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ScalarDescriptor> {
        self.scalars.get(name)
    }

    pub fn unregister(&mut self, name: &str) -> Option<ScalarDescriptor> {
        self.scalars.remove(name)
    }

    /// Schema source declaring one wrapper message per registered scalar.
    /// Wrappers live in the root package so an unqualified lowercase name
    /// resolves from any user package.
    pub fn schema_source(&self) -> String {
        let mut names: Vec<&String> = self.scalars.keys().collect();
        names.sort();
        let mut source = String::from("syntax = \"proto3\";\n");
        for name in names {
            let wire = self.scalars[name].wire.proto_type();
            source.push_str(&format!("message {name} {{ {wire} value = 1; }}\n"));
        }
        source
    }

    /// Whether any registered scalar name appears in `source` as a word.
    pub fn mentioned_in(&self, source: &str) -> bool {
        self.scalars.keys().any(|name| {
            source.match_indices(name.as_str()).any(|(at, _)| {
                let before = source[..at].chars().next_back();
                let after = source[at + name.len()..].chars().next();
                !before.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
                    && !after.is_some_and(|c| c.is_alphanumeric() || c == '_')
            })
        })
    }
}

/// 256-bit unsigned integer, 32 big-endian bytes on the wire. Accepts a
/// native integer, a decimal string, or a `0x`-prefixed hex string; zero and
/// the empty string encode as 32 zero bytes. Decodes to a native number when
/// the value fits, a decimal string otherwise.
fn bigint_scalar() -> ScalarDescriptor {
    ScalarDescriptor {
        name: "bigint".to_string(),
        wire: WireKind::Bytes,
        encode: Arc::new(|json| {
            let big = parse_biguint(json)?;
            let mut bytes = big.to_bytes_be();
            if bytes.len() > BIGINT_WIDTH {
                return Err(BusError::invalid_message(format!(
                    "bigint overflows {} bytes",
                    BIGINT_WIDTH
                )));
            }
            let mut wire = vec![0u8; BIGINT_WIDTH - bytes.len()];
            wire.append(&mut bytes);
            Ok(Value::Bytes(wire.into()))
        }),
        decode: Arc::new(|value| {
            let Value::Bytes(bytes) = value else {
                return Err(BusError::internal_error("bigint wire value is not bytes"));
            };
            let big = BigUint::from_bytes_be(bytes);
            match u64::try_from(&big) {
                Ok(small) => Ok(Json::from(small)),
                Err(_) => Ok(Json::String(big.to_str_radix(10))),
            }
        }),
    }
}

fn parse_biguint(json: &Json) -> Result<BigUint> {
    match json {
        Json::Null => Ok(BigUint::default()),
        Json::Number(n) => n
            .as_u64()
            .map(BigUint::from)
            .ok_or_else(|| BusError::invalid_message(format!("bigint rejects {n}"))),
        Json::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(BigUint::default());
            }
            let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => (hex, 16),
                None => (s, 10),
            };
            BigUint::parse_bytes(digits.as_bytes(), radix)
                .ok_or_else(|| BusError::invalid_message(format!("bigint rejects '{s}'")))
        }
        other => Err(BusError::invalid_message(format!(
            "bigint rejects {other}"
        ))),
    }
}

/// Signed milliseconds since the Unix epoch. Accepts numeric milliseconds or
/// an ISO-8601 string; decodes to an RFC 3339 string with millisecond
/// precision.
fn timestamp_scalar() -> ScalarDescriptor {
    ScalarDescriptor {
        name: "timestamp".to_string(),
        wire: WireKind::Int64,
        encode: Arc::new(|json| {
            let millis = match json {
                Json::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| BusError::invalid_message(format!("timestamp rejects {n}")))?,
                Json::String(s) => DateTime::parse_from_rfc3339(s)
                    .map_err(|e| BusError::invalid_message(format!("timestamp rejects '{s}': {e}")))?
                    .timestamp_millis(),
                other => {
                    return Err(BusError::invalid_message(format!(
                        "timestamp rejects {other}"
                    )))
                }
            };
            Ok(Value::I64(millis))
        }),
        decode: Arc::new(|value| {
            let Value::I64(millis) = value else {
                return Err(BusError::internal_error("timestamp wire value is not int64"));
            };
            let date = Utc
                .timestamp_millis_opt(*millis)
                .single()
                .ok_or_else(|| BusError::invalid_message(format!("timestamp {millis} out of range")))?;
            Ok(Json::String(date.to_rfc3339_opts(SecondsFormat::Millis, true)))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(registry: &ScalarRegistry, name: &str, json: Json) -> Result<Value> {
        (registry.get(name).unwrap().encode)(&json)
    }

    fn decode(registry: &ScalarRegistry, name: &str, value: Value) -> Result<Json> {
        (registry.get(name).unwrap().decode)(&value)
    }

    #[test]
    fn bigint_max_is_all_ones() {
        let registry = ScalarRegistry::with_builtins();
        let max = BigUint::parse_bytes(b"f".repeat(64).as_slice(), 16).unwrap();
        let encoded = encode(&registry, "bigint", Json::String(max.to_str_radix(10))).unwrap();
        let Value::Bytes(bytes) = &encoded else { panic!() };
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|b| *b == 0xff));
        let back = decode(&registry, "bigint", encoded).unwrap();
        assert_eq!(back, Json::String(max.to_str_radix(10)));
    }

    #[test]
    fn bigint_zero_and_empty() {
        let registry = ScalarRegistry::with_builtins();
        for input in [Json::from(0u64), Json::String(String::new()), Json::Null] {
            let encoded = encode(&registry, "bigint", input).unwrap();
            let Value::Bytes(bytes) = &encoded else { panic!() };
            assert_eq!(bytes.len(), 32);
            assert!(bytes.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn bigint_hex_round_trips_to_native() {
        let registry = ScalarRegistry::with_builtins();
        let encoded = encode(&registry, "bigint", Json::String("0xdeadbeef".into())).unwrap();
        let back = decode(&registry, "bigint", encoded).unwrap();
        assert_eq!(back, Json::from(0xdeadbeefu64));
    }

    #[test]
    fn bigint_rejects_negatives_and_garbage() {
        let registry = ScalarRegistry::with_builtins();
        assert!(encode(&registry, "bigint", Json::from(-1)).is_err());
        assert!(encode(&registry, "bigint", Json::String("grape".into())).is_err());
        let too_big = BigUint::from(1u8) << 256usize;
        assert!(encode(&registry, "bigint", Json::String(too_big.to_str_radix(10))).is_err());
    }

    #[test]
    fn timestamp_round_trip() {
        let registry = ScalarRegistry::with_builtins();
        let encoded = encode(
            &registry,
            "timestamp",
            Json::String("2024-05-01T12:30:00.250Z".into()),
        )
        .unwrap();
        assert_eq!(encoded, Value::I64(1_714_566_600_250));
        let back = decode(&registry, "timestamp", encoded).unwrap();
        assert_eq!(back, Json::String("2024-05-01T12:30:00.250Z".into()));
    }

    #[test]
    fn timestamp_accepts_millis() {
        let registry = ScalarRegistry::with_builtins();
        let encoded = encode(&registry, "timestamp", Json::from(0)).unwrap();
        assert_eq!(encoded, Value::I64(0));
        let back = decode(&registry, "timestamp", encoded).unwrap();
        assert_eq!(back, Json::String("1970-01-01T00:00:00.000Z".into()));
    }

    #[test]
    fn registry_generates_wrapper_schema() {
        let registry = ScalarRegistry::with_builtins();
        let source = registry.schema_source();
        assert!(source.contains("message bigint { bytes value = 1; }"));
        assert!(source.contains("message timestamp { int64 value = 1; }"));
    }

    #[test]
    fn mention_scan_respects_word_boundaries() {
        let registry = ScalarRegistry::with_builtins();
        assert!(registry.mentioned_in("message A { bigint balance = 1; }"));
        assert!(!registry.mentioned_in("message A { string bigintish = 1; }"));
        assert!(!registry.mentioned_in("message A { my.bigint b = 1; }"));
    }

    #[test]
    fn rejects_bad_names() {
        let mut registry = ScalarRegistry::default();
        let mut bad = bigint_scalar();
        bad.name = "BigInt".to_string();
        assert!(registry.register(bad).is_err());
    }
}
