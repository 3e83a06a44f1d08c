//! Message factory: schema registry, framing envelopes, and typed payload
//! encoding with extensible pseudo-scalars.
//!
//! Schemas are compiled at runtime from `.proto` sources (directories, single
//! files, or inline text) into one process-wide descriptor pool, so a type
//! name resolves to exactly one descriptor. Custom scalars contribute a
//! synthetic wrapper schema; user sources that mention a registered scalar
//! name get an import of that file injected before compilation.

pub mod containers;
pub mod scalars;
mod value;
pub mod view;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MethodDescriptor};
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use protox::Compiler;
use serde_json::Value as Json;
use tracing::debug;

use crate::error::{BusError, Result};
use self::containers::{
    response_container::Outcome, EventContainer, RequestContainer, ResponseContainer,
    ResponseError, ResponseResult,
};
use self::scalars::{ScalarDescriptor, ScalarRegistry, SCALARS_FILE};

/// A decoded RPC request: the framing fields plus the payload rendered
/// against the method's input type.
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub method: String,
    pub actor: String,
    pub payload: Json,
}

/// Structured error carried in a response envelope.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub message: String,
    pub code: String,
    pub handled: bool,
}

/// A decoded RPC response: exactly one of `result` / `error` is populated.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub result: Option<Json>,
    pub error: Option<ErrorRecord>,
}

/// A decoded event: type, topic, and the payload rendered against the type.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub type_name: String,
    pub topic: String,
    pub payload: Json,
}

struct CodecInner {
    pool: DescriptorPool,
    /// file name -> raw schema source, recompiled as a whole on every change
    sources: BTreeMap<String, String>,
    scalars: ScalarRegistry,
    inline_counter: usize,
}

/// Schema-driven codec for the three framing envelopes.
///
/// All operations are CPU-only and never suspend.
pub struct Codec {
    inner: RwLock<CodecInner>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CodecInner {
                pool: DescriptorPool::new(),
                sources: BTreeMap::new(),
                scalars: ScalarRegistry::with_builtins(),
                inline_counter: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CodecInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CodecInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a custom scalar. May be called before or after `init`;
    /// schemas parsed earlier are recompiled against the updated registry.
    /// A registration whose wrapper fails to compile is rolled back.
    pub fn register_scalar(&self, descriptor: ScalarDescriptor) -> Result<()> {
        let name = descriptor.name.clone();
        let mut inner = self.write();
        inner.scalars.register(descriptor)?;
        if let Err(e) = inner.recompile() {
            inner.scalars.unregister(&name);
            return Err(e);
        }
        Ok(())
    }

    /// Discover `.proto` files under each directory recursively and compile
    /// them into the registry. File names are directory-relative; a name
    /// appearing under several roots resolves to the last one given. A
    /// compile failure leaves the registry as it was.
    pub fn init<P: AsRef<Path>>(&self, schema_dirs: &[P]) -> Result<()> {
        let mut discovered = Vec::new();
        for dir in schema_dirs {
            collect_protos(dir.as_ref(), dir.as_ref(), &mut discovered)?;
        }
        let mut inner = self.write();
        let previous = inner.sources.clone();
        for (name, path) in discovered {
            let source = fs::read_to_string(&path)?;
            debug!("loaded schema {} from {}", name, path.display());
            inner.sources.insert(name, source);
        }
        if let Err(e) = inner.recompile() {
            inner.sources = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Add one schema text block to the registry. A compile failure leaves
    /// the registry as it was.
    pub fn parse(&self, text: &str) -> Result<()> {
        let mut inner = self.write();
        inner.inline_counter += 1;
        let name = format!("inline/{}.proto", inner.inline_counter);
        inner.sources.insert(name.clone(), text.to_string());
        if let Err(e) = inner.recompile() {
            inner.sources.remove(&name);
            return Err(e);
        }
        Ok(())
    }

    /// Read and add one schema file.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BusError::config_error(format!("bad schema path {}", path.display())))?;
        let mut inner = self.write();
        let previous = inner.sources.insert(name.clone(), source);
        if let Err(e) = inner.recompile() {
            match previous {
                Some(previous) => inner.sources.insert(name, previous),
                None => inner.sources.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Encode an RPC request envelope for `method` (fully qualified, e.g.
    /// `Demo.Math.add`). The payload is checked against the method's input
    /// type; unknown fields are rejected.
    pub fn encode_request(&self, method: &str, payload: &Json, actor: &str) -> Result<Vec<u8>> {
        let inner = self.read();
        let descriptor = resolve_method(&inner.pool, method)?;
        let message = value::json_to_message(&descriptor.input(), payload, &inner.scalars)?;
        let container = RequestContainer {
            method: method.to_string(),
            actor: actor.to_string(),
            payload: message.encode_to_vec(),
        };
        Ok(container.encode_to_vec())
    }

    /// Decode an RPC request envelope. The inner payload is decoded exactly
    /// once, against the input type of the method named in the envelope.
    pub fn decode_request(&self, bytes: &[u8]) -> Result<DecodedRequest> {
        let inner = self.read();
        let container = RequestContainer::decode(bytes)?;
        let descriptor = resolve_method(&inner.pool, &container.method)?;
        let message = DynamicMessage::decode(descriptor.input(), container.payload.as_slice())?;
        let payload = value::message_to_json(&message, &inner.scalars)?;
        Ok(DecodedRequest {
            method: container.method,
            actor: container.actor,
            payload,
        })
    }

    /// Encode a successful RPC response for `method`.
    pub fn encode_response(&self, method: &str, payload: &Json) -> Result<Vec<u8>> {
        let inner = self.read();
        let descriptor = resolve_method(&inner.pool, method)?;
        let message = value::json_to_message(&descriptor.output(), payload, &inner.scalars)?;
        let container = ResponseContainer {
            outcome: Some(Outcome::Result(ResponseResult {
                payload: message.encode_to_vec(),
            })),
        };
        Ok(container.encode_to_vec())
    }

    /// Encode a structured error response. Type-independent, so it is
    /// available even when the request could not be decoded.
    pub fn encode_error(&self, message: &str, code: &str, handled: bool) -> Vec<u8> {
        let container = ResponseContainer {
            outcome: Some(Outcome::Error(ResponseError {
                message: message.to_string(),
                code: code.to_string(),
                handled,
            })),
        };
        container.encode_to_vec()
    }

    /// Decode an RPC response envelope; the result payload is rendered
    /// against the output type of `method`.
    pub fn decode_response(&self, method: &str, bytes: &[u8]) -> Result<ResponseRecord> {
        let inner = self.read();
        let container = ResponseContainer::decode(bytes)?;
        match container.outcome {
            Some(Outcome::Result(result)) => {
                let descriptor = resolve_method(&inner.pool, method)?;
                let message =
                    DynamicMessage::decode(descriptor.output(), result.payload.as_slice())?;
                Ok(ResponseRecord {
                    result: Some(value::message_to_json(&message, &inner.scalars)?),
                    error: None,
                })
            }
            Some(Outcome::Error(error)) => Ok(ResponseRecord {
                result: None,
                error: Some(ErrorRecord {
                    message: error.message,
                    code: error.code,
                    handled: error.handled,
                }),
            }),
            None => Err(BusError::invalid_message("response carries no outcome")),
        }
    }

    /// Encode an event envelope; the payload is checked against `type_name`.
    pub fn encode_event(&self, type_name: &str, payload: &Json, topic: &str) -> Result<Vec<u8>> {
        let inner = self.read();
        let descriptor = inner.pool.get_message_by_name(type_name).ok_or_else(|| {
            BusError::invalid_message(format!("unknown event type '{type_name}'"))
        })?;
        let message = value::json_to_message(&descriptor, payload, &inner.scalars)?;
        let container = EventContainer {
            type_name: type_name.to_string(),
            topic: topic.to_string(),
            payload: message.encode_to_vec(),
        };
        Ok(container.encode_to_vec())
    }

    /// Decode an event envelope; the payload is rendered against the type
    /// named inside it.
    pub fn decode_event(&self, bytes: &[u8]) -> Result<DecodedEvent> {
        let inner = self.read();
        let container = EventContainer::decode(bytes)?;
        let descriptor = inner
            .pool
            .get_message_by_name(&container.type_name)
            .ok_or_else(|| {
                BusError::invalid_message(format!("unknown event type '{}'", container.type_name))
            })?;
        let message = DynamicMessage::decode(descriptor, container.payload.as_slice())?;
        let payload = value::message_to_json(&message, &inner.scalars)?;
        Ok(DecodedEvent {
            type_name: container.type_name,
            topic: container.topic,
            payload,
        })
    }

    /// Render a language-neutral description of a service's methods and
    /// types, for code generators.
    pub fn export_type_view(&self, service: &str) -> Result<view::ServiceView> {
        let inner = self.read();
        view::export(&inner.pool, service, &inner.scalars)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.read().pool.get_service_by_name(service).is_some()
    }

    /// Names of the methods a service declares, in declaration order.
    pub fn method_names(&self, service: &str) -> Result<Vec<String>> {
        let inner = self.read();
        let descriptor = inner
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| BusError::ServiceNotFound {
                service: service.to_string(),
            })?;
        Ok(descriptor.methods().map(|m| m.name().to_string()).collect())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Codec")
            .field("schemas", &inner.sources.len())
            .finish()
    }
}

impl CodecInner {
    fn recompile(&mut self) -> Result<()> {
        let mut files = HashMap::new();
        files.insert(SCALARS_FILE.to_string(), self.scalars.schema_source());
        for (name, raw) in &self.sources {
            files.insert(name.clone(), preprocess(raw, &self.scalars));
        }
        let names: Vec<String> = files.keys().cloned().collect();

        let mut chain = ChainFileResolver::new();
        chain.add(GoogleFileResolver::new());
        chain.add(SourceResolver { files });

        let mut compiler = Compiler::with_file_resolver(chain);
        compiler.include_imports(true);
        for name in &names {
            compiler.open_file(name)?;
        }
        self.pool = DescriptorPool::from_file_descriptor_set(compiler.file_descriptor_set())?;
        Ok(())
    }
}

/// Resolver serving preprocessed in-memory sources.
#[derive(Debug)]
struct SourceResolver {
    files: HashMap<String, String>,
}

impl FileResolver for SourceResolver {
    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.files.get(name) {
            Some(source) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

/// Inject an import of the scalar wrapper schema into sources that mention
/// a registered scalar name. The import goes right after the syntax line so
/// statement order stays legal.
fn preprocess(source: &str, scalars: &ScalarRegistry) -> String {
    if !scalars.mentioned_in(source) {
        return source.to_string();
    }
    let import = format!("import \"{SCALARS_FILE}\";");
    let mut lines: Vec<&str> = source.lines().collect();
    let insert_at = lines
        .iter()
        .position(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("syntax") && trimmed.contains(';')
        })
        .map(|at| at + 1)
        .unwrap_or(0);
    lines.insert(insert_at, &import);
    lines.join("\n")
}

fn resolve_method(pool: &DescriptorPool, method: &str) -> Result<MethodDescriptor> {
    let (service_name, method_name) = method.rsplit_once('.').ok_or_else(|| {
        BusError::invalid_message(format!("method '{method}' is not fully qualified"))
    })?;
    let service =
        pool.get_service_by_name(service_name)
            .ok_or_else(|| BusError::ServiceNotFound {
                service: service_name.to_string(),
            })?;
    let method = service
        .methods()
        .find(|m| m.name() == method_name)
        .ok_or_else(|| BusError::MethodNotFound {
            service: service_name.to_string(),
            method: method_name.to_string(),
        })?;
    Ok(method)
}

fn collect_protos(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_protos(root, &path, out)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("proto") {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MATH_SCHEMA: &str = r#"
        syntax = "proto3";
        package Demo;
        service Math {
            rpc add (AddRequest) returns (AddResponse);
        }
        message AddRequest { int32 a = 1; int32 b = 2; }
        message AddResponse { int32 result = 1; }
    "#;

    fn math_codec() -> Codec {
        let codec = Codec::new();
        codec.parse(MATH_SCHEMA).unwrap();
        codec
    }

    #[test]
    fn request_round_trip() {
        let codec = math_codec();
        let bytes = codec
            .encode_request("Demo.Math.add", &json!({"a": 1, "b": 2}), "tester")
            .unwrap();
        let decoded = codec.decode_request(&bytes).unwrap();
        assert_eq!(decoded.method, "Demo.Math.add");
        assert_eq!(decoded.actor, "tester");
        assert_eq!(decoded.payload, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn response_round_trip() {
        let codec = math_codec();
        let bytes = codec
            .encode_response("Demo.Math.add", &json!({"result": 3}))
            .unwrap();
        let record = codec.decode_response("Demo.Math.add", &bytes).unwrap();
        assert_eq!(record.result, Some(json!({"result": 3})));
        assert!(record.error.is_none());
    }

    #[test]
    fn error_envelope_round_trip() {
        let codec = math_codec();
        let bytes = codec.encode_error("bad", "VALIDATION_ERROR", true);
        let record = codec.decode_response("Demo.Math.add", &bytes).unwrap();
        assert!(record.result.is_none());
        let error = record.error.unwrap();
        assert_eq!(error.message, "bad");
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert!(error.handled);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let codec = math_codec();
        let result = codec.encode_request("Demo.Math.add", &json!({"a": 1, "z": 9}), "");
        assert!(matches!(result, Err(BusError::InvalidMessage { .. })));
    }

    #[test]
    fn unknown_method_and_service() {
        let codec = math_codec();
        assert!(matches!(
            codec.encode_request("Demo.Math.sub", &json!({}), ""),
            Err(BusError::MethodNotFound { .. })
        ));
        assert!(matches!(
            codec.encode_request("Demo.Physics.add", &json!({}), ""),
            Err(BusError::ServiceNotFound { .. })
        ));
    }

    #[test]
    fn custom_scalars_travel_as_wrappers() {
        let codec = math_codec();
        codec
            .parse(
                r#"
                syntax = "proto3";
                package Demo;
                message Account {
                    string owner = 1;
                    bigint balance = 2;
                    timestamp opened_at = 3;
                }
            "#,
            )
            .unwrap();
        let payload = json!({
            "owner": "alice",
            "balance": "0xdeadbeef",
            "opened_at": "2024-05-01T12:30:00.250Z",
        });
        let bytes = codec
            .encode_event("Demo.Account", &payload, "EVENT.Demo.Account")
            .unwrap();
        let decoded = codec.decode_event(&bytes).unwrap();
        assert_eq!(decoded.type_name, "Demo.Account");
        assert_eq!(decoded.topic, "EVENT.Demo.Account");
        assert_eq!(
            decoded.payload,
            json!({
                "owner": "alice",
                "balance": 0xdeadbeefu32,
                "opened_at": "2024-05-01T12:30:00.250Z",
            })
        );
    }

    #[test]
    fn absent_message_fields_decode_to_null() {
        let codec = Codec::new();
        codec
            .parse(
                r#"
                syntax = "proto3";
                package Demo;
                message Outer { Inner inner = 1; int32 n = 2; }
                message Inner { string s = 1; }
            "#,
            )
            .unwrap();
        let bytes = codec
            .encode_event("Demo.Outer", &json!({"n": 0}), "t")
            .unwrap();
        let decoded = codec.decode_event(&bytes).unwrap();
        assert_eq!(decoded.payload, json!({"inner": null, "n": 0}));
    }

    #[test]
    fn init_discovers_directories_recursively() {
        let root = std::env::temp_dir().join(format!("protobus-codec-{}", std::process::id()));
        let nested = root.join("demo");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("math.proto"), MATH_SCHEMA).unwrap();

        let codec = Codec::new();
        codec.init(&[&root]).unwrap();
        assert!(codec.has_service("Demo.Math"));
        assert_eq!(codec.method_names("Demo.Math").unwrap(), vec!["add"]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn bad_schema_text_rolls_back() {
        let codec = math_codec();
        assert!(codec.parse("message Broken {").is_err());
        // the registry still serves everything parsed before the failure
        assert!(codec.has_service("Demo.Math"));
        codec
            .parse("syntax = \"proto3\"; message Fine { int32 n = 1; }")
            .unwrap();
        assert!(codec.has_service("Demo.Math"));
    }

    #[test]
    fn method_resolution_requires_qualified_names() {
        let codec = math_codec();
        assert!(matches!(
            codec.encode_request("add", &json!({}), ""),
            Err(BusError::InvalidMessage { .. })
        ));
    }
}
