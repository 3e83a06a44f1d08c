//! Language-neutral rendering of a service's type surface, consumed by
//! code generators when they emit statically typed client stubs.

use std::collections::BTreeMap;

use prost_reflect::{DescriptorPool, Kind, MessageDescriptor};
use serde::Serialize;

use crate::codec::scalars::ScalarRegistry;
use crate::error::{BusError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub service: String,
    pub methods: Vec<MethodView>,
    pub types: Vec<TypeView>,
    pub enums: Vec<EnumView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodView {
    pub name: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeView {
    pub name: String,
    pub fields: Vec<FieldView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldView {
    pub name: String,
    /// Scalar kind, `message:<name>`, `enum:<name>`, or a custom scalar name
    pub kind: String,
    pub repeated: bool,
    pub map: bool,
    pub nullable: bool,
    /// Set when the field's declared type is a registered custom scalar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scalar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumView {
    pub name: String,
    pub values: Vec<EnumValueView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnumValueView {
    pub name: String,
    pub number: i32,
}

pub(crate) fn export(
    pool: &DescriptorPool,
    service: &str,
    scalars: &ScalarRegistry,
) -> Result<ServiceView> {
    let descriptor = pool
        .get_service_by_name(service)
        .ok_or_else(|| BusError::ServiceNotFound {
            service: service.to_string(),
        })?;

    let mut methods = Vec::new();
    let mut types = BTreeMap::new();
    let mut enums = BTreeMap::new();
    for method in descriptor.methods() {
        methods.push(MethodView {
            name: method.name().to_string(),
            input: method.input().full_name().to_string(),
            output: method.output().full_name().to_string(),
        });
        collect_type(&method.input(), scalars, &mut types, &mut enums);
        collect_type(&method.output(), scalars, &mut types, &mut enums);
    }

    Ok(ServiceView {
        service: service.to_string(),
        methods,
        types: types.into_values().collect(),
        enums: enums.into_values().collect(),
    })
}

fn collect_type(
    desc: &MessageDescriptor,
    scalars: &ScalarRegistry,
    types: &mut BTreeMap<String, TypeView>,
    enums: &mut BTreeMap<String, EnumView>,
) {
    let name = desc.full_name().to_string();
    if types.contains_key(&name) {
        return;
    }
    // reserve the slot first so recursive types terminate
    types.insert(
        name.clone(),
        TypeView {
            name: name.clone(),
            fields: Vec::new(),
        },
    );

    let mut fields = Vec::new();
    for field in desc.fields() {
        let (kind, scalar) = match field.kind() {
            Kind::Message(inner) => {
                if inner.package_name().is_empty() && scalars.get(inner.name()).is_some() {
                    (inner.name().to_string(), Some(inner.name().to_string()))
                } else if field.is_map() {
                    let value_kind = inner.map_entry_value_field().kind();
                    if let Kind::Message(value_desc) = &value_kind {
                        collect_type(value_desc, scalars, types, enums);
                    }
                    (format!("map:{}", kind_label(&value_kind)), None)
                } else {
                    collect_type(&inner, scalars, types, enums);
                    (format!("message:{}", inner.full_name()), None)
                }
            }
            Kind::Enum(inner) => {
                enums.entry(inner.full_name().to_string()).or_insert_with(|| EnumView {
                    name: inner.full_name().to_string(),
                    values: inner
                        .values()
                        .map(|v| EnumValueView {
                            name: v.name().to_string(),
                            number: v.number(),
                        })
                        .collect(),
                });
                (format!("enum:{}", inner.full_name()), None)
            }
            other => (kind_label(&other), None),
        };
        fields.push(FieldView {
            name: field.name().to_string(),
            kind,
            repeated: field.is_list(),
            map: field.is_map(),
            nullable: field.supports_presence(),
            scalar,
        });
    }
    if let Some(entry) = types.get_mut(&name) {
        entry.fields = fields;
    }
}

fn kind_label(kind: &Kind) -> String {
    match kind {
        Kind::Double => "double".to_string(),
        Kind::Float => "float".to_string(),
        Kind::Int32 => "int32".to_string(),
        Kind::Int64 => "int64".to_string(),
        Kind::Uint32 => "uint32".to_string(),
        Kind::Uint64 => "uint64".to_string(),
        Kind::Sint32 => "sint32".to_string(),
        Kind::Sint64 => "sint64".to_string(),
        Kind::Fixed32 => "fixed32".to_string(),
        Kind::Fixed64 => "fixed64".to_string(),
        Kind::Sfixed32 => "sfixed32".to_string(),
        Kind::Sfixed64 => "sfixed64".to_string(),
        Kind::Bool => "bool".to_string(),
        Kind::String => "string".to_string(),
        Kind::Bytes => "bytes".to_string(),
        Kind::Message(desc) => format!("message:{}", desc.full_name()),
        Kind::Enum(desc) => format!("enum:{}", desc.full_name()),
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::Codec;

    #[test]
    fn exports_methods_fields_and_scalar_tags() {
        let codec = Codec::new();
        codec
            .parse(
                r#"
                syntax = "proto3";
                package Bank;
                service Accounts {
                    rpc open (OpenRequest) returns (Account);
                }
                message OpenRequest { string owner = 1; }
                message Account {
                    string owner = 1;
                    bigint balance = 2;
                    optional string nickname = 3;
                    repeated string tags = 4;
                    Status status = 5;
                }
                enum Status { UNKNOWN = 0; OPEN = 1; CLOSED = 2; }
            "#,
            )
            .unwrap();

        let view = codec.export_type_view("Bank.Accounts").unwrap();
        assert_eq!(view.service, "Bank.Accounts");
        assert_eq!(view.methods.len(), 1);
        assert_eq!(view.methods[0].input, "Bank.OpenRequest");
        assert_eq!(view.methods[0].output, "Bank.Account");

        let account = view.types.iter().find(|t| t.name == "Bank.Account").unwrap();
        let balance = account.fields.iter().find(|f| f.name == "balance").unwrap();
        assert_eq!(balance.kind, "bigint");
        assert_eq!(balance.scalar.as_deref(), Some("bigint"));

        let nickname = account.fields.iter().find(|f| f.name == "nickname").unwrap();
        assert!(nickname.nullable);
        let tags = account.fields.iter().find(|f| f.name == "tags").unwrap();
        assert!(tags.repeated);

        let status = view.enums.iter().find(|e| e.name == "Bank.Status").unwrap();
        assert_eq!(status.values.len(), 3);
    }
}
