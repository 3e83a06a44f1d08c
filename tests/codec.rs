//! End-to-end codec scenarios exercised through the public API only. These
//! run without a broker; the wire bytes produced here are what any peer, in
//! any language, would see.

use std::sync::Arc;

use prost_reflect::Value;
use protobus::{Codec, ScalarDescriptor, WireKind};
use serde_json::{json, Value as Json};

const BANK_SCHEMA: &str = r#"
    syntax = "proto3";
    package Bank;

    service Ledger {
        rpc deposit (DepositRequest) returns (Balance);
    }

    message DepositRequest {
        string account = 1;
        bigint amount = 2;
    }

    message Balance {
        string account = 1;
        bigint total = 2;
        timestamp updated_at = 3;
    }

    message Transfer {
        string from = 1;
        string to = 2;
        bigint amount = 3;
    }
"#;

fn bank_codec() -> Codec {
    let codec = Codec::new();
    codec.parse(BANK_SCHEMA).unwrap();
    codec
}

#[test]
fn request_reply_full_cycle() {
    let codec = bank_codec();

    let request = codec
        .encode_request(
            "Bank.Ledger.deposit",
            &json!({"account": "acc-1", "amount": "250"}),
            "alice",
        )
        .unwrap();
    let decoded = codec.decode_request(&request).unwrap();
    assert_eq!(decoded.method, "Bank.Ledger.deposit");
    assert_eq!(decoded.actor, "alice");
    assert_eq!(decoded.payload["account"], "acc-1");
    assert_eq!(decoded.payload["amount"], 250);

    let reply = codec
        .encode_response(
            "Bank.Ledger.deposit",
            &json!({
                "account": "acc-1",
                "total": "1250",
                "updated_at": "2024-05-01T12:30:00.000Z",
            }),
        )
        .unwrap();
    let record = codec.decode_response("Bank.Ledger.deposit", &reply).unwrap();
    let result = record.result.unwrap();
    assert_eq!(result["total"], 1250);
    assert_eq!(result["updated_at"], "2024-05-01T12:30:00.000Z");
}

#[test]
fn separate_codec_instances_interoperate() {
    // two processes with the same schema must agree on the bytes
    let sender = bank_codec();
    let receiver = bank_codec();

    let bytes = sender
        .encode_event(
            "Bank.Transfer",
            &json!({"from": "a", "to": "b", "amount": "0xdeadbeef"}),
            "EVENT.Bank.Transfer",
        )
        .unwrap();
    let event = receiver.decode_event(&bytes).unwrap();
    assert_eq!(event.type_name, "Bank.Transfer");
    assert_eq!(event.payload["amount"], 0xdeadbeefu32);
}

#[test]
fn bigint_boundaries_through_the_schema() {
    let codec = bank_codec();
    let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";

    let bytes = codec
        .encode_event(
            "Bank.Transfer",
            &json!({"from": "a", "to": "b", "amount": max}),
            "t",
        )
        .unwrap();
    let event = codec.decode_event(&bytes).unwrap();
    assert_eq!(event.payload["amount"], Json::String(max.to_string()));

    let zero = codec
        .encode_event(
            "Bank.Transfer",
            &json!({"from": "a", "to": "b", "amount": 0}),
            "t",
        )
        .unwrap();
    let event = codec.decode_event(&zero).unwrap();
    assert_eq!(event.payload["amount"], 0);

    let over = json!({"from": "a", "to": "b", "amount": format!("{max}0")});
    assert!(codec.encode_event("Bank.Transfer", &over, "t").is_err());
}

#[test]
fn user_registered_scalars_join_the_schema() {
    let codec = Codec::new();
    codec
        .register_scalar(ScalarDescriptor {
            name: "upper".to_string(),
            wire: WireKind::String,
            encode: Arc::new(|json| match json {
                Json::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Err(protobus::BusError::invalid_message(format!(
                    "upper rejects {other}"
                ))),
            }),
            decode: Arc::new(|value| match value {
                Value::String(s) => Ok(Json::String(s.clone())),
                _ => Err(protobus::BusError::invalid_message("not a string")),
            }),
        })
        .unwrap();
    codec
        .parse(
            r#"
            syntax = "proto3";
            package Demo;
            message Shout { upper text = 1; }
        "#,
        )
        .unwrap();

    let bytes = codec
        .encode_event("Demo.Shout", &json!({"text": "hello"}), "t")
        .unwrap();
    let event = codec.decode_event(&bytes).unwrap();
    assert_eq!(event.payload["text"], "HELLO");
}

#[test]
fn scalar_registration_after_parse_recompiles() {
    let codec = Codec::new();
    codec
        .parse(
            r#"
            syntax = "proto3";
            package Demo;
            message Plain { string text = 1; }
        "#,
        )
        .unwrap();
    // late registration must not disturb already-parsed schemas
    codec
        .register_scalar(ScalarDescriptor {
            name: "noop".to_string(),
            wire: WireKind::Uint32,
            encode: Arc::new(|json| match json.as_u64() {
                Some(n) => Ok(Value::U32(n as u32)),
                None => Err(protobus::BusError::invalid_message("not a number")),
            }),
            decode: Arc::new(|value| match value {
                Value::U32(n) => Ok(Json::from(*n)),
                _ => Err(protobus::BusError::invalid_message("not a u32")),
            }),
        })
        .unwrap();

    let bytes = codec
        .encode_event("Demo.Plain", &json!({"text": "still here"}), "t")
        .unwrap();
    assert_eq!(codec.decode_event(&bytes).unwrap().payload["text"], "still here");
}

#[test]
fn type_view_names_custom_scalars() {
    let codec = bank_codec();
    let view = codec.export_type_view("Bank.Ledger").unwrap();
    assert_eq!(view.methods.len(), 1);
    let balance = view.types.iter().find(|t| t.name == "Bank.Balance").unwrap();
    let total = balance.fields.iter().find(|f| f.name == "total").unwrap();
    assert_eq!(total.scalar.as_deref(), Some("bigint"));
    let updated = balance
        .fields
        .iter()
        .find(|f| f.name == "updated_at")
        .unwrap();
    assert_eq!(updated.scalar.as_deref(), Some("timestamp"));

    // the view serialises cleanly for generator tooling
    let rendered = serde_json::to_value(&view).unwrap();
    assert_eq!(rendered["service"], "Bank.Ledger");
}
