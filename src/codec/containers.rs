//! Framing envelopes carried on the wire around every payload.
//!
//! Tag numbers are part of the cross-language contract and must not change:
//! any Protobuf decoder configured with these tags interoperates with peers
//! regardless of language.

/// Envelope wrapping an RPC request payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestContainer {
    /// Fully-qualified method, e.g. `Demo.Math.add`
    #[prost(string, tag = "1")]
    pub method: String,
    /// Caller identity, opaque to the runtime
    #[prost(string, tag = "2")]
    pub actor: String,
    /// Payload encoded against the method's input type
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Envelope wrapping an RPC reply: either a result or a structured error.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseContainer {
    #[prost(oneof = "response_container::Outcome", tags = "1, 2")]
    pub outcome: Option<response_container::Outcome>,
}

pub mod response_container {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Result(super::ResponseResult),
        #[prost(message, tag = "2")]
        Error(super::ResponseError),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseResult {
    /// Payload encoded against the method's output type
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseError {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub code: String,
    /// Business-semantic failure flag; handled errors are never retried
    #[prost(bool, tag = "3")]
    pub handled: bool,
}

/// Envelope wrapping a published event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventContainer {
    /// Fully-qualified payload type name
    #[prost(string, tag = "1")]
    pub type_name: String,
    /// Topic the event was routed under
    #[prost(string, tag = "2")]
    pub topic: String,
    /// Payload encoded against `type_name`
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn request_container_wire_layout() {
        let container = RequestContainer {
            method: "M.add".to_string(),
            actor: "u1".to_string(),
            payload: vec![0x08, 0x01],
        };
        // field 1 (string): 0x0A len "M.add"
        // field 2 (string): 0x12 len "u1"
        // field 3 (bytes):  0x1A len 08 01
        let expected = [
            0x0A, 0x05, b'M', b'.', b'a', b'd', b'd', 0x12, 0x02, b'u', b'1', 0x1A, 0x02, 0x08,
            0x01,
        ];
        assert_eq!(container.encode_to_vec(), expected);
    }

    #[test]
    fn response_outcome_tags() {
        let ok = ResponseContainer {
            outcome: Some(response_container::Outcome::Result(ResponseResult {
                payload: vec![0x08, 0x03],
            })),
        };
        // oneof result lives under field 1 as a nested message
        assert_eq!(ok.encode_to_vec()[0], 0x0A);

        let err = ResponseContainer {
            outcome: Some(response_container::Outcome::Error(ResponseError {
                message: "bad".to_string(),
                code: "VALIDATION_ERROR".to_string(),
                handled: true,
            })),
        };
        let bytes = err.encode_to_vec();
        // oneof error lives under field 2
        assert_eq!(bytes[0], 0x12);
        let decoded = ResponseContainer::decode(bytes.as_slice()).unwrap();
        match decoded.outcome {
            Some(response_container::Outcome::Error(e)) => {
                assert_eq!(e.code, "VALIDATION_ERROR");
                assert!(e.handled);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn event_container_round_trip() {
        let container = EventContainer {
            type_name: "Demo.UserCreated".to_string(),
            topic: "EVENT.Demo.UserCreated".to_string(),
            payload: vec![1, 2, 3],
        };
        let decoded = EventContainer::decode(container.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, container);
    }
}
