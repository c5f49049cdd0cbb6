//! Schema codec: reflective protobuf encode/decode by message type name.
//!
//! Message-type definitions are loaded once, at startup, from a compiled
//! `FileDescriptorSet` (the output of `protoc --descriptor_set_out`). After
//! load the codec is stateless and cheap to share.
//!
//! Values cross the codec boundary as `serde_json::Value` in proto3 canonical
//! JSON form, so collaborators stay decoupled from generated message types.

use std::path::Path;

use bytes::Bytes;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor};
use serde_json::Value;
use tracing::info;

use crate::error::{Result, TransportError};

/// Wire content type for schema-encoded payloads.
pub const CONTENT_TYPE: &str = "application/protobuf";

/// Encodes and decodes typed payloads against a pre-loaded schema registry.
pub struct SchemaCodec {
    pool: DescriptorPool,
}

impl SchemaCodec {
    /// Build a codec from raw `FileDescriptorSet` bytes.
    pub fn from_descriptor_bytes(bytes: &[u8]) -> Result<Self> {
        let pool = DescriptorPool::decode(bytes)
            .map_err(|e| TransportError::Decode(format!("Invalid descriptor set: {}", e)))?;

        info!(
            messages = pool.all_messages().count(),
            "Schema registry loaded"
        );

        Ok(Self { pool })
    }

    /// Build a codec from a `FileDescriptorSet` file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            TransportError::Decode(format!("Cannot read descriptor file {:?}: {}", path, e))
        })?;
        Self::from_descriptor_bytes(&bytes)
    }

    /// Build a codec from an in-memory descriptor set.
    pub fn from_file_descriptor_set(set: prost_types::FileDescriptorSet) -> Result<Self> {
        let pool = DescriptorPool::from_file_descriptor_set(set)
            .map_err(|e| TransportError::Decode(format!("Invalid descriptor set: {}", e)))?;
        Ok(Self { pool })
    }

    /// Whether `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.pool.get_message_by_name(type_name).is_some()
    }

    fn descriptor(&self, type_name: &str) -> Result<MessageDescriptor> {
        self.pool.get_message_by_name(type_name).ok_or_else(|| {
            TransportError::Decode(format!("Unknown message type '{}'", type_name))
        })
    }

    /// Encode `value` as the binary form of `type_name`.
    ///
    /// Fails with a `Decode` error if the value does not conform to the
    /// message schema (unknown fields, wrong scalar types, ...).
    pub fn encode(&self, type_name: &str, value: &Value) -> Result<Bytes> {
        let descriptor = self.descriptor(type_name)?;
        let message =
            DynamicMessage::deserialize(descriptor, value.clone()).map_err(|e| {
                TransportError::Decode(format!("Value does not conform to '{}': {}", type_name, e))
            })?;
        Ok(message.encode_to_vec().into())
    }

    /// Decode binary `bytes` as `type_name`.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Value> {
        let descriptor = self.descriptor(type_name)?;
        let message = DynamicMessage::decode(descriptor, bytes).map_err(|e| {
            TransportError::Decode(format!("Malformed payload for '{}': {}", type_name, e))
        })?;
        serde_json::to_value(&message)
            .map_err(|e| TransportError::Decode(format!("Cannot render '{}': {}", type_name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};
    use serde_json::json;

    fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(ty as i32),
            label: Some(Label::Optional as i32),
            json_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn test_codec() -> SchemaCodec {
        let file = FileDescriptorProto {
            name: Some("orders.proto".to_string()),
            package: Some("courier.test".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("GetOrder".to_string()),
                    field: vec![field("id", 1, Type::Int32)],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("Order".to_string()),
                    field: vec![
                        field("id", 1, Type::Int32),
                        field("status", 2, Type::String),
                    ],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        SchemaCodec::from_file_descriptor_set(prost_types::FileDescriptorSet { file: vec![file] })
            .expect("build codec")
    }

    #[test]
    fn test_round_trip() {
        let codec = test_codec();
        let value = json!({"id": 42, "status": "PENDING"});

        let bytes = codec.encode("courier.test.Order", &value).expect("encode");
        let decoded = codec.decode("courier.test.Order", &bytes).expect("decode");

        assert_eq!(decoded["id"], json!(42));
        assert_eq!(decoded["status"], json!("PENDING"));

        // inverse round-trip: decode then encode yields identical bytes
        let re_encoded = codec.encode("courier.test.Order", &decoded).expect("re-encode");
        assert_eq!(bytes, re_encoded);
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        let codec = test_codec();
        let err = codec
            .encode("courier.test.Missing", &json!({}))
            .expect_err("unknown type");
        assert!(matches!(err, TransportError::Decode(_)));
        assert!(!codec.contains("courier.test.Missing"));
        assert!(codec.contains("courier.test.GetOrder"));
    }

    #[test]
    fn test_nonconforming_value_is_decode_error() {
        let codec = test_codec();
        let err = codec
            .encode("courier.test.GetOrder", &json!({"id": "not-a-number"}))
            .expect_err("bad field type");
        assert!(matches!(err, TransportError::Decode(_)));

        let err = codec
            .encode("courier.test.GetOrder", &json!({"bogus": 1}))
            .expect_err("unknown field");
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_malformed_bytes_is_decode_error() {
        let codec = test_codec();
        // field 1 announced as length-delimited with a length running past the buffer
        let err = codec
            .decode("courier.test.Order", &[0x0a, 0xff, 0x01])
            .expect_err("malformed bytes");
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_from_file() {
        use prost::Message;

        let file = tempfile::NamedTempFile::new().expect("temp file");
        let set = prost_types::FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("ping.proto".to_string()),
                package: Some("courier.test".to_string()),
                syntax: Some("proto3".to_string()),
                message_type: vec![DescriptorProto {
                    name: Some("Ping".to_string()),
                    field: vec![field("seq", 1, Type::Int32)],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        std::fs::write(file.path(), set.encode_to_vec()).expect("write descriptor");

        let codec = SchemaCodec::from_file(file.path()).expect("load from file");
        assert!(codec.contains("courier.test.Ping"));
    }
}
