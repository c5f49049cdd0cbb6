//! Shared fixtures for integration tests requiring a running RabbitMQ.

use courier::{SchemaCodec, TransportConfig};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};

pub fn amqp_url() -> String {
    std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
}

pub fn test_config() -> TransportConfig {
    init_tracing();
    let mut config = TransportConfig::for_test();
    config.broker.url = amqp_url();
    config.broker.reconnect_delay_ms = 200;
    config
}

/// Diagnostic logging, controlled by `COURIER_LOG` (e.g. `courier=debug`).
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env(courier::config::LOG_ENV_VAR)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

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

/// Order-service message types used across the integration tests.
pub fn test_codec() -> SchemaCodec {
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
            DescriptorProto {
                name: Some("CustomerCreated".to_string()),
                field: vec![
                    field("customer_id", 1, Type::Int32),
                    field("name", 2, Type::String),
                ],
                ..Default::default()
            },
        ],
        ..Default::default()
    };

    SchemaCodec::from_file_descriptor_set(prost_types::FileDescriptorSet { file: vec![file] })
        .expect("build test codec")
}
