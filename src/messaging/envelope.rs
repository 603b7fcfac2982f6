//! # Message Envelope
//!
//! Immutable message data model for all inter-service communication.
//! One envelope = one wire message; the JSON-encoded envelope is the message
//! value and carries the routing headers (message id, correlation, tenant).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Header names attached to every published message.
pub mod headers {
    pub const MESSAGE_ID: &str = "Message-ID";
    pub const CORRELATION_ID: &str = "Correlation-ID";
    pub const TENANT_ID: &str = "Tenant-ID";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const CAUSATION_ID: &str = "Causation-ID";
}

/// Immutable envelope wrapping every message on the wire.
///
/// The envelope provides the metadata for idempotent processing
/// (`message_id`), multi-tenant partitioning (`tenant_id`), and distributed
/// tracing (`correlation_id` / `causation_id`). Once created it is never
/// mutated; derived messages get fresh envelopes linked via `causation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message identifier (idempotency key), generated at creation
    pub message_id: Uuid,

    /// Message type, e.g. "campaign.generate" or "asset.rendered"
    pub message_type: String,

    /// Tenant identifier; also the partition key for ordered delivery
    pub tenant_id: String,

    /// Links related messages in one business transaction
    pub correlation_id: Uuid,

    /// Links this message to the message that caused it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,

    /// UTC timestamp stamped at creation
    pub timestamp: DateTime<Utc>,

    /// Opaque structured payload
    pub payload: serde_json::Value,

    /// Opaque metadata map
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Create a new envelope with a fresh message id and correlation id.
    pub fn new(
        message_type: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.into(),
            tenant_id: tenant_id.into(),
            correlation_id: Uuid::new_v4(),
            causation_id: None,
            timestamp: Utc::now(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Set an explicit correlation id (defaults to a fresh UUID).
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Link this envelope to the message that caused it.
    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Attach metadata entries.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Insert a single metadata entry.
    pub fn with_metadata_entry(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Partition key bytes; tenant messages stay ordered within a partition.
    pub fn partition_key(&self) -> &[u8] {
        self.tenant_id.as_bytes()
    }

    /// Wire headers for this envelope.
    pub fn wire_headers(&self) -> HashMap<String, String> {
        let mut h = HashMap::from([
            (headers::MESSAGE_ID.to_string(), self.message_id.to_string()),
            (
                headers::CORRELATION_ID.to_string(),
                self.correlation_id.to_string(),
            ),
            (headers::TENANT_ID.to_string(), self.tenant_id.clone()),
            (headers::TIMESTAMP.to_string(), self.timestamp.to_rfc3339()),
        ]);
        if let Some(causation_id) = self.causation_id {
            h.insert(headers::CAUSATION_ID.to_string(), causation_id.to_string());
        }
        h
    }

    /// Convert to JSON for wire transmission.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Parse an envelope from a wire message value.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Deterministic message id for deliveries whose envelope carries none.
///
/// Derived as a v5 UUID over the delivery coordinates so every redelivery of
/// the same wire message resolves to the same idempotency key.
pub fn derived_message_id(topic: &str, partition: i32, offset: i64) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{topic}:{partition}:{offset}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation_defaults() {
        let envelope = MessageEnvelope::new("campaign.generate", "tenant-1", json!({"id": 7}));

        assert_eq!(envelope.message_type, "campaign.generate");
        assert_eq!(envelope.tenant_id, "tenant-1");
        assert!(envelope.causation_id.is_none());
        assert!(envelope.metadata.is_empty());
        assert_ne!(envelope.message_id, envelope.correlation_id);
    }

    #[test]
    fn test_envelope_builder_chain() {
        let correlation = Uuid::new_v4();
        let causation = Uuid::new_v4();
        let envelope = MessageEnvelope::new("asset.render", "tenant-2", json!({}))
            .with_correlation_id(correlation)
            .with_causation_id(causation)
            .with_metadata_entry("reason", json!("SAGA_COMPENSATION"));

        assert_eq!(envelope.correlation_id, correlation);
        assert_eq!(envelope.causation_id, Some(causation));
        assert_eq!(envelope.metadata["reason"], json!("SAGA_COMPENSATION"));
    }

    #[test]
    fn test_wire_headers_presence() {
        let envelope = MessageEnvelope::new("governance.evaluate", "tenant-3", json!({}));
        let h = envelope.wire_headers();

        assert_eq!(h[headers::MESSAGE_ID], envelope.message_id.to_string());
        assert_eq!(h[headers::TENANT_ID], "tenant-3");
        assert!(h.contains_key(headers::TIMESTAMP));
        assert!(!h.contains_key(headers::CAUSATION_ID));

        let with_causation = MessageEnvelope::new("governance.evaluate", "tenant-3", json!({}))
            .with_causation_id(envelope.message_id);
        assert!(with_causation
            .wire_headers()
            .contains_key(headers::CAUSATION_ID));
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let envelope = MessageEnvelope::new("memory.recall", "tenant-4", json!({"query": "q"}));
        let json = envelope.to_json().unwrap();
        let parsed = MessageEnvelope::from_json(json).unwrap();

        assert_eq!(parsed.message_id, envelope.message_id);
        assert_eq!(parsed.correlation_id, envelope.correlation_id);
        assert_eq!(parsed.payload, envelope.payload);
    }

    #[test]
    fn test_derived_message_id_deterministic() {
        let a = derived_message_id("commands", 0, 42);
        let b = derived_message_id("commands", 0, 42);
        let c = derived_message_id("commands", 0, 43);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
