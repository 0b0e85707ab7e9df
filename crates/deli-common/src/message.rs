//! Wire envelopes exchanged with the inbound and outbound logs.
//!
//! Only the fields needed for ticketing are modelled. Operation contents are
//! carried through untouched as JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{SequenceNumber, Timestamp};

/// Operation as submitted by a client, before it has a place in the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    pub client_sequence_number: u64,
    pub reference_sequence_number: SequenceNumber,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub contents: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperationMessage {
    pub document_id: String,
    /// Absent for service-generated operations.
    #[serde(default)]
    pub client_id: Option<String>,
    pub operation: DocumentMessage,
    #[serde(default)]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReferenceSequenceNumberMessage {
    pub document_id: String,
    pub client_id: String,
    pub sequence_number: SequenceNumber,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// Parsed inbound envelope, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    RawOperation(RawOperationMessage),
    UpdateReferenceSequenceNumber(UpdateReferenceSequenceNumberMessage),
    /// Any other message type. Tracked for offsets only.
    #[serde(other)]
    Other,
}

/// Discriminant of an [`InboundMessage`], used for routing and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RawOperation,
    UpdateReferenceSequenceNumber,
    Other,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::RawOperation => "raw_operation",
            MessageKind::UpdateReferenceSequenceNumber => "update_reference",
            MessageKind::Other => "other",
        }
    }
}

impl InboundMessage {
    /// Decode a UTF-8 JSON payload.
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::RawOperation(_) => MessageKind::RawOperation,
            InboundMessage::UpdateReferenceSequenceNumber(_) => {
                MessageKind::UpdateReferenceSequenceNumber
            }
            InboundMessage::Other => MessageKind::Other,
        }
    }

    /// Document the message is addressed to, if it is one we ticket.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            InboundMessage::RawOperation(msg) => Some(&msg.document_id),
            InboundMessage::UpdateReferenceSequenceNumber(msg) => Some(&msg.document_id),
            InboundMessage::Other => None,
        }
    }
}

/// Operation after ticketing, as seen by every downstream reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedDocumentMessage {
    pub client_id: Option<String>,
    pub client_sequence_number: u64,
    pub reference_sequence_number: SequenceNumber,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
    #[serde(rename = "type")]
    pub op_type: String,
    pub contents: serde_json::Value,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOperationMessage {
    pub document_id: String,
    pub operation: SequencedDocumentMessage,
}

/// Envelope published to the outbound log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    SequencedOperation(SequencedOperationMessage),
}

impl OutboundMessage {
    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_raw_operation() {
        let payload = json!({
            "type": "RawOperation",
            "documentId": "doc-1",
            "clientId": "client-a",
            "operation": {
                "clientSequenceNumber": 4,
                "referenceSequenceNumber": 2,
                "type": "op",
                "contents": {"insert": "x"}
            },
            "timestamp": 1700000000000i64
        });

        let msg = InboundMessage::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(msg.kind(), MessageKind::RawOperation);
        assert_eq!(msg.document_id(), Some("doc-1"));

        match msg {
            InboundMessage::RawOperation(raw) => {
                assert_eq!(raw.client_id.as_deref(), Some("client-a"));
                assert_eq!(raw.operation.client_sequence_number, 4);
                assert_eq!(raw.operation.reference_sequence_number, 2);
                assert_eq!(raw.operation.contents, json!({"insert": "x"}));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_reference() {
        let payload = br#"{"type":"UpdateReferenceSequenceNumber","documentId":"d","clientId":"c","sequenceNumber":9}"#;
        let msg = InboundMessage::parse(payload).unwrap();
        assert_eq!(msg.kind(), MessageKind::UpdateReferenceSequenceNumber);
        assert_eq!(msg.document_id(), Some("d"));
    }

    #[test]
    fn test_unknown_type_is_other() {
        let payload = br#"{"type":"Heartbeat","documentId":"d","anything":[1,2,3]}"#;
        let msg = InboundMessage::parse(payload).unwrap();
        assert_eq!(msg, InboundMessage::Other);
        assert_eq!(msg.document_id(), None);
    }

    #[test]
    fn test_malformed_payload_fails() {
        assert!(InboundMessage::parse(b"not json").is_err());
        assert!(InboundMessage::parse(br#"{"documentId":"d"}"#).is_err());
        assert!(InboundMessage::parse(br#"{"type":"RawOperation","documentId":"d"}"#).is_err());
    }

    #[test]
    fn test_outbound_envelope_is_tagged() {
        let out = OutboundMessage::SequencedOperation(SequencedOperationMessage {
            document_id: "doc".to_string(),
            operation: SequencedDocumentMessage {
                client_id: Some("c".to_string()),
                client_sequence_number: 1,
                reference_sequence_number: 0,
                sequence_number: 1,
                minimum_sequence_number: 0,
                op_type: "op".to_string(),
                contents: serde_json::Value::Null,
                timestamp: 0,
            },
        });

        let value: serde_json::Value =
            serde_json::from_slice(&out.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "SequencedOperation");
        assert_eq!(value["documentId"], "doc");
        assert_eq!(value["operation"]["sequenceNumber"], 1);
        assert_eq!(value["operation"]["type"], "op");
    }
}
