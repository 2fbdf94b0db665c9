use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::document::DocumentKey;

/// Field of a `doc_update` payload naming a lifecycle event
pub const EVENT_FIELD: &str = "event";

/// Field of a `doc_update` payload carrying the writer's transaction token
pub const TRANSACTION_FIELD: &str = "_transaction";

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request delivery of updates for a document
    SubscribeDoc {
        doctype: String,
        name: String,
        /// Set when the sender waits for an `ack`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// Stop delivery of updates for a document
    UnsubscribeDoc { doctype: String, name: String },
}

impl ClientMessage {
    pub fn subscribe(key: &DocumentKey) -> Self {
        Self::SubscribeDoc {
            doctype: key.collection().to_string(),
            name: key.id().to_string(),
            request_id: None,
        }
    }

    pub fn unsubscribe(key: &DocumentKey) -> Self {
        Self::UnsubscribeDoc {
            doctype: key.collection().to_string(),
            name: key.id().to_string(),
        }
    }

    /// Tag a subscribe request so the server's `ack` can be matched to it
    pub fn with_request_id(self, id: u64) -> Self {
        match self {
            Self::SubscribeDoc { doctype, name, .. } => Self::SubscribeDoc {
                doctype,
                name,
                request_id: Some(id),
            },
            other => other,
        }
    }

    pub fn key(&self) -> DocumentKey {
        match self {
            Self::SubscribeDoc { doctype, name, .. } | Self::UnsubscribeDoc { doctype, name } => {
                DocumentKey::new(doctype.as_str(), name.as_str())
            }
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A document changed, was created or was deleted
    DocUpdate {
        #[serde(default)]
        doctype: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        data: JsonValue,
    },
    /// An externally cached resource should be reloaded
    RefetchResource { cache_key: String },
    /// Acknowledgment of a subscribe request
    Ack {
        #[serde(default)]
        request_id: Option<u64>,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    /// Error message
    Error { message: String },
}

/// What a `doc_update` payload says happened to the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Created,
    Deleted,
    Modified,
}

/// Classify a `doc_update` payload by its `event` field
pub fn update_kind(data: &JsonValue) -> UpdateKind {
    match data.get(EVENT_FIELD).and_then(JsonValue::as_str) {
        Some("created") => UpdateKind::Created,
        Some("deleted") => UpdateKind::Deleted,
        _ => UpdateKind::Modified,
    }
}

/// The transaction token a `doc_update` payload was tagged with, if any
pub fn transaction_token(data: &JsonValue) -> Option<&str> {
    data.get(TRANSACTION_FIELD).and_then(JsonValue::as_str)
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::DoclinkResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::DoclinkResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json = lib0::decoding::Read::read_string(&mut decoder).map_err(|e| {
        crate::DoclinkError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        }
    })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}

/// Decode a bare JSON message (text frames)
pub fn decode_text<T: for<'de> Deserialize<'de>>(text: &str) -> crate::DoclinkResult<T> {
    Ok(serde_json::from_str(text)?)
}
