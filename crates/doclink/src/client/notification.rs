use serde::Serialize;

use crate::document::DocumentKey;

/// Lifecycle events for UI collaborators
///
/// Purely observational: nothing in the client waits on these being read,
/// and a lagging receiver simply misses old entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Connected,
    Reconnected { attempts: u32 },
    Disconnected { reason: String, critical: bool },
    Reconnecting { attempt: u32 },
    /// Too many consecutive critical connection errors
    ConnectionIssues { message: String, error: String },
    DocCreated { key: DocumentKey },
    DocDeleted { key: DocumentKey },
    /// An externally cached resource should be reloaded
    RefetchResource { cache_key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_event_tag() {
        let json = serde_json::to_value(Notification::Disconnected {
            reason: "ping timeout".to_string(),
            critical: true,
        })
        .unwrap();
        assert_eq!(json["event"], "disconnected");
        assert_eq!(json["critical"], true);

        let json = serde_json::to_value(Notification::DocDeleted {
            key: DocumentKey::new("Task", "T-9"),
        })
        .unwrap();
        assert_eq!(json["event"], "doc_deleted");
    }
}
