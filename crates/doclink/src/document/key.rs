use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a subscribable document: its collection (doctype) and id (name)
///
/// Keys order and hash by `(collection, id)`. Callers must not put `:` in a
/// collection name, otherwise two keys could share a display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    collection: String,
    id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse the `collection:id` display form
    ///
    /// Splits on the first `:`, so ids may themselves contain colons.
    pub fn parse(value: &str) -> Option<Self> {
        let (collection, id) = value.split_once(':')?;
        if collection.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(collection, id))
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Both components present
    pub fn is_valid(&self) -> bool {
        !self.collection.is_empty() && !self.id.is_empty()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.id)
    }
}

impl<C: Into<String>, I: Into<String>> From<(C, I)> for DocumentKey {
    fn from((collection, id): (C, I)) -> Self {
        Self::new(collection, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let key = DocumentKey::new("CRM Lead", "CRM-LEAD-2024-00001");
        assert_eq!(key.to_string(), "CRM Lead:CRM-LEAD-2024-00001");
        assert_eq!(DocumentKey::parse(&key.to_string()), Some(key));

        let with_colon = DocumentKey::parse("Note:12:30 call").unwrap();
        assert_eq!(with_colon.collection(), "Note");
        assert_eq!(with_colon.id(), "12:30 call");

        assert_eq!(DocumentKey::parse("no-separator"), None);
        assert_eq!(DocumentKey::parse(":missing-collection"), None);
    }

    #[test]
    fn test_ordering_is_by_collection_then_id() {
        let mut keys = vec![
            DocumentKey::new("Task", "a"),
            DocumentKey::new("CRM Deal", "z"),
            DocumentKey::new("CRM Deal", "b"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["CRM Deal:b", "CRM Deal:z", "Task:a"]);
    }

    #[test]
    fn test_validity() {
        assert!(DocumentKey::from(("Task", "T-1")).is_valid());
        assert!(!DocumentKey::new("", "T-1").is_valid());
        assert!(!DocumentKey::new("Task", "").is_valid());
    }
}
