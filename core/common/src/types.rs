//! Common types used throughout SkySync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued offline action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ActionId from an existing string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ActionId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_creation() {
        let id = ActionId::new("action-1").unwrap();
        assert_eq!(id.as_str(), "action-1");
    }

    #[test]
    fn test_action_id_empty_fails() {
        assert!(ActionId::new("").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ActionId::generate(), ActionId::generate());
    }

    #[test]
    fn test_action_id_serializes_as_plain_string() {
        let id = ActionId::new("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
