//! Node naming.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error type for node name validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The name is empty or contains only whitespace.
    EmptyName,
    /// The name contains a character reserved by the key layout.
    ReservedCharacter(char),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyName => write!(f, "Node name cannot be empty"),
            ValidationError::ReservedCharacter(c) => {
                write!(f, "Node name cannot contain '{c}'")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Name of a mesh node, unique within one coordination store prefix.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    /// Creates a random node name.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("n{}", uuid::Uuid::new_v4().simple()))
    }

    /// Creates a `NodeName` from a string, validating it.
    ///
    /// # Errors
    /// Returns `ValidationError` if the name is empty or contains `/`.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if s.contains('/') {
            return Err(ValidationError::ReservedCharacter('/'));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the string representation of this name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
