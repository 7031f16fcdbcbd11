//! Explicit receiver handed to every handler invocation.

use super::handler::Args;
use super::MethodRegistry;
use crate::error::MeshError;
use crate::transport::ValueStream;
use serde_json::Value;
use std::sync::Arc;

/// The context a handler runs in.
///
/// A scope knows which entry is running and the group it belongs to, so a
/// handler can call its siblings by relative name without going over the wire.
#[derive(Clone)]
pub struct Scope {
    registry: MethodRegistry,
    entry: Arc<str>,
}

impl Scope {
    pub(crate) fn new(registry: MethodRegistry, entry: &str) -> Self {
        Self {
            registry,
            entry: Arc::from(entry),
        }
    }

    /// Entry of the running method.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Path of the group containing the running method; empty at the root.
    #[must_use]
    pub fn parent(&self) -> &str {
        self.entry.rsplit_once('/').map_or("", |(parent, _)| parent)
    }

    /// Resolves a name relative to the running method's group.
    #[must_use]
    pub fn resolve(&self, relative: &str) -> String {
        match self.parent() {
            "" => relative.to_string(),
            parent => format!("{parent}/{relative}"),
        }
    }

    /// Calls a sibling method in-process.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] for an unknown sibling, or
    /// [`MeshError::RemoteCall`] if the sibling fails.
    pub async fn call(&self, relative: &str, args: Args) -> Result<Value, MeshError> {
        self.registry.call_local(&self.resolve(relative), args).await
    }

    /// Opens the result stream of a sibling method in-process.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] for an unknown sibling.
    pub fn stream(&self, relative: &str, args: Args) -> Result<ValueStream, MeshError> {
        self.registry.stream_local(&self.resolve(relative), args)
    }

    /// Registry of the node running this method.
    #[must_use]
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_resolution() {
        let nested = Scope::new(MethodRegistry::new(), "nested/deep/method");
        assert_eq!(nested.parent(), "nested/deep");
        assert_eq!(nested.resolve("other"), "nested/deep/other");

        let root = Scope::new(MethodRegistry::new(), "method");
        assert_eq!(root.parent(), "");
        assert_eq!(root.resolve("other"), "other");
    }
}
