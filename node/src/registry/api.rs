//! Declarative method trees.

use super::handler::{Args, Handler};
use super::MethodRegistry;
use crate::error::MeshError;
use crate::schema::MethodSchema;
use crate::transport::ValueStream;
use serde_json::Value;

/// One node of an [`Api`] tree.
#[derive(Clone)]
pub enum ApiNode {
    /// An exposed method.
    Method {
        /// Wire schema of the method.
        schema: MethodSchema,
        /// Implementation.
        handler: Handler,
    },
    /// A nested group of methods.
    Group(Api),
    /// A placeholder leaf; kept in the tree, never served.
    Constant(String),
}

/// A tree of named methods, as passed to `register`.
///
/// ```
/// use meshwork::registry::{Api, Handler};
/// use meshwork::schema::{FieldType, MessageSchema, MethodSchema};
/// use serde_json::json;
///
/// let echo = MethodSchema::new(
///     MessageSchema::new().field("you", FieldType::String),
///     MessageSchema::result(FieldType::String),
/// );
/// let api = Api::new()
///     .method("testSimple", echo.clone(), Handler::unary(|_, args| async move {
///         Ok(json!(format!("test pass {}", args[0].as_str().unwrap_or_default())))
///     }))
///     .group("nested", Api::new().method("method", echo, Handler::unary(|_, args| async move {
///         Ok(args[0].clone())
///     })));
/// assert_eq!(api.entries(), vec!["testSimple", "nested/method"]);
/// ```
#[derive(Clone, Default)]
pub struct Api {
    children: Vec<(String, ApiNode)>,
}

impl Api {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, schema: MethodSchema, handler: Handler) -> Self {
        self.children
            .push((name.into(), ApiNode::Method { schema, handler }));
        self
    }

    /// Adds a nested group.
    #[must_use]
    pub fn group(mut self, name: impl Into<String>, api: Api) -> Self {
        self.children.push((name.into(), ApiNode::Group(api)));
        self
    }

    /// Adds a placeholder leaf.
    #[must_use]
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.children
            .push((name.into(), ApiNode::Constant(value.into())));
        self
    }

    /// Children in declaration order.
    #[must_use]
    pub fn children(&self) -> &[(String, ApiNode)] {
        &self.children
    }

    /// Entry paths of every method in the tree, in declaration order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.visit("", &mut |entry, _, _| out.push(entry.to_string()));
        out
    }

    /// Walks every method leaf depth-first with its full entry path.
    pub fn visit<F>(&self, prefix: &str, f: &mut F)
    where
        F: FnMut(&str, &MethodSchema, &Handler),
    {
        for (name, node) in &self.children {
            let entry = join(prefix, name);
            match node {
                ApiNode::Method { schema, handler } => f(&entry, schema, handler),
                ApiNode::Group(api) => api.visit(&entry, f),
                ApiNode::Constant(_) => {}
            }
        }
    }
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// A registered method bound to its node, callable in-process.
#[derive(Clone)]
pub struct LocalMethod {
    registry: MethodRegistry,
    entry: String,
}

impl LocalMethod {
    /// Entry path of the method.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Invokes the method in-process; stream results are collected.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::RemoteCall`] if the handler fails.
    pub async fn call(&self, args: Args) -> Result<Value, MeshError> {
        self.registry.call_local(&self.entry, args).await
    }

    /// Opens the method's results as a stream.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::EntryNotFound`] if the method is gone.
    pub fn stream(&self, args: Args) -> Result<ValueStream, MeshError> {
        self.registry.stream_local(&self.entry, args)
    }
}

/// One node of a [`BoundApi`].
#[derive(Clone)]
pub enum Bound {
    /// A registered method.
    Method(LocalMethod),
    /// A nested group.
    Group(BoundApi),
    /// A placeholder leaf, unchanged.
    Constant(String),
}

/// The tree returned by `register`: same shape, leaves bound to the node.
#[derive(Clone, Default)]
pub struct BoundApi {
    children: Vec<(String, Bound)>,
}

impl BoundApi {
    pub(crate) fn bind(api: &Api, prefix: &str, registry: &MethodRegistry) -> Self {
        let children = api
            .children
            .iter()
            .map(|(name, node)| {
                let entry = join(prefix, name);
                let bound = match node {
                    ApiNode::Method { .. } => Bound::Method(LocalMethod {
                        registry: registry.clone(),
                        entry,
                    }),
                    ApiNode::Group(group) => Bound::Group(Self::bind(group, &entry, registry)),
                    ApiNode::Constant(value) => Bound::Constant(value.clone()),
                };
                (name.clone(), bound)
            })
            .collect();
        Self { children }
    }

    /// Looks up a direct child.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, bound)| bound)
    }

    /// Looks up a method by slash-separated path relative to this tree.
    #[must_use]
    pub fn method(&self, path: &str) -> Option<&LocalMethod> {
        let (head, rest) = match path.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        match (self.get(head)?, rest) {
            (Bound::Method(method), None) => Some(method),
            (Bound::Group(group), Some(rest)) => group.method(rest),
            _ => None,
        }
    }
}
