use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};

use crate::registry::{ExpandContext, ExpanderRegistry};
use crate::tree::{ExpansionTree, Node};

/// Key under which `Include` mode attaches collected expansion errors.
pub const EXPANSION_ERRORS_KEY: &str = "_expansionErrors";

/// What to do when expanding one path fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Drop the field and record the error internally (logged only)
    #[default]
    Ignore,
    /// Drop the field and attach the error to the response under
    /// [`EXPANSION_ERRORS_KEY`]
    Include,
    /// Propagate the first error to the caller
    Throw,
}

/// An error collected while expanding one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionError {
    /// `<DTO>.<path>[<index>?]`, unique per failing site
    pub key: String,
    pub message: String,
    /// Dotted field path, including collection indices
    pub path: String,
}

/// Recursive expansion driver over a validated [`ExpanderRegistry`].
pub struct Expansion<'r> {
    registry: &'r ExpanderRegistry,
    policy: ErrorPolicy,
}

impl<'r> Expansion<'r> {
    pub fn new(registry: &'r ExpanderRegistry) -> Self {
        Self {
            registry,
            policy: ErrorPolicy::default(),
        }
    }

    pub fn with_policy(registry: &'r ExpanderRegistry, policy: ErrorPolicy) -> Self {
        Self { registry, policy }
    }

    /// Expand `resource` according to `tree`.
    ///
    /// When `root_field` is given the resource is treated as a wrapper and
    /// expansion applies to the value under that field. Arrays are expanded
    /// element-wise; with [`ErrorPolicy::Include`] each element carries its
    /// own `_expansionErrors`.
    pub async fn expand(
        &self,
        resource: Value,
        tree: &ExpansionTree,
        dto: &str,
        root_field: Option<&str>,
        request: &Value,
    ) -> Result<Value> {
        if tree.is_empty() {
            return Ok(resource);
        }
        if !self.registry.has_expander(dto) {
            return Err(anyhow!("No expander registered for DTO '{}'", dto));
        }

        match root_field {
            Some(field) => {
                let Value::Object(mut wrapper) = resource else {
                    return Err(anyhow!(
                        "Expected an object with root field '{}', got a non-object",
                        field
                    ));
                };
                let inner = wrapper
                    .remove(field)
                    .ok_or_else(|| anyhow!("Root field '{}' missing from response", field))?;
                let expanded = self.expand_top(inner, tree, dto, request).await?;
                wrapper.insert(field.to_string(), expanded);
                Ok(Value::Object(wrapper))
            }
            None => self.expand_top(resource, tree, dto, request).await,
        }
    }

    /// Expand the top-level value and attach collected errors per object.
    async fn expand_top(
        &self,
        resource: Value,
        tree: &ExpansionTree,
        dto: &str,
        request: &Value,
    ) -> Result<Value> {
        match resource {
            Value::Array(items) => {
                let mut expanded = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let prefix = format!("{dto}[{index}]");
                    let (value, errors) =
                        self.expand_value(item, tree, dto, request, prefix).await?;
                    expanded.push(self.attach_errors(value, errors));
                }
                Ok(Value::Array(expanded))
            }
            other => {
                let (value, errors) = self
                    .expand_value(other, tree, dto, request, dto.to_string())
                    .await?;
                Ok(self.attach_errors(value, errors))
            }
        }
    }

    /// Recursively expand one value. Returns the expanded value plus the
    /// errors collected beneath it; `Err` is only produced under
    /// [`ErrorPolicy::Throw`].
    fn expand_value<'a>(
        &'a self,
        value: Value,
        tree: &'a ExpansionTree,
        dto: &'a str,
        request: &'a Value,
        prefix: String,
    ) -> BoxFuture<'a, Result<(Value, Vec<ExpansionError>)>> {
        async move {
            match value {
                Value::Array(items) => {
                    let mut expanded = Vec::with_capacity(items.len());
                    let mut errors = Vec::new();
                    for (index, item) in items.into_iter().enumerate() {
                        let (value, item_errors) = self
                            .expand_value(item, tree, dto, request, format!("{prefix}[{index}]"))
                            .await?;
                        expanded.push(value);
                        errors.extend(item_errors);
                    }
                    Ok((Value::Array(expanded), errors))
                }
                Value::Object(object) => self.expand_object(object, tree, dto, request, prefix).await,
                scalar => Ok((scalar, Vec::new())),
            }
        }
        .boxed()
    }

    async fn expand_object(
        &self,
        mut object: Map<String, Value>,
        tree: &ExpansionTree,
        dto: &str,
        request: &Value,
        prefix: String,
    ) -> Result<(Value, Vec<ExpansionError>)> {
        let mut errors = Vec::new();

        for (key, node) in tree.iter() {
            if key == "*" || !node.is_enabled() {
                continue;
            }
            let path = format!("{prefix}.{key}");

            let Some(method) = self.registry.resolve(dto, key) else {
                if self.policy == ErrorPolicy::Throw {
                    return Err(anyhow!("No expander method for '{}'", path));
                }
                self.record(&mut errors, &path, "no expander method for field");
                continue;
            };

            let parent = Value::Object(object.clone());
            let args = method.resolve_args(&parent, request);
            let context = ExpandContext {
                parent,
                request: request.clone(),
                args,
            };

            match (method.func)(context).await {
                Ok(mut result) => {
                    if let (Some(subtree), Some(target)) = (node.subtree(), &method.target) {
                        let (expanded, nested) = self
                            .expand_value(result, subtree, target, request, path.clone())
                            .await?;
                        result = expanded;
                        errors.extend(nested);
                    }
                    object.insert(key.to_string(), result);
                }
                Err(e) => {
                    if self.policy == ErrorPolicy::Throw {
                        return Err(e.context(format!("Failed to expand '{}'", path)));
                    }
                    self.record(&mut errors, &path, &format!("{e:#}"));
                }
            }
        }

        Ok((Value::Object(object), errors))
    }

    fn record(&self, errors: &mut Vec<ExpansionError>, path: &str, message: &str) {
        tracing::debug!("Expansion of '{}' failed: {}", path, message);
        errors.push(ExpansionError {
            key: path.to_string(),
            message: message.to_string(),
            path: path.to_string(),
        });
    }

    /// Under `Include`, attach collected errors to the object.
    fn attach_errors(&self, value: Value, errors: Vec<ExpansionError>) -> Value {
        if self.policy != ErrorPolicy::Include || errors.is_empty() {
            return value;
        }
        let Value::Object(mut object) = value else {
            return value;
        };
        let mut map = Map::new();
        for error in errors {
            map.insert(
                error.key.clone(),
                json!({"message": error.message, "path": error.path}),
            );
        }
        object.insert(EXPANSION_ERRORS_KEY.to_string(), Value::Object(map));
        Value::Object(object)
    }
}

/// Recursively restrict `value` to the fields selected by `tree`.
///
/// `*` keeps every key at its level, a `-key` leaf removes one, and keys
/// with subtrees are masked recursively. An empty tree keeps the value
/// untouched. Arrays are masked element-wise.
pub fn mask(value: Value, tree: &ExpansionTree) -> Value {
    if tree.is_empty() {
        return value;
    }
    match value {
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| mask(item, tree)).collect())
        }
        Value::Object(object) => {
            let wildcard = tree.has_wildcard();
            let mut masked = Map::new();
            for (key, item) in object {
                match tree.get(&key) {
                    Some(Node::Leaf(false)) => continue,
                    Some(Node::Leaf(true)) => {
                        masked.insert(key, item);
                    }
                    Some(Node::Tree(subtree)) => {
                        masked.insert(key, mask(item, subtree));
                    }
                    None => {
                        if wildcard {
                            masked.insert(key, item);
                        }
                    }
                }
            }
            Value::Object(masked)
        }
        scalar => scalar,
    }
}
