use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;

/// Everything an expander method sees when invoked.
pub struct ExpandContext {
    /// Shallow copy of the object being expanded
    pub parent: Value,
    /// Opaque per-request data (auth principal, locale, ...)
    pub request: Value,
    /// Arguments resolved from the method's declared parameter paths, or
    /// produced by its argument function
    pub args: Vec<Value>,
}

type ExpandFn = Arc<dyn Fn(ExpandContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type ArgsFn = Arc<dyn Fn(&Value, &Value) -> Vec<Value> + Send + Sync>;

/// One expander method: the function to call, how to build its arguments,
/// and optionally the DTO its result expands into.
#[derive(Clone)]
pub struct MethodDef {
    pub(crate) func: ExpandFn,
    pub(crate) params: Vec<String>,
    pub(crate) args_fn: Option<ArgsFn>,
    pub(crate) target: Option<String>,
}

impl MethodDef {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(ExpandContext) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            params: Vec::new(),
            args_fn: None,
            target: None,
        }
    }

    /// Declare parent property paths to pass as arguments, e.g.
    /// `["instructorId"]` or `["parent.id"]`.
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Compute arguments with a function of `(parent, request)` instead of
    /// declared paths. Takes precedence over [`params`](Self::params).
    pub fn args_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Vec<Value> + Send + Sync + 'static,
    {
        self.args_fn = Some(Arc::new(f));
        self
    }

    /// Declare that the method's result is itself expandable as `dto`,
    /// enabling recursion into nested sub-trees.
    pub fn target(mut self, dto: impl Into<String>) -> Self {
        self.target = Some(dto.into());
        self
    }

    /// Resolve this method's arguments for one invocation.
    pub(crate) fn resolve_args(&self, parent: &Value, request: &Value) -> Vec<Value> {
        if let Some(args_fn) = &self.args_fn {
            return args_fn(parent, request);
        }
        self.params
            .iter()
            .map(|path| lookup_path(parent, path))
            .collect()
    }
}

/// A declarative link from an expander field to a method in a reusable
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLink {
    pub container: String,
    pub method: String,
    /// Parameter paths overriding the reusable method's own declaration
    pub params: Vec<String>,
}

impl FieldLink {
    pub fn new(container: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            method: method.into(),
            params: Vec::new(),
        }
    }

    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Default)]
struct ExpanderDef {
    methods: HashMap<String, MethodDef>,
    links: HashMap<String, FieldLink>,
}

/// Registry of expanders, reusable method containers, and field links.
///
/// Built once at startup and validated before serving requests.
#[derive(Clone, Default)]
pub struct ExpanderRegistry {
    expanders: HashMap<String, ExpanderDef>,
    reusable: HashMap<String, HashMap<String, MethodDef>>,
}

impl ExpanderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a standard expander method for `field` of `dto`.
    pub fn add_method(&mut self, dto: impl Into<String>, field: impl Into<String>, method: MethodDef) {
        self.expanders
            .entry(dto.into())
            .or_default()
            .methods
            .insert(field.into(), method);
    }

    /// Register a method in a reusable container, callable from multiple
    /// expanders via [`FieldLink`]s.
    pub fn add_reusable(
        &mut self,
        container: impl Into<String>,
        method: impl Into<String>,
        def: MethodDef,
    ) {
        self.reusable
            .entry(container.into())
            .or_default()
            .insert(method.into(), def);
    }

    /// Link `field` of `dto` to a reusable method. Links take precedence
    /// over standard methods of the same field.
    pub fn add_link(&mut self, dto: impl Into<String>, field: impl Into<String>, link: FieldLink) {
        self.expanders
            .entry(dto.into())
            .or_default()
            .links
            .insert(field.into(), link);
    }

    /// Validate the registry: every listed expandable DTO has at least one
    /// expander, and every link references an existing reusable method.
    /// Configuration errors here are fatal at startup.
    pub fn validate(&self, expandable_dtos: &[&str]) -> Result<()> {
        for dto in expandable_dtos {
            match self.expanders.get(*dto) {
                Some(def) if !def.methods.is_empty() || !def.links.is_empty() => {}
                _ => bail!("Expandable DTO '{}' has no registered expander", dto),
            }
        }
        for (dto, def) in &self.expanders {
            for (field, link) in &def.links {
                let exists = self
                    .reusable
                    .get(&link.container)
                    .map(|methods| methods.contains_key(&link.method))
                    .unwrap_or(false);
                if !exists {
                    bail!(
                        "Link for '{}.{}' references unknown reusable method '{}.{}'",
                        dto,
                        field,
                        link.container,
                        link.method
                    );
                }
            }
        }
        Ok(())
    }

    /// Resolve the method serving `field` of `dto`. A reusable link wins
    /// over a standard method; link params override the linked method's own
    /// parameter declaration.
    pub(crate) fn resolve(&self, dto: &str, field: &str) -> Option<MethodDef> {
        let def = self.expanders.get(dto)?;
        if let Some(link) = def.links.get(field) {
            let mut method = self.reusable.get(&link.container)?.get(&link.method)?.clone();
            if !link.params.is_empty() {
                method.params = link.params.clone();
            }
            return Some(method);
        }
        def.methods.get(field).cloned()
    }

    pub(crate) fn has_expander(&self, dto: &str) -> bool {
        self.expanders.contains_key(dto)
    }
}

/// Resolve a dotted property path against a JSON object. Missing segments
/// yield `null`.
fn lookup_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;

    fn constant(value: Value) -> MethodDef {
        MethodDef::new(move |_ctx| {
            let value = value.clone();
            async move { Ok(value) }.boxed()
        })
    }

    #[test]
    fn validate_requires_an_expander_per_dto() {
        let mut registry = ExpanderRegistry::new();
        registry.add_method("CourseDto", "instructor", constant(json!({})));
        assert!(registry.validate(&["CourseDto"]).is_ok());
        assert!(registry.validate(&["CourseDto", "LessonDto"]).is_err());
    }

    #[test]
    fn validate_rejects_dangling_links() {
        let mut registry = ExpanderRegistry::new();
        registry.add_link("CourseDto", "instructor", FieldLink::new("Users", "byId"));
        assert!(registry.validate(&[]).is_err());

        registry.add_reusable("Users", "byId", constant(json!({})));
        assert!(registry.validate(&[]).is_ok());
    }

    #[test]
    fn link_takes_precedence_over_method() {
        let mut registry = ExpanderRegistry::new();
        registry.add_method("CourseDto", "instructor", constant(json!("method")));
        registry.add_reusable("Users", "byId", constant(json!("reusable")).params(["ownId"]));
        registry.add_link(
            "CourseDto",
            "instructor",
            FieldLink::new("Users", "byId").params(["instructorId"]),
        );

        let resolved = registry.resolve("CourseDto", "instructor").unwrap();
        // Link params override the reusable method's declaration.
        assert_eq!(resolved.params, vec!["instructorId".to_string()]);
    }

    #[test]
    fn resolve_args_from_paths() {
        let method = constant(json!({})).params(["instructorId", "meta.level"]);
        let parent = json!({"instructorId": 7, "meta": {"level": "basic"}});
        let args = method.resolve_args(&parent, &Value::Null);
        assert_eq!(args, vec![json!(7), json!("basic")]);
    }

    #[test]
    fn resolve_args_missing_path_is_null() {
        let method = constant(json!({})).params(["nope"]);
        let args = method.resolve_args(&json!({}), &Value::Null);
        assert_eq!(args, vec![Value::Null]);
    }

    #[test]
    fn args_fn_takes_precedence() {
        let method = constant(json!({}))
            .params(["ignored"])
            .args_with(|parent, _request| vec![parent["id"].clone()]);
        let args = method.resolve_args(&json!({"id": 3, "ignored": 9}), &Value::Null);
        assert_eq!(args, vec![json!(3)]);
    }
}
