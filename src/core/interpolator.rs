// src/core/interpolator.rs

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

lazy_static! {
    // `$${` is an escaped literal, `${name}` or `${name.attr}` is a reference.
    static ref TOKEN_RE: Regex =
        Regex::new(r"\$\$\{|\$\{\s*([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z0-9_-]+)*)\s*\}").unwrap();
}

const MAX_RECURSION_DEPTH: usize = 32;

/// Errors raised while expanding `${...}` references.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    /// The name is not bound, not declared and not in the defaults table.
    #[error("unknown variable '{name}' in '{text}'")]
    UnknownVariable {
        /// Referenced name.
        name: String,
        /// String holding the reference.
        text: String,
    },
    /// `${name.attr}` on a value without that attribute.
    #[error("variable '{name}' has no attribute '{attribute}'")]
    MissingAttribute {
        /// Referenced name.
        name: String,
        /// Missing attribute.
        attribute: String,
    },
    /// A list or map referenced inside a longer string.
    #[error("variable '{name}' is a list or map and cannot be embedded in '{text}'")]
    NotScalar {
        /// Referenced name.
        name: String,
        /// String holding the reference.
        text: String,
    },
    /// A default that reaches itself, or nests too deeply.
    #[error("variable '{name}' refers to itself through its default value")]
    Cycle {
        /// Variable whose default loops.
        name: String,
    },
}

type InterpolationResult<T> = Result<T, InterpolationError>;

/// Values bound by a matrix evaluation context, checked before any other source.
pub type Bindings = Map<String, Value>;

/// Lookup used for process environment variables.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Resolves `${NAME}` references against, in order: matrix bindings, the environment (for
/// declared variables and names in the defaults table), the declared default and the
/// caller's defaults table. A declared variable found nowhere is an empty string; an
/// undeclared one is an error.
#[derive(Clone)]
pub struct Interpolator<'a> {
    declared: &'a BTreeMap<String, Option<Value>>,
    defaults: &'a BTreeMap<String, String>,
    lookup_env: EnvLookup<'a>,
    // Variables whose default is currently being expanded.
    recursion_stack: Vec<String>,
}

impl std::fmt::Debug for Interpolator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpolator")
            .field("declared", &self.declared)
            .field("defaults", &self.defaults)
            .field("recursion_stack", &self.recursion_stack)
            .finish_non_exhaustive()
    }
}

impl<'a> Interpolator<'a> {
    /// `declared` maps variable names to their optional default.
    pub fn new(
        declared: &'a BTreeMap<String, Option<Value>>,
        defaults: &'a BTreeMap<String, String>,
        lookup_env: EnvLookup<'a>,
    ) -> Self {
        Self {
            declared,
            defaults,
            lookup_env,
            recursion_stack: Vec::new(),
        }
    }

    /// Interpolates every string inside `value`. Object keys are left alone.
    pub fn expand_value(&mut self, value: &Value, bindings: &Bindings) -> InterpolationResult<Value> {
        match value {
            Value::String(s) => self.expand_string(s, bindings),
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_value(item, bindings))
                .collect::<InterpolationResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut expanded = Map::with_capacity(map.len());
                for (k, v) in map {
                    expanded.insert(k.clone(), self.expand_value(v, bindings)?);
                }
                Ok(Value::Object(expanded))
            }
            other => Ok(other.clone()),
        }
    }

    /// Interpolates one string. A string made of a single reference keeps the referenced
    /// value's type, so `"${FLAG}"` can still produce a boolean or a list.
    pub fn expand_string(&mut self, text: &str, bindings: &Bindings) -> InterpolationResult<Value> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for captures in TOKEN_RE.captures_iter(text) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            out.push_str(text.get(last..whole.start()).unwrap_or_default());
            last = whole.end();

            let Some(name) = captures.get(1) else {
                out.push_str("${");
                continue;
            };
            let path = captures.get(2).map_or("", |m| m.as_str());
            let value = self.resolve(name.as_str(), path, bindings, text)?;

            if whole.start() == 0 && whole.end() == text.len() && !value.is_string() {
                return Ok(value);
            }
            match scalar_to_string(&value) {
                Some(s) => out.push_str(&s),
                None => {
                    return Err(InterpolationError::NotScalar {
                        name: name.as_str().to_string(),
                        text: text.to_string(),
                    });
                }
            }
        }
        out.push_str(text.get(last..).unwrap_or_default());
        Ok(Value::String(out))
    }

    fn resolve(
        &mut self,
        name: &str,
        path: &str,
        bindings: &Bindings,
        text: &str,
    ) -> InterpolationResult<Value> {
        let mut value = self
            .lookup(name, bindings)?
            .ok_or_else(|| InterpolationError::UnknownVariable {
                name: name.to_string(),
                text: text.to_string(),
            })?;

        for attribute in path.split('.').filter(|a| !a.is_empty()) {
            value = value
                .get(attribute)
                .cloned()
                .ok_or_else(|| InterpolationError::MissingAttribute {
                    name: name.to_string(),
                    attribute: attribute.to_string(),
                })?;
        }
        Ok(value)
    }

    fn lookup(&mut self, name: &str, bindings: &Bindings) -> InterpolationResult<Option<Value>> {
        if let Some(value) = bindings.get(name) {
            return Ok(Some(value.clone()));
        }

        let declared = self.declared.get(name);
        if declared.is_some() || self.defaults.contains_key(name) {
            if let Some(value) = (self.lookup_env)(name) {
                log::trace!("Variable '{}' taken from the environment", name);
                return Ok(Some(Value::String(value)));
            }
        }

        let from_table = self.defaults.get(name).map(|v| Value::String(v.clone()));
        match declared {
            Some(Some(default)) => self.expand_default(name, default).map(Some),
            // Declared without a default: evaluates to an empty string.
            Some(None) => Ok(Some(from_table.unwrap_or_else(|| Value::String(String::new())))),
            None => Ok(from_table),
        }
    }

    /// Declared defaults may reference other variables, but never matrix bindings.
    fn expand_default(&mut self, name: &str, default: &Value) -> InterpolationResult<Value> {
        if self.recursion_stack.iter().any(|n| n == name)
            || self.recursion_stack.len() >= MAX_RECURSION_DEPTH
        {
            return Err(InterpolationError::Cycle {
                name: name.to_string(),
            });
        }
        self.recursion_stack.push(name.to_string());
        let expanded = self.expand_value(default, &Bindings::new());
        self.recursion_stack.pop();
        expanded
    }
}

/// Renders a scalar the way it reads in a build flag. Lists and maps have no string form.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared() -> BTreeMap<String, Option<Value>> {
        BTreeMap::from([
            ("TAG".to_string(), Some(json!("latest"))),
            ("REPO".to_string(), Some(json!("${REGISTRY}/app"))),
            ("REGISTRY".to_string(), None),
            ("PUSH".to_string(), Some(json!(true))),
            ("LOOP".to_string(), Some(json!("${LOOP}"))),
        ])
    }

    fn expand(text: &str, env: &dyn Fn(&str) -> Option<String>) -> InterpolationResult<Value> {
        let declared = declared();
        let defaults = BTreeMap::from([("REGISTRY".to_string(), "docker.io".to_string())]);
        Interpolator::new(&declared, &defaults, env).expand_string(text, &Bindings::new())
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_declared_default_and_defaults_table() {
        assert_eq!(expand("app:${TAG}", &no_env).unwrap(), json!("app:latest"));
        assert_eq!(expand("${REPO}:${TAG}", &no_env).unwrap(), json!("docker.io/app:latest"));
    }

    #[test]
    fn test_environment_wins_for_known_names_only() {
        let env = |name: &str| match name {
            "TAG" => Some("dev".to_string()),
            "HOME" => Some("/root".to_string()),
            _ => None,
        };
        assert_eq!(expand("${TAG}", &env).unwrap(), json!("dev"));
        assert!(matches!(
            expand("${HOME}", &env),
            Err(InterpolationError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_declared_without_default_is_empty() {
        let declared = declared();
        let defaults = BTreeMap::new();
        let mut interpolator = Interpolator::new(&declared, &defaults, &no_env);
        assert_eq!(
            interpolator.expand_string("${REPO}", &Bindings::new()).unwrap(),
            json!("/app")
        );
        assert_eq!(
            interpolator.expand_string("${REGISTRY}", &Bindings::new()).unwrap(),
            json!("")
        );
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        assert_eq!(expand("${PUSH}", &no_env).unwrap(), json!(true));
        assert_eq!(expand("push=${PUSH}", &no_env).unwrap(), json!("push=true"));
    }

    #[test]
    fn test_escape_and_unknown() {
        assert_eq!(expand("$${TAG}", &no_env).unwrap(), json!("${TAG}"));
        let err = expand("${NOPE}", &no_env).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn test_default_cycle_is_error() {
        assert!(matches!(
            expand("${LOOP}", &no_env),
            Err(InterpolationError::Cycle { .. })
        ));
    }

    #[test]
    fn test_bindings_and_attribute_access() {
        let declared = declared();
        let defaults = BTreeMap::new();
        let mut bindings = Bindings::new();
        bindings.insert("item".into(), json!({"os": "linux", "tags": ["a"]}));
        bindings.insert("TAG".into(), json!("matrix"));

        let mut interpolator = Interpolator::new(&declared, &defaults, &no_env);
        assert_eq!(
            interpolator.expand_string("${item.os}-${TAG}", &bindings).unwrap(),
            json!("linux-matrix")
        );
        assert!(matches!(
            interpolator.expand_string("x-${item.tags}", &bindings),
            Err(InterpolationError::NotScalar { .. })
        ));
        assert!(matches!(
            interpolator.expand_string("${item.arch}", &bindings),
            Err(InterpolationError::MissingAttribute { .. })
        ));
    }
}
