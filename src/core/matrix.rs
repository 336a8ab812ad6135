//! # Matrix Expander
//!
//! Turns one authored `target` block into its concrete target definitions. A block without a
//! `matrix` attribute yields exactly one target named after its label. With a matrix, every
//! combination of candidate values becomes its own evaluation context and the remaining
//! attributes are interpolated once per context.
//!
//! Contexts are built variable by variable in declaration order. For each variable the current
//! set is replaced by its product with that variable's candidates, candidate-major: with
//! `os = [linux, darwin]` then `arch = [amd64, arm64]` the order is
//! `linux/amd64, darwin/amd64, linux/arm64, darwin/arm64`.

use crate::core::interpolator::{scalar_to_string, Bindings, InterpolationError, Interpolator};
use crate::core::overrides::parse_bool;
use crate::models::{Group, RawBlock, Target};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while evaluating a `target` or `group` block.
#[derive(Error, Debug)]
pub enum MatrixError {
    /// `matrix` is not a map.
    #[error("matrix must be a map in target '{target}'")]
    NotAMap {
        /// Block label.
        target: String,
    },
    /// A matrix variable whose candidates are not a list.
    #[error("matrix values must be a list, '{variable}' in target '{target}' is not")]
    NotAList {
        /// Block label.
        target: String,
        /// Offending matrix variable.
        variable: String,
    },
    /// `name` given without `matrix`.
    #[error("name requires matrix in target '{target}'")]
    NameRequiresMatrix {
        /// Block label.
        target: String,
    },
    /// `name` evaluated to something other than a string.
    #[error("name of target '{target}' must evaluate to a string")]
    InvalidName {
        /// Block label.
        target: String,
    },
    /// A group block carries `matrix`.
    #[error("matrix is not supported for groups ('{group}')")]
    GroupMatrix {
        /// Group label.
        group: String,
    },
    /// A group block carries `name`.
    #[error("name is not supported for groups ('{group}')")]
    GroupName {
        /// Group label.
        group: String,
    },
    /// A `${...}` reference failed to expand.
    #[error("failed to evaluate '{block}': {source}")]
    Interpolation {
        /// Block label.
        block: String,
        /// The interpolation failure.
        #[source]
        source: InterpolationError,
    },
    /// The evaluated attributes do not form a valid target.
    #[error("invalid definition for target '{target}': {source}")]
    InvalidTarget {
        /// Target name.
        target: String,
        /// The deserialization error.
        #[source]
        source: serde_json::Error,
    },
    /// The evaluated attributes do not form a valid group.
    #[error("invalid definition for group '{group}': {source}")]
    InvalidGroup {
        /// Group name.
        group: String,
        /// The deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

type MatrixResult<T> = Result<T, MatrixError>;

const MATRIX_ATTR: &str = "matrix";
const NAME_ATTR: &str = "name";

/// Expands a target block into one target per matrix combination.
pub fn expand_target(block: &RawBlock, interpolator: &mut Interpolator<'_>) -> MatrixResult<Vec<Target>> {
    let label = block.label.as_str();
    let mut attributes = block.attributes.clone();
    let matrix = attributes.remove(MATRIX_ATTR);
    let name_expr = attributes.remove(NAME_ATTR);

    let contexts = match &matrix {
        None => {
            if name_expr.is_some() {
                return Err(MatrixError::NameRequiresMatrix {
                    target: label.to_string(),
                });
            }
            vec![Bindings::new()]
        }
        Some(matrix) => {
            let matrix = interpolator
                .expand_value(matrix, &Bindings::new())
                .map_err(|source| interpolation_error(label, source))?;
            eval_contexts(label, &matrix)?
        }
    };
    log::debug!("Target block '{}' expands to {} context(s)", label, contexts.len());

    let mut targets = Vec::with_capacity(contexts.len());
    for bindings in &contexts {
        let name = match &name_expr {
            None => label.to_string(),
            Some(expr) => {
                let value = interpolator
                    .expand_value(expr, bindings)
                    .map_err(|source| interpolation_error(label, source))?;
                scalar_to_string(&value)
                    .filter(|_| !value.is_null())
                    .ok_or_else(|| MatrixError::InvalidName {
                        target: label.to_string(),
                    })?
            }
        };

        let mut evaluated = Map::with_capacity(attributes.len());
        for (key, value) in &attributes {
            let value = interpolator
                .expand_value(value, bindings)
                .map_err(|source| interpolation_error(&name, source))?;
            evaluated.insert(key.clone(), value);
        }
        coerce_target_attributes(&mut evaluated);

        let mut target: Target = serde_json::from_value(Value::Object(evaluated))
            .map_err(|source| MatrixError::InvalidTarget {
                target: name.clone(),
                source,
            })?;
        target.name = name;
        targets.push(target);
    }
    Ok(targets)
}

/// Evaluates a group block. Groups take neither `matrix` nor `name`.
pub fn expand_group(block: &RawBlock, interpolator: &mut Interpolator<'_>) -> MatrixResult<Group> {
    let label = block.label.as_str();
    if block.attributes.contains_key(MATRIX_ATTR) {
        return Err(MatrixError::GroupMatrix {
            group: label.to_string(),
        });
    }
    if block.attributes.contains_key(NAME_ATTR) {
        return Err(MatrixError::GroupName {
            group: label.to_string(),
        });
    }

    let evaluated = interpolator
        .expand_value(&Value::Object(block.attributes.clone()), &Bindings::new())
        .map_err(|source| interpolation_error(label, source))?;
    let mut group: Group =
        serde_json::from_value(evaluated).map_err(|source| MatrixError::InvalidGroup {
            group: label.to_string(),
            source,
        })?;
    group.name = label.to_string();
    Ok(group)
}

/// Builds the cartesian product of the matrix variables.
fn eval_contexts(label: &str, matrix: &Value) -> MatrixResult<Vec<Bindings>> {
    let Value::Object(variables) = matrix else {
        return Err(MatrixError::NotAMap {
            target: label.to_string(),
        });
    };

    let mut contexts = vec![Bindings::new()];
    for (variable, candidates) in variables {
        let Value::Array(candidates) = candidates else {
            return Err(MatrixError::NotAList {
                target: label.to_string(),
                variable: variable.clone(),
            });
        };
        let mut next = Vec::with_capacity(contexts.len() * candidates.len());
        for candidate in candidates {
            for context in &contexts {
                let mut context = context.clone();
                context.insert(variable.clone(), candidate.clone());
                next.push(context);
            }
        }
        contexts = next;
    }
    Ok(contexts)
}

/// Loosens scalar types the way the file formats allow: numeric or boolean build args and
/// labels become strings, and string booleans are accepted for `pull` and `no-cache`.
fn coerce_target_attributes(attributes: &mut Map<String, Value>) {
    for key in ["args", "labels"] {
        if let Some(Value::Object(entries)) = attributes.get_mut(key) {
            for value in entries.values_mut() {
                if matches!(value, Value::Number(_) | Value::Bool(_)) {
                    if let Some(s) = scalar_to_string(value) {
                        *value = Value::String(s);
                    }
                }
            }
        }
    }
    for key in ["pull", "no-cache"] {
        if let Some(value) = attributes.get_mut(key) {
            if let Some(b) = value.as_str().and_then(parse_bool) {
                *value = Value::Bool(b);
            }
        }
    }
}

fn interpolation_error(block: &str, source: InterpolationError) -> MatrixError {
    MatrixError::Interpolation {
        block: block.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn block(label: &str, attributes: Value) -> RawBlock {
        match attributes {
            Value::Object(map) => RawBlock::new(label, map),
            _ => panic!("attributes must be an object"),
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn expand(raw: &RawBlock) -> MatrixResult<Vec<Target>> {
        let declared = BTreeMap::from([("VERSION".to_string(), Some(json!("1.0")))]);
        let defaults = BTreeMap::new();
        let mut interpolator = Interpolator::new(&declared, &defaults, &no_env);
        expand_target(raw, &mut interpolator)
    }

    #[test]
    fn test_no_matrix_yields_single_target() {
        let targets = expand(&block("app", json!({"context": "./app", "tags": ["app:${VERSION}"]})))
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "app");
        assert_eq!(targets[0].tags, Some(vec!["app:1.0".to_string()]));
    }

    #[test]
    fn test_matrix_cartesian_product() {
        let targets = expand(&block(
            "app",
            json!({
                "name": "app-${os}-${arch}",
                "matrix": {"os": ["linux", "darwin"], "arch": ["amd64", "arm64"]},
                "dockerfile": "Dockerfile.${os}",
                "args": {"ARCH": "${arch}"},
                "pull": true,
            }),
        ))
        .unwrap();

        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["app-linux-amd64", "app-darwin-amd64", "app-linux-arm64", "app-darwin-arm64"]
        );
        for target in &targets {
            assert_eq!(target.pull, Some(true));
        }
        assert_eq!(targets[1].dockerfile.as_deref(), Some("Dockerfile.darwin"));
        assert_eq!(targets[2].args.get("ARCH"), Some(&Some("arm64".to_string())));
    }

    #[test]
    fn test_matrix_without_name_keeps_label() {
        let targets = expand(&block(
            "app",
            json!({"matrix": {"os": ["linux", "darwin"], "arch": ["amd64", "arm64"]}}),
        ))
        .unwrap();
        assert_eq!(targets.len(), 4);
        assert!(targets.iter().all(|t| t.name == "app"));
    }

    #[test]
    fn test_matrix_of_objects() {
        let targets = expand(&block(
            "svc",
            json!({
                "name": "svc-${item.name}",
                "matrix": {"item": [{"name": "a", "port": 80}, {"name": "b", "port": 443}]},
                "args": {"PORT": "${item.port}"},
            }),
        ))
        .unwrap();
        assert_eq!(targets[1].name, "svc-b");
        assert_eq!(targets[1].args.get("PORT"), Some(&Some("443".to_string())));
    }

    #[test]
    fn test_matrix_errors() {
        assert!(matches!(
            expand(&block("app", json!({"name": "x"}))),
            Err(MatrixError::NameRequiresMatrix { .. })
        ));
        assert!(matches!(
            expand(&block("app", json!({"matrix": ["a"]}))),
            Err(MatrixError::NotAMap { .. })
        ));
        assert!(matches!(
            expand(&block("app", json!({"matrix": {"os": "linux"}}))),
            Err(MatrixError::NotAList { .. })
        ));
    }

    #[test]
    fn test_scalar_args_and_string_booleans_are_coerced() {
        let targets = expand(&block(
            "app",
            json!({"args": {"N": 3, "DEBUG": false, "UNSET": null}, "no-cache": "true"}),
        ))
        .unwrap();
        let target = &targets[0];
        assert_eq!(target.args.get("N"), Some(&Some("3".to_string())));
        assert_eq!(target.args.get("DEBUG"), Some(&Some("false".to_string())));
        assert_eq!(target.args.get("UNSET"), Some(&None));
        assert_eq!(target.no_cache, Some(true));
    }

    #[test]
    fn test_unknown_attribute_names_target() {
        let err = expand(&block("app", json!({"contxt": "."}))).unwrap_err();
        assert!(err.to_string().contains("'app'"));
    }

    #[test]
    fn test_groups_reject_matrix_and_name() {
        let declared = BTreeMap::new();
        let defaults = BTreeMap::new();
        let mut interpolator = Interpolator::new(&declared, &defaults, &no_env);

        let group = expand_group(&block("all", json!({"targets": ["a", "b"]})), &mut interpolator)
            .unwrap();
        assert_eq!(group.name, "all");
        assert_eq!(group.targets, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(
            expand_group(&block("all", json!({"matrix": {}})), &mut interpolator),
            Err(MatrixError::GroupMatrix { .. })
        ));
        assert!(matches!(
            expand_group(&block("all", json!({"name": "x"})), &mut interpolator),
            Err(MatrixError::GroupName { .. })
        ));
    }
}
