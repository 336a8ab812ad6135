//! # Document Model
//!
//! The resolver's input: every group and target definition after matrix expansion, with
//! same-name definitions already folded together. A `Document` is built once and only read
//! afterwards; resolution copies definitions into fresh accumulators.

use crate::constants::VALID_NAME_CHARS;
use crate::core::interpolator::{EnvLookup, Interpolator};
use crate::core::matrix::{self, MatrixError};
use crate::core::merge::dedup_strings;
use crate::models::{Group, RawDocument, Target};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(&format!("^{}$", VALID_NAME_CHARS)).unwrap();
}

/// Errors raised while building a [`Document`].
#[derive(Error, Debug)]
pub enum DocumentError {
    /// A group or target name outside [`VALID_NAME_CHARS`].
    #[error("invalid name '{0}': only \"{chars}\" are allowed", chars = VALID_NAME_CHARS)]
    InvalidName(String),
    /// A block failed to evaluate.
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

type DocumentResult<T> = Result<T, DocumentError>;

/// Evaluated groups and targets, indexed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    groups: Vec<Group>,
    targets: Vec<Target>,
    group_index: HashMap<String, usize>,
    target_index: HashMap<String, usize>,
}

impl Document {
    /// Builds a document from already evaluated definitions. Names are validated, same-name
    /// targets are merged into the first one and same-name groups are unioned.
    pub fn new(groups: Vec<Group>, targets: Vec<Target>) -> DocumentResult<Self> {
        for name in groups.iter().map(|g| &g.name).chain(targets.iter().map(|t| &t.name)) {
            validate_target_name(name)?;
        }
        let mut document = Self::default();
        for group in groups {
            document.insert_group(group);
        }
        for target in targets {
            document.insert_target(target);
        }
        Ok(document)
    }

    /// Evaluates a raw document: variables are interpolated, target blocks are expanded
    /// through their matrix and a group is added for every block whose produced names differ
    /// from its label. The environment is read from the current process.
    pub fn from_raw(raw: &RawDocument, defaults: &BTreeMap<String, String>) -> DocumentResult<Self> {
        Self::from_raw_with_env(raw, defaults, &|name| std::env::var(name).ok())
    }

    /// Same as [`Document::from_raw`] with an explicit environment lookup.
    pub fn from_raw_with_env(
        raw: &RawDocument,
        defaults: &BTreeMap<String, String>,
        lookup_env: EnvLookup<'_>,
    ) -> DocumentResult<Self> {
        let mut interpolator = Interpolator::new(&raw.variables, defaults, lookup_env);

        let mut groups = raw
            .groups
            .iter()
            .map(|block| matrix::expand_group(block, &mut interpolator))
            .collect::<Result<Vec<_>, _>>()?;

        let mut targets = Vec::with_capacity(raw.targets.len());
        for block in &raw.targets {
            validate_target_name(&block.label)?;
            let expanded = matrix::expand_target(block, &mut interpolator)?;
            let names: Vec<String> = dedup_strings(
                &expanded.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
            );
            if !matches!(names.as_slice(), [only] if *only == block.label) {
                log::debug!("Target block '{}' renamed to {:?}", block.label, names);
                groups.push(Group {
                    name: block.label.clone(),
                    description: None,
                    targets: names,
                });
            }
            targets.extend(expanded);
        }

        Self::new(groups, targets)
    }

    /// Folds another document into this one: groups by name with target-list union, targets
    /// through the merge rules.
    pub fn merge(&mut self, other: Document) {
        for group in other.groups {
            self.insert_group(group);
        }
        for target in other.targets {
            self.insert_target(target);
        }
    }

    fn insert_group(&mut self, mut group: Group) {
        match self.group_index.get(&group.name).and_then(|&i| self.groups.get_mut(i)) {
            Some(existing) => existing.merge(&group),
            None => {
                group.targets = dedup_strings(&group.targets);
                self.group_index.insert(group.name.clone(), self.groups.len());
                self.groups.push(group);
            }
        }
    }

    fn insert_target(&mut self, target: Target) {
        match self.target_index.get(&target.name).and_then(|&i| self.targets.get_mut(i)) {
            Some(existing) => {
                log::trace!("Merging duplicate definition of target '{}'", target.name);
                existing.merge(&target);
            }
            None => {
                self.target_index.insert(target.name.clone(), self.targets.len());
                self.targets.push(target);
            }
        }
    }

    /// Groups in declaration order.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Targets in declaration order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Looks up a group by name.
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.group_index.get(name).and_then(|&i| self.groups.get(i))
    }

    /// Looks up a target by name.
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.target_index.get(name).and_then(|&i| self.targets.get(i))
    }

    /// Target names in declaration order.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }

    /// Every declared group name followed by every target name, without duplicates.
    pub fn list_targets(&self) -> Vec<String> {
        let names: Vec<String> = self
            .groups
            .iter()
            .map(|g| g.name.clone())
            .chain(self.targets.iter().map(|t| t.name.clone()))
            .collect();
        dedup_strings(&names)
    }
}

/// Checks a target or group name against [`VALID_NAME_CHARS`].
pub fn validate_target_name(name: &str) -> DocumentResult<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(DocumentError::InvalidName(name.to_string()))
    }
}

/// Rewrites names from schemes that allow dots (compose service names) to valid target names.
pub fn sanitize_target_name(name: &str) -> String {
    name.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawBlock;
    use serde_json::{Value, json};

    fn block(label: &str, attributes: Value) -> RawBlock {
        match attributes {
            Value::Object(map) => RawBlock::new(label, map),
            _ => panic!("attributes must be an object"),
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_same_name_targets_merge_into_first() {
        let first = Target {
            name: "app".into(),
            context: Some("./a".into()),
            tags: Some(vec!["a".into()]),
            ..Default::default()
        };
        let second = Target {
            name: "app".into(),
            dockerfile: Some("b.Dockerfile".into()),
            ..Default::default()
        };
        let doc = Document::new(Vec::new(), vec![first, second]).unwrap();
        assert_eq!(doc.targets().len(), 1);
        let app = doc.target("app").unwrap();
        assert_eq!(app.context.as_deref(), Some("./a"));
        assert_eq!(app.dockerfile.as_deref(), Some("b.Dockerfile"));
    }

    #[test]
    fn test_groups_dedup_and_union() {
        let groups = vec![
            Group {
                name: "all".into(),
                targets: vec!["a".into(), "a".into(), "b".into()],
                ..Default::default()
            },
            Group {
                name: "all".into(),
                targets: vec!["b".into(), "c".into()],
                ..Default::default()
            },
        ];
        let doc = Document::new(groups, Vec::new()).unwrap();
        assert_eq!(
            doc.group("all").unwrap().targets,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let err = Document::new(Vec::new(), vec![Target::named("my.app")]).unwrap_err();
        assert!(err.to_string().contains("my.app"));
        assert!(err.to_string().contains(VALID_NAME_CHARS));
        assert!(validate_target_name("web-1_x").is_ok());
        assert!(validate_target_name("").is_err());
        assert_eq!(sanitize_target_name("my.app.svc"), "my_app_svc");
    }

    #[test]
    fn test_renamed_matrix_block_gets_group() {
        let raw = RawDocument {
            targets: vec![
                block(
                    "app",
                    json!({"name": "app-${v}", "matrix": {"v": ["1", "2"]}}),
                ),
                block("plain", json!({"matrix": {"v": ["1", "2"]}})),
            ],
            ..Default::default()
        };
        let doc = Document::from_raw_with_env(&raw, &BTreeMap::new(), &no_env).unwrap();
        assert_eq!(
            doc.group("app").unwrap().targets,
            vec!["app-1".to_string(), "app-2".to_string()]
        );
        assert!(doc.group("plain").is_none());
        assert_eq!(doc.target_names(), vec!["app-1", "app-2", "plain"]);
    }

    #[test]
    fn test_variable_without_default_renders_empty() {
        let raw = RawDocument {
            variables: BTreeMap::from([("GITHUB_SHA".to_string(), None)]),
            targets: vec![block("app", json!({"tags": ["app:${GITHUB_SHA}"]}))],
            ..Default::default()
        };
        let doc = Document::from_raw_with_env(&raw, &BTreeMap::new(), &no_env).unwrap();
        assert_eq!(doc.target("app").unwrap().tags, Some(vec!["app:".to_string()]));

        let sha = |name: &str| (name == "GITHUB_SHA").then(|| "abc123".to_string());
        let doc = Document::from_raw_with_env(&raw, &BTreeMap::new(), &sha).unwrap();
        assert_eq!(doc.target("app").unwrap().tags, Some(vec!["app:abc123".to_string()]));
    }

    #[test]
    fn test_cross_document_merge_and_listing() {
        let mut base = Document::new(
            vec![Group {
                name: "default".into(),
                targets: vec!["web".into()],
                ..Default::default()
            }],
            vec![Target {
                name: "web".into(),
                args: BTreeMap::from([("A".to_string(), Some("1".to_string()))]),
                ..Default::default()
            }],
        )
        .unwrap();
        let overlay = Document::new(
            vec![Group {
                name: "default".into(),
                targets: vec!["web".into(), "api".into()],
                ..Default::default()
            }],
            vec![
                Target {
                    name: "web".into(),
                    args: BTreeMap::from([("B".to_string(), Some("2".to_string()))]),
                    ..Default::default()
                },
                Target::named("api"),
            ],
        )
        .unwrap();
        base.merge(overlay);

        assert_eq!(
            base.group("default").unwrap().targets,
            vec!["web".to_string(), "api".to_string()]
        );
        assert_eq!(base.target("web").unwrap().args.len(), 2);
        assert_eq!(base.list_targets(), vec!["default", "web", "api"]);
    }
}
