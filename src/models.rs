// src/models.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// --- DOCUMENT MODELS (what the parsing layer hands to the engine) ---

/// A named collection of targets and/or other groups.
/// Groups never carry build attributes of their own.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Group {
    /// Group name, taken from the block label.
    #[serde(skip)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Member targets and groups, in declaration order.
    #[serde(default)]
    pub targets: Vec<String>,
}

/// One buildable unit.
///
/// Scalar fields are `Option` so that "unset" and "explicitly empty" stay distinct during
/// merging: an unset field never overwrites, a set one always does. List fields follow the
/// same rule, which is what lets `tags = []` clear inherited tags.
///
/// The serialized names follow the bake file format (`secret`, `output`, `network`, ...).
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Target {
    /// Target name, taken from the block label or the matrix `name`.
    #[serde(skip)]
    pub name: String,
    /// Free-form description shown by `--list`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Parents merged in before this target's own fields. Never overridable with `--set`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,

    /// OCI annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<String>>,
    /// Attestations, deduplicated by type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attest: Option<Vec<String>>,
    /// Build context path. Defaults to `.` once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Named build contexts. A `target:NAME` value links to another target.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, String>,
    /// Dockerfile path, relative to the context. Defaults to `Dockerfile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Dockerfile contents given inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_inline: Option<String>,
    /// Build arguments. A `None` value means "unset" and is skipped when merging.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Option<String>>,
    /// Image labels. `None` values are unset, as for `args`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, Option<String>>,
    /// Image names and tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Cache import sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_from: Option<Vec<String>>,
    /// Cache export destinations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_to: Option<Vec<String>>,
    /// Dockerfile stage to build.
    #[serde(default, rename = "target", skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
    /// Secrets exposed to the build.
    #[serde(default, rename = "secret", skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Vec<String>>,
    /// SSH agent sockets or keys exposed to the build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<Vec<String>>,
    /// Target platforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    /// Output destinations.
    #[serde(default, rename = "output", skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    /// Always pull referenced images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<bool>,
    /// Disable the build cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_cache: Option<bool>,
    /// Networking mode for `RUN` instructions.
    #[serde(default, rename = "network", skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Stages built without cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_cache_filter: Option<Vec<String>>,
    /// Size of `/dev/shm`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<String>,
    /// Ulimit options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ulimits: Option<Vec<String>>,
    /// Frontend method to evaluate instead of building.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<String>,
    /// Extra privileges the build asks for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<Vec<String>>,

    /// Set on targets that were only resolved to satisfy another target's `target:` context.
    #[serde(skip)]
    pub(crate) linked: bool,
}

impl Target {
    /// Creates an empty target with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this target exists only because another target links to it.
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// The build context, falling back to the default for unresolved targets.
    pub fn context_path(&self) -> &str {
        self.context
            .as_deref()
            .unwrap_or(crate::constants::DEFAULT_CONTEXT)
    }

    /// The dockerfile path, falling back to the default for unresolved targets.
    pub fn dockerfile_path(&self) -> &str {
        self.dockerfile
            .as_deref()
            .unwrap_or(crate::constants::DEFAULT_DOCKERFILE)
    }

    /// Names of the targets this one links to through `target:` contexts, in key order.
    pub fn linked_target_names(&self) -> Vec<String> {
        self.contexts
            .values()
            .filter_map(|v| v.strip_prefix(crate::constants::LINK_SCHEME))
            .map(str::to_string)
            .collect()
    }
}

/// A target after inheritance, overrides, normalization and link resolution.
/// `context` and `dockerfile` are always set and `inherits` is always empty.
pub type ResolvedTarget = Target;

// --- OVERRIDE MODELS ---

/// The accumulated value of one `--set` key for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    /// Scalar keys: the last occurrence wins.
    Value(String),
    /// List keys: every occurrence is appended in encounter order.
    List(Vec<String>),
}

impl Override {
    /// The scalar value, or the last list element for list-valued keys.
    pub fn value(&self) -> &str {
        match self {
            Self::Value(v) => v,
            Self::List(values) => values.last().map(String::as_str).unwrap_or(""),
        }
    }

    /// The accumulated values; a scalar override is a one-element list.
    pub fn values(&self) -> Vec<String> {
        match self {
            Self::Value(v) => vec![v.clone()],
            Self::List(values) => values.clone(),
        }
    }
}

// --- ENTITLEMENTS ---

/// Privileges and filesystem access discovered while resolving a request.
///
/// Append-only: the same path may be recorded more than once when targets share parents or
/// links. Use [`EntitlementConf::deduplicated`] when reading.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EntitlementConf {
    /// Local paths the build reads.
    pub fs_read: Vec<String>,
    /// Local paths the build writes.
    pub fs_write: Vec<String>,
    /// Host networking is used.
    pub network_host: bool,
    /// Insecure security mode is requested.
    pub security_insecure: bool,
}

impl EntitlementConf {
    /// Returns a copy with duplicate paths removed, first occurrence kept.
    pub fn deduplicated(&self) -> Self {
        Self {
            fs_read: crate::core::merge::dedup_strings(&self.fs_read),
            fs_write: crate::core::merge::dedup_strings(&self.fs_write),
            network_host: self.network_host,
            security_insecure: self.security_insecure,
        }
    }

    /// True when nothing beyond the default sandbox is required.
    pub fn is_empty(&self) -> bool {
        self.fs_read.is_empty()
            && self.fs_write.is_empty()
            && !self.network_host
            && !self.security_insecure
    }
}

// --- RAW (PRE-EXPANSION) MODELS ---

/// One `group` or `target` block as authored, before matrix expansion and interpolation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBlock {
    /// Block label.
    pub label: String,
    /// Attributes as authored.
    pub attributes: Map<String, Value>,
}

impl RawBlock {
    /// Creates a block from its label and attribute map.
    pub fn new(label: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            label: label.into(),
            attributes,
        }
    }
}

/// The uniform input produced by the configuration parsers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDocument {
    /// Declared variables and their default value, if any.
    pub variables: BTreeMap<String, Option<Value>>,
    /// `group` blocks in file order.
    pub groups: Vec<RawBlock>,
    /// `target` blocks in file order.
    pub targets: Vec<RawBlock>,
}

impl RawDocument {
    /// Appends another document's blocks after this one's. Later variable defaults win.
    pub fn extend(&mut self, other: Self) {
        for (name, default) in other.variables {
            match (self.variables.get(&name), &default) {
                (Some(Some(_)), None) => {}
                _ => {
                    self.variables.insert(name, default);
                }
            }
        }
        self.groups.extend(other.groups);
        self.targets.extend(other.targets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_deserializes_bake_field_names() {
        let json = serde_json::json!({
            "context": "./app",
            "dockerfile-inline": "FROM scratch",
            "target": "release",
            "secret": ["id=npm,src=.npmrc"],
            "output": ["type=docker"],
            "network": "host",
            "no-cache": true,
            "args": {"A": "1", "B": null},
        });
        let target: Target = serde_json::from_value(json).unwrap();
        assert_eq!(target.context.as_deref(), Some("./app"));
        assert_eq!(target.dockerfile_inline.as_deref(), Some("FROM scratch"));
        assert_eq!(target.target_stage.as_deref(), Some("release"));
        assert_eq!(target.secrets, Some(vec!["id=npm,src=.npmrc".to_string()]));
        assert_eq!(target.outputs, Some(vec!["type=docker".to_string()]));
        assert_eq!(target.network_mode.as_deref(), Some("host"));
        assert_eq!(target.no_cache, Some(true));
        assert_eq!(target.args.get("A"), Some(&Some("1".to_string())));
        assert_eq!(target.args.get("B"), Some(&None));
    }

    #[test]
    fn test_target_rejects_unknown_field() {
        let json = serde_json::json!({ "contxt": "." });
        let result: Result<Target, _> = serde_json::from_value(json);
        assert!(result.unwrap_err().to_string().contains("unknown field `contxt`"));
    }

    #[test]
    fn test_linked_target_names() {
        let mut target = Target::named("app");
        target.contexts.insert("base".into(), "target:base".into());
        target.contexts.insert("src".into(), "./src".into());
        assert_eq!(target.linked_target_names(), vec!["base".to_string()]);
    }

    #[test]
    fn test_entitlements_deduplicated_on_read() {
        let ent = EntitlementConf {
            fs_read: vec!["/a".into(), "/b".into(), "/a".into()],
            fs_write: vec!["/out".into(), "/out".into()],
            network_host: true,
            security_insecure: false,
        };
        let dedup = ent.deduplicated();
        assert_eq!(dedup.fs_read, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(dedup.fs_write, vec!["/out".to_string()]);
        assert!(dedup.network_host);
        assert_eq!(ent.fs_read.len(), 3);
    }

    #[test]
    fn test_override_value_accessors() {
        let list = Override::List(vec!["a".into(), "b".into()]);
        assert_eq!(list.value(), "b");
        assert_eq!(list.values().len(), 2);
        assert_eq!(Override::Value("x".into()).values(), vec!["x".to_string()]);
    }
}
