//! # Override Engine
//!
//! Parses `--set` expressions (`pattern.key[.subkey]=value`) into a per-target table and applies
//! that table to a merged target. Applying an override is also where filesystem and network
//! requirements are discovered: local cache sources, secret files, ssh keys and output
//! destinations are recorded in the session's [`EntitlementConf`].
//!
//! Keys form a closed set ([`OverrideKey`]), so an unknown key is rejected while parsing and
//! every known key has exactly one apply rule.

use crate::constants::{ENTITLEMENT_NETWORK_HOST, ENTITLEMENT_SECURITY_INSECURE};
use crate::core::specs::{self, SpecError};
use crate::models::{EntitlementConf, Override, Target};
use globset::GlobBuilder;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while parsing or applying overrides.
#[derive(Error, Debug)]
pub enum OverrideError {
    /// The key has no `pattern.` prefix.
    #[error("invalid override key {key}, expected target.name")]
    MissingDot {
        /// Key as written.
        key: String,
    },
    /// The expression has no `=`.
    #[error("invalid override {value}, expected target.name=value")]
    MissingValue {
        /// Expression as written.
        value: String,
    },
    /// `args`, `contexts` or `labels` without a sub-key.
    #[error("invalid key {key}, {field} requires name")]
    MissingSubkey {
        /// Key as written.
        key: String,
        /// Field that needs the sub-key.
        field: String,
    },
    /// A sub-key on a field that takes none.
    #[error("invalid key {key}, {field} does not take a sub-key")]
    UnexpectedSubkey {
        /// Key as written.
        key: String,
        /// Field given the sub-key.
        field: String,
    },
    /// The field is not overridable.
    #[error("unknown key: {key}")]
    UnknownKey {
        /// Key as written.
        key: String,
    },
    /// The pattern matched no target.
    #[error("could not find any target matching '{pattern}'")]
    NoMatch {
        /// Pattern as written.
        pattern: String,
    },
    /// The pattern is not a valid glob.
    #[error("could not match targets with '{pattern}': {source}")]
    InvalidPattern {
        /// Pattern as written.
        pattern: String,
        /// The glob compiler error.
        #[source]
        source: globset::Error,
    },
    /// A boolean field given something other than a boolean.
    #[error("invalid value {value} for boolean key {key} on target {target}")]
    InvalidBool {
        /// Value as written.
        value: String,
        /// Overridden field.
        key: String,
        /// Target being overridden.
        target: String,
    },
    /// A cache, secret, ssh, output or attest value that does not parse.
    #[error("invalid value for {key} on target {target}: {source}")]
    InvalidSpec {
        /// Overridden field.
        key: String,
        /// Target being overridden.
        target: String,
        /// The parser error.
        #[source]
        source: SpecError,
    },
}

type OverrideResult<T> = Result<T, OverrideError>;

/// Every field reachable through `--set`.
///
/// The declaration order is the apply order: `push` and `load` come last so they rewrite the
/// final `output` list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OverrideKey {
    /// `context`
    Context,
    /// `dockerfile`
    Dockerfile,
    /// `args.NAME`
    Args(String),
    /// `contexts.NAME`
    Contexts(String),
    /// `labels.NAME`
    Labels(String),
    /// `tags`
    Tags,
    /// `cache-from`
    CacheFrom,
    /// `cache-to`
    CacheTo,
    /// `target`, the Dockerfile stage.
    TargetStage,
    /// `call`
    Call,
    /// `secrets`
    Secrets,
    /// `ssh`
    Ssh,
    /// `platform`
    Platform,
    /// `output`
    Output,
    /// `entitlements`
    Entitlements,
    /// `annotations`
    Annotations,
    /// `attest`
    Attest,
    /// `no-cache`
    NoCache,
    /// `no-cache-filter`
    NoCacheFilter,
    /// `shm-size`
    ShmSize,
    /// `ulimits`
    Ulimits,
    /// `network`
    Network,
    /// `pull`
    Pull,
    /// Shorthand that adds `push=true` to every output.
    Push,
    /// Shorthand that adds a docker output.
    Load,
}

impl OverrideKey {
    /// Maps a field name and optional sub-key onto a key. `raw` is only used in errors.
    fn parse(field: &str, subkey: Option<&str>, raw: &str) -> OverrideResult<Self> {
        let with_name = |make: fn(String) -> Self| match subkey {
            Some(name) if !name.is_empty() => Ok(make(name.to_string())),
            _ => Err(OverrideError::MissingSubkey {
                key: raw.to_string(),
                field: field.to_string(),
            }),
        };

        let key = match field {
            "args" => return with_name(Self::Args),
            "contexts" => return with_name(Self::Contexts),
            "labels" => return with_name(Self::Labels),
            "context" => Self::Context,
            "dockerfile" => Self::Dockerfile,
            "tags" => Self::Tags,
            "cache-from" => Self::CacheFrom,
            "cache-to" => Self::CacheTo,
            "target" => Self::TargetStage,
            "call" => Self::Call,
            "secrets" => Self::Secrets,
            "ssh" => Self::Ssh,
            "platform" => Self::Platform,
            "output" => Self::Output,
            "entitlements" => Self::Entitlements,
            "annotations" => Self::Annotations,
            "attest" => Self::Attest,
            "no-cache" => Self::NoCache,
            "no-cache-filter" => Self::NoCacheFilter,
            "shm-size" => Self::ShmSize,
            "ulimits" => Self::Ulimits,
            "network" => Self::Network,
            "pull" => Self::Pull,
            "push" => Self::Push,
            "load" => Self::Load,
            _ => {
                return Err(OverrideError::UnknownKey {
                    key: field.to_string(),
                });
            }
        };
        if subkey.is_some() {
            return Err(OverrideError::UnexpectedSubkey {
                key: raw.to_string(),
                field: field.to_string(),
            });
        }
        Ok(key)
    }

    /// Keys whose repeated occurrences accumulate instead of replacing each other.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            Self::Output
                | Self::CacheTo
                | Self::CacheFrom
                | Self::Tags
                | Self::Platform
                | Self::Secrets
                | Self::Ssh
                | Self::Attest
                | Self::Entitlements
                | Self::Network
                | Self::Annotations
                | Self::NoCacheFilter
                | Self::Ulimits
        )
    }
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Args(n) => return write!(f, "args.{}", n),
            Self::Contexts(n) => return write!(f, "contexts.{}", n),
            Self::Labels(n) => return write!(f, "labels.{}", n),
            Self::Context => "context",
            Self::Dockerfile => "dockerfile",
            Self::Tags => "tags",
            Self::CacheFrom => "cache-from",
            Self::CacheTo => "cache-to",
            Self::TargetStage => "target",
            Self::Call => "call",
            Self::Secrets => "secrets",
            Self::Ssh => "ssh",
            Self::Platform => "platform",
            Self::Output => "output",
            Self::Entitlements => "entitlements",
            Self::Annotations => "annotations",
            Self::Attest => "attest",
            Self::NoCache => "no-cache",
            Self::NoCacheFilter => "no-cache-filter",
            Self::ShmSize => "shm-size",
            Self::Ulimits => "ulimits",
            Self::Network => "network",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Load => "load",
        };
        f.write_str(name)
    }
}

/// Overrides for one target, in apply order.
pub type TargetOverrides = BTreeMap<OverrideKey, Override>;

/// Structured overrides keyed by concrete target name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    entries: BTreeMap<String, TargetOverrides>,
}

impl OverrideTable {
    /// The overrides that apply to `name`, if any.
    pub fn for_target(&self, name: &str) -> Option<&TargetOverrides> {
        self.entries.get(name)
    }

    /// Names of every target with at least one override entry.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn record(&mut self, target: &str, key: OverrideKey, value: String) {
        let overrides = self.entries.entry(target.to_string()).or_default();
        if key.is_list() {
            let slot = overrides
                .entry(key)
                .or_insert_with(|| Override::List(Vec::new()));
            if let Override::List(values) = slot {
                values.push(value);
            } else {
                *slot = Override::List(vec![value]);
            }
        } else {
            overrides.insert(key, Override::Value(value));
        }
    }

    fn touch(&mut self, target: &str) {
        self.entries.entry(target.to_string()).or_default();
    }
}

// --- PARSING ---

/// Parses `--set` expressions against the known target names, reading `args.NAME` pass-through
/// values from the process environment.
pub fn parse_overrides(values: &[String], target_names: &[String]) -> OverrideResult<OverrideTable> {
    parse_overrides_with_env(values, target_names, &|name| std::env::var(name).ok())
}

/// Same as [`parse_overrides`] with an explicit environment lookup.
pub fn parse_overrides_with_env(
    values: &[String],
    target_names: &[String],
    lookup_env: &dyn Fn(&str) -> Option<String>,
) -> OverrideResult<OverrideTable> {
    let mut table = OverrideTable::default();

    for raw in values {
        let (lhs, value) = match raw.split_once('=') {
            Some((lhs, value)) => (lhs, Some(value)),
            None => (raw.as_str(), None),
        };
        let mut parts = lhs.splitn(3, '.');
        let (pattern, field) = match (parts.next(), parts.next()) {
            (Some(pattern), Some(field)) => (pattern, field),
            _ => {
                return Err(OverrideError::MissingDot {
                    key: lhs.to_string(),
                });
            }
        };
        let subkey = parts.next();

        if value.is_none() && field != "args" {
            return Err(OverrideError::MissingValue { value: raw.clone() });
        }
        let key = OverrideKey::parse(field, subkey, lhs)?;
        let names = expand_targets(pattern, target_names)?;
        log::debug!("Override '{}' matches targets {:?}", raw, names);

        let value = match (value, &key) {
            (Some(v), _) => v.to_string(),
            (None, OverrideKey::Args(arg)) => match lookup_env(arg) {
                Some(v) => v,
                None => {
                    log::debug!("Skipping override '{}': ${} is not set", raw, arg);
                    for name in &names {
                        table.touch(name);
                    }
                    continue;
                }
            },
            (None, _) => return Err(OverrideError::MissingValue { value: raw.clone() }),
        };

        for name in &names {
            table.record(name, key.clone(), value.clone());
        }
    }
    Ok(table)
}

/// Expands an override pattern into target names. An exact name wins outright; otherwise the
/// pattern is a glob over every known name and must match at least one.
pub fn expand_targets(pattern: &str, target_names: &[String]) -> OverrideResult<Vec<String>> {
    if target_names.iter().any(|n| n == pattern) {
        return Ok(vec![pattern.to_string()]);
    }

    let matcher = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|source| OverrideError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    let names: Vec<String> = target_names
        .iter()
        .filter(|n| matcher.is_match(n.as_str()))
        .cloned()
        .collect();
    if names.is_empty() {
        return Err(OverrideError::NoMatch {
            pattern: pattern.to_string(),
        });
    }
    Ok(names)
}

/// Parses a boolean the way command-line flags are usually spelled.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

// --- APPLYING ---

impl Target {
    /// Applies this target's overrides. List-valued fields are replaced by the override values,
    /// except `entitlements`, `annotations` and `attest`, which append.
    pub fn add_overrides(
        &mut self,
        overrides: &TargetOverrides,
        ent: &mut EntitlementConf,
    ) -> OverrideResult<()> {
        for (key, o) in overrides {
            let value = o.value().to_string();
            match key {
                OverrideKey::Context => self.context = Some(value),
                OverrideKey::Dockerfile => self.dockerfile = Some(value),
                OverrideKey::Args(name) => {
                    self.args.insert(name.clone(), Some(value));
                }
                OverrideKey::Contexts(name) => {
                    self.contexts.insert(name.clone(), value);
                }
                OverrideKey::Labels(name) => {
                    self.labels.insert(name.clone(), Some(value));
                }
                OverrideKey::Tags => self.tags = Some(o.values()),
                OverrideKey::CacheFrom => {
                    let values = o.values();
                    let entries = specs::parse_cache_entries(&values)
                        .map_err(|e| self.spec_error(key, e))?;
                    ent.fs_read.extend(
                        entries
                            .into_iter()
                            .filter(|c| c.kind == "local")
                            .filter_map(|mut c| c.attrs.remove("src")),
                    );
                    self.cache_from = Some(values);
                }
                OverrideKey::CacheTo => {
                    let values = o.values();
                    let entries = specs::parse_cache_entries(&values)
                        .map_err(|e| self.spec_error(key, e))?;
                    ent.fs_write.extend(
                        entries
                            .into_iter()
                            .filter(|c| c.kind == "local")
                            .filter_map(|mut c| c.attrs.remove("dest")),
                    );
                    self.cache_to = Some(values);
                }
                OverrideKey::TargetStage => self.target_stage = Some(value),
                OverrideKey::Call => self.call = Some(value),
                OverrideKey::Secrets => {
                    let values = o.values();
                    let secrets = specs::parse_secret_specs(&values)
                        .map_err(|e| self.spec_error(key, e))?;
                    ent.fs_read
                        .extend(secrets.into_iter().filter_map(|s| s.file_path));
                    self.secrets = Some(values);
                }
                OverrideKey::Ssh => {
                    let values = o.values();
                    let specs = specs::parse_ssh_specs(&values)
                        .map_err(|e| self.spec_error(key, e))?;
                    ent.fs_read.extend(specs.into_iter().flat_map(|s| s.paths));
                    self.ssh = Some(values);
                }
                OverrideKey::Platform => self.platforms = Some(o.values()),
                OverrideKey::Output => {
                    let values = o.values();
                    let exports =
                        specs::parse_exports(&values).map_err(|e| self.spec_error(key, e))?;
                    ent.fs_write
                        .extend(exports.into_iter().filter_map(|e| e.destination));
                    self.outputs = Some(values);
                }
                OverrideKey::Entitlements => {
                    let values = o.values();
                    for v in &values {
                        if v == ENTITLEMENT_NETWORK_HOST {
                            ent.network_host = true;
                        } else if v == ENTITLEMENT_SECURITY_INSECURE {
                            ent.security_insecure = true;
                        }
                    }
                    self.entitlements.get_or_insert_with(Vec::new).extend(values);
                }
                OverrideKey::Annotations => {
                    self.annotations.get_or_insert_with(Vec::new).extend(o.values());
                }
                OverrideKey::Attest => {
                    self.attest.get_or_insert_with(Vec::new).extend(o.values());
                }
                OverrideKey::NoCache => self.no_cache = Some(self.bool_value(key, &value)?),
                OverrideKey::NoCacheFilter => self.no_cache_filter = Some(o.values()),
                OverrideKey::ShmSize => self.shm_size = Some(value),
                OverrideKey::Ulimits => self.ulimits = Some(o.values()),
                OverrideKey::Network => self.network_mode = Some(value),
                OverrideKey::Pull => self.pull = Some(self.bool_value(key, &value)?),
                OverrideKey::Push => {
                    let push = self.bool_value(key, &value)?;
                    let outputs = set_push_override(self.outputs.as_deref().unwrap_or_default(), push);
                    self.outputs = (!outputs.is_empty()).then_some(outputs);
                }
                OverrideKey::Load => {
                    let load = self.bool_value(key, &value)?;
                    let outputs = set_load_override(self.outputs.as_deref().unwrap_or_default(), load);
                    self.outputs = (!outputs.is_empty()).then_some(outputs);
                }
            }
        }
        Ok(())
    }

    fn bool_value(&self, key: &OverrideKey, value: &str) -> OverrideResult<bool> {
        parse_bool(value).ok_or_else(|| OverrideError::InvalidBool {
            value: value.to_string(),
            key: key.to_string(),
            target: self.name.clone(),
        })
    }

    fn spec_error(&self, key: &OverrideKey, source: SpecError) -> OverrideError {
        OverrideError::InvalidSpec {
            key: key.to_string(),
            target: self.name.clone(),
            source,
        }
    }
}

/// Rewrites outputs for `push=<bool>`.
///
/// Image outputs get an explicit `push` attribute, registry outputs are dropped when not
/// pushing, and an image output is added when pushing with nothing but docker outputs.
pub fn set_push_override(outputs: &[String], push: bool) -> Vec<String> {
    let mut out = Vec::with_capacity(outputs.len() + 1);
    let mut add_image = true;
    for output in outputs {
        match specs::parse_output_type(output).as_str() {
            "registry" => {
                add_image = false;
                if push {
                    out.push(output.clone());
                }
            }
            "image" => {
                add_image = false;
                out.push(format!("{},push={}", output, push));
            }
            typ => {
                if typ != "docker" {
                    add_image = false;
                }
                out.push(output.clone());
            }
        }
    }
    if push && add_image {
        out.push("type=image,push=true".to_string());
    }
    out
}

/// Rewrites outputs for `load=<bool>`: adds a `type=docker` output unless one already loads
/// the image or an output cannot coexist with loading.
pub fn set_load_override(outputs: &[String], load: bool) -> Vec<String> {
    let mut out = outputs.to_vec();
    if !load {
        return out;
    }
    let mut add_docker = true;
    for output in outputs {
        match specs::parse_output_type(output).as_str() {
            "docker" => {
                // A docker output without `dest` already loads; with one it writes a tarball.
                let loads = specs::parse_output_attrs(output)
                    .is_some_and(|attrs| !attrs.contains_key("dest"));
                if loads {
                    add_docker = false;
                    break;
                }
            }
            "image" | "registry" | "oci" => {}
            _ => {
                add_docker = false;
                break;
            }
        }
    }
    if add_docker {
        out.push("type=docker".to_string());
    }
    out
}
