//! # Merge Engine
//!
//! Field-level rules for folding one target (or group) definition into another. The same rules
//! serve same-name definitions across documents and the `inherits` chain, so every field has a
//! fixed policy instead of a generic deep merge:
//!
//! - **Replace** when the source sets the field: context, dockerfile, dockerfile-inline, target,
//!   call, platforms, cache-to, output, shm-size, pull, no-cache, network, description, tags.
//! - **Append**: annotations, attest (then folded by attestation type), secret, ssh, cache-from,
//!   no-cache-filter, ulimits, entitlements, inherits.
//! - **Map union**, source wins on collision: args, contexts, labels. Unset (`None`) args and
//!   labels never overwrite.

use crate::constants::ENTITLEMENT_NETWORK_HOST;
use crate::core::specs;
use crate::models::{Group, Target};
use std::collections::{HashMap, HashSet};

impl Target {
    /// Merges `src` into `self`; fields set on `src` take precedence.
    pub fn merge(&mut self, src: &Self) {
        replace_if_set(&mut self.context, &src.context);
        replace_if_set(&mut self.dockerfile, &src.dockerfile);
        replace_if_set(&mut self.dockerfile_inline, &src.dockerfile_inline);
        replace_if_set(&mut self.target_stage, &src.target_stage);
        replace_if_set(&mut self.call, &src.call);
        replace_if_set(&mut self.platforms, &src.platforms);
        replace_if_set(&mut self.cache_to, &src.cache_to);
        replace_if_set(&mut self.outputs, &src.outputs);
        replace_if_set(&mut self.shm_size, &src.shm_size);
        replace_if_set(&mut self.pull, &src.pull);
        replace_if_set(&mut self.no_cache, &src.no_cache);
        replace_if_set(&mut self.network_mode, &src.network_mode);
        replace_if_set(&mut self.tags, &src.tags);
        if src.description.as_deref().is_some_and(|d| !d.is_empty()) {
            self.description.clone_from(&src.description);
        }

        append_if_set(&mut self.annotations, &src.annotations);
        if src.attest.is_some() {
            append_if_set(&mut self.attest, &src.attest);
            self.attest = self.attest.take().map(|a| remove_attest_dupes(&a));
        }
        append_if_set(&mut self.secrets, &src.secrets);
        append_if_set(&mut self.ssh, &src.ssh);
        append_if_set(&mut self.cache_from, &src.cache_from);
        append_if_set(&mut self.no_cache_filter, &src.no_cache_filter);
        append_if_set(&mut self.ulimits, &src.ulimits);
        append_if_set(&mut self.entitlements, &src.entitlements);
        self.inherits.extend(src.inherits.iter().cloned());

        for (k, v) in &src.args {
            if v.is_some() {
                self.args.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in &src.contexts {
            self.contexts.insert(k.clone(), v.clone());
        }
        for (k, v) in &src.labels {
            if v.is_some() {
                self.labels.insert(k.clone(), v.clone());
            }
        }
    }

    /// Cleans up a freshly merged target: removes duplicate and empty list entries, folds
    /// attestations by type, implies `network.host` for host networking and drops empty
    /// named contexts.
    pub fn normalize(&mut self) {
        for list in [
            &mut self.annotations,
            &mut self.tags,
            &mut self.secrets,
            &mut self.ssh,
            &mut self.platforms,
            &mut self.cache_from,
            &mut self.cache_to,
            &mut self.outputs,
            &mut self.no_cache_filter,
            &mut self.ulimits,
        ] {
            if let Some(values) = list.as_mut() {
                *values = remove_dupes(values);
            }
        }
        self.attest = self.attest.take().map(|a| remove_attest_dupes(&a));

        if self.network_mode.as_deref() == Some("host") {
            self.entitlements
                .get_or_insert_with(Vec::new)
                .push(ENTITLEMENT_NETWORK_HOST.to_string());
        }
        if let Some(entitlements) = self.entitlements.as_mut() {
            *entitlements = remove_dupes(entitlements);
        }

        self.contexts.retain(|_, v| !v.is_empty());
    }
}

impl Group {
    /// Adds the targets of `src` that this group does not list yet, keeping first-seen order.
    pub fn merge(&mut self, src: &Self) {
        for name in &src.targets {
            if !self.targets.contains(name) {
                self.targets.push(name.clone());
            }
        }
        if self.description.is_none() {
            self.description.clone_from(&src.description);
        }
    }
}

fn replace_if_set<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}

fn append_if_set(dst: &mut Option<Vec<String>>, src: &Option<Vec<String>>) {
    if let Some(values) = src {
        dst.get_or_insert_with(Vec::new).extend(values.iter().cloned());
    }
}

/// Removes duplicates and empty strings, keeping the first occurrence.
pub fn remove_dupes(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .iter()
        .filter(|v| !v.is_empty() && seen.insert(v.as_str()))
        .cloned()
        .collect()
}

/// Removes duplicates, keeping the first occurrence. Empty strings are kept.
pub fn dedup_strings(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect()
}

/// Keeps one attestation per type: the last value wins but takes the position of the first.
/// Entries that do not parse as an attestation are kept untouched.
pub fn remove_attest_dupes(values: &[String]) -> Vec<String> {
    let mut res: Vec<String> = Vec::with_capacity(values.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    for value in values {
        let Ok(attest) = specs::parse_attest(value) else {
            res.push(value.clone());
            continue;
        };
        match positions.get(&attest.kind) {
            Some(&i) => {
                if let Some(slot) = res.get_mut(i) {
                    slot.clone_from(value);
                }
            }
            None => {
                positions.insert(attest.kind, res.len());
                res.push(value.clone());
            }
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Option<Vec<String>> {
        Some(values.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_scalar_fields_replace_only_when_set() {
        let mut dst = Target {
            context: Some("./a".into()),
            dockerfile: Some("a.Dockerfile".into()),
            ..Default::default()
        };
        let src = Target {
            context: Some("./b".into()),
            ..Default::default()
        };
        dst.merge(&src);
        assert_eq!(dst.context.as_deref(), Some("./b"));
        assert_eq!(dst.dockerfile.as_deref(), Some("a.Dockerfile"));
    }

    #[test]
    fn test_tags_replace_and_empty_list_clears() {
        let mut dst = Target {
            tags: strings(&["a:1", "a:2"]),
            ..Default::default()
        };
        dst.merge(&Target {
            tags: strings(&["b:1"]),
            ..Default::default()
        });
        assert_eq!(dst.tags, strings(&["b:1"]));

        dst.merge(&Target {
            tags: Some(Vec::new()),
            ..Default::default()
        });
        assert_eq!(dst.tags, Some(Vec::new()));
    }

    #[test]
    fn test_list_fields_append() {
        let mut dst = Target {
            cache_from: strings(&["type=registry,ref=a"]),
            secrets: strings(&["id=one"]),
            inherits: vec!["base".into()],
            ..Default::default()
        };
        let src = Target {
            cache_from: strings(&["type=registry,ref=b"]),
            secrets: strings(&["id=two"]),
            entitlements: strings(&["network.host"]),
            inherits: vec!["other".into()],
            ..Default::default()
        };
        dst.merge(&src);
        assert_eq!(
            dst.cache_from,
            strings(&["type=registry,ref=a", "type=registry,ref=b"])
        );
        assert_eq!(dst.secrets, strings(&["id=one", "id=two"]));
        assert_eq!(dst.entitlements, strings(&["network.host"]));
        assert_eq!(dst.inherits, vec!["base".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_maps_union_and_skip_unset_values() {
        let mut dst = Target::default();
        dst.args.insert("A".into(), Some("1".into()));
        dst.args.insert("B".into(), Some("2".into()));
        dst.labels.insert("l".into(), Some("x".into()));

        let mut src = Target::default();
        src.args.insert("A".into(), Some("10".into()));
        src.args.insert("B".into(), None);
        src.args.insert("C".into(), Some("3".into()));
        src.labels.insert("l".into(), None);
        src.contexts.insert("base".into(), "target:base".into());

        dst.merge(&src);
        assert_eq!(dst.args.get("A"), Some(&Some("10".to_string())));
        assert_eq!(dst.args.get("B"), Some(&Some("2".to_string())));
        assert_eq!(dst.args.get("C"), Some(&Some("3".to_string())));
        assert_eq!(dst.labels.get("l"), Some(&Some("x".to_string())));
        assert_eq!(dst.contexts.get("base").map(String::as_str), Some("target:base"));
    }

    #[test]
    fn test_attest_merge_keeps_last_per_type() {
        let mut dst = Target {
            attest: strings(&["type=sbom", "type=provenance,mode=min"]),
            ..Default::default()
        };
        dst.merge(&Target {
            attest: strings(&["type=provenance,mode=max"]),
            ..Default::default()
        });
        assert_eq!(dst.attest, strings(&["type=sbom", "type=provenance,mode=max"]));
    }

    #[test]
    fn test_empty_description_does_not_replace() {
        let mut dst = Target {
            description: Some("base image".into()),
            ..Default::default()
        };
        dst.merge(&Target {
            description: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(dst.description.as_deref(), Some("base image"));
    }

    #[test]
    fn test_normalize_dedups_and_implies_network_host() {
        let mut target = Target {
            tags: strings(&["a", "", "a", "b"]),
            network_mode: Some("host".into()),
            entitlements: strings(&["network.host"]),
            ..Default::default()
        };
        target.contexts.insert("empty".into(), String::new());
        target.contexts.insert("src".into(), "./src".into());
        target.normalize();

        assert_eq!(target.tags, strings(&["a", "b"]));
        assert_eq!(target.entitlements, strings(&["network.host"]));
        assert!(!target.contexts.contains_key("empty"));
        assert!(target.contexts.contains_key("src"));
    }

    #[test]
    fn test_group_merge_skips_duplicates() {
        let mut dst = Group {
            name: "all".into(),
            targets: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        dst.merge(&Group {
            name: "all".into(),
            targets: vec!["b".into(), "c".into()],
            ..Default::default()
        });
        assert_eq!(dst.targets, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_remove_attest_dupes_keeps_unparsable() {
        let values = vec![
            "type=sbom,generator=a".to_string(),
            "garbage".to_string(),
            "type=sbom,generator=b".to_string(),
        ];
        assert_eq!(
            remove_attest_dupes(&values),
            vec!["type=sbom,generator=b".to_string(), "garbage".to_string()]
        );
    }
}
