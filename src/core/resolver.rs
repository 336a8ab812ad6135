//! # Resolver
//!
//! Turns a request (target or group names) into fully materialized build units.
//!
//! A [`Session`] owns everything that is shared across the targets of one or more requests:
//! the parsed override table, the inheritance memo and the map of targets resolved so far,
//! which the link pass both reads and extends. Nothing is global, so independent sessions can
//! run side by side; a single session shared between threads goes behind one `Mutex`.
//!
//! Per target the merge order is: empty default, inherited parents (later parents win), the
//! target's own fields, then its overrides, then normalization.

use crate::constants::{CACHE_ONLY_OUTPUT, DEFAULT_CONTEXT, DEFAULT_DOCKERFILE, DEFAULT_GROUP};
use crate::core::document::{sanitize_target_name, Document};
use crate::core::merge::dedup_strings;
use crate::core::overrides::{self, OverrideError, OverrideTable};
use crate::models::{EntitlementConf, Group, ResolvedTarget, Target};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Errors raised while resolving a request.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The name is neither a group nor a target, and matches nothing as a pattern.
    #[error("failed to find target {0}")]
    TargetNotFound(String),
    /// A target lists itself in `inherits`.
    #[error("target {0} cannot inherit from itself")]
    SelfInherit(String),
    /// The inheritance chain comes back to a target still being resolved.
    #[error("inheritance cycle: {}", .0.join(" -> "))]
    InheritanceCycle(Vec<String>),
    /// A `target:` context names its own target.
    #[error("target {0} cannot link to itself")]
    SelfLink(String),
    /// Two targets link to each other, directly or not.
    #[error("infinite loop from {from} to {to}")]
    LinkCycle {
        /// Target holding the link.
        from: String,
        /// Linked target.
        to: String,
    },
    /// A linked target builds for a different platform set than its dependent.
    #[error(
        "target {target} can't be used by {dependent} because it is defined for different platforms {target_platforms:?} and {dependent_platforms:?}"
    )]
    PlatformMismatch {
        /// Linked target.
        target: String,
        /// Target holding the link.
        dependent: String,
        /// Platforms of the linked target.
        target_platforms: Vec<String>,
        /// Platforms of the dependent.
        dependent_platforms: Vec<String>,
    },
    /// A `--set` value could not be parsed.
    #[error(transparent)]
    Override(#[from] OverrideError),
}

type ResolveResult<T> = Result<T, ResolveError>;

/// What a request resolves to: the reachable groups (plus the synthesized `default` group)
/// and every target needed to build them, linked dependencies included.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Reachable groups by name.
    #[serde(rename = "group")]
    pub groups: BTreeMap<String, Group>,
    /// Resolved targets by name.
    #[serde(rename = "target")]
    pub targets: BTreeMap<String, ResolvedTarget>,
}

impl Resolution {
    /// Targets the user asked for, without the ones pulled in only through links.
    pub fn requested_targets(&self) -> impl Iterator<Item = (&String, &ResolvedTarget)> {
        self.targets.iter().filter(|(_, t)| !t.is_linked())
    }
}

#[derive(Debug)]
enum VisitState {
    InProgress,
    Done(Target),
}

/// Shared state of one resolution session.
#[derive(Debug)]
pub struct Session<'a> {
    document: &'a Document,
    overrides: OverrideTable,
    memo: HashMap<String, VisitState>,
    resolved: BTreeMap<String, ResolvedTarget>,
}

impl<'a> Session<'a> {
    /// Starts a session over `document` with a fixed override table.
    pub fn new(document: &'a Document, overrides: OverrideTable) -> Self {
        Self {
            document,
            overrides,
            memo: HashMap::new(),
            resolved: BTreeMap::new(),
        }
    }

    /// Resolves a request. Names are sanitized first; a name that is neither a group nor a
    /// target is treated as a glob over both.
    pub fn read(&mut self, requests: &[String], ent: &mut EntitlementConf) -> ResolveResult<Resolution> {
        let requests = self.expand_requests(requests)?;
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        let mut requested = Vec::new();

        for request in &requests {
            let (target_names, group_names) = self.document.resolve_group(request);
            for name in target_names {
                // A target first seen as a link becomes a regular one once requested.
                if self.resolved.get(&name).is_none_or(Target::is_linked) {
                    let target = self.resolve_target(&name, ent)?;
                    self.resolved.insert(name.clone(), target);
                }
                requested.push(name);
            }
            for name in group_names {
                if let Some(group) = self.document.group(&name) {
                    groups.insert(name, group.clone());
                }
            }
        }

        let extra: Vec<String> = requests
            .iter()
            .filter(|r| r.as_str() != DEFAULT_GROUP)
            .cloned()
            .collect();
        if !extra.is_empty() {
            let default = groups
                .entry(DEFAULT_GROUP.to_string())
                .or_insert_with(|| Group {
                    name: DEFAULT_GROUP.to_string(),
                    ..Default::default()
                });
            default.targets.extend(extra);
            default.targets = dedup_strings(&default.targets);
        }

        self.resolve_links(ent)?;

        Ok(Resolution {
            groups,
            targets: self.link_closure(&requested),
        })
    }

    /// Resolves one target through its inheritance chain and overrides, and fills in the
    /// default context and dockerfile.
    pub fn resolve_target(&mut self, name: &str, ent: &mut EntitlementConf) -> ResolveResult<ResolvedTarget> {
        let mut target = self.inherit(name, ent, &mut Vec::new())?;
        target.inherits.clear();
        target
            .context
            .get_or_insert_with(|| DEFAULT_CONTEXT.to_string());
        target
            .dockerfile
            .get_or_insert_with(|| DEFAULT_DOCKERFILE.to_string());
        Ok(target)
    }

    /// Resolved targets so far, including link-only ones.
    pub fn resolved(&self) -> &BTreeMap<String, ResolvedTarget> {
        &self.resolved
    }

    fn expand_requests(&self, requests: &[String]) -> ResolveResult<Vec<String>> {
        let known = self.document.list_targets();
        let mut expanded = Vec::with_capacity(requests.len());
        for request in requests {
            let name = sanitize_target_name(request);
            let is_glob = name.contains(['*', '?', '[']);
            if is_glob && !known.contains(&name) {
                expanded.extend(overrides::expand_targets(&name, &known)?);
            } else {
                expanded.push(name);
            }
        }
        Ok(dedup_strings(&expanded))
    }

    fn inherit(
        &mut self,
        name: &str,
        ent: &mut EntitlementConf,
        stack: &mut Vec<String>,
    ) -> ResolveResult<Target> {
        match self.memo.get(name) {
            Some(VisitState::Done(target)) => {
                log::trace!("Target '{}' already resolved", name);
                return Ok(target.clone());
            }
            Some(VisitState::InProgress) => {
                let mut chain = stack.clone();
                chain.push(name.to_string());
                return Err(ResolveError::InheritanceCycle(chain));
            }
            None => {}
        }

        let document = self.document;
        let declared = document
            .target(name)
            .ok_or_else(|| ResolveError::TargetNotFound(name.to_string()))?;
        if declared.inherits.iter().any(|parent| parent == name) {
            return Err(ResolveError::SelfInherit(name.to_string()));
        }

        self.memo.insert(name.to_string(), VisitState::InProgress);
        stack.push(name.to_string());
        let merged = self.merge_target(name, declared, ent, stack);
        stack.pop();

        match merged {
            Ok(target) => {
                self.memo
                    .insert(name.to_string(), VisitState::Done(target.clone()));
                Ok(target)
            }
            Err(err) => {
                self.memo.remove(name);
                Err(err)
            }
        }
    }

    fn merge_target(
        &mut self,
        name: &str,
        declared: &Target,
        ent: &mut EntitlementConf,
        stack: &mut Vec<String>,
    ) -> ResolveResult<Target> {
        let mut inherited = Target::default();
        for parent in &declared.inherits {
            log::debug!("Target '{}' inherits from '{}'", name, parent);
            let parent = self.inherit(parent, ent, stack)?;
            inherited.merge(&parent);
        }

        let mut target = Target::named(name);
        target.merge(&inherited);
        target.merge(declared);
        if let Some(overrides) = self.overrides.for_target(name) {
            target.add_overrides(overrides, ent)?;
        }
        target.normalize();
        Ok(target)
    }

    /// Closes the resolved set over `target:` links until no new target appears.
    fn resolve_links(&mut self, ent: &mut EntitlementConf) -> ResolveResult<()> {
        let mut done = BTreeSet::new();
        loop {
            let pending: Vec<String> = self
                .resolved
                .keys()
                .filter(|name| !done.contains(*name))
                .cloned()
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for name in pending {
                self.load_links(&name, &mut Vec::new(), ent)?;
                done.insert(name);
            }
        }
    }

    fn load_links(
        &mut self,
        name: &str,
        path: &mut Vec<String>,
        ent: &mut EntitlementConf,
    ) -> ResolveResult<()> {
        path.push(name.to_string());
        let links = self
            .resolved
            .get(name)
            .map(Target::linked_target_names)
            .unwrap_or_default();

        for link in links {
            if link == name {
                return Err(ResolveError::SelfLink(link));
            }
            if path.contains(&link) {
                return Err(ResolveError::LinkCycle {
                    from: name.to_string(),
                    to: link,
                });
            }
            if !self.resolved.contains_key(&link) {
                log::debug!("Resolving '{}' as a link of '{}'", link, name);
                let mut linked = self.resolve_target(&link, ent)?;
                linked.outputs = Some(vec![CACHE_ONLY_OUTPUT.to_string()]);
                linked.linked = true;
                self.resolved.insert(link.clone(), linked);
            }
            self.load_links(&link, path, ent)?;

            let (link_entitlements, link_platforms) = self
                .resolved
                .get(&link)
                .map(|t| {
                    (
                        t.entitlements.clone().unwrap_or_default(),
                        t.platforms.clone().unwrap_or_default(),
                    )
                })
                .unwrap_or_default();
            let Some(target) = self.resolved.get_mut(name) else {
                continue;
            };

            if !link_entitlements.is_empty() {
                let entitlements = target.entitlements.get_or_insert_with(Vec::new);
                for entitlement in link_entitlements {
                    if !entitlements.contains(&entitlement) {
                        entitlements.push(entitlement);
                    }
                }
            }

            let platforms = target.platforms.as_deref().unwrap_or_default();
            if platforms.len() > 1 && link_platforms.len() > 1 && !same_set(platforms, &link_platforms) {
                return Err(ResolveError::PlatformMismatch {
                    target: link,
                    dependent: name.to_string(),
                    target_platforms: link_platforms,
                    dependent_platforms: platforms.to_vec(),
                });
            }
        }
        path.pop();
        Ok(())
    }

    /// The requested targets plus everything they reach through links.
    fn link_closure(&self, requested: &[String]) -> BTreeMap<String, ResolvedTarget> {
        let mut closure = BTreeMap::new();
        let mut pending: Vec<String> = requested.to_vec();
        while let Some(name) = pending.pop() {
            if closure.contains_key(&name) {
                continue;
            }
            if let Some(target) = self.resolved.get(&name) {
                pending.extend(target.linked_target_names());
                closure.insert(name, target.clone());
            }
        }
        closure
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Parses `overrides` against the document and resolves `requests` in a fresh session.
pub fn read_targets(
    document: &Document,
    requests: &[String],
    overrides: &[String],
    ent: &mut EntitlementConf,
) -> ResolveResult<Resolution> {
    let table = overrides::parse_overrides(overrides, &document.target_names())?;
    Session::new(document, table).read(requests, ent)
}
