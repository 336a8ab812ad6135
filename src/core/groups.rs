// src/core/groups.rs

use crate::core::document::Document;
use crate::core::merge::dedup_strings;
use std::collections::HashMap;

#[derive(Debug)]
enum Visit {
    InProgress,
    Done { targets: Vec<String>, groups: Vec<String> },
}

impl Document {
    /// Flattens `name` into the target names it reaches and the groups crossed on the way,
    /// both deduplicated in discovery order. A name that is not a group is returned as a
    /// target. A group that contains itself, directly or not, contributes nothing the second
    /// time it is reached, unless a target carries the same name.
    pub fn resolve_group(&self, name: &str) -> (Vec<String>, Vec<String>) {
        let mut visited = HashMap::new();
        let (targets, groups) = self.expand_group(name, &mut visited);
        (dedup_strings(&targets), dedup_strings(&groups))
    }

    fn expand_group(
        &self,
        name: &str,
        visited: &mut HashMap<String, Visit>,
    ) -> (Vec<String>, Vec<String>) {
        match visited.get(name) {
            Some(Visit::Done { targets, groups }) => return (targets.clone(), groups.clone()),
            Some(Visit::InProgress) => {
                // A renamed matrix block yields a group sharing the name of one of its targets.
                if self.target(name).is_some() {
                    return (vec![name.to_string()], Vec::new());
                }
                log::debug!("Group '{}' contains itself, skipping", name);
                return (Vec::new(), Vec::new());
            }
            None => {}
        }
        let Some(group) = self.group(name) else {
            return (vec![name.to_string()], Vec::new());
        };

        visited.insert(name.to_string(), Visit::InProgress);
        let mut targets = Vec::with_capacity(group.targets.len());
        let mut groups = vec![name.to_string()];
        for child in &group.targets {
            let (t, g) = self.expand_group(child, visited);
            targets.extend(t);
            groups.extend(g);
        }
        visited.insert(
            name.to_string(),
            Visit::Done {
                targets: targets.clone(),
                groups: groups.clone(),
            },
        );
        (targets, groups)
    }
}
