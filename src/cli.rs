// src/cli.rs

use crate::constants::DEFAULT_GROUP;
use clap::Parser;
use std::collections::BTreeMap;

/// bakeplan: resolves bake build definitions into concrete build targets.
///
/// Definition files declare targets and groups. `bakeplan` expands the requested groups,
/// merges inheritance chains, evaluates matrices, follows `target:` build contexts, applies
/// `--set` overrides and prints the resolved targets as JSON.
///
/// Examples:
/// - `bakeplan` resolves the `default` group from the default files.
/// - `bakeplan -f bake.toml web api` resolves two targets from one file.
/// - `bakeplan --set '*.platform=linux/arm64' --push` overrides every target.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Targets or groups to resolve. Glob patterns are matched against declared names.
    /// Defaults to the `default` group.
    pub targets: Vec<String>,

    /// Build definition file. Repeat to merge several files; `-` reads from stdin.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub files: Vec<String>,

    /// Override a target value (e.g., "web.args.VERSION=1.2" or "*.platform=linux/amd64").
    #[arg(long = "set", value_name = "PATTERN.KEY[.NAME]=VALUE")]
    pub overrides: Vec<String>,

    /// Value for variables without a declared default (e.g., "KEY=VALUE"). Entries are split
    /// on commas, so a value cannot itself contain a comma: `TAGS=a,b` sets `TAGS=a` and an
    /// empty `b`.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub var: Vec<String>,

    /// Shorthand for `--set=*.push=true`.
    #[arg(long)]
    pub push: bool,

    /// Shorthand for `--set=*.load=true`.
    #[arg(long)]
    pub load: bool,

    /// List declared groups and targets without resolving them.
    #[arg(long)]
    pub list: bool,
}

impl Cli {
    /// The requested names, or the default group when none is given.
    pub fn requests(&self) -> Vec<String> {
        if self.targets.is_empty() {
            vec![DEFAULT_GROUP.to_string()]
        } else {
            self.targets.clone()
        }
    }

    /// The `--set` values followed by the `--push`/`--load` shorthands.
    pub fn override_values(&self) -> Vec<String> {
        let mut values = self.overrides.clone();
        if self.push {
            values.push("*.push=true".to_string());
        }
        if self.load {
            values.push("*.load=true".to_string());
        }
        values
    }

    /// The `--var` values as a defaults table. A bare `KEY` maps to an empty value.
    pub fn defaults(&self) -> BTreeMap<String, String> {
        self.var
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}
