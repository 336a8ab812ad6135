//! Resolution engine for bake build definitions: groups, inheritance, matrices, `--set`
//! overrides and `target:` links.

/// Command-line interface.
pub mod cli;
/// Shared defaults and names.
pub mod constants;
pub mod core;
/// Build definition models.
pub mod models;

pub use crate::core::document::Document;
pub use crate::core::resolver::{Resolution, Session, read_targets};
pub use crate::models::{EntitlementConf, Group, ResolvedTarget, Target};
