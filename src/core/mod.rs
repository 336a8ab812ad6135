// src/core/mod.rs

//! Loading, evaluation and resolution of build definitions.

pub mod document;
/// Group flattening.
pub mod groups;
/// `${NAME}` interpolation.
pub mod interpolator;
pub mod loader;
pub mod matrix;
pub mod merge;
pub mod overrides;
pub mod resolver;
pub mod specs;
