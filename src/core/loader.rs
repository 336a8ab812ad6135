//! # Loader
//!
//! Reads definition files and converts them into the uniform [`RawDocument`] the engine
//! consumes. JSON and TOML files share one shape:
//!
//! ```toml
//! [variable.TAG]
//! default = "latest"
//!
//! [group.default]
//! targets = ["app"]
//!
//! [target.app]
//! context = "."
//! tags = ["app:${TAG}"]
//! ```

use crate::constants::{DEFAULT_FILENAMES, STDIN_FILENAME};
use crate::models::{RawBlock, RawDocument};
use serde_json::Value;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading or parsing definition files.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// A named file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// The file that failed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Reading `-` from stdin failed.
    #[error("failed to read definition from stdin: {0}")]
    Stdin(#[source] io::Error),
    /// None of the default file names exist.
    #[error("couldn't find a bake definition, tried {}", .0.join(", "))]
    NotFound(Vec<String>),
    /// A `.json` file is not valid JSON.
    #[error("failed to parse {name} as JSON: {source}")]
    Json {
        /// The file that failed.
        name: String,
        /// The parser error.
        #[source]
        source: serde_json::Error,
    },
    /// A `.toml` file is not valid TOML.
    #[error("failed to parse {name} as TOML: {source}")]
    Toml {
        /// The file that failed.
        name: String,
        /// The parser error.
        #[source]
        source: toml::de::Error,
    },
    /// A file without a known extension parsed as neither format.
    #[error("failed to parse {name}: not valid JSON ({json}) nor TOML ({toml})")]
    UnknownFormat {
        /// The file that failed.
        name: String,
        /// Error from the JSON attempt.
        json: serde_json::Error,
        /// Error from the TOML attempt.
        toml: toml::de::Error,
    },
    /// The file parsed but its sections have the wrong shape.
    #[error("invalid definition in {name}: {reason}")]
    Shape {
        /// The file that failed.
        name: String,
        /// What was wrong.
        reason: String,
    },
}

type LoaderResult<T> = Result<T, LoaderError>;

/// One definition file and its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// Path as given, or `-` for stdin.
    pub name: String,
    /// Raw file contents.
    pub data: String,
}

/// Reads the named files, or the default file names when `names` is empty. Missing default
/// files are skipped; `-` reads from stdin.
pub fn read_local_files(names: &[String]) -> LoaderResult<Vec<File>> {
    read_local_files_from(names, io::stdin())
}

/// Same as [`read_local_files`] reading `-` from `stdin`.
pub fn read_local_files_from(names: &[String], mut stdin: impl Read) -> LoaderResult<Vec<File>> {
    let is_default = names.is_empty();
    let names: Vec<String> = if is_default {
        DEFAULT_FILENAMES.iter().map(|n| n.to_string()).collect()
    } else {
        names.to_vec()
    };

    let mut files = Vec::with_capacity(names.len());
    for name in &names {
        if name == STDIN_FILENAME {
            let mut data = String::new();
            stdin.read_to_string(&mut data).map_err(LoaderError::Stdin)?;
            files.push(File {
                name: name.clone(),
                data,
            });
            continue;
        }
        match std::fs::read_to_string(name) {
            Ok(data) => {
                log::debug!("Loaded definition file '{}'", name);
                files.push(File {
                    name: name.clone(),
                    data,
                });
            }
            Err(e) if is_default && e.kind() == io::ErrorKind::NotFound => {
                log::trace!("Default file '{}' not found, skipping", name);
            }
            Err(source) => {
                return Err(LoaderError::Read {
                    path: name.clone(),
                    source,
                });
            }
        }
    }

    if files.is_empty() {
        return Err(LoaderError::NotFound(names));
    }
    Ok(files)
}

/// Parses every file and concatenates them in order.
pub fn parse_files(files: &[File]) -> LoaderResult<RawDocument> {
    let mut document = RawDocument::default();
    for file in files {
        document.extend(parse_file(file)?);
    }
    Ok(document)
}

/// Parses one file, picking the format from its extension. Files without a known extension
/// (stdin included) are tried as JSON, then TOML.
pub fn parse_file(file: &File) -> LoaderResult<RawDocument> {
    let extension = Path::new(&file.name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let value = match extension.as_deref() {
        Some("json") => parse_json(file)?,
        Some("toml") => parse_toml(file)?,
        _ => match parse_json(file) {
            Ok(value) => value,
            Err(LoaderError::Json { source: json, .. }) => {
                parse_toml(file).map_err(|err| match err {
                    LoaderError::Toml { source: toml, .. } => LoaderError::UnknownFormat {
                        name: file.name.clone(),
                        json,
                        toml,
                    },
                    other => other,
                })?
            }
            Err(other) => return Err(other),
        },
    };
    to_raw_document(&file.name, value)
}

fn parse_json(file: &File) -> LoaderResult<Value> {
    serde_json::from_str(&file.data).map_err(|source| LoaderError::Json {
        name: file.name.clone(),
        source,
    })
}

fn parse_toml(file: &File) -> LoaderResult<Value> {
    let value: toml::Value = toml::from_str(&file.data).map_err(|source| LoaderError::Toml {
        name: file.name.clone(),
        source,
    })?;
    Ok(toml_to_json(value))
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn to_raw_document(name: &str, value: Value) -> LoaderResult<RawDocument> {
    let shape = |reason: String| LoaderError::Shape {
        name: name.to_string(),
        reason,
    };
    let Value::Object(root) = value else {
        return Err(shape("top level must be a map".to_string()));
    };

    let mut document = RawDocument::default();
    for (section, content) in root {
        let Value::Object(entries) = content else {
            return Err(shape(format!("'{}' must be a map", section)));
        };
        match section.as_str() {
            "variable" => {
                for (var, definition) in entries {
                    let default = match definition {
                        Value::Object(mut attrs) => attrs.remove("default"),
                        Value::Null => None,
                        other => Some(other),
                    };
                    document.variables.insert(var, default);
                }
            }
            "group" | "target" => {
                for (label, attributes) in entries {
                    let Value::Object(attributes) = attributes else {
                        return Err(shape(format!("{} '{}' must be a map", section, label)));
                    };
                    let block = RawBlock::new(label, attributes);
                    if section == "group" {
                        document.groups.push(block);
                    } else {
                        document.targets.push(block);
                    }
                }
            }
            other => return Err(shape(format!("unknown section '{}'", other))),
        }
    }
    Ok(document)
}

/// Convenience used by tests and callers that build documents in memory.
pub fn parse_str(name: &str, data: &str) -> LoaderResult<RawDocument> {
    parse_file(&File {
        name: name.to_string(),
        data: data.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_toml_and_json_share_shape() {
        let toml = r#"
            [variable.TAG]
            default = "latest"

            [group.default]
            targets = ["app"]

            [target.app]
            context = "."
            tags = ["app:${TAG}"]
        "#;
        let json = r#"{
            "variable": {"TAG": {"default": "latest"}},
            "group": {"default": {"targets": ["app"]}},
            "target": {"app": {"context": ".", "tags": ["app:${TAG}"]}}
        }"#;
        let from_toml = parse_str("docker-bake.toml", toml).unwrap();
        let from_json = parse_str("docker-bake.json", json).unwrap();
        assert_eq!(from_toml, from_json);
        assert_eq!(from_toml.variables.get("TAG"), Some(&Some(json!("latest"))));
        assert_eq!(from_toml.targets[0].label, "app");
    }

    #[test]
    fn test_target_order_preserved() {
        let raw = parse_str("x.toml", "[target.zeta]\n[target.alpha]\n[target.mid]\n").unwrap();
        let labels: Vec<&str> = raw.targets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_unknown_extension_falls_back() {
        assert!(parse_str("-", "[target.app]\ncontext = \".\"\n").is_ok());
        assert!(parse_str("-", r#"{"target": {"app": {}}}"#).is_ok());
        let err = parse_str("-", "target = [").unwrap_err();
        assert!(matches!(err, LoaderError::UnknownFormat { .. }));
    }

    #[test]
    fn test_shape_errors() {
        let err = parse_str("a.json", r#"{"service": {}}"#).unwrap_err();
        assert!(err.to_string().contains("unknown section 'service'"));
        let err = parse_str("a.json", r#"{"target": {"app": 1}}"#).unwrap_err();
        assert!(err.to_string().contains("'app'"));
    }

    #[test]
    fn test_read_local_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bake.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[target.app]").unwrap();

        let name = path.to_string_lossy().to_string();
        let files =
            read_local_files_from(&[name.clone(), "-".to_string()], "{}".as_bytes()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].data, "{}");

        let missing = dir.path().join("missing.toml").to_string_lossy().to_string();
        let err = read_local_files_from(&[missing], io::empty()).unwrap_err();
        assert!(matches!(err, LoaderError::Read { .. }));
    }

    #[test]
    fn test_multiple_files_concatenate() {
        let files = vec![
            File {
                name: "a.json".into(),
                data: r#"{"target": {"app": {"context": "a"}}}"#.into(),
            },
            File {
                name: "b.toml".into(),
                data: "[target.app]\ndockerfile = \"b\"\n".into(),
            },
        ];
        let raw = parse_files(&files).unwrap();
        assert_eq!(raw.targets.len(), 2);
    }
}
