//! # Build-flag specifications
//!
//! Parsers for the comma-separated `key=value` strings used by cache, secret, ssh, output and
//! attestation fields. The resolver only needs enough structure to discover the local paths a
//! build will read or write, and the attestation type used for deduplication.

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while parsing a build-flag specification. Every variant carries the full
/// `value` being parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// A quote opened and never closed.
    #[error("unterminated quote in '{value}'")]
    UnterminatedQuote {
        /// Spec as written.
        value: String,
    },
    /// A field without `=`.
    #[error("invalid field '{field}' in '{value}', expected key=value")]
    InvalidField {
        /// Offending field.
        field: String,
        /// Spec as written.
        value: String,
    },
    /// A cache entry without `type`.
    #[error("type required for cache entry '{value}'")]
    CacheTypeRequired {
        /// Spec as written.
        value: String,
    },
    /// An output without `type`.
    #[error("type is required for output '{value}'")]
    OutputTypeRequired {
        /// Spec as written.
        value: String,
    },
    /// An attestation without `type`.
    #[error("attestation type not specified in '{value}'")]
    AttestTypeRequired {
        /// Spec as written.
        value: String,
    },
    /// A secret attribute other than type, id, src, source or env.
    #[error("unexpected key '{key}' in secret '{value}'")]
    UnexpectedSecretKey {
        /// Offending key.
        key: String,
        /// Spec as written.
        value: String,
    },
    /// A secret type other than file or env.
    #[error("unsupported secret type '{kind}' in '{value}'")]
    UnsupportedSecretType {
        /// Offending type.
        kind: String,
        /// Spec as written.
        value: String,
    },
    /// An ssh entry starting with `=`.
    #[error("invalid ssh spec '{value}', id is required")]
    EmptySshId {
        /// Spec as written.
        value: String,
    },
}

type SpecResult<T> = Result<T, SpecError>;

/// A `cache-from` or `cache-to` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The `type` attribute.
    pub kind: String,
    /// Remaining attributes.
    pub attrs: BTreeMap<String, String>,
}

/// A `secret` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    /// The `id` attribute, empty when not given.
    pub id: String,
    /// Set for file secrets.
    pub file_path: Option<String>,
    /// Set for environment secrets.
    pub env: Option<String>,
}

/// An `ssh` entry: an agent socket or key paths under an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSpec {
    /// Agent or key id.
    pub id: String,
    /// Sockets or key files.
    pub paths: Vec<String>,
}

/// An `output` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    /// The `type` attribute.
    pub kind: String,
    /// The `dest` attribute, removed from `attrs`.
    pub destination: Option<String>,
    /// Remaining attributes.
    pub attrs: BTreeMap<String, String>,
}

/// An `attest` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestSpec {
    /// The `type` attribute, used for deduplication.
    pub kind: String,
    /// `disabled=true` was given.
    pub disabled: bool,
    /// Remaining attributes.
    pub attrs: BTreeMap<String, String>,
}

// --- FIELD SPLITTING ---

/// Splits a CSV record into its fields. Double quotes group commas and `""` is a literal quote.
pub fn csv_fields(value: &str) -> SpecResult<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(SpecError::UnterminatedQuote {
            value: value.to_string(),
        });
    }
    fields.push(current);
    Ok(fields)
}

/// Parses every field of `value` as a `key=value` pair.
fn key_values(value: &str) -> SpecResult<Vec<(String, String)>> {
    csv_fields(value)?
        .into_iter()
        .map(|field| match field.split_once('=') {
            Some((k, v)) => Ok((k.trim().to_lowercase(), v.to_string())),
            None => Err(SpecError::InvalidField {
                field,
                value: value.to_string(),
            }),
        })
        .collect()
}

/// Best-effort parse of an output string into its attributes. Returns `None` when malformed.
pub fn parse_output_attrs(value: &str) -> Option<BTreeMap<String, String>> {
    let fields = csv_fields(value).ok()?;
    Some(
        fields
            .into_iter()
            .filter_map(|f| f.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect(),
    )
}

/// The `type` of an output string, or an empty string when it has none.
pub fn parse_output_type(value: &str) -> String {
    parse_output_attrs(value)
        .and_then(|mut attrs| attrs.remove("type"))
        .unwrap_or_default()
}

// --- SPEC PARSERS ---

/// Parses cache entries. A bare value without `=` is a registry reference.
pub fn parse_cache_entries(values: &[String]) -> SpecResult<Vec<CacheEntry>> {
    let mut entries = Vec::with_capacity(values.len());
    for value in values {
        if value.is_empty() {
            continue;
        }
        if !value.contains('=') {
            entries.push(CacheEntry {
                kind: "registry".to_string(),
                attrs: BTreeMap::from([("ref".to_string(), value.clone())]),
            });
            continue;
        }
        let mut attrs: BTreeMap<String, String> = key_values(value)?.into_iter().collect();
        let kind = attrs.remove("type").unwrap_or_default();
        if kind.is_empty() {
            return Err(SpecError::CacheTypeRequired {
                value: value.clone(),
            });
        }
        entries.push(CacheEntry { kind, attrs });
    }
    Ok(entries)
}

/// Parses secret specifications.
pub fn parse_secret_specs(values: &[String]) -> SpecResult<Vec<SecretSpec>> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| parse_secret(v))
        .collect()
}

fn parse_secret(value: &str) -> SpecResult<SecretSpec> {
    let mut id = String::new();
    let mut kind = String::new();
    let mut source = None;
    let mut env = None;

    for (key, val) in key_values(value)? {
        match key.as_str() {
            "type" => kind = val,
            "id" => id = val,
            "source" | "src" => source = Some(val),
            "env" => env = Some(val),
            _ => {
                return Err(SpecError::UnexpectedSecretKey {
                    key,
                    value: value.to_string(),
                });
            }
        }
    }

    if kind.is_empty() {
        kind = if env.is_some() && source.is_none() {
            "env".to_string()
        } else {
            "file".to_string()
        };
    }

    match kind.as_str() {
        "file" => Ok(SecretSpec {
            id,
            file_path: source,
            env: None,
        }),
        "env" => Ok(SecretSpec {
            env: source.or(env).or_else(|| Some(id.clone())),
            id,
            file_path: None,
        }),
        _ => Err(SpecError::UnsupportedSecretType {
            kind,
            value: value.to_string(),
        }),
    }
}

/// Parses ssh specifications of the form `id[=path[,path...]]`.
pub fn parse_ssh_specs(values: &[String]) -> SpecResult<Vec<SshSpec>> {
    let mut specs = Vec::with_capacity(values.len());
    for value in values.iter().filter(|v| !v.is_empty()) {
        let (id, paths) = match value.split_once('=') {
            Some((id, paths)) => (
                id,
                paths
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            None => (value.as_str(), Vec::new()),
        };
        if id.is_empty() {
            return Err(SpecError::EmptySshId {
                value: value.clone(),
            });
        }
        specs.push(SshSpec {
            id: id.to_string(),
            paths,
        });
    }
    Ok(specs)
}

/// Parses output (export) specifications.
///
/// A bare path is a `local` export to that path, `-` is a tarball on stdout and
/// `type=registry` is an image export with `push=true`.
pub fn parse_exports(values: &[String]) -> SpecResult<Vec<ExportEntry>> {
    let mut exports = Vec::with_capacity(values.len());
    for value in values.iter().filter(|v| !v.is_empty()) {
        let fields = csv_fields(value)?;
        if let [single] = fields.as_slice() {
            if !single.contains('=') {
                let kind = if single == "-" { "tar" } else { "local" };
                exports.push(ExportEntry {
                    kind: kind.to_string(),
                    destination: Some(single.clone()),
                    attrs: BTreeMap::new(),
                });
                continue;
            }
        }

        let mut attrs: BTreeMap<String, String> = key_values(value)?.into_iter().collect();
        let mut kind = attrs.remove("type").unwrap_or_default();
        if kind.is_empty() {
            return Err(SpecError::OutputTypeRequired {
                value: value.clone(),
            });
        }
        if kind == "registry" {
            kind = "image".to_string();
            attrs.insert("push".to_string(), "true".to_string());
        }
        let destination = attrs.remove("dest").filter(|d| !d.is_empty());
        exports.push(ExportEntry {
            kind,
            destination,
            attrs,
        });
    }
    Ok(exports)
}

/// Parses one attestation specification.
pub fn parse_attest(value: &str) -> SpecResult<AttestSpec> {
    let mut attrs: BTreeMap<String, String> = key_values(value)?.into_iter().collect();
    let kind = attrs.remove("type").unwrap_or_default();
    if kind.is_empty() {
        return Err(SpecError::AttestTypeRequired {
            value: value.to_string(),
        });
    }
    let disabled = attrs
        .remove("disabled")
        .map(|d| crate::core::overrides::parse_bool(&d).unwrap_or(false))
        .unwrap_or(false);
    Ok(AttestSpec {
        kind,
        disabled,
        attrs,
    })
}

/// Parses attestation specifications, skipping empty entries.
pub fn parse_attests(values: &[String]) -> SpecResult<Vec<AttestSpec>> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| parse_attest(v))
        .collect()
}
