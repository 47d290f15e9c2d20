//! File validation before processing.

use std::fmt;
use std::sync::Arc;

use crate::file::FileLike;
use crate::Error;

/// A custom validation rule, returning a failure message when a file is rejected.
pub type Rule = Arc<dyn Fn(&dyn FileLike) -> Result<(), String> + Send + Sync>;

/// Validation configuration.
///
/// MIME type patterns either match a type exactly or, when ending with `/*`, any type sharing the same top-level
/// part (e.g. `image/*` matches `image/png`).
#[derive(Clone, Default)]
pub struct ValidationConfig {
    pub allowed_types: Vec<String>,
    pub blocked_types: Vec<String>,
    /// Maximum size in bytes, inclusive.
    pub max_size: Option<u64>,
    /// Minimum size in bytes, inclusive.
    pub min_size: Option<u64>,
    pub validate: Option<Rule>,
}

impl ValidationConfig {
    #[inline]
    pub fn with_allowed_types<I: IntoIterator<Item = S>, S: Into<String>>(self, types: I) -> Self {
        Self {
            allowed_types: types.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    #[inline]
    pub fn with_blocked_types<I: IntoIterator<Item = S>, S: Into<String>>(self, types: I) -> Self {
        Self {
            blocked_types: types.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    #[inline]
    pub fn with_max_size(self, max_size: u64) -> Self {
        Self {
            max_size: Some(max_size),
            ..self
        }
    }

    #[inline]
    pub fn with_min_size(self, min_size: u64) -> Self {
        Self {
            min_size: Some(min_size),
            ..self
        }
    }

    #[inline]
    pub fn with_rule(self, rule: impl Fn(&dyn FileLike) -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self {
            validate: Some(Arc::new(rule)),
            ..self
        }
    }
}

impl fmt::Debug for ValidationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationConfig")
            .field("allowed_types", &self.allowed_types)
            .field("blocked_types", &self.blocked_types)
            .field("max_size", &self.max_size)
            .field("min_size", &self.min_size)
            .field("validate", &self.validate.as_ref().map(|_| ".."))
            .finish()
    }
}

fn matches_type(mime_type: &str, pattern: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => mime_type.split_once('/').map_or(mime_type, |(top, _)| top) == prefix,
        None => mime_type == pattern,
    }
}

/// Check `file` against `config`, stopping at the first violation.
///
/// Only metadata is looked at, the file content is never read. No configuration means no restriction at all.
///
/// ```
/// use chunker::file::MemoryFile;
/// use chunker::validate::{validate, ValidationConfig};
///
/// let file = MemoryFile::new("notes.txt", "hello").with_mime_type("text/plain");
/// let config = ValidationConfig::default().with_allowed_types(["image/*"]);
///
/// assert!(validate(&file, None).is_ok());
/// assert!(validate(&file, Some(&config)).is_err());
/// ```
pub fn validate(file: &dyn FileLike, config: Option<&ValidationConfig>) -> Result<(), Error> {
    let Some(config) = config else {
        return Ok(());
    };

    let mime_type = file.mime_type();
    let invalid = |message: String| Err(Error::invalid_file(file.name(), message));

    if !config.allowed_types.is_empty() && !config.allowed_types.iter().any(|pattern| matches_type(mime_type, pattern)) {
        return invalid(format!(
            "type `{mime_type}` is not allowed, expected one of: {}",
            config.allowed_types.join(", ")
        ));
    }

    if let Some(pattern) = config.blocked_types.iter().find(|pattern| matches_type(mime_type, pattern)) {
        return invalid(format!("type `{mime_type}` is blocked by `{pattern}`"));
    }

    let size = file.size();

    if let Some(max_size) = config.max_size.filter(|&max_size| size > max_size) {
        return invalid(format!("size of {size} bytes exceeds maximum of {max_size} bytes"));
    }

    if let Some(min_size) = config.min_size.filter(|&min_size| size < min_size) {
        return invalid(format!("size of {size} bytes is below minimum of {min_size} bytes"));
    }

    if let Some(ref rule) = config.validate {
        rule(file).or_else(invalid)?;
    }

    Ok(())
}
