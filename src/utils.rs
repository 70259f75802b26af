//! Utility functions for paths and environment lookups.
//!
//! This module provides helpers used throughout the crate for building
//! per-account file system paths and for reading environment variables from an
//! injectable snapshot rather than from the process directly.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Snapshot of environment variables.
///
/// Resolution code never reads the process environment directly. It receives an
/// [`EnvVars`] instead, so tests can inject exactly the variables they need.
///
/// # Examples
///
/// ```
/// # use multi_matrix::utils::EnvVars;
/// let env = EnvVars::from_iter([("MATRIX_HOMESERVER", "https://matrix.org")]);
/// assert_eq!(env.get("MATRIX_HOMESERVER"), Some("https://matrix.org"));
/// assert_eq!(env.get("MATRIX_PASSWORD"), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EnvVars {
    vars: HashMap<String, String>,
}

impl EnvVars {
    /// Captures the current process environment.
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn from_process() -> Self {
        EnvVars {
            vars: std::env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    /// Returns the trimmed value of a variable, or `None` when unset or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        EnvVars {
            vars: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Constructs a path by joining a directory with one or more components.
///
/// # Examples
///
/// ```
/// # use multi_matrix::utils::get_path;
/// let path = get_path("/var/lib/state", &["credentials", "matrix"]);
/// # #[cfg(unix)]
/// assert_eq!(path.to_str(), Some("/var/lib/state/credentials/matrix"));
/// ```
pub fn get_path(dir_path: impl AsRef<Path>, components: &[&str]) -> PathBuf {
    let mut path = dir_path.as_ref().to_path_buf();
    path.extend(components);
    path
}

/// Makes an arbitrary string safe to use as a single path component.
///
/// Every character outside `[A-Za-z0-9._-]` becomes `_`, so Matrix user ids
/// such as `@bot:example.org` map to `_bot_example.org`.
pub fn sanitize_path_segment(segment: &str) -> String {
    let sanitized: String = segment
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Never produce a component that walks up or stays in place
    match sanitized.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => sanitized,
    }
}
