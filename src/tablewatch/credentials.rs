//! Database credential resolution
//!
//! Inline values win when non-empty; otherwise the `*-file` variants are
//! read on demand so that secret rotation on disk is picked up without a
//! restart. File contents are trimmed of surrounding whitespace and
//! newlines.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Inline and file-based credential sources for the database connection.
#[derive(Debug, Clone, Default)]
pub struct DbCredentials {
    username: String,
    password: String,
    username_file: Option<PathBuf>,
    password_file: Option<PathBuf>,
}

/// A point-in-time resolution of [`DbCredentials`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DbCredentials {
    pub fn new(
        username: String,
        password: String,
        username_file: Option<PathBuf>,
        password_file: Option<PathBuf>,
    ) -> Self {
        Self {
            username,
            password,
            username_file,
            password_file,
        }
    }

    /// Resolve both credentials, reading files as needed.
    pub fn resolve(&self) -> Result<ResolvedCredentials> {
        Ok(ResolvedCredentials {
            username: resolve_one("username", &self.username, self.username_file.as_deref())?,
            password: resolve_one("password", &self.password, self.password_file.as_deref())?,
        })
    }

    /// Directories holding credential files, for rotation watching.
    pub fn watch_dirs(&self) -> BTreeSet<PathBuf> {
        let mut dirs = BTreeSet::new();
        for file in [&self.username_file, &self.password_file].into_iter().flatten() {
            if let Some(parent) = file.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }
        dirs
    }
}

fn resolve_one(kind: &str, inline: &str, file: Option<&Path>) -> Result<Option<String>> {
    if !inline.is_empty() {
        return Ok(Some(inline.to_string()));
    }

    let Some(path) = file else {
        return Ok(None);
    };

    debug!(kind, path = %path.display(), "reading database credential from file");

    let contents = fs::read_to_string(path).map_err(|e| {
        Error::credentials(format!("reading {kind} file {}: {e}", path.display()))
    })?;

    Ok(Some(contents.trim().to_string()))
}
