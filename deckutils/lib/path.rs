//! `deckutils::path` is a module containing path utilities for the deckcore project.

use std::path::{Path, PathBuf};

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{DeckutilsError, DeckutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix for log files
pub const LOG_SUFFIX: &str = "log";

/// The suffix given to a log file when it is rotated out
pub const ROTATED_LOG_SUFFIX: &str = "old";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes the name of an archive entry into a relative path that stays inside the
/// extraction root.
///
/// Rules:
/// - Leading `/` and `./` are stripped, archives commonly store either form
/// - `.` components and empty components are dropped
/// - `..` components pop a previous component and are rejected if nothing is left to pop
///
/// # Returns
/// An error if the entry is empty after normalization or would escape the root
pub fn normalize_entry_path(entry: &str) -> DeckutilsResult<Utf8UnixPathBuf> {
    let path = Utf8UnixPathBuf::from(entry);
    let mut normalized: Vec<&str> = Vec::new();

    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::ParentDir => {
                if normalized.pop().is_none() {
                    return Err(DeckutilsError::PathValidation(format!(
                        "entry escapes the extraction root: {entry}"
                    )));
                }
            }
            Utf8UnixComponent::Normal(c) => {
                if !c.is_empty() {
                    normalized.push(c);
                }
            }
        }
    }

    if normalized.is_empty() {
        return Err(DeckutilsError::PathValidation(format!(
            "entry has no path components: {entry:?}"
        )));
    }

    Ok(Utf8UnixPathBuf::from(normalized.join("/")))
}

/// Returns true if `path`, after resolving symlinks on its deepest existing ancestor, is
/// located under the canonical `root`.
///
/// The path itself need not exist yet; this is what lets the extractor check a destination
/// before writing to it.
pub fn is_within(root: &Path, path: &Path) -> std::io::Result<bool> {
    let root = root.canonicalize()?;

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(false),
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }

    Ok(resolved.starts_with(&root))
}

/// Resolves the path of a binary, preferring the location given in an environment variable.
///
/// ## Arguments
///
/// * `env_var` - Environment variable that may override the location
/// * `default_path` - Location used when the variable is not set
///
/// ## Errors
///
/// Returns [`DeckutilsError::BinaryNotFound`] if the resolved path does not exist.
pub fn resolve_env_path(env_var: &str, default_path: impl AsRef<Path>) -> DeckutilsResult<PathBuf> {
    let (path, source) = match std::env::var_os(env_var) {
        Some(value) => (PathBuf::from(value), format!("environment variable {env_var}")),
        None => (
            default_path.as_ref().to_path_buf(),
            "default location".to_string(),
        ),
    };

    if !path.exists() {
        return Err(DeckutilsError::BinaryNotFound(
            path.display().to_string(),
            source,
        ));
    }

    Ok(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
