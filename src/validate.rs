/// Pre-launch sanity check for OpenVPN config files.
///
/// This is a heuristic gate, not a grammar parser: a file passes if it is
/// readable and mentions at least one of the core client directives.
use std::path::{Path, PathBuf};

const REQUIRED_DIRECTIVES: [&str; 3] = ["remote ", "dev ", "proto "];

/// Errors produced by config validation.
#[derive(Debug)]
pub enum ValidateError {
    /// The file could not be read (missing, permissions, not UTF-8).
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// None of the required directives occur in the file.
    MissingDirectives { path: PathBuf },
}

impl std::fmt::Display for ValidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidateError::Unreadable { path, source } => {
                write!(
                    f,
                    "failed to read OpenVPN config {}: {source}",
                    path.display()
                )
            }
            ValidateError::MissingDirectives { path } => {
                write!(
                    f,
                    "invalid OpenVPN config {}: missing required parameters",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ValidateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ValidateError::Unreadable { source, .. } => Some(source),
            ValidateError::MissingDirectives { .. } => None,
        }
    }
}

/// Check that `path` is readable and contains `remote `, `dev ` or `proto `.
pub fn validate(path: &Path) -> Result<(), ValidateError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ValidateError::Unreadable {
        path: path.to_path_buf(),
        source: e,
    })?;

    if has_required_directive(&contents) {
        Ok(())
    } else {
        Err(ValidateError::MissingDirectives {
            path: path.to_path_buf(),
        })
    }
}

fn has_required_directive(contents: &str) -> bool {
    REQUIRED_DIRECTIVES.iter().any(|d| contents.contains(d))
}
