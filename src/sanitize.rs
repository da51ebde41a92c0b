//! # Input Sanitization Gate
//!
//! Checked before any subprocess spawn or working-directory resolution. The engine
//! treats the gate as opaque: a rejection aborts the task before anything runs.

use crate::error::EngineError;
use std::path::{Component, Path, PathBuf};

const MAX_COMMAND_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanitizeError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("command exceeds {MAX_COMMAND_LEN} bytes")]
    CommandTooLong,
    #[error("{0} contains a NUL byte")]
    NulByte(String),
    #[error("invalid environment variable name '{0}'")]
    InvalidEnvKey(String),
    #[error("path '{0}' escapes the working directory")]
    PathEscape(String),
}

impl From<SanitizeError> for EngineError {
    fn from(err: SanitizeError) -> Self {
        EngineError::Sanitization(err.to_string())
    }
}

pub trait Sanitizer: Send + Sync {
    fn check_command(&self, command: &str) -> Result<(), SanitizeError>;

    fn check_env(&self, key: &str, value: &str) -> Result<(), SanitizeError>;

    /// Resolve `path` against `base`, rejecting anything unsafe
    fn resolve_path(&self, path: &Path, base: &Path) -> Result<PathBuf, SanitizeError>;
}

/// Rejects NUL bytes, malformed variable names and relative paths that climb out of
/// the working directory. Absolute paths are accepted as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSanitizer;

impl Sanitizer for BasicSanitizer {
    fn check_command(&self, command: &str) -> Result<(), SanitizeError> {
        if command.trim().is_empty() {
            return Err(SanitizeError::EmptyCommand);
        }
        if command.len() > MAX_COMMAND_LEN {
            return Err(SanitizeError::CommandTooLong);
        }
        if command.contains('\0') {
            return Err(SanitizeError::NulByte("command".to_string()));
        }
        Ok(())
    }

    fn check_env(&self, key: &str, value: &str) -> Result<(), SanitizeError> {
        let mut chars = key.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SanitizeError::InvalidEnvKey(key.to_string()));
        }
        if value.contains('\0') {
            return Err(SanitizeError::NulByte(format!("value of {key}")));
        }
        Ok(())
    }

    fn resolve_path(&self, path: &Path, base: &Path) -> Result<PathBuf, SanitizeError> {
        if path.to_string_lossy().contains('\0') {
            return Err(SanitizeError::NulByte("path".to_string()));
        }
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }

        let mut depth: usize = 0;
        let mut resolved = base.to_path_buf();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| SanitizeError::PathEscape(path.display().to_string()))?;
                    resolved.pop();
                }
                Component::Normal(part) => {
                    depth += 1;
                    resolved.push(part);
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SanitizeError::PathEscape(path.display().to_string()));
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_checks() {
        let s = BasicSanitizer;
        assert!(s.check_command("npm run migrate").is_ok());
        assert_eq!(s.check_command("  "), Err(SanitizeError::EmptyCommand));
        assert!(matches!(s.check_command("ls\0rm"), Err(SanitizeError::NulByte(_))));
    }

    #[test]
    fn test_env_checks() {
        let s = BasicSanitizer;
        assert!(s.check_env("DATABASE_URL", "postgres://x").is_ok());
        assert!(s.check_env("_PRIVATE", "").is_ok());
        assert!(s.check_env("1BAD", "x").is_err());
        assert!(s.check_env("BAD-NAME", "x").is_err());
        assert!(s.check_env("", "x").is_err());
        assert!(s.check_env("OK", "a\0b").is_err());
    }

    #[test]
    fn test_path_resolution() {
        let s = BasicSanitizer;
        let base = Path::new("/srv/app");
        assert_eq!(
            s.resolve_path(Path::new("services/./api"), base).unwrap(),
            PathBuf::from("/srv/app/services/api")
        );
        assert_eq!(
            s.resolve_path(Path::new("a/../b"), base).unwrap(),
            PathBuf::from("/srv/app/b")
        );
        assert!(matches!(
            s.resolve_path(Path::new("../etc"), base),
            Err(SanitizeError::PathEscape(_))
        ));
        assert_eq!(
            s.resolve_path(Path::new("/tmp/work"), base).unwrap(),
            PathBuf::from("/tmp/work")
        );
    }
}
