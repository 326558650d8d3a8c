//! Why a gateway settings file could not be turned into [`MangahubSettings`].
//!
//! [`MangahubSettings`]: crate::MangahubSettings

use thiserror::Error;

/// Failure while loading `mangahub.json` or validating the merged result.
///
/// Bad `MANGAHUB_*` env vars never end up here; the loader skips them and
/// reports them as [`RejectedOverride`](crate::RejectedOverride)s.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read gateway settings: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not JSON, or a field has the wrong shape.
    #[error("malformed gateway settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A field parsed but would leave the bridge or a tracker unusable,
    /// e.g. a zero queue capacity or breaker threshold.
    #[error("unusable gateway settings: {0}")]
    InvalidValue(String),
}

/// Result alias for the settings crate.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_settings_from_path;

    #[test]
    fn unreadable_path_is_io() {
        let dir = tempfile::tempdir().unwrap();
        // A directory exists but cannot be read as a file.
        let err = load_settings_from_path(dir.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
        assert!(err.to_string().starts_with("cannot read gateway settings"));
    }

    #[test]
    fn wrong_field_shape_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mangahub.json");
        std::fs::write(&path, r#"{"gateway":{"tcp_port":"ninety"}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
        assert!(err.to_string().starts_with("malformed gateway settings"));
    }

    #[test]
    fn zero_breaker_threshold_is_invalid_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mangahub.json");
        std::fs::write(&path, r#"{"circuit_breaker":{"threshold":0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unusable gateway settings: circuit_breaker.threshold must be greater than zero"
        );
    }
}
