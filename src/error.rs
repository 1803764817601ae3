//! Error types for strata
//!
//! All modules use `StrataResult<T>` as their return type. Recoverable
//! conditions (missing previous image, unreadable metadata label) are
//! logged as warnings and never surface here.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// All errors that can occur in strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Configuration errors
    #[error("Invalid buildpack group at {path}: {reason}")]
    GroupInvalid { path: PathBuf, reason: String },

    #[error("Buildpack group file not found: {0}")]
    GroupNotFound(PathBuf),

    // Layer cache errors
    #[error("Invalid layer config at {path}: {reason}")]
    LayerConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to remove cached layers for '{layer}': {source}")]
    LayerRemove {
        layer: String,
        #[source]
        source: std::io::Error,
    },

    // Export errors
    #[error("cannot reuse layer '{buildpack}/{layer}': previous image has no metadata for it")]
    ReuseMissingMetadata { buildpack: String, layer: String },

    #[error("cannot reuse layer '{layer}': digest '{digest}' not found in previous image")]
    ReuseMissingBlob {
        layer: String,
        digest: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("failed to export layer '{layer}'")]
    ExportLayer {
        layer: String,
        #[source]
        source: Box<StrataError>,
    },

    // Image store errors
    #[error("image store error during {operation}: {reason}")]
    ImageStore { operation: String, reason: String },

    #[error("layer '{digest}' not present in image '{image}'")]
    LayerNotFound { image: String, digest: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an image store error
    pub fn image_store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImageStore {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an error with the logical layer it occurred in
    pub fn export_layer(layer: impl Into<String>, source: StrataError) -> Self {
        Self::ExportLayer {
            layer: layer.into(),
            source: Box::new(source),
        }
    }
}
