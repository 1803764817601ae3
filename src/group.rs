//! Buildpack group definition
//!
//! The build group is the ordered list of buildpacks participating in
//! the current build, loaded from a `group.toml` document. Only group
//! members may retain on-disk cached state between builds.

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One buildpack in the build group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buildpack {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

impl Buildpack {
    /// Directory-safe form of the id (`/` is not valid in a path segment)
    pub fn escaped_id(&self) -> String {
        self.id.replace('/', "_")
    }
}

/// Ordered build group, parsed from group.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackGroup {
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
}

impl BuildpackGroup {
    /// Load a group from a TOML file on disk
    pub async fn from_file(path: &Path) -> StrataResult<Self> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::GroupNotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(StrataError::io(
                    format!("reading buildpack group {}", path.display()),
                    e,
                ));
            }
        };
        Self::parse(&content).map_err(|e| StrataError::GroupInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Parse a group from a TOML string
    pub fn parse(content: &str) -> StrataResult<Self> {
        Ok(toml::from_str(content)?)
    }
}
