//! Unit manifests - test unit descriptors stored on disk
//!
//! A manifest is the hand-off format between a discovery tool and the engine:
//! a list of [`TestUnit`] values in discovery order.
//!
//! ```toml
//! [[units]]
//! id = "auth::login"
//! partition_key = "auth"
//! priority = "high"
//! tags = ["smoke"]
//! executable = { kind = "shell", command = "pytest tests/auth/test_login.py" }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ManifestError, Result};
use crate::unit::TestUnit;

/// On-disk manifest layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitManifest {
    /// Units in discovery order
    #[serde(default)]
    pub units: Vec<TestUnit>,
}

impl UnitManifest {
    /// Parse a manifest from a string in the given format ("json", "yaml", "toml")
    pub fn parse(content: &str, format: &str) -> std::result::Result<Self, ManifestError> {
        let manifest: UnitManifest = match format {
            "json" => serde_json::from_str(content)?,
            "toml" => toml::from_str(content)?,
            _ => serde_yaml::from_str(content)?,
        };
        manifest.check()?;
        Ok(manifest)
    }

    fn check(&self) -> std::result::Result<(), ManifestError> {
        for unit in &self.units {
            if unit.id.trim().is_empty() {
                return Err(ManifestError::InvalidUnit {
                    id: unit.id.clone(),
                    message: "unit id cannot be empty".to_string(),
                });
            }
            if unit.partition_key.trim().is_empty() {
                return Err(ManifestError::InvalidUnit {
                    id: unit.id.clone(),
                    message: "partition_key cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Load test units from a manifest file
pub fn load_manifest(path: &Path) -> Result<Vec<TestUnit>> {
    if !path.exists() {
        return Err(ManifestError::NotFound(path.to_path_buf()).into());
    }

    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "json",
        Some("toml") => "toml",
        Some("yaml") | Some("yml") => "yaml",
        _ => return Err(ManifestError::UnsupportedFormat(path.to_path_buf()).into()),
    };
    info!(path = %path.display(), format, "loading unit manifest");

    let content = std::fs::read_to_string(path).map_err(ManifestError::Io)?;
    let manifest = UnitManifest::parse(&content, format)?;

    debug!(units = manifest.units.len(), "unit manifest loaded");
    Ok(manifest.units)
}
