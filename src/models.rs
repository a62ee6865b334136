use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ForgeError, Result};

/// Which remote repository a bundle comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleKind {
    Package,
    Fix,
    Bypass,
}

impl BundleKind {
    pub fn path_segment(&self) -> &'static str {
        match self {
            BundleKind::Package => "download",
            BundleKind::Fix => "fix",
            BundleKind::Bypass => "bypass",
        }
    }

    pub fn not_available_message(&self) -> &'static str {
        match self {
            BundleKind::Package => "Game Not Added Yet: Will Be Added Soon",
            BundleKind::Fix => "No Fix Found for This Game",
            BundleKind::Bypass => "No Bypass Found for This Game",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveShape {
    Single,
    Split,
}

/// Shape of a remote bundle as reported by the type probe.
#[derive(Clone, Debug)]
pub struct ArchiveDescriptor {
    pub shape: ArchiveShape,
    /// Part filenames in server order; empty for single-file bundles.
    pub parts: Vec<String>,
    /// Per-part byte counts when the server knows them.
    pub sizes: HashMap<String, u64>,
}

impl ArchiveDescriptor {
    /// Sum of the declared part sizes, when every part is covered.
    pub fn declared_total(&self) -> Option<u64> {
        if self.parts.is_empty() {
            return None;
        }
        let mut total = 0u64;
        for part in &self.parts {
            total += *self.sizes.get(part)?;
        }
        Some(total)
    }
}

/// Wire form of the type probe: `{type, files, sizes, error}`.
#[derive(Debug, Deserialize)]
pub struct ProbeResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub sizes: HashMap<String, u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProbeResponse {
    /// `None` means "bundle does not exist" (not an error).
    pub fn into_descriptor(self) -> Result<Option<ArchiveDescriptor>> {
        match self.kind.as_str() {
            "none" => Ok(None),
            "single" => Ok(Some(ArchiveDescriptor {
                shape: ArchiveShape::Single,
                parts: Vec::new(),
                sizes: HashMap::new(),
            })),
            "split" => {
                if self.files.is_empty() {
                    return Err(ForgeError::Archive(
                        "split descriptor carries no part files".to_string(),
                    ));
                }
                Ok(Some(ArchiveDescriptor {
                    shape: ArchiveShape::Split,
                    parts: self.files,
                    sizes: self.sizes,
                }))
            }
            "error" => Err(ForgeError::Remote(
                self.error.unwrap_or_else(|| "Unknown error".to_string()),
            )),
            other => Err(ForgeError::Archive(format!(
                "unrecognized bundle type \"{other}\""
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub download_endpoint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub appid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchAvailabilityResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub available: Vec<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchUpdatesResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub updates: Vec<UpdateEntry>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGame {
    #[serde(alias = "appid")]
    pub app_id: u32,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadedApp {
    pub app_id: u32,
    pub name: String,
}
