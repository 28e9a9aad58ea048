//! Artifact resolution: local directory first, then one remote lookup
//!
//! Remote storage sits behind `ArtifactSource`. `HubCache` is the provided
//! implementation, a content-addressed local mirror of a hub: artifacts of
//! identifier `id` live under `<root>/<sha256(id)>/`.

use crate::error::{LoraError, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment variable overriding the hub cache location
pub const HUB_CACHE_ENV: &str = "LORA_TUNER_HUB_CACHE";

/// Somewhere artifacts can be fetched from by identifier
pub trait ArtifactSource {
    /// Local path of `filename` for `identifier`, fetching it if needed
    fn fetch(&self, identifier: &str, filename: &str) -> Result<PathBuf>;
}

/// Content-addressed mirror of remote adapter repositories
#[derive(Debug, Clone)]
pub struct HubCache {
    root: PathBuf,
}

impl HubCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$LORA_TUNER_HUB_CACHE`, else `$HOME/.cache/lora-tuner/hub`
    pub fn from_env() -> Self {
        let root = std::env::var_os(HUB_CACHE_ENV)
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".cache").join("lora-tuner").join("hub"))
            })
            .unwrap_or_else(|| PathBuf::from(".lora-tuner-hub"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `identifier`
    pub fn entry_dir(&self, identifier: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(identifier.as_bytes()));
        self.root.join(key)
    }

    /// Mirror the artifacts in `dir` under `identifier`
    pub fn publish(&self, identifier: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let entry = self.entry_dir(identifier);
        std::fs::create_dir_all(&entry)?;
        let mut copied = 0usize;
        for item in std::fs::read_dir(dir.as_ref())? {
            let item = item?;
            if item.file_type()?.is_file() {
                std::fs::copy(item.path(), entry.join(item.file_name()))?;
                copied += 1;
            }
        }
        info!("Published {} artifacts for '{}' to {}", copied, identifier, entry.display());
        Ok(entry)
    }
}

impl ArtifactSource for HubCache {
    fn fetch(&self, identifier: &str, filename: &str) -> Result<PathBuf> {
        let path = self.entry_dir(identifier).join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(LoraError::ArtifactNotFound {
                identifier: identifier.to_string(),
                filename: filename.to_string(),
            })
        }
    }
}

/// Find `filename` for `identifier`: `<identifier>/<filename>` on disk, else
/// one lookup through `source`. Both failing yields one `ArtifactNotFound`.
pub fn resolve_artifact(
    identifier: &str,
    filename: &str,
    source: Option<&dyn ArtifactSource>,
) -> Result<PathBuf> {
    let local = Path::new(identifier).join(filename);
    if local.is_file() {
        return Ok(local);
    }
    if let Some(source) = source {
        match source.fetch(identifier, filename) {
            Ok(path) => {
                debug!("Resolved {} for '{}' remotely at {}", filename, identifier, path.display());
                return Ok(path);
            }
            Err(e) => debug!("Remote lookup of {} for '{}' failed: {}", filename, identifier, e),
        }
    }
    Err(LoraError::ArtifactNotFound {
        identifier: identifier.to_string(),
        filename: filename.to_string(),
    })
}
