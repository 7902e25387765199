//! Results store: per-dataset evaluation artifacts with integrity checksums
//!
//! The evaluation program writes one artifact per benchmark into the results
//! directory. The store keeps a `manifest.json` next to them recording each
//! artifact's file name, SHA-256 and size, so a sweep can be verified or
//! compared against a re-run.

use crate::error::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Metadata for one recorded artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub dataset: String,
    pub filename: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Manifest tracking all artifacts, in recording order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultManifest {
    pub artifacts: Vec<ArtifactMeta>,
}

/// Hex SHA-256 of a file's contents
pub fn file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let data = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// The results store for one results directory
#[derive(Debug)]
pub struct ResultStore {
    dir: PathBuf,
    pub manifest: ResultManifest,
}

impl ResultStore {
    /// Open the store in `dir`, loading an existing manifest if there is one
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = match std::fs::read_to_string(&manifest_path) {
            Ok(json) => match serde_json::from_str::<ResultManifest>(&json) {
                Ok(manifest) => {
                    info!("Loaded result manifest with {} artifacts", manifest.artifacts.len());
                    manifest
                }
                Err(e) => {
                    warn!("Ignoring unreadable manifest {}: {}", manifest_path.display(), e);
                    ResultManifest::default()
                }
            },
            Err(_) => ResultManifest::default(),
        };
        Self { dir, manifest }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record (or re-record) the artifact for `dataset`
    pub fn record(&mut self, dataset: &str, artifact: impl AsRef<Path>) -> Result<ArtifactMeta> {
        let artifact = artifact.as_ref();
        let checksum = file_checksum(artifact)?;
        let size_bytes = std::fs::metadata(artifact)?.len();
        let filename = match artifact.strip_prefix(&self.dir) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => artifact.to_string_lossy().into_owned(),
        };
        let meta = ArtifactMeta {
            dataset: dataset.to_string(),
            filename,
            checksum,
            size_bytes,
            recorded_at: Utc::now(),
        };

        match self.manifest.artifacts.iter_mut().find(|a| a.dataset == dataset) {
            Some(existing) => *existing = meta.clone(),
            None => self.manifest.artifacts.push(meta.clone()),
        }
        info!("Recorded {} result: {} ({} bytes)", dataset, meta.filename, size_bytes);
        Ok(meta)
    }

    pub fn get(&self, dataset: &str) -> Option<&ArtifactMeta> {
        self.manifest.artifacts.iter().find(|a| a.dataset == dataset)
    }

    /// Forget the entry for `dataset`; the artifact file itself is left alone
    pub fn remove(&mut self, dataset: &str) -> Option<ArtifactMeta> {
        let index = self.manifest.artifacts.iter().position(|a| a.dataset == dataset)?;
        info!("Dropped {} from the result manifest", dataset);
        Some(self.manifest.artifacts.remove(index))
    }

    pub fn artifacts(&self) -> &[ArtifactMeta] {
        &self.manifest.artifacts
    }

    fn resolve(&self, meta: &ArtifactMeta) -> PathBuf {
        let path = Path::new(&meta.filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    /// Recompute checksums; returns `(dataset, ok)` for every artifact
    pub fn verify(&self) -> Vec<(String, bool)> {
        self.manifest
            .artifacts
            .iter()
            .map(|meta| {
                let ok = file_checksum(self.resolve(meta)).map_or(false, |c| c == meta.checksum);
                (meta.dataset.clone(), ok)
            })
            .collect()
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(&self.manifest)?;
        std::fs::write(self.dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}
