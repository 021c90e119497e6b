//! Deterministic on-disk layout and atomic persistence for per-batch artifacts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use pdca_core::{BatchPaths, JobKind, MasterDataDocument};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdca-storage";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Directory scheme shared by the scheduler, the reconciler and the export utilities.
///
/// ```text
/// <root>/match_<ms>/raw/match_<bs>-<n>.json      scheduler output, batch-local ids
/// <root>/match_<ms>/match_<bs>-<n>.json          reconciled output, global ids
/// <root>/match_<ms>/augment_<as>/augment_<bs>-<n>.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    root: PathBuf,
    match_schema: u32,
    augment_schema: u32,
    batch_size: usize,
}

impl BatchLayout {
    pub fn new(
        output_root: impl AsRef<Path>,
        match_schema: u32,
        augment_schema: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            root: output_root.as_ref().join("match"),
            match_schema,
            augment_schema,
            batch_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn match_dir(&self) -> PathBuf {
        self.root.join(format!("match_{}", self.match_schema))
    }

    pub fn raw_match_dir(&self) -> PathBuf {
        self.match_dir().join("raw")
    }

    pub fn augment_dir(&self) -> PathBuf {
        self.match_dir().join(format!("augment_{}", self.augment_schema))
    }

    pub fn file_name(&self, kind: JobKind, batch_number: usize) -> String {
        format!("{}_{}-{}.json", kind.endpoint(), self.batch_size, batch_number)
    }

    pub fn paths_for(&self, batch_number: usize) -> BatchPaths {
        BatchPaths {
            match_file: self
                .raw_match_dir()
                .join(self.file_name(JobKind::Match, batch_number)),
            augment_file: self
                .augment_dir()
                .join(self.file_name(JobKind::Augment, batch_number)),
        }
    }

    pub fn reconciled_match_file(&self, batch_number: usize) -> PathBuf {
        self.match_dir()
            .join(self.file_name(JobKind::Match, batch_number))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.root.join(RUN_SUMMARY_FILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFileName {
    pub batch_size: usize,
    pub batch_number: usize,
}

impl BatchFileName {
    pub fn parse(file_name: &str, kind: JobKind) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let rest = stem.strip_prefix(kind.endpoint())?.strip_prefix('_')?;
        let (size, number) = rest.rsplit_once('-')?;
        Some(Self {
            batch_size: size.parse().ok()?,
            batch_number: number.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub name: BatchFileName,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub batch_number: usize,
    pub kind: JobKind,
    pub reconciled: bool,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    layout: BatchLayout,
}

impl ArtifactStore {
    pub fn new(layout: BatchLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [self.layout.raw_match_dir(), self.layout.augment_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        fs::try_exists(path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))
    }

    pub async fn read_document(&self, path: &Path) -> anyhow::Result<MasterDataDocument> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading artifact {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing artifact {}", path.display()))
    }

    /// Temp file plus rename: a file under its final name is always complete.
    pub async fn write_json<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        pretty: bool,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
        .with_context(|| format!("serializing {}", path.display()))?;

        let parent = path
            .parent()
            .with_context(|| format!("artifact path {} has no parent", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(StoredArtifact {
            path: path.to_path_buf(),
            content_hash: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
        })
    }

    /// Ordered by batch number; a missing directory is empty.
    pub async fn list_batch_files(&self, dir: &Path, kind: JobKind) -> anyhow::Result<Vec<BatchFile>> {
        if !self.exists(dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            match BatchFileName::parse(&file_name, kind) {
                Some(name) => files.push(BatchFile {
                    name,
                    path: entry.path(),
                }),
                None => debug!(file = %file_name, dir = %dir.display(), "skipping non-batch file"),
            }
        }
        files.sort_by_key(|f| f.name.batch_number);
        Ok(files)
    }

    pub async fn write_manifest(&self) -> anyhow::Result<(PathBuf, ArtifactManifest)> {
        let groups = [
            (self.layout.raw_match_dir(), JobKind::Match, false),
            (self.layout.match_dir(), JobKind::Match, true),
            (self.layout.augment_dir(), JobKind::Augment, false),
        ];

        let mut files = Vec::new();
        for (dir, kind, reconciled) in groups {
            for file in self.list_batch_files(&dir, kind).await? {
                files.push(self.manifest_entry(&file, kind, reconciled).await?);
            }
        }

        let manifest = ArtifactManifest {
            schema_version: 1,
            files,
        };
        let path = self.layout.manifest_path();
        self.write_json(&path, &manifest, true).await?;
        Ok((path, manifest))
    }

    async fn manifest_entry(
        &self,
        file: &BatchFile,
        kind: JobKind,
        reconciled: bool,
    ) -> anyhow::Result<ManifestEntry> {
        let bytes = fs::read(&file.path)
            .await
            .with_context(|| format!("reading {}", file.path.display()))?;
        let rel = file
            .path
            .strip_prefix(self.layout.root())
            .unwrap_or(&file.path)
            .display()
            .to_string();
        Ok(ManifestEntry {
            batch_number: file.name.batch_number,
            kind,
            reconciled,
            path: rel,
            sha256: Self::sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        })
    }
}
