//! CSV manifest of per-image captions and review state.
//!
//! The manifest is the durable contract between runs. Rows are keyed by the
//! image path relative to the manifest's directory. Every save rewrites the
//! whole file through a temp file in the same directory, so a crash leaves
//! either the previous or the new manifest on disk, never a torn one.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::models::image::{ImageRecord, ImageStatus};
use crate::services::encoder;

pub const MANIFEST_FILE_NAME: &str = "manifest.csv";

const HEADER: [&str; 5] = ["filepath", "prompt_en", "prompt_cn", "status", "retry_cnt"];

/// Which records a run should send to the vision API.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selection {
    /// Skip images that already have a caption.
    pub skip_existing: bool,
    /// Send `rejected` images again for a fresh caption.
    pub regenerate_rejected: bool,
}

impl Selection {
    pub fn wants(&self, record: &ImageRecord) -> bool {
        if !record.status.is_dispatchable(self.regenerate_rejected) {
            return false;
        }
        let already_done = record.status != ImageStatus::Rejected && record.has_caption();
        !(self.skip_existing && already_done)
    }
}

/// Per-status totals for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub retrying: usize,
    pub captioned: usize,
}

pub struct ManifestStore {
    path: PathBuf,
    base_dir: PathBuf,
    records: Vec<ImageRecord>,
    index: HashMap<String, usize>,
}

impl ManifestStore {
    /// Empty manifest that will be written to `path`.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            path,
            base_dir,
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Load `path`, or start empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ManifestError> {
        let mut store = Self::create(path);
        if !store.path.exists() {
            tracing::info!(path = %store.path.display(), "Manifest not found, starting empty");
            return Ok(store);
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&store.path)?;
        for (line, row) in reader.deserialize::<ImageRecord>().enumerate() {
            match row {
                Ok(record) if store.index.contains_key(&record.filepath) => {
                    tracing::warn!(filepath = %record.filepath, "Duplicate manifest row ignored");
                }
                Ok(record) => store.insert(record),
                Err(e) => {
                    tracing::warn!(row = line + 2, error = %e, "Skipping unparseable manifest row");
                }
            }
        }

        tracing::info!(
            path = %store.path.display(),
            records = store.records.len(),
            "Loaded manifest"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory that record paths are relative to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, filepath: &str) -> Option<&ImageRecord> {
        self.index.get(filepath).map(|&i| &self.records[i])
    }

    /// Location of a record's image on disk.
    pub fn resolve(&self, filepath: &str) -> PathBuf {
        self.base_dir.join(filepath)
    }

    fn insert(&mut self, record: ImageRecord) {
        self.index.insert(record.filepath.clone(), self.records.len());
        self.records.push(record);
    }

    /// Add a new `pending` record unless one exists. Returns whether it was added.
    pub fn add(&mut self, filepath: &str) -> bool {
        if self.index.contains_key(filepath) {
            return false;
        }
        self.insert(ImageRecord::new(filepath));
        true
    }

    /// Apply `f` to the record for `filepath`.
    pub fn update<F>(&mut self, filepath: &str, f: F) -> Result<&ImageRecord, ManifestError>
    where
        F: FnOnce(&mut ImageRecord),
    {
        let i = *self
            .index
            .get(filepath)
            .ok_or_else(|| ManifestError::NotFound(filepath.to_string()))?;
        f(&mut self.records[i]);
        Ok(&self.records[i])
    }

    /// Reviewer decision. Approving a record without a caption is refused.
    pub fn set_status(&mut self, filepath: &str, status: ImageStatus) -> Result<(), ManifestError> {
        if status == ImageStatus::Approved
            && !self.get(filepath).is_some_and(ImageRecord::has_caption)
        {
            return match self.get(filepath) {
                Some(_) => Err(ManifestError::NoCaption(filepath.to_string())),
                None => Err(ManifestError::NotFound(filepath.to_string())),
            };
        }
        self.update(filepath, |record| record.status = status)?;
        Ok(())
    }

    /// Scan the manifest's directory for supported images and add new ones.
    pub fn import_images(&mut self) -> Result<usize, ManifestError> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.base_dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !encoder::is_supported(entry.path()) {
                continue;
            }
            if let Some(relative) = relative_key(&self.base_dir, entry.path()) {
                found.push(relative);
            }
        }
        found.sort();

        let imported = found.iter().filter(|key| self.add(key)).count();
        tracing::info!(
            dir = %self.base_dir.display(),
            found = found.len(),
            imported,
            "Imported images"
        );
        Ok(imported)
    }

    pub fn select(&self, selection: Selection) -> Vec<&ImageRecord> {
        self.records.iter().filter(|r| selection.wants(r)).collect()
    }

    /// Atomically rewrite the manifest file.
    pub fn save(&self) -> Result<(), ManifestError> {
        let dir = if self.base_dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.base_dir.as_path()
        };
        std::fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(temp.as_file_mut());
            writer.write_record(HEADER)?;
            for record in &self.records {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        temp.as_file_mut().flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| ManifestError::Io(e.error))?;

        tracing::debug!(path = %self.path.display(), records = self.records.len(), "Saved manifest");
        Ok(())
    }

    /// Where the caption file for `record` goes.
    pub fn sidecar_path(&self, record: &ImageRecord, output_dir: Option<&Path>) -> PathBuf {
        let image = self.resolve(&record.filepath);
        match output_dir {
            Some(dir) => {
                let stem = image.file_stem().unwrap_or_default().to_string_lossy();
                dir.join(format!("{stem}.txt"))
            }
            None => image.with_extension("txt"),
        }
    }

    /// Write the English caption of one record next to its image (or into `output_dir`).
    pub fn write_sidecar(
        &self,
        record: &ImageRecord,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf, ManifestError> {
        let target = self.sidecar_path(record, output_dir);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, record.prompt_en.as_bytes())?;
        Ok(target)
    }

    /// Export every approved caption as a `.txt` file. Returns how many were written.
    pub fn export_txt(&self, output_dir: Option<&Path>) -> Result<usize, ManifestError> {
        let mut exported = 0;
        for record in self
            .records
            .iter()
            .filter(|r| r.status == ImageStatus::Approved && r.has_caption())
        {
            let target = self.write_sidecar(record, output_dir)?;
            tracing::debug!(filepath = %record.filepath, target = %target.display(), "Exported caption");
            exported += 1;
        }
        tracing::info!(exported, "Exported approved captions");
        Ok(exported)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            total: self.records.len(),
            ..StatusCounts::default()
        };
        for record in &self.records {
            match record.status {
                ImageStatus::Pending => counts.pending += 1,
                ImageStatus::Approved => counts.approved += 1,
                ImageStatus::Rejected => counts.rejected += 1,
                ImageStatus::Retry(_) => counts.retrying += 1,
            }
            if record.has_caption() {
                counts.captioned += 1;
            }
        }
        counts
    }
}

/// `/`-separated path of `path` below `base`.
fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("No manifest record for {0}")]
    NotFound(String),

    #[error("Cannot approve {0}: it has no caption yet")]
    NoCaption(String),
}
