//! Content store: staging writes, probing, and relocation into the category tree.
//!
//! Layout under the data dir:
//!
//! ```text
//! temp/<id>.<ext>                      staged single image (+ <id>_thumb.jpg)
//! temp/<id>/<slot>.<ext>               staged multi-view set (+ model.<ext>)
//! categories/<category>/<id>.<ext>     archived single image (+ <id>_thumb.jpg)
//! categories/<category>/<id>/          archived multi-view set
//! ```
//!
//! Nothing in this module knows about jobs or classification.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use image::ImageReader;
use tracing::{debug, error, info, warn};

use super::thumbnail::{self, is_thumbnail, thumbnail_path_for};
use super::{StagedAsset, StagedModel, UploadJob, UploadMeta, VIEW_ORDER, validate_view_slots};
use crate::error::{IngestError, Result};

const STAGING_DIR: &str = "temp";
const CATEGORIES_DIR: &str = "categories";
const MODEL_STEM: &str = "model";

/// Raw bytes of one uploaded file plus the name the uploader gave it.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagedMultiView {
    pub asset_id: String,
    pub dir: PathBuf,
    pub views: BTreeMap<String, PathBuf>,
    pub model: Option<StagedModel>,
}

impl StagedMultiView {
    pub fn into_job(self, meta: UploadMeta) -> UploadJob {
        UploadJob {
            asset_id: self.asset_id,
            staged: StagedAsset::MultiView {
                dir: self.dir,
                views: self.views,
                model: self.model,
            },
            meta,
        }
    }
}

/// Final locations of a relocated multi-view set, relative to the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedMultiView {
    pub folder_path: String,
    pub views: BTreeMap<String, String>,
    pub model_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    data_dir: PathBuf,
    staging_dir: PathBuf,
    categories_dir: PathBuf,
    max_upload_bytes: u64,
}

impl ContentStore {
    pub fn new(data_dir: impl Into<PathBuf>, max_upload_bytes: u64) -> Self {
        let data_dir = data_dir.into();
        Self {
            staging_dir: data_dir.join(STAGING_DIR),
            categories_dir: data_dir.join(CATEGORIES_DIR),
            data_dir,
            max_upload_bytes,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Create the staging and category roots. Safe to call on every start.
    pub fn initialize(&self) -> Result<()> {
        for dir in [&self.staging_dir, &self.categories_dir] {
            fs::create_dir_all(dir).map_err(|err| IngestError::storage("create directory", dir, err))?;
        }
        Ok(())
    }

    /// Absolute path of a data-dir relative path as stored in records.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.data_dir.join(relative)
    }

    /// Write one uploaded image into staging under a fresh asset id.
    pub fn stage_single(&self, file: &UploadFile) -> Result<(String, PathBuf)> {
        self.check_payload("image", file)?;

        let asset_id = uuid::Uuid::new_v4().to_string();
        let staged = self
            .staging_dir
            .join(with_extension(&asset_id, &file.filename));
        write_new(&staged, &file.bytes)?;

        debug!(asset_id = %asset_id, path = %staged.display(), "staged single image");
        Ok((asset_id, staged))
    }

    /// Write every view (and the optional raw model) into `temp/<id>/`.
    ///
    /// Slot names are validated before anything touches the disk.
    pub fn stage_multi_view(
        &self,
        views: &BTreeMap<String, UploadFile>,
        model: Option<&UploadFile>,
    ) -> Result<StagedMultiView> {
        validate_view_slots(views.keys().map(String::as_str))?;
        for (slot, file) in views {
            self.check_payload(slot, file)?;
        }
        if let Some(model) = model {
            self.check_payload(MODEL_STEM, model)?;
        }

        let asset_id = uuid::Uuid::new_v4().to_string();
        let dir = self.staging_dir.join(&asset_id);
        fs::create_dir_all(&dir).map_err(|err| IngestError::storage("create directory", &dir, err))?;

        let mut staged_views = BTreeMap::new();
        for (slot, file) in views {
            let path = dir.join(with_extension(slot, &file.filename));
            write_new(&path, &file.bytes)?;
            staged_views.insert(slot.clone(), path);
        }

        let staged_model = match model {
            Some(file) => {
                let path = dir.join(with_extension(MODEL_STEM, &file.filename));
                write_new(&path, &file.bytes)?;
                Some(StagedModel {
                    path,
                    filename: file.filename.clone(),
                })
            }
            None => None,
        };

        debug!(asset_id = %asset_id, views = staged_views.len(), "staged multi-view set");
        Ok(StagedMultiView {
            asset_id,
            dir,
            views: staged_views,
            model: staged_model,
        })
    }

    pub fn thumbnail(&self, path: &Path) -> Result<PathBuf> {
        thumbnail::generate_thumbnail(path)
    }

    /// One thumbnail per slot, written next to each slot file.
    pub fn thumbnails(&self, views: &BTreeMap<String, PathBuf>) -> Result<BTreeMap<String, PathBuf>> {
        views
            .iter()
            .map(|(slot, path)| Ok((slot.clone(), self.thumbnail(path)?)))
            .collect()
    }

    /// Pixel dimensions from the image header. Never mutates the file.
    pub fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        ImageReader::open(path)
            .map_err(|err| IngestError::storage("open image", path, err))?
            .with_guessed_format()
            .map_err(|err| IngestError::storage("read image", path, err))?
            .into_dimensions()
            .map_err(|err| IngestError::unreadable(path, err))
    }

    pub fn file_size(&self, path: &Path) -> Result<u64> {
        fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|err| IngestError::storage("stat", path, err))
    }

    /// Move a staged image and its thumbnail into `categories/<category>/`.
    ///
    /// Both moves succeed or neither does: if the thumbnail cannot be moved the
    /// primary file is moved back before the error is returned. Returns the
    /// final image and thumbnail paths relative to the data dir.
    pub fn relocate_single(
        &self,
        asset_id: &str,
        staged_path: &Path,
        category: &str,
    ) -> Result<(String, String)> {
        let category_dir = self.ensure_category_dir(category)?;

        let final_path = category_dir.join(with_extension(
            asset_id,
            &staged_path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        ));
        let staged_thumb = thumbnail_path_for(staged_path);
        let final_thumb = category_dir.join(format!("{asset_id}_thumb.jpg"));

        for target in [&final_path, &final_thumb] {
            if target.exists() {
                return Err(IngestError::storage(
                    "relocate onto existing",
                    target,
                    std::io::ErrorKind::AlreadyExists.into(),
                ));
            }
        }

        fs::rename(staged_path, &final_path)
            .map_err(|err| IngestError::storage("move image", staged_path, err))?;

        if let Err(err) = fs::rename(&staged_thumb, &final_thumb) {
            warn!(asset_id, error = %err, "thumbnail move failed, rolling back image move");
            if let Err(rollback) = fs::rename(&final_path, staged_path) {
                error!(
                    asset_id,
                    error = %rollback,
                    path = %final_path.display(),
                    "failed to roll back image move"
                );
            }
            return Err(IngestError::storage("move thumbnail", &staged_thumb, err));
        }

        info!(asset_id, category, "relocated single image");
        Ok((self.relative(&final_path)?, self.relative(&final_thumb)?))
    }

    /// Move the whole staged directory into `categories/<category>/<id>/` with
    /// one rename, then resolve the slot files from the moved directory.
    pub fn relocate_multi_view(
        &self,
        asset_id: &str,
        staged_dir: &Path,
        category: &str,
    ) -> Result<RelocatedMultiView> {
        let category_dir = self.ensure_category_dir(category)?;
        let final_dir = category_dir.join(asset_id);
        if final_dir.exists() {
            return Err(IngestError::storage(
                "relocate onto existing",
                &final_dir,
                std::io::ErrorKind::AlreadyExists.into(),
            ));
        }

        fs::rename(staged_dir, &final_dir)
            .map_err(|err| IngestError::storage("move directory", staged_dir, err))?;

        let entries =
            fs::read_dir(&final_dir).map_err(|err| IngestError::storage("read directory", &final_dir, err))?;

        let mut views = BTreeMap::new();
        let mut model_path = None;
        for entry in entries {
            let entry = entry.map_err(|err| IngestError::storage("read directory", &final_dir, err))?;
            let path = entry.path();
            if !path.is_file() || is_thumbnail(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if stem == MODEL_STEM {
                model_path = Some(self.relative(&path)?);
            } else if VIEW_ORDER.contains(&stem) {
                views.insert(stem.to_string(), self.relative(&path)?);
            }
        }

        info!(asset_id, category, views = views.len(), "relocated multi-view set");
        Ok(RelocatedMultiView {
            folder_path: self.relative(&final_dir)?,
            views,
            model_path,
        })
    }

    /// Create-if-absent; an existing directory is not an error.
    fn ensure_category_dir(&self, category: &str) -> Result<PathBuf> {
        let mut components = Path::new(category).components();
        let flat = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !flat {
            return Err(IngestError::Validation(format!(
                "category must be a single path component: {category:?}"
            )));
        }

        let dir = self.categories_dir.join(category);
        fs::create_dir_all(&dir).map_err(|err| IngestError::storage("create directory", &dir, err))?;
        Ok(dir)
    }

    fn check_payload(&self, slot: &str, file: &UploadFile) -> Result<()> {
        if file.bytes.is_empty() {
            return Err(IngestError::Validation(format!("{slot} upload is empty")));
        }
        if file.bytes.len() as u64 > self.max_upload_bytes {
            return Err(IngestError::Validation(format!(
                "{slot} upload exceeds {} bytes",
                self.max_upload_bytes
            )));
        }
        Ok(())
    }

    /// Data-dir relative path with `/` separators.
    fn relative(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.data_dir).map_err(|_| {
            IngestError::storage(
                "relativize",
                path,
                std::io::Error::other("path is outside the data directory"),
            )
        })?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

/// `<stem>.<ext>` using the lower-cased extension of `filename`; the extension is
/// dropped unless it is plain alphanumeric.
fn with_extension(stem: &str, filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| IngestError::storage("create file", path, err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| IngestError::storage("write file", path, err))
}
