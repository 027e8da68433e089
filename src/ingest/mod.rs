pub mod category;
pub mod gateway;
pub mod ledger;
pub mod scheduler;
pub mod search;
pub mod store;
pub mod thumbnail;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Slot name of the only file of a single-image asset.
pub const PRIMARY_SLOT: &str = "primary";

/// Views every multi-view set must carry.
pub const REQUIRED_VIEWS: [&str; 4] = ["front", "back", "left", "right"];

/// Optional views; a set carries both or neither.
pub const EXTRA_VIEWS: [&str; 2] = ["top", "bottom"];

/// Canonical view order used for provider calls and ledger entries.
pub const VIEW_ORDER: [&str; 6] = ["front", "back", "left", "right", "top", "bottom"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    SingleImage,
    MultiViewSet,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::SingleImage => "single-image",
            AssetKind::MultiViewSet => "multi-view-set",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "single-image" => Ok(AssetKind::SingleImage),
            "multi-view-set" => Ok(AssetKind::MultiViewSet),
            other => Err(IngestError::Validation(format!("unknown asset kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Processing,
    Completed,
    Failed,
}

impl AssetStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AssetStatus::Processing)
    }
}

/// Raw 3D model file staged alongside a multi-view set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedModel {
    pub path: PathBuf,
    /// File name as supplied by the uploader.
    pub filename: String,
}

/// Files of one asset as they sit in the staging area.
#[derive(Debug, Clone)]
pub enum StagedAsset {
    Single {
        path: PathBuf,
    },
    MultiView {
        dir: PathBuf,
        views: BTreeMap<String, PathBuf>,
        model: Option<StagedModel>,
    },
}

/// Caller-supplied descriptive fields of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    pub title: String,
    pub artist: String,
    pub tags: Vec<String>,
}

impl UploadMeta {
    /// Trims every field and drops empty tags.
    pub fn new(title: &str, artist: &str, tags: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            title: title.trim().to_string(),
            artist: artist.trim().to_string(),
            tags: tags
                .into_iter()
                .map(|tag| tag.as_ref().trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.title.is_empty() || self.artist.is_empty() {
            return Err(IngestError::Validation("title and artist are required".into()));
        }
        for (field, value) in [("title", &self.title), ("artist", &self.artist)] {
            if value.contains(['\n', '\r']) {
                return Err(IngestError::Validation(format!("{field} must be a single line")));
            }
            if value.trim() != value.as_str() {
                return Err(IngestError::Validation(format!(
                    "{field} has surrounding whitespace: {value:?}"
                )));
            }
        }
        for tag in &self.tags {
            if tag.is_empty() || tag.trim() != tag.as_str() || tag.contains([',', '\n', '\r']) {
                return Err(IngestError::Validation(format!("invalid tag: {tag:?}")));
            }
        }
        Ok(())
    }
}

/// A unit of work handed from the caller to the scheduler.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub asset_id: String,
    pub staged: StagedAsset,
    pub meta: UploadMeta,
}

impl UploadJob {
    pub fn single(asset_id: impl Into<String>, path: impl Into<PathBuf>, meta: UploadMeta) -> Self {
        Self {
            asset_id: asset_id.into(),
            staged: StagedAsset::Single { path: path.into() },
            meta,
        }
    }

    pub fn kind(&self) -> AssetKind {
        match self.staged {
            StagedAsset::Single { .. } => AssetKind::SingleImage,
            StagedAsset::MultiView { .. } => AssetKind::MultiViewSet,
        }
    }

    /// Staged image files keyed by slot name (`primary` for single images).
    pub fn slot_paths(&self) -> BTreeMap<String, PathBuf> {
        match &self.staged {
            StagedAsset::Single { path } => {
                BTreeMap::from([(PRIMARY_SLOT.to_string(), path.clone())])
            }
            StagedAsset::MultiView { views, .. } => views.clone(),
        }
    }

    /// Checks everything that must hold before the job may be queued.
    pub fn validate(&self) -> Result<()> {
        if self.asset_id.trim().is_empty() {
            return Err(IngestError::Validation("asset id is required".into()));
        }
        self.meta.validate()?;

        if let StagedAsset::MultiView { views, model, .. } = &self.staged {
            validate_view_slots(views.keys().map(String::as_str))?;
            if let Some(model) = model {
                ensure_staged(&model.path)?;
            }
        }
        for path in self.slot_paths().values() {
            ensure_staged(path)?;
        }
        Ok(())
    }
}

fn ensure_staged(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(IngestError::Validation(format!(
            "staged file is missing: {}",
            path.display()
        )))
    }
}

/// A multi-view set has exactly the four side views, optionally plus top and bottom.
pub fn validate_view_slots<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let names: BTreeSet<&str> = names.into_iter().collect();

    if let Some(unknown) = names.iter().find(|name| !VIEW_ORDER.contains(*name)) {
        return Err(IngestError::Validation(format!("unknown view: {unknown}")));
    }
    if let Some(missing) = REQUIRED_VIEWS.iter().find(|view| !names.contains(*view)) {
        return Err(IngestError::Validation(format!("missing view: {missing}")));
    }
    let extras = EXTRA_VIEWS.iter().filter(|view| names.contains(*view)).count();
    if extras != 0 && extras != EXTRA_VIEWS.len() {
        return Err(IngestError::Validation(
            "multi-view sets need either 4 or 6 views".into(),
        ));
    }
    Ok(())
}

/// Entries of a slot map in canonical view order.
pub fn in_view_order<V>(views: &BTreeMap<String, V>) -> Vec<(&str, &V)> {
    VIEW_ORDER
        .iter()
        .filter_map(|view| views.get_key_value(*view))
        .map(|(name, value)| (name.as_str(), value))
        .collect()
}

/// A detected feature with the provider's confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub confidence: f64,
}

/// Structured classification output for one asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Flat category as returned by the provider, before normalization.
    pub primary_category: String,
    pub description: String,
    pub objects: Vec<String>,
    pub colors: Vec<String>,
    // single images
    pub scene_type: Option<String>,
    pub mood: Option<String>,
    pub style: Option<String>,
    // multi-view sets
    pub lighting: Option<String>,
    pub symmetry: Option<String>,
    pub complexity: Option<String>,
    pub material_characteristics: Option<String>,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleImageLayout {
    pub file_path: String,
    pub thumbnail_path: String,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiViewLayout {
    pub folder_path: String,
    pub views: BTreeMap<String, String>,
    pub model_path: Option<String>,
    pub model_filename: Option<String>,
    pub total_file_size: u64,
}

/// Where the archived files of a processed asset live, relative to the data dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoredLayout {
    Single(SingleImageLayout),
    MultiView(MultiViewLayout),
}

/// The tracked state of one asset, and its durable record once completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub kind: AssetKind,
    pub status: AssetStatus,
    pub title: String,
    pub artist: String,
    pub created_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub layout: Option<StoredLayout>,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
}

impl AssetRecord {
    pub fn processing(job: &UploadJob) -> Self {
        Self {
            id: job.asset_id.clone(),
            kind: job.kind(),
            status: AssetStatus::Processing,
            title: job.meta.title.clone(),
            artist: job.meta.artist.clone(),
            created_at: Local::now(),
            completed_at: None,
            category: None,
            tags: job.meta.tags.clone(),
            layout: None,
            analysis: None,
            error: None,
        }
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = AssetStatus::Completed;
        self.completed_at = Some(Local::now());
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = AssetStatus::Failed;
        self.completed_at = Some(Local::now());
        self.error = Some(error);
    }
}
