//! Append-only markdown ledger of processed assets.
//!
//! Every completed asset becomes one entry headed `## Asset: <id>` with flat
//! `**Label:** value` lines, terminated by a horizontal rule. The ledger is the
//! search corpus; [`IndexLedger::parse_all`] is the only supported reader.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{AnalysisResult, AssetKind, AssetRecord, StoredLayout, in_view_order};
use crate::error::{IngestError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TITLE: &str = "# Visual Asset Index";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

static ENTRY_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^## Asset: (.+?)[ \t]*\r?$").unwrap());
static FIELD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:- )?\*\*([^*]+):\*\*[ \t]*(.*?)[ \t]*\r?$").unwrap());
static VIEW_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^- (\w+): (.+?)[ \t]*\r?$").unwrap());

/// What a reader gets back from an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub uploaded_at: String,
    pub kind: Option<AssetKind>,
    pub category: String,
    pub file_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub folder_path: Option<String>,
    pub model_file_path: Option<String>,
    pub model_filename: Option<String>,
    pub views: BTreeMap<String, String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IndexLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl IndexLedger {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the ledger with its header if it does not exist yet.
    ///
    /// An existing ledger is never touched. The header is written to a temp
    /// file and moved into place without clobbering, so a concurrent
    /// initializer or writer cannot lose content.
    pub fn initialize(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|err| IngestError::storage("create directory", &dir, err))?;

        let mut tmp =
            NamedTempFile::new_in(&dir).map_err(|err| IngestError::storage("create temp file", &dir, err))?;
        let header = format!(
            "{TITLE}\nLast Updated: {}\n\n---\n",
            Local::now().format(TIMESTAMP_FORMAT)
        );
        tmp.write_all(header.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| IngestError::storage("write ledger header", tmp.path(), err))?;

        match tmp.persist_noclobber(&self.path) {
            Ok(_) => {
                info!(path = %self.path.display(), "created ledger");
                Ok(())
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(IngestError::storage("create ledger", &self.path, err.error)),
        }
    }

    /// Append one entry while holding the exclusive ledger lock.
    pub fn append(&self, record: &AssetRecord) -> Result<()> {
        let entry = render_entry(record);
        let _lock = self.acquire_lock()?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| IngestError::storage("open ledger", &self.path, err))?;
        file.write_all(entry.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|err| IngestError::storage("append to ledger", &self.path, err))?;

        debug!(asset_id = %record.id, "appended ledger entry");
        Ok(())
    }

    pub fn read_all(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|err| IngestError::storage("read ledger", &self.path, err))
    }

    pub fn parse_all(&self) -> Result<Vec<IndexSummary>> {
        Ok(parse_entries(&self.read_all()?))
    }

    pub fn find(&self, asset_id: &str) -> Result<Option<IndexSummary>> {
        Ok(self.parse_all()?.into_iter().find(|entry| entry.id == asset_id))
    }

    fn acquire_lock(&self) -> Result<LedgerLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|err| IngestError::storage("open ledger lock", &self.lock_path, err))?;

        let started = Instant::now();
        let mut contended = false;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(LedgerLock { file }),
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        warn!(path = %self.lock_path.display(), ?waited, "ledger lock timed out");
                        return Err(IngestError::LockTimeout {
                            path: self.lock_path.clone(),
                            waited,
                        });
                    }
                    if !contended {
                        debug!(path = %self.lock_path.display(), "waiting for ledger lock");
                        contended = true;
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(IngestError::storage("lock ledger", &self.lock_path, err)),
            }
        }
    }
}

/// Released on drop; closing the handle would release it too.
struct LedgerLock {
    file: File,
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Serialize a record into its ledger entry.
pub fn render_entry(record: &AssetRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("\n## Asset: {}\n\n", record.id));
    field(&mut out, "Title", &record.title);
    field(&mut out, "Artist", &record.artist);
    field(
        &mut out,
        "Uploaded",
        &record.created_at.format(TIMESTAMP_FORMAT).to_string(),
    );
    field(&mut out, "Kind", record.kind.as_str());
    field(&mut out, "Category", record.category.as_deref().unwrap_or_default());

    match &record.layout {
        Some(StoredLayout::Single(single)) => {
            field(&mut out, "File Path", &single.file_path);
            field(&mut out, "Thumbnail", &single.thumbnail_path);
            field(&mut out, "Dimensions", &format!("{}x{}", single.width, single.height));
            field(&mut out, "File Size", &format!("{:.1} MB", megabytes(single.file_size)));
        }
        Some(StoredLayout::MultiView(multi)) => {
            field(&mut out, "Folder Path", &multi.folder_path);
            if let Some(model) = &multi.model_path {
                field(&mut out, "Model File", model);
                field(&mut out, "Model Filename", multi.model_filename.as_deref().unwrap_or_default());
            }
            out.push_str("**Views:**\n");
            for (view, path) in in_view_order(&multi.views) {
                out.push_str(&format!("- {view}: {}\n", one_line(path)));
            }
            field(
                &mut out,
                "Total File Size",
                &format!(
                    "{:.1} MB ({} views)",
                    megabytes(multi.total_file_size),
                    multi.views.len()
                ),
            );
        }
        None => {}
    }

    if !record.tags.is_empty() {
        out.push('\n');
        field(&mut out, "Manual Tags", &record.tags.join(", "));
    }

    if let Some(analysis) = &record.analysis {
        render_analysis(&mut out, analysis);
    }

    out.push_str("\n---\n");
    out
}

fn render_analysis(out: &mut String, analysis: &AnalysisResult) {
    out.push_str("\n**AI Analysis:**\n");
    item(out, "Description", &analysis.description);
    item(out, "Primary Category", &analysis.primary_category);
    if !analysis.objects.is_empty() {
        item(out, "Objects", &analysis.objects.join(", "));
    }
    if !analysis.colors.is_empty() {
        item(out, "Colors", &analysis.colors.join(", "));
    }

    let descriptors = [
        ("Scene Type", &analysis.scene_type),
        ("Mood", &analysis.mood),
        ("Style", &analysis.style),
        ("Lighting", &analysis.lighting),
        ("Symmetry", &analysis.symmetry),
        ("Complexity", &analysis.complexity),
        ("Material Characteristics", &analysis.material_characteristics),
    ];
    for (label, value) in descriptors {
        if let Some(value) = value {
            item(out, label, value);
        }
    }

    if !analysis.features.is_empty() {
        let features: Vec<String> = analysis
            .features
            .iter()
            .map(|f| format!("{} ({:.2})", f.name, f.confidence))
            .collect();
        item(out, "Features", &features.join(", "));
    }
}

fn field(out: &mut String, label: &str, value: &str) {
    out.push_str(&format!("**{label}:** {}\n", one_line(value)));
}

fn item(out: &mut String, label: &str, value: &str) {
    out.push_str(&format!("- **{label}:** {}\n", one_line(value)));
}

/// One field is always one line.
fn one_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Re-derive entry summaries from raw ledger text.
pub fn parse_entries(content: &str) -> Vec<IndexSummary> {
    let headings: Vec<(usize, String)> = ENTRY_HEADING
        .captures_iter(content)
        .filter_map(|caps| {
            let start = caps.get(0)?.start();
            Some((start, caps[1].to_string()))
        })
        .collect();

    headings
        .iter()
        .enumerate()
        .map(|(i, (start, id))| {
            let end = headings.get(i + 1).map_or(content.len(), |(next, _)| *next);
            parse_section(id, &content[*start..end])
        })
        .collect()
}

fn parse_section(id: &str, section: &str) -> IndexSummary {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut views = BTreeMap::new();
    let mut in_views = false;

    for line in section.lines() {
        if in_views {
            if let Some(caps) = VIEW_LINE.captures(line) {
                views.insert(caps[1].to_string(), slash_path(&caps[2]));
                continue;
            }
            in_views = false;
        }
        if let Some(caps) = FIELD_LINE.captures(line) {
            let label = caps[1].trim().to_string();
            if label == "Views" {
                in_views = true;
            }
            fields.entry(label).or_insert_with(|| caps[2].to_string());
        }
    }

    let take = |label: &str| fields.get(label).filter(|v| !v.is_empty()).cloned();

    IndexSummary {
        id: id.to_string(),
        title: take("Title").unwrap_or_default(),
        artist: take("Artist").unwrap_or_default(),
        uploaded_at: take("Uploaded").unwrap_or_default(),
        kind: take("Kind").and_then(|kind| kind.parse().ok()),
        category: take("Category").unwrap_or_default(),
        file_path: take("File Path").map(|p| slash_path(&p)),
        thumbnail_path: take("Thumbnail").map(|p| slash_path(&p)),
        folder_path: take("Folder Path").map(|p| slash_path(&p)),
        model_file_path: take("Model File").map(|p| slash_path(&p)),
        model_filename: take("Model Filename"),
        views,
        description: take("Description"),
        tags: take("Manual Tags")
            .map(|tags| tags.split(", ").map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

fn slash_path(path: &str) -> String {
    path.trim().replace('\\', "/")
}
