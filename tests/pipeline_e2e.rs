use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::{DynamicImage, ImageFormat};
use tempfile::TempDir;

use visualimg_ingest::ingest::StagedAsset;
use visualimg_ingest::logging::{LogConfig, init_logging};
use visualimg_ingest::{
    AssetKind, AssetRecord, AssetStatus, ClassificationGateway, IngestConfig, IngestError,
    Pipeline, ProviderRequest, Scheduler, SearchService, StoredLayout, UploadFile, UploadJob,
    UploadMeta, VisionProvider,
};

/// Answers classification calls with `analysis` and search calls with `ranking`,
/// remembering how many images each request carried.
struct Scripted {
    analysis: String,
    ranking: String,
    image_counts: Mutex<Vec<usize>>,
}

impl Scripted {
    fn new(analysis: &str, ranking: &str) -> Arc<Self> {
        Arc::new(Self {
            analysis: analysis.to_string(),
            ranking: ranking.to_string(),
            image_counts: Mutex::new(Vec::new()),
        })
    }
}

impl VisionProvider for Scripted {
    fn generate(&self, request: &ProviderRequest) -> anyhow::Result<String> {
        self.image_counts.lock().unwrap().push(request.images.len());
        if request.images.is_empty() {
            Ok(self.ranking.clone())
        } else {
            Ok(self.analysis.clone())
        }
    }
}

struct Harness {
    scheduler: Scheduler,
    pipeline: Arc<Pipeline>,
    _dir: TempDir,
}

impl Harness {
    fn new(provider: Arc<Scripted>) -> Self {
        let _ = init_logging(&LogConfig {
            verbose: true,
            ansi: false,
        });

        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            data_dir: dir.path().to_path_buf(),
            workers: 2,
            queue_capacity: 16,
            ..Default::default()
        };
        let pipeline =
            Arc::new(Pipeline::from_config(&config, ClassificationGateway::new(provider)).unwrap());
        let scheduler = Scheduler::from_config(&config, Arc::clone(&pipeline)).unwrap();
        Self {
            scheduler,
            pipeline,
            _dir: dir,
        }
    }

    fn wait(&self, asset_id: &str) -> AssetRecord {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let record = self.scheduler.status(asset_id).unwrap();
            if record.status.is_terminal() {
                return record;
            }
            assert!(Instant::now() < deadline, "asset {asset_id} still processing");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .unwrap();
    buf
}

const LANDSCAPE: &str = r#"```json
{
  "primary_category": "Landscapes",
  "description": "A quiet beach at sunset.",
  "objects": ["sea", "sand"],
  "colors": ["orange", "blue"],
  "scene_type": "outdoor",
  "mood": "calm",
  "features": ["sunset (0.95)", {"name": "waves", "confidence": 0.7}, "horizon"]
}
```"#;

const SCULPTURE: &str = r#"{
  "primary_category": "Sculpture",
  "description": "A marble bust.",
  "objects": ["bust"],
  "colors": ["white"],
  "lighting": "studio",
  "symmetry": "symmetrical",
  "three_d_characteristics": "high-poly, smooth",
  "features": ["marble"]
}"#;

#[test]
fn test_single_image_is_archived_and_indexed() {
    let harness = Harness::new(Scripted::new(LANDSCAPE, "[]"));
    let store = harness.pipeline.store();

    let (asset_id, staged) = store
        .stage_single(&UploadFile::new("holiday.JPG", jpeg(800, 600)))
        .unwrap();
    let job = UploadJob::single(&asset_id, &staged, UploadMeta::new("Sunset", "Ana", ["beach", "sunset"]));
    harness.scheduler.submit(job).unwrap();

    let record = harness.wait(&asset_id);
    assert_eq!(record.status, AssetStatus::Completed, "{:?}", record.error);
    assert_eq!(record.category.as_deref(), Some("landscapes"));
    assert!(record.completed_at.is_some());

    let expected = format!("categories/landscapes/{asset_id}.jpg");
    assert!(store.resolve(&expected).is_file());
    assert!(store.resolve(&format!("categories/landscapes/{asset_id}_thumb.jpg")).is_file());
    assert!(!staged.exists());

    let ledger = harness.pipeline.ledger().read_all().unwrap();
    assert!(ledger.contains(&format!("## Asset: {asset_id}")));
    assert!(ledger.contains("**Category:** landscapes"));
    assert!(ledger.contains("**Manual Tags:** beach, sunset"));
    assert!(ledger.contains("**Dimensions:** 800x600"));
    assert!(ledger.contains("- **Features:** sunset (0.95), waves (0.70), horizon (1.00)"));

    let summary = harness.pipeline.ledger().find(&asset_id).unwrap().unwrap();
    assert_eq!(summary.file_path.as_deref(), Some(expected.as_str()));
    assert_eq!(summary.kind, Some(AssetKind::SingleImage));
}

#[test]
fn test_multi_view_set_is_classified_in_one_call_and_moved_whole() {
    let provider = Scripted::new(SCULPTURE, "[]");
    let harness = Harness::new(Arc::clone(&provider));
    let store = harness.pipeline.store();

    let views: BTreeMap<String, UploadFile> = ["front", "back", "left", "right", "top", "bottom"]
        .into_iter()
        .map(|slot| (slot.to_string(), UploadFile::new(format!("{slot}.jpg"), jpeg(64, 64))))
        .collect();
    let model = UploadFile::new("Bust.GLB", b"glTF binary".to_vec());
    let staged = store.stage_multi_view(&views, Some(&model)).unwrap();
    let staged_dir = staged.dir.clone();
    let asset_id = staged.asset_id.clone();

    harness
        .scheduler
        .submit(staged.into_job(UploadMeta::new("Bust", "Cy", Vec::<String>::new())))
        .unwrap();

    let record = harness.wait(&asset_id);
    assert_eq!(record.status, AssetStatus::Completed, "{:?}", record.error);
    assert_eq!(*provider.image_counts.lock().unwrap(), vec![6]);
    assert!(!staged_dir.exists());

    let Some(StoredLayout::MultiView(layout)) = &record.layout else {
        panic!("expected a multi-view layout, got {:?}", record.layout);
    };
    assert_eq!(layout.folder_path, format!("categories/sculpture/{asset_id}"));
    assert_eq!(layout.views.len(), 6);
    assert_eq!(
        layout.model_path.as_deref(),
        Some(format!("categories/sculpture/{asset_id}/model.glb").as_str())
    );
    assert_eq!(layout.model_filename.as_deref(), Some("Bust.GLB"));
    assert!(store.resolve(&layout.views["top"]).is_file());
    assert_eq!(
        record.analysis.as_ref().unwrap().material_characteristics.as_deref(),
        Some("high-poly, smooth")
    );

    let summary = harness.pipeline.ledger().find(&asset_id).unwrap().unwrap();
    assert_eq!(summary.kind, Some(AssetKind::MultiViewSet));
    assert_eq!(summary.views, layout.views);
    assert!(summary.tags.is_empty());
}

#[test]
fn test_missing_view_is_rejected_before_queueing() {
    let harness = Harness::new(Scripted::new(SCULPTURE, "[]"));
    let store = harness.pipeline.store();

    let staged = store
        .stage_multi_view(
            &["front", "back", "left", "right"]
                .into_iter()
                .map(|slot| (slot.to_string(), UploadFile::new("v.jpg", jpeg(16, 16))))
                .collect(),
            None,
        )
        .unwrap();
    let mut job = staged.into_job(UploadMeta::new("Bust", "Cy", Vec::<String>::new()));
    if let StagedAsset::MultiView { views, .. } = &mut job.staged {
        views.remove("right");
    }
    let asset_id = job.asset_id.clone();

    let err = harness.scheduler.submit(job).unwrap_err();
    assert!(matches!(err, IngestError::Validation(_)), "{err}");
    assert!(err.to_string().contains("right"));
    assert!(matches!(harness.scheduler.status(&asset_id), Err(IngestError::NotFound(_))));
    assert!(harness.scheduler.statuses().is_empty());
}

#[test]
fn test_malformed_classification_fails_without_side_effects() {
    let harness = Harness::new(Scripted::new("I think this is a landscape.", "[]"));
    let store = harness.pipeline.store();

    let (asset_id, staged) = store.stage_single(&UploadFile::new("x.jpg", jpeg(40, 30))).unwrap();
    let original = fs::read(&staged).unwrap();
    harness
        .scheduler
        .submit(UploadJob::single(&asset_id, &staged, UploadMeta::new("X", "Y", ["z"])))
        .unwrap();

    let record = harness.wait(&asset_id);
    assert_eq!(record.status, AssetStatus::Failed);
    assert!(record.error.unwrap().contains("provider error"));
    assert!(record.analysis.is_none());
    assert_eq!(fs::read(&staged).unwrap(), original);
    assert!(harness.pipeline.ledger().parse_all().unwrap().is_empty());
}

#[test]
fn test_many_concurrent_jobs_each_get_one_entry() {
    let harness = Harness::new(Scripted::new(LANDSCAPE, "[]"));
    let store = harness.pipeline.store();

    let ids: Vec<String> = (0..12)
        .map(|n| {
            let (asset_id, staged) = store
                .stage_single(&UploadFile::new(format!("{n}.jpg"), jpeg(32, 32)))
                .unwrap();
            harness
                .scheduler
                .submit(UploadJob::single(&asset_id, staged, UploadMeta::new("T", "A", [format!("tag{n}")])))
                .unwrap();
            asset_id
        })
        .collect();

    for id in &ids {
        assert_eq!(harness.wait(id).status, AssetStatus::Completed);
    }
    let entries = harness.pipeline.ledger().parse_all().unwrap();
    assert_eq!(entries.len(), ids.len());
    for id in &ids {
        assert_eq!(entries.iter().filter(|e| &e.id == id).count(), 1);
    }
}

#[test]
fn test_search_ranks_over_indexed_assets() {
    let ranking_for = |id: &str| {
        format!(r#"[{{"asset_id": "{id}", "relevance_score": 1.4, "reason": "sunset"}}, {{"image_id": "unknown", "relevance_score": 0.2}}]"#)
    };

    // ids are only known after ingestion, so ranking uses a second provider
    let harness = Harness::new(Scripted::new(LANDSCAPE, "[]"));
    let (asset_id, staged) = harness
        .pipeline
        .store()
        .stage_single(&UploadFile::new("s.jpg", jpeg(32, 32)))
        .unwrap();
    harness
        .scheduler
        .submit(UploadJob::single(&asset_id, staged, UploadMeta::new("Sunset", "Ana", ["beach"])))
        .unwrap();
    assert_eq!(harness.wait(&asset_id).status, AssetStatus::Completed);

    let ranking = Scripted::new(LANDSCAPE, &ranking_for(&asset_id));
    let search = SearchService::new(
        harness.pipeline.ledger().clone(),
        ClassificationGateway::new(ranking),
        10,
    );

    let response = search.search("orange evening by the sea", None).unwrap();
    assert_eq!(response.total, 2);
    assert_eq!(response.results[0].matched.asset_id, asset_id);
    assert_eq!(response.results[0].matched.relevance_score, 1.0);
    assert_eq!(response.results[0].summary.as_ref().unwrap().title, "Sunset");
    assert!(response.results[1].summary.is_none());

    let limited = search.search("sunset", Some(1)).unwrap();
    assert_eq!(limited.total, 1);

    assert!(matches!(search.search(" ", None), Err(IngestError::Validation(_))));
}
