#![deny(clippy::all)]

pub mod error;
pub mod ingest;
pub mod logging;
pub mod settings;

pub use error::{IngestError, Result};
pub use ingest::gateway::{ClassificationGateway, ProviderRequest, ScoredMatch, VisionProvider};
pub use ingest::ledger::{IndexLedger, IndexSummary};
pub use ingest::scheduler::{Pipeline, Scheduler};
pub use ingest::search::{SearchHit, SearchResponse, SearchService};
pub use ingest::store::{ContentStore, UploadFile};
pub use ingest::{
    AnalysisResult, AssetKind, AssetRecord, AssetStatus, StagedAsset, StoredLayout, UploadJob,
    UploadMeta,
};
pub use settings::IngestConfig;
