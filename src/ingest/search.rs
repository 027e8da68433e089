use serde::Serialize;
use tracing::debug;

use super::gateway::{ClassificationGateway, ScoredMatch};
use super::ledger::{IndexLedger, IndexSummary, parse_entries};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub matched: ScoredMatch,
    /// Absent when the provider names an id the ledger does not hold.
    pub summary: Option<IndexSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub total: usize,
    pub results: Vec<SearchHit>,
}

/// Natural-language search over the ledger, ranked by the provider.
#[derive(Clone)]
pub struct SearchService {
    ledger: IndexLedger,
    gateway: ClassificationGateway,
    default_limit: usize,
}

impl SearchService {
    pub fn new(ledger: IndexLedger, gateway: ClassificationGateway, default_limit: usize) -> Self {
        Self {
            ledger,
            gateway,
            default_limit,
        }
    }

    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IngestError::Validation("search query is required".into()));
        }
        let limit = limit.unwrap_or(self.default_limit);

        let corpus = self.ledger.read_all()?;
        let entries = parse_entries(&corpus);
        if entries.is_empty() {
            return Ok(SearchResponse {
                query: query.to_string(),
                total: 0,
                results: Vec::new(),
            });
        }

        let mut matches = self.gateway.rank(&corpus, query)?;
        matches.truncate(limit);
        debug!(query, entries = entries.len(), hits = matches.len(), "search ranked");

        let results: Vec<SearchHit> = matches
            .into_iter()
            .map(|matched| SearchHit {
                summary: entries.iter().find(|e| e.id == matched.asset_id).cloned(),
                matched,
            })
            .collect();

        Ok(SearchResponse {
            query: query.to_string(),
            total: results.len(),
            results,
        })
    }
}
