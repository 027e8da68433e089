//! Adapter around the external vision/search provider.
//!
//! The provider is opaque: it receives a prompt plus images and answers with
//! text that should contain a single JSON document. This module builds the
//! requests, strips formatting wrappers off the answer and validates its shape.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AnalysisResult, AssetKind, Feature, in_view_order};
use crate::error::{IngestError, Result};

pub const CLASSIFY_TEMPERATURE: f32 = 0.4;
pub const SEARCH_TEMPERATURE: f32 = 0.2;

/// One inline image of a provider request.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub mime_type: &'static str,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub images: Vec<ImagePart>,
    pub temperature: f32,
}

/// The external model. Implementations perform one blocking round trip and
/// return the raw response text.
pub trait VisionProvider: Send + Sync {
    fn generate(&self, request: &ProviderRequest) -> anyhow::Result<String>;
}

/// A ranked search hit as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    #[serde(alias = "image_id")]
    pub asset_id: String,
    pub relevance_score: f64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone)]
pub struct ClassificationGateway {
    provider: Arc<dyn VisionProvider>,
}

impl ClassificationGateway {
    pub fn new(provider: Arc<dyn VisionProvider>) -> Self {
        Self { provider }
    }

    /// Classify an asset from its slot files. Multi-view sets go to the
    /// provider as one request carrying every view.
    pub fn classify(
        &self,
        kind: AssetKind,
        slots: &BTreeMap<String, PathBuf>,
    ) -> Result<AnalysisResult> {
        let (prompt, paths): (String, Vec<&PathBuf>) = match kind {
            AssetKind::SingleImage => {
                let path = slots.values().next().ok_or_else(|| {
                    IngestError::Validation("single image has no file".into())
                })?;
                (single_image_prompt(), vec![path])
            }
            AssetKind::MultiViewSet => {
                let ordered = in_view_order(slots);
                if ordered.is_empty() {
                    return Err(IngestError::Validation("no surface views provided".into()));
                }
                let names: Vec<&str> = ordered.iter().map(|(name, _)| *name).collect();
                (
                    multi_view_prompt(&names),
                    ordered.into_iter().map(|(_, path)| path).collect(),
                )
            }
        };

        let images = paths
            .into_iter()
            .map(|path| read_image_part(path))
            .collect::<Result<Vec<_>>>()?;

        debug!(kind = %kind, images = images.len(), "requesting classification");
        let text = self
            .provider
            .generate(&ProviderRequest {
                prompt,
                images,
                temperature: CLASSIFY_TEMPERATURE,
            })
            .map_err(IngestError::provider)?;

        parse_analysis(&text)
    }

    /// Rank ledger entries against a free-text query. An empty array means no
    /// matches. The provider is not trusted with limits; callers truncate.
    pub fn rank(&self, corpus: &str, query: &str) -> Result<Vec<ScoredMatch>> {
        let text = self
            .provider
            .generate(&ProviderRequest {
                prompt: search_prompt(corpus, query),
                images: Vec::new(),
                temperature: SEARCH_TEMPERATURE,
            })
            .map_err(IngestError::provider)?;

        parse_matches(&text)
    }
}

fn read_image_part(path: &Path) -> Result<ImagePart> {
    let data = fs::read(path).map_err(|err| IngestError::storage("read image", path, err))?;
    Ok(ImagePart {
        mime_type: mime_type_for(path),
        data,
    })
}

/// MIME type from the file extension; jpeg when unknown.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Remove a markdown code fence (with or without a language tag) around the payload.
pub fn strip_code_fences(text: &str) -> &str {
    static FENCED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\s*```$").unwrap());

    let trimmed = text.trim();
    match FENCED.captures(trimmed).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim(),
        None => trimmed,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFeature {
    Scored { name: String, confidence: f64 },
    Text(String),
}

#[derive(Deserialize)]
struct WireAnalysis {
    primary_category: String,
    description: String,
    #[serde(default)]
    objects: Vec<String>,
    #[serde(default)]
    colors: Vec<String>,
    scene_type: Option<String>,
    mood: Option<String>,
    style: Option<String>,
    lighting: Option<String>,
    symmetry: Option<String>,
    complexity: Option<String>,
    #[serde(alias = "three_d_characteristics")]
    material_characteristics: Option<String>,
    #[serde(default)]
    features: Vec<WireFeature>,
}

pub fn parse_analysis(text: &str) -> Result<AnalysisResult> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(IngestError::Provider("empty response".into()));
    }
    let wire: WireAnalysis = serde_json::from_str(body)
        .map_err(|err| IngestError::Provider(format!("malformed analysis JSON: {err}")))?;

    if wire.primary_category.trim().is_empty() {
        return Err(IngestError::Provider("analysis has an empty primary_category".into()));
    }

    Ok(AnalysisResult {
        primary_category: wire.primary_category.trim().to_string(),
        description: wire.description,
        objects: wire.objects,
        colors: wire.colors,
        scene_type: non_empty(wire.scene_type),
        mood: non_empty(wire.mood),
        style: non_empty(wire.style),
        lighting: non_empty(wire.lighting),
        symmetry: non_empty(wire.symmetry),
        complexity: non_empty(wire.complexity),
        material_characteristics: non_empty(wire.material_characteristics),
        features: wire
            .features
            .into_iter()
            .map(|feature| match feature {
                WireFeature::Scored { name, confidence } => Feature { name, confidence },
                WireFeature::Text(text) => parse_feature(&text),
            })
            .filter(|feature| !feature.name.is_empty())
            .collect(),
    })
}

/// `"tag (0.95)"` or `"tag"`; confidence defaults to 1.0.
pub fn parse_feature(text: &str) -> Feature {
    static SCORED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(.*?)\s*\(\s*([0-9]*\.?[0-9]+)\s*\)$").unwrap());

    let text = text.trim();
    if let Some(caps) = SCORED.captures(text) {
        if let Ok(confidence) = caps[2].parse::<f64>() {
            return Feature {
                name: caps[1].trim().to_string(),
                confidence,
            };
        }
    }
    Feature {
        name: text.to_string(),
        confidence: 1.0,
    }
}

pub fn parse_matches(text: &str) -> Result<Vec<ScoredMatch>> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(IngestError::Provider("empty response".into()));
    }
    let matches: Vec<ScoredMatch> = serde_json::from_str(body)
        .map_err(|err| IngestError::Provider(format!("malformed search JSON: {err}")))?;

    Ok(matches
        .into_iter()
        .filter(|m| !m.asset_id.trim().is_empty())
        .map(|mut m| {
            m.relevance_score = m.relevance_score.clamp(0.0, 1.0);
            m
        })
        .collect())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn single_image_prompt() -> String {
    r#"Analyze this image and classify it.

Respond with a single JSON object of this shape:
{
  "primary_category": "artwork|conceptual-art|surrealism|figurines|character-design|sculpture|performance-art|animals|landscapes|portraits|3d-renders|abstract|architecture|products|uncategorized",
  "description": "2-3 sentence description",
  "objects": ["object1", "object2"],
  "colors": ["color1", "color2"],
  "scene_type": "indoor|outdoor|studio",
  "mood": "calm|dark|energetic|mysterious|whimsical|...",
  "style": "photorealistic|cartoon|3D|painting|sketch|sculpture",
  "features": ["at least 10 descriptive tags"]
}

primary_category is ONE flat label. Never return sub-categories or paths.
Return ONLY the JSON object, no other text."#
        .to_string()
}

fn multi_view_prompt(views: &[&str]) -> String {
    let listing: String = views
        .iter()
        .enumerate()
        .map(|(i, view)| format!("{}. {view} view\n", i + 1))
        .collect();

    format!(
        r#"These {count} images show the same 3D object from different sides ({joined}).

Images, in order:
{listing}
Reason over all {count} views together to understand the whole object.

Respond with a single JSON object of this shape:
{{
  "primary_category": "sculpture|figurines|character-design|3d-renders|products|characters|environments|architecture|vehicles|artwork|uncategorized",
  "description": "2-3 sentence description of the object",
  "objects": ["primary objects identified"],
  "colors": ["dominant colors across all views"],
  "style": "photorealistic-3d|stylized|low-poly|high-poly|cartoon-3d|pbr|ceramic|sculpted",
  "mood": "futuristic|organic|mechanical|fantasy|realistic|whimsical|surreal|...",
  "lighting": "studio|natural|dramatic|neutral",
  "material_characteristics": "topology, modeling style, material type",
  "symmetry": "symmetrical|asymmetrical",
  "complexity": "simple|moderate|complex|highly-detailed",
  "features": ["at least 10 descriptive tags"]
}}

primary_category is ONE flat label. Never return sub-categories or paths.
Return ONLY the JSON object, no other text."#,
        count = views.len(),
        joined = views.join(", "),
    )
}

fn search_prompt(corpus: &str, query: &str) -> String {
    format!(
        r#"Below is an index of archived visual assets followed by a search query.

Index:
{corpus}

Query: "{query}"

Return a JSON array of the matching assets ranked by relevance:
[
  {{"asset_id": "<id from the '## Asset:' heading>", "relevance_score": 0.95, "reason": "why it matches"}}
]

Match on meaning, not only exact words: descriptions, detected objects,
colors, mood, style, features and manual tags all count.
Return [] when nothing matches. Return ONLY the JSON array, no other text."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recording {
        response: String,
        seen: Mutex<Vec<ProviderRequest>>,
    }

    impl VisionProvider for Recording {
        fn generate(&self, request: &ProviderRequest) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.response.clone())
        }
    }

    const ANALYSIS: &str = r#"{
        "primary_category": "Landscapes",
        "description": "A beach at dusk.",
        "objects": ["sea", "sand"],
        "colors": ["orange"],
        "scene_type": "outdoor",
        "mood": "calm",
        "style": "",
        "features": ["sunset (0.95)", "waves", {"name": "horizon", "confidence": 0.5}]
    }"#;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fences("```JSON {\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_analysis() {
        let fenced = format!("```json\n{ANALYSIS}\n```");
        let analysis = parse_analysis(&fenced).unwrap();

        assert_eq!(analysis.primary_category, "Landscapes");
        assert_eq!(analysis.objects, vec!["sea", "sand"]);
        assert_eq!(analysis.style, None);
        assert_eq!(
            analysis.features,
            vec![
                Feature { name: "sunset".into(), confidence: 0.95 },
                Feature { name: "waves".into(), confidence: 1.0 },
                Feature { name: "horizon".into(), confidence: 0.5 },
            ]
        );
    }

    #[test]
    fn test_parse_analysis_rejects_bad_payloads() {
        assert!(matches!(parse_analysis("I think it is a cat."), Err(IngestError::Provider(_))));
        assert!(matches!(parse_analysis(""), Err(IngestError::Provider(_))));
        assert!(matches!(
            parse_analysis(r#"{"description": "no category"}"#),
            Err(IngestError::Provider(_))
        ));
        assert!(matches!(
            parse_analysis(r#"{"primary_category": "  ", "description": "x"}"#),
            Err(IngestError::Provider(_))
        ));
    }

    #[test]
    fn test_parse_analysis_material_alias() {
        let analysis = parse_analysis(
            r#"{"primary_category": "sculpture", "description": "d", "three_d_characteristics": "clay"}"#,
        )
        .unwrap();
        assert_eq!(analysis.material_characteristics.as_deref(), Some("clay"));
    }

    #[test]
    fn test_parse_matches() {
        let matches = parse_matches(
            r#"```json
            [{"asset_id": "a", "relevance_score": 1.4, "reason": "cat"},
             {"image_id": "b", "relevance_score": 0.3},
             {"asset_id": "", "relevance_score": 0.9}]
            ```"#,
        )
        .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].relevance_score, 1.0);
        assert_eq!(matches[1].asset_id, "b");
        assert!(parse_matches("[]").unwrap().is_empty());
        assert!(parse_matches("{}").is_err());
    }

    #[test]
    fn test_classify_sends_all_views_in_one_request() {
        let dir = TempDir::new().unwrap();
        let mut slots = BTreeMap::new();
        for view in ["right", "front", "left", "back"] {
            let path = dir.path().join(format!("{view}.png"));
            fs::write(&path, view.as_bytes()).unwrap();
            slots.insert(view.to_string(), path);
        }

        let provider = Arc::new(Recording {
            response: ANALYSIS.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let gateway = ClassificationGateway::new(provider.clone());
        gateway.classify(AssetKind::MultiViewSet, &slots).unwrap();

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let order: Vec<&[u8]> = seen[0].images.iter().map(|i| i.data.as_slice()).collect();
        assert_eq!(order, vec![&b"front"[..], &b"back"[..], &b"left"[..], &b"right"[..]]);
        assert!(seen[0].images.iter().all(|i| i.mime_type == "image/png"));
        assert!(seen[0].prompt.contains("front, back, left, right"));
        assert_eq!(seen[0].temperature, CLASSIFY_TEMPERATURE);
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_type_for(Path::new("a.tiff")), "image/jpeg");
    }
}
