//! In-memory lexical reference index
//!
//! Guideline passages are loaded from a JSONL / YAML / JSON corpus and scored
//! against queries with TF-IDF cosine similarity. Scores land in `[0, 1]`, so
//! they plug straight into the reference-validation thresholds.

use crate::error::{CorpusError, CorpusResult};
use async_trait::async_trait;
use ctd_core::{BackendError, ReferenceSnippet, RetrievalBackend, RetrievalQuery};
use ctd_rules::Section;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Module value for passages that apply to every section
pub const GENERAL_MODULE: &str = "GENERAL";

/// One guideline passage
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    /// Passage text
    pub content: String,
    /// Source document
    pub source: String,
    /// CTD module the passage belongs to; `None` for general guidance
    pub module: Option<Section>,
    /// Section of the source document
    pub section: Option<String>,
    /// Page in the source document
    pub page: Option<String>,
    /// Paragraph identifier
    pub para_id: Option<String>,
}

impl CorpusEntry {
    /// Passage with only text and source
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            module: None,
            section: None,
            page: None,
            para_id: None,
        }
    }

    /// With module
    #[must_use]
    pub fn with_module(mut self, module: Section) -> Self {
        self.module = Some(module).filter(|s| s.is_known());
        self
    }

    /// With page
    #[must_use]
    pub fn with_page(mut self, page: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self
    }
}

/// Record as authored; metadata may sit at the top level or under `metadata`
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(alias = "content")]
    text: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl RawEntry {
    fn field(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .or_else(|| self.rest.get(key))
            .and_then(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    fn into_entry(self) -> Option<CorpusEntry> {
        if self.text.trim().is_empty() {
            return None;
        }
        let module = self
            .field("module")
            .filter(|m| !m.eq_ignore_ascii_case(GENERAL_MODULE))
            .map(|m| Section::parse(&m))
            .filter(|s| s.is_known());
        Some(CorpusEntry {
            source: self
                .field("source")
                .or_else(|| self.field("file_name"))
                .unwrap_or_else(|| "corpus".to_string()),
            section: self.field("section"),
            page: self.field("page"),
            para_id: self.field("para_id"),
            module,
            content: self.text,
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

fn term_counts(tokens: Vec<String>) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    counts
}

/// TF-IDF index over guideline passages
#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    entries: Vec<CorpusEntry>,
    /// Unit-length TF-IDF vector per entry
    vectors: Vec<HashMap<String, f64>>,
    idf: HashMap<String, f64>,
}

impl LexicalIndex {
    /// Build an index from passages
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_entries(entries: Vec<CorpusEntry>) -> Self {
        let counts: Vec<HashMap<String, f64>> = entries.iter().map(|e| term_counts(tokenize(&e.content))).collect();

        let mut df: HashMap<&str, usize> = HashMap::new();
        for doc in &counts {
            for term in doc.keys() {
                *df.entry(term.as_str()).or_insert(0) += 1;
            }
        }
        let n = entries.len() as f64;
        let idf: HashMap<String, f64> = df
            .into_iter()
            .map(|(term, d)| (term.to_string(), ((n + 1.0) / (d as f64 + 1.0)).ln() + 1.0))
            .collect();

        let vectors = counts.into_iter().map(|doc| weigh(doc, &idf)).collect();
        Self { entries, vectors, idf }
    }

    /// Load a corpus file
    ///
    /// `.yaml` / `.yml` hold a list of records, `.json` an array; anything
    /// else is read as JSONL. Records without text are skipped.
    pub async fn load(path: impl AsRef<Path>) -> CorpusResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let raw = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str::<Vec<RawEntry>>(&text)
                .map_err(|e| CorpusError::parse_error(e.location().map_or(0, |l| l.line()), e.to_string()))?,
            "json" => serde_json::from_str::<Vec<RawEntry>>(&text)
                .map_err(|e| CorpusError::parse_error(e.line(), e.to_string()))?,
            _ => parse_jsonl(&text)?,
        };

        let entries: Vec<CorpusEntry> = raw.into_iter().filter_map(RawEntry::into_entry).collect();
        tracing::info!(path = %path.display(), entries = entries.len(), "reference corpus loaded");
        Ok(Self::from_entries(entries))
    }

    /// Number of passages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No passages loaded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Score passages against a query, best first
    ///
    /// A section restricts results to that module plus general passages.
    #[must_use]
    pub fn rank(&self, text: &str, section: Option<Section>, k: usize) -> Vec<ReferenceSnippet> {
        let query = weigh(term_counts(tokenize(text)), &self.idf);
        if query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .zip(&self.vectors)
            .enumerate()
            .filter(|(_, (entry, _))| match (section, entry.module) {
                (Some(wanted), Some(module)) => wanted == module,
                _ => true,
            })
            .map(|(i, (_, vector))| (i, cosine(&query, vector)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(i, score)| {
                let entry = &self.entries[i];
                ReferenceSnippet {
                    content: entry.content.clone(),
                    score: score.clamp(0.0, 1.0),
                    source: entry.source.clone(),
                    section: entry.section.clone(),
                    page: entry.page.clone(),
                    para_id: entry.para_id.clone(),
                }
            })
            .collect()
    }
}

fn parse_jsonl(text: &str) -> CorpusResult<Vec<RawEntry>> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry = serde_json::from_str::<RawEntry>(line).map_err(|e| CorpusError::parse_error(i + 1, e.to_string()))?;
        out.push(entry);
    }
    Ok(out)
}

/// Apply IDF weights and scale to unit length
fn weigh(counts: HashMap<String, f64>, idf: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut vector: HashMap<String, f64> = counts
        .into_iter()
        .filter_map(|(term, tf)| idf.get(&term).map(|w| (term, tf * w)))
        .collect();
    let norm = vector.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in vector.values_mut() {
            *v /= norm;
        }
    }
    vector
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, x)| large.get(term).map(|y| x * y))
        .sum()
}

#[async_trait]
impl RetrievalBackend for LexicalIndex {
    async fn search(&self, query: &RetrievalQuery) -> Result<Vec<ReferenceSnippet>, BackendError> {
        Ok(self.rank(&query.text, query.section, query.k))
    }
}
