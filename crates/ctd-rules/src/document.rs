//! Document instances and output formats
//!
//! A [`DocumentInstance`] is the parsed key-value form of a CTD section draft.
//! YAML and JSON both land in a `serde_json::Value` tree so that the linter,
//! the report and the CLI share one representation.
//!
//! Model output is rarely bare: text is first searched for a fenced block
//! (```yaml ... ```) and only parsed whole when no fence is present.

use crate::error::DocumentError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Output format of a generated document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// YAML mapping
    #[default]
    Yaml,
    /// JSON object
    Json,
    /// Free-form markdown
    Markdown,
}

impl OutputFormat {
    /// Fence tag and display name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    fn fence_tags(self) -> &'static [&'static str] {
        match self {
            Self::Yaml => &["yaml", "yml"],
            Self::Json => &["json"],
            Self::Markdown => &["markdown", "md"],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            _ => Err(DocumentError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Key under which markdown documents keep their body
pub const MARKDOWN_BODY_FIELD: &str = "Body";

/// Parsed key-value document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentInstance {
    fields: Map<String, Value>,
}

impl DocumentInstance {
    /// Empty document
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value; the top level must be an object
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Err(DocumentError::Empty),
            other => Err(DocumentError::NotAMapping(kind_name(&other))),
        }
    }

    /// Parse text in a known format
    ///
    /// A fenced block tagged with the format is preferred over the whole text.
    pub fn from_text(text: &str, format: OutputFormat) -> Result<Self, DocumentError> {
        let body = extract_fenced_block(text, format.fence_tags())
            .or_else(|| extract_fenced_block(text, &[""]))
            .unwrap_or(text)
            .trim();
        if body.is_empty() {
            return Err(DocumentError::Empty);
        }

        match format {
            OutputFormat::Yaml => parse_yaml(body),
            OutputFormat::Json => parse_json(body),
            OutputFormat::Markdown => {
                let mut doc = Self::new();
                doc.insert(MARKDOWN_BODY_FIELD, Value::String(body.to_string()));
                Ok(doc)
            }
        }
    }

    /// Parse caller-submitted structured text, detecting JSON vs YAML
    ///
    /// A ```json fence or a leading `{` selects JSON; everything else is
    /// treated as YAML (a superset of JSON).
    pub fn from_submission(text: &str) -> Result<Self, DocumentError> {
        if extract_fenced_block(text, OutputFormat::Json.fence_tags()).is_some()
            || text.trim_start().starts_with('{')
        {
            Self::from_text(text, OutputFormat::Json)
        } else {
            Self::from_text(text, OutputFormat::Yaml)
        }
    }

    /// Top-level value
    #[inline]
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Insert or replace a top-level value
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    /// Top-level fields
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Number of top-level fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render as text in a format (unfenced)
    #[must_use]
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Yaml => serde_yaml::to_string(&self.fields).unwrap_or_default(),
            OutputFormat::Json => serde_json::to_string_pretty(&self.fields).unwrap_or_default(),
            OutputFormat::Markdown => render_markdown(&self.fields),
        }
    }

    /// Render wrapped in a fenced block tagged with the format
    #[must_use]
    pub fn render_fenced(&self, format: OutputFormat) -> String {
        format!("```{}\n{}\n```", format.as_str(), self.render(format).trim_end())
    }
}

/// Whether a value counts as absent for requirement checks
///
/// Null, blank strings, empty lists and empty mappings are all missing.
#[must_use]
pub fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Name of a value's kind, for issue details
#[must_use]
pub fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Body of the first fenced block whose tag is one of `tags`
///
/// Tags compare case-insensitively; an empty tag matches an untagged fence.
#[must_use]
pub fn extract_fenced_block<'a>(text: &'a str, tags: &[&str]) -> Option<&'a str> {
    enum Scan {
        Outside,
        Skipping,
        Capturing(usize),
    }

    let mut offset = 0;
    let mut state = Scan::Outside;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        state = match state {
            Scan::Outside => match trimmed.strip_prefix("```") {
                Some(tag) if tags.iter().any(|t| t.eq_ignore_ascii_case(tag.trim())) => {
                    Scan::Capturing(offset + line.len())
                }
                Some(_) => Scan::Skipping,
                None => Scan::Outside,
            },
            Scan::Skipping if trimmed == "```" => Scan::Outside,
            Scan::Capturing(start) if trimmed == "```" => return Some(&text[start..offset]),
            other => other,
        };
        offset += line.len();
    }

    // Unterminated fence: take everything after the opener
    match state {
        Scan::Capturing(start) => Some(&text[start..]),
        _ => None,
    }
}

fn parse_yaml(body: &str) -> Result<DocumentInstance, DocumentError> {
    let mut first = None;
    for doc in serde_yaml::Deserializer::from_str(body) {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| DocumentError::syntax_error("yaml", e.to_string()))?;
        if !matches!(value, serde_yaml::Value::Null) {
            first = Some(value);
            break;
        }
    }
    let value = first.ok_or(DocumentError::Empty)?;
    DocumentInstance::from_value(yaml_to_json(value))
}

fn parse_json(body: &str) -> Result<DocumentInstance, DocumentError> {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => DocumentInstance::from_value(value),
        Err(strict) => {
            // Prose around a single object: take the outermost braces.
            let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
                return Err(DocumentError::syntax_error("json", strict.to_string()));
            };
            if end <= start {
                return Err(DocumentError::syntax_error("json", strict.to_string()));
            }
            serde_json::from_str::<Value>(&body[start..=end])
                .map_err(|e| DocumentError::syntax_error("json", e.to_string()))
                .and_then(DocumentInstance::from_value)
        }
    }
}

/// Convert a YAML tree into the shared JSON representation
///
/// Non-string mapping keys are rendered to their scalar text.
#[must_use]
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    use serde_yaml::Value as Yaml;

    match value {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => Value::Array(items.into_iter().map(yaml_to_json).collect()),
        Yaml::Mapping(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(yaml_key(key), yaml_to_json(value));
            }
            Value::Object(out)
        }
        Yaml::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn render_markdown(fields: &Map<String, Value>) -> String {
    if let (1, Some(Value::String(body))) = (fields.len(), fields.get(MARKDOWN_BODY_FIELD)) {
        return body.clone();
    }
    let mut out = String::new();
    for (key, value) in fields {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("- **{key}**: {text}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn output_format_parsing() {
        assert_eq!("YAML".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert_eq!(
            "docx".parse::<OutputFormat>().unwrap_err(),
            DocumentError::UnsupportedFormat("docx".to_string())
        );
    }

    #[test]
    fn prefers_fenced_block() {
        let text = "Here is the draft:\n```yaml\nProductName: Aspirin\nDosageForm: Tablet\n```\nThanks.";
        let doc = DocumentInstance::from_text(text, OutputFormat::Yaml).unwrap();
        assert_eq!(doc.get("ProductName"), Some(&json!("Aspirin")));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn untagged_fence_is_accepted() {
        let text = "```\n{\"a\": 1}\n```";
        let doc = DocumentInstance::from_text(text, OutputFormat::Json).unwrap();
        assert_eq!(doc.get("a"), Some(&json!(1)));
    }

    #[test]
    fn json_embedded_in_prose() {
        let text = "Sure! {\"action\": \"generate\"} hope that helps";
        let doc = DocumentInstance::from_text(text, OutputFormat::Json).unwrap();
        assert_eq!(doc.get("action"), Some(&json!("generate")));
    }

    #[test]
    fn scalar_top_level_is_rejected() {
        let err = DocumentInstance::from_text("just a sentence", OutputFormat::Yaml).unwrap_err();
        assert_eq!(err, DocumentError::NotAMapping("string"));
    }

    #[test]
    fn empty_text_is_rejected() {
        assert_eq!(
            DocumentInstance::from_text("   ", OutputFormat::Yaml).unwrap_err(),
            DocumentError::Empty
        );
    }

    #[test]
    fn markdown_keeps_body() {
        let doc = DocumentInstance::from_text("# Title\n\nText", OutputFormat::Markdown).unwrap();
        assert_eq!(doc.get(MARKDOWN_BODY_FIELD), Some(&json!("# Title\n\nText")));
        assert_eq!(doc.render(OutputFormat::Markdown), "# Title\n\nText");
    }

    #[test]
    fn submission_detects_json() {
        let doc = DocumentInstance::from_submission("{\"ProductName\": \"X1\"}").unwrap();
        assert_eq!(doc.get("ProductName"), Some(&json!("X1")));
        let doc = DocumentInstance::from_submission("ProductName: X1\n").unwrap();
        assert_eq!(doc.get("ProductName"), Some(&json!("X1")));
    }

    #[test]
    fn yaml_numeric_keys_are_stringified() {
        let doc = DocumentInstance::from_text("1: one\ntrue: yes\n", OutputFormat::Yaml).unwrap();
        assert_eq!(doc.get("1"), Some(&json!("one")));
        assert_eq!(doc.get("true"), Some(&json!("yes")));
    }

    #[test]
    fn missing_values() {
        assert!(is_missing(None));
        assert!(is_missing(Some(&json!(null))));
        assert!(is_missing(Some(&json!("  "))));
        assert!(is_missing(Some(&json!([]))));
        assert!(is_missing(Some(&json!({}))));
        assert!(!is_missing(Some(&json!(0))));
        assert!(!is_missing(Some(&json!(false))));
    }

    #[test]
    fn fenced_render_reparses() {
        let doc = DocumentInstance::from_value(json!({ "NEED_INPUT": true, "References": [] })).unwrap();
        let text = doc.render_fenced(OutputFormat::Yaml);
        assert!(text.starts_with("```yaml\n"));
        assert_eq!(DocumentInstance::from_text(&text, OutputFormat::Yaml).unwrap(), doc);
    }
}
