//! Declarative rule sets
//!
//! A rule set is authored as YAML and compiled once into an immutable
//! [`RuleSet`]. Compilation resolves value-set references and compiles every
//! regex, so a malformed rule file fails at load time rather than mid-run.
//!
//! # Rule file layout
//!
//! ```yaml
//! red_flags:
//!   phrases: ["TBD", "as appropriate"]
//!   patterns: ["(?i)lorem\\s+ipsum"]
//! value_sets:
//!   DosageForm: [Tablet, Capsule, Solution]
//! normalization:
//!   terms:
//!     - canonical: drug substance
//!       synonyms: [active substance]
//! sections:
//!   M2.3:
//!     required: [ProductName, DosageForm]
//!     severities: { DosageForm: minor }
//!     fields:
//!       ProductName: { pattern: "[A-Za-z0-9][A-Za-z0-9 \\-]{1,99}" }
//!       DosageForm: { allowed_values_ref: value_sets.DosageForm }
//!   M2.6:
//!     policy:
//!       tabulated_fields: [TabulatedSummaries]
//!       written_field: WrittenSummary
//!       source_pattern: "(?i)^m26_\\d+_.*\\.csv$"
//!       written:
//!         blocks: [{ id: Pharmacology, min_len: 10 }]
//! ```

use crate::error::{RuleSetError, RuleSetResult};
use crate::section::Section;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Issue severity
///
/// Any `Major` issue fails validation; `Minor` issues are reported only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Reported, does not fail validation
    Minor,
    /// Fails validation
    #[default]
    Major,
}

impl Severity {
    /// Whether an issue of this severity fails validation
    #[inline]
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Major)
    }

    /// Weight used in violation scoring
    #[inline]
    #[must_use]
    pub const fn weight(self) -> u32 {
        match self {
            Self::Minor => 1,
            Self::Major => 2,
        }
    }
}

/// Shape a field value is expected to have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Text (numbers and booleans are accepted as scalars)
    String,
    /// Sequence
    List,
    /// Key-value mapping
    Mapping,
}

impl ValueKind {
    /// Kind name used in issue details
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::List => "list",
            Self::Mapping => "mapping",
        }
    }
}

// ---------------------------------------------------------------------------
// Raw (authored) form
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    red_flags: RawRedFlags,
    #[serde(default)]
    value_sets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    normalization: RawNormalization,
    #[serde(default)]
    sections: BTreeMap<String, RawRuleGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedFlags {
    #[serde(default)]
    phrases: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNormalization {
    #[serde(default)]
    terms: Vec<TermRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRuleGroup {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    severities: BTreeMap<String, Severity>,
    #[serde(default)]
    fields: BTreeMap<String, RawFieldRule>,
    #[serde(default)]
    policy: Option<RawPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFieldRule {
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    allowed_values_ref: Option<String>,
    #[serde(default)]
    kind: Option<ValueKind>,
    #[serde(default)]
    item_keys: Vec<String>,
    #[serde(default)]
    non_empty: bool,
}

fn default_tabulated_fields() -> Vec<String> {
    vec!["TabulatedSummaries".to_string()]
}

fn default_written_field() -> String {
    "WrittenSummary".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    #[serde(default = "default_tabulated_fields")]
    tabulated_fields: Vec<String>,
    #[serde(default = "default_written_field")]
    written_field: String,
    #[serde(default)]
    source_pattern: Option<String>,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    written: RawWritten,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWritten {
    #[serde(default)]
    min_len: Option<usize>,
    #[serde(default)]
    blocks: Vec<BlockRule>,
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// A preferred term and the variants normalised to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TermRule {
    /// Preferred spelling
    pub canonical: String,
    /// Variants replaced by the canonical spelling
    #[serde(default)]
    pub synonyms: Vec<String>,
}

/// Minimum-length rule for one named sub-block of a written summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockRule {
    /// Block key inside the written-summary mapping
    pub id: String,
    /// Minimum length in characters
    pub min_len: usize,
    /// Overrides the policy severity for this block
    #[serde(default)]
    pub severity: Option<Severity>,
}

/// Globally forbidden phrases and patterns
#[derive(Debug, Clone, Default)]
pub struct RedFlags {
    phrases: Vec<(String, String)>,
    patterns: Vec<Regex>,
}

impl RedFlags {
    /// Whether any phrase or pattern is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty() && self.patterns.is_empty()
    }

    /// Every phrase (case-insensitive substring) or pattern that occurs in `text`
    #[must_use]
    pub fn hits(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut hits: Vec<String> = self
            .phrases
            .iter()
            .filter(|(_, needle)| lowered.contains(needle.as_str()))
            .map(|(authored, _)| authored.clone())
            .collect();
        hits.extend(
            self.patterns
                .iter()
                .filter(|rx| rx.is_match(text))
                .map(|rx| rx.as_str().to_string()),
        );
        hits
    }
}

/// Resolved closed vocabulary for a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedValues {
    /// Value-set name
    pub name: String,
    /// Permitted values (exact match)
    pub values: BTreeSet<String>,
}

/// Constraints on a single field
#[derive(Debug, Clone, Default)]
pub struct FieldRule {
    pattern: Option<Regex>,
    pattern_source: Option<String>,
    allowed_values: Option<AllowedValues>,
    kind: Option<ValueKind>,
    item_keys: Vec<String>,
    non_empty: bool,
}

impl FieldRule {
    /// Full-match pattern, if declared
    #[inline]
    #[must_use]
    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    /// Pattern as authored
    #[inline]
    #[must_use]
    pub fn pattern_source(&self) -> Option<&str> {
        self.pattern_source.as_deref()
    }

    /// Allowed values, if declared
    #[inline]
    #[must_use]
    pub fn allowed_values(&self) -> Option<&AllowedValues> {
        self.allowed_values.as_ref()
    }

    /// Expected value kind, if declared
    #[inline]
    #[must_use]
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    /// Keys every list item must carry
    #[inline]
    #[must_use]
    pub fn item_keys(&self) -> &[String] {
        &self.item_keys
    }

    /// Whether an empty list is an issue
    #[inline]
    #[must_use]
    pub fn non_empty(&self) -> bool {
        self.non_empty
    }
}

/// Requirements for the written summary when no tabular source is supplied
#[derive(Debug, Clone, Default)]
pub struct WrittenSummaryRule {
    /// Minimum length when the summary is a single string
    pub min_len: Option<usize>,
    /// Per-block minimum lengths when the summary is a mapping
    pub blocks: Vec<BlockRule>,
}

/// Conditional requirement: tabulated summaries when a tabular source is
/// attached, a written summary otherwise
#[derive(Debug, Clone)]
pub struct ConditionalPolicy {
    tabulated_fields: Vec<String>,
    written_field: String,
    source_pattern: Option<Regex>,
    severity: Severity,
    written: WrittenSummaryRule,
}

impl ConditionalPolicy {
    /// Fields required when a tabular source is present
    #[inline]
    #[must_use]
    pub fn tabulated_fields(&self) -> &[String] {
        &self.tabulated_fields
    }

    /// Field required when no tabular source is present
    #[inline]
    #[must_use]
    pub fn written_field(&self) -> &str {
        &self.written_field
    }

    /// Severity for policy issues
    #[inline]
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Written summary requirements
    #[inline]
    #[must_use]
    pub fn written(&self) -> &WrittenSummaryRule {
        &self.written
    }

    /// Whether an attachment name counts as a tabular source
    #[must_use]
    pub fn is_tabular_source(&self, name: &str) -> bool {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(name);
        match &self.source_pattern {
            Some(rx) => rx.is_match(file_name),
            None => file_name.to_ascii_lowercase().ends_with(".csv"),
        }
    }

    /// Fields the policy governs in the active branch
    #[must_use]
    pub fn active_fields(&self, csv_present: bool) -> Vec<&str> {
        if csv_present {
            self.tabulated_fields.iter().map(String::as_str).collect()
        } else {
            vec![self.written_field.as_str()]
        }
    }
}

/// Rules for one section
#[derive(Debug, Clone, Default)]
pub struct RuleGroup {
    required: Vec<String>,
    severities: HashMap<String, Severity>,
    fields: BTreeMap<String, FieldRule>,
    policy: Option<ConditionalPolicy>,
}

impl RuleGroup {
    /// Unconditionally required fields, in authored order
    #[inline]
    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Declared severity for a field; undeclared fields are major
    #[must_use]
    pub fn severity_of(&self, field: &str) -> Severity {
        self.severities.get(field).copied().unwrap_or_default()
    }

    /// Severity for a policy-governed field: declared severity, else the policy's
    #[must_use]
    pub fn policy_severity_of(&self, field: &str) -> Severity {
        match (self.severities.get(field), &self.policy) {
            (Some(severity), _) => *severity,
            (None, Some(policy)) => policy.severity,
            (None, None) => Severity::default(),
        }
    }

    /// Per-field constraints
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    /// Constraints for one field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldRule> {
        self.fields.get(name)
    }

    /// Conditional policy, if any
    #[inline]
    #[must_use]
    pub fn policy(&self) -> Option<&ConditionalPolicy> {
        self.policy.as_ref()
    }

    /// Whether any attachment name counts as a tabular source
    ///
    /// Sections without a policy never have a tabular source.
    #[must_use]
    pub fn tabular_source_present<S: AsRef<str>>(&self, attachments: &[S]) -> bool {
        self.policy.as_ref().is_some_and(|policy| {
            attachments
                .iter()
                .any(|name| policy.is_tabular_source(name.as_ref()))
        })
    }

    /// Every field name the group mentions: required, policy, and constrained
    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.required.iter().map(String::as_str).collect();
        if let Some(policy) = &self.policy {
            names.extend(policy.tabulated_fields.iter().map(String::as_str));
            names.push(policy.written_field.as_str());
        }
        names.extend(self.fields.keys().map(String::as_str));
        let mut seen = BTreeSet::new();
        names.retain(|name| seen.insert(*name));
        names
    }
}

/// Compiled, immutable rule set
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    red_flags: RedFlags,
    groups: HashMap<Section, RuleGroup>,
    terms: Vec<TermRule>,
    origin: Option<PathBuf>,
}

impl RuleSet {
    /// Rule set with no rules at all
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a rule set from YAML text
    pub fn from_yaml_str(text: &str) -> RuleSetResult<Self> {
        Self::compile(text, "<inline>")
    }

    /// Load and compile a rule file
    pub async fn load(path: impl AsRef<Path>) -> RuleSetResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RuleSetError::io_error(path, e))?;
        let mut rules = Self::compile(&text, &path.display().to_string())?;
        rules.origin = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), sections = rules.groups.len(), "rule set loaded");
        Ok(rules)
    }

    fn compile(text: &str, origin: &str) -> RuleSetResult<Self> {
        let raw: RuleFile = if text.trim().is_empty() {
            RuleFile::default()
        } else {
            serde_yaml::from_str(text)
                .map_err(|e| RuleSetError::syntax_error(origin, e.to_string()))?
        };

        let red_flags = compile_red_flags(raw.red_flags)?;

        let mut groups = HashMap::with_capacity(raw.sections.len());
        for (key, group) in raw.sections {
            let section =
                Section::from_key(&key).ok_or_else(|| RuleSetError::UnknownSection(key.clone()))?;
            groups.insert(section, compile_group(group, &raw.value_sets)?);
        }

        Ok(Self {
            red_flags,
            groups,
            terms: raw.normalization.terms,
            origin: None,
        })
    }

    /// Rules for a section, if the rule set covers it
    #[inline]
    #[must_use]
    pub fn group(&self, section: Section) -> Option<&RuleGroup> {
        self.groups.get(&section)
    }

    /// Sections the rule set covers
    #[must_use]
    pub fn sections(&self) -> Vec<Section> {
        let mut sections: Vec<Section> = self.groups.keys().copied().collect();
        sections.sort();
        sections
    }

    /// Global red flags
    #[inline]
    #[must_use]
    pub fn red_flags(&self) -> &RedFlags {
        &self.red_flags
    }

    /// Terminology normalisation table
    #[inline]
    #[must_use]
    pub fn terms(&self) -> &[TermRule] {
        &self.terms
    }

    /// File the rule set was loaded from
    #[inline]
    #[must_use]
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }
}

fn compile_red_flags(raw: RawRedFlags) -> RuleSetResult<RedFlags> {
    let phrases = raw
        .phrases
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            let needle = p.to_lowercase();
            (p, needle)
        })
        .collect();
    let patterns = raw
        .patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| RuleSetError::invalid_pattern("red_flags", e.to_string())))
        .collect::<RuleSetResult<Vec<_>>>()?;
    Ok(RedFlags { phrases, patterns })
}

fn compile_group(
    raw: RawRuleGroup,
    value_sets: &BTreeMap<String, Vec<String>>,
) -> RuleSetResult<RuleGroup> {
    let mut fields = BTreeMap::new();
    for (name, rule) in raw.fields {
        let compiled = compile_field(&name, rule, value_sets)?;
        fields.insert(name, compiled);
    }

    let policy = raw
        .policy
        .map(|policy| {
            let source_pattern = policy
                .source_pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| RuleSetError::invalid_pattern("policy.source_pattern", e.to_string()))
                })
                .transpose()?;
            Ok::<_, RuleSetError>(ConditionalPolicy {
                tabulated_fields: policy.tabulated_fields,
                written_field: policy.written_field,
                source_pattern,
                severity: policy.severity,
                written: WrittenSummaryRule {
                    min_len: policy.written.min_len,
                    blocks: policy.written.blocks,
                },
            })
        })
        .transpose()?;

    Ok(RuleGroup {
        required: raw.required,
        severities: raw.severities.into_iter().collect(),
        fields,
        policy,
    })
}

fn compile_field(
    name: &str,
    raw: RawFieldRule,
    value_sets: &BTreeMap<String, Vec<String>>,
) -> RuleSetResult<FieldRule> {
    // Patterns must match the whole value, not a substring of it.
    let pattern = raw
        .pattern
        .as_deref()
        .map(|p| {
            RegexBuilder::new(&format!("^(?:{p})$"))
                .build()
                .map_err(|e| RuleSetError::invalid_pattern(name, e.to_string()))
        })
        .transpose()?;

    let allowed_values = raw
        .allowed_values_ref
        .as_deref()
        .map(|reference| {
            let set_name = reference.strip_prefix("value_sets.").unwrap_or(reference);
            value_sets
                .get(set_name)
                .map(|values| AllowedValues {
                    name: set_name.to_string(),
                    values: values.iter().cloned().collect(),
                })
                .ok_or_else(|| RuleSetError::UnknownValueSet {
                    field: name.to_string(),
                    reference: reference.to_string(),
                })
        })
        .transpose()?;

    Ok(FieldRule {
        pattern,
        pattern_source: raw.pattern,
        allowed_values,
        kind: raw.kind,
        item_keys: raw.item_keys,
        non_empty: raw.non_empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
red_flags:
  phrases: ["TBD", "as appropriate"]
  patterns: ["(?i)lorem\\s+ipsum"]
value_sets:
  DosageForm: [Tablet, Capsule]
sections:
  M2.3:
    required: [ProductName, DosageForm]
    severities: { DosageForm: minor }
    fields:
      ProductName: { pattern: "[A-Z][a-z]+" }
      DosageForm: { allowed_values_ref: value_sets.DosageForm }
  m26:
    policy:
      source_pattern: "(?i)^m26_\\d+_.*\\.csv$"
      written:
        blocks: [{ id: Pharmacology, min_len: 10 }]
"#;

    #[test]
    fn compiles_sections_and_defaults() {
        let rules = RuleSet::from_yaml_str(RULES).unwrap();
        assert_eq!(
            rules.sections(),
            vec![Section::QualityOverallSummary, Section::NonclinicalSummary]
        );

        let qos = rules.group(Section::QualityOverallSummary).unwrap();
        assert_eq!(qos.required(), ["ProductName", "DosageForm"]);
        assert_eq!(qos.severity_of("DosageForm"), Severity::Minor);
        assert_eq!(qos.severity_of("ProductName"), Severity::Major);

        let policy = rules.group(Section::NonclinicalSummary).unwrap().policy().unwrap();
        assert_eq!(policy.tabulated_fields(), ["TabulatedSummaries"]);
        assert_eq!(policy.written_field(), "WrittenSummary");
        assert_eq!(policy.written().blocks[0].id, "Pharmacology");
    }

    #[test]
    fn pattern_is_anchored() {
        let rules = RuleSet::from_yaml_str(RULES).unwrap();
        let rule = rules
            .group(Section::QualityOverallSummary)
            .and_then(|g| g.field("ProductName"))
            .unwrap();
        let rx = rule.pattern().unwrap();
        assert!(rx.is_match("Aspirin"));
        assert!(!rx.is_match("Aspirin 100"));
        assert_eq!(rule.pattern_source(), Some("[A-Z][a-z]+"));
    }

    #[test]
    fn value_set_reference_is_resolved() {
        let rules = RuleSet::from_yaml_str(RULES).unwrap();
        let allowed = rules
            .group(Section::QualityOverallSummary)
            .and_then(|g| g.field("DosageForm"))
            .and_then(FieldRule::allowed_values)
            .unwrap();
        assert_eq!(allowed.name, "DosageForm");
        assert!(allowed.values.contains("Capsule"));
    }

    #[test]
    fn red_flags_match_case_insensitively() {
        let rules = RuleSet::from_yaml_str(RULES).unwrap();
        let hits = rules.red_flags().hits("Dose: tbd, see Lorem  Ipsum");
        assert_eq!(hits.len(), 2);
        assert!(hits.contains(&"TBD".to_string()));
    }

    #[test]
    fn tabular_source_detection() {
        let rules = RuleSet::from_yaml_str(RULES).unwrap();
        let group = rules.group(Section::NonclinicalSummary).unwrap();
        assert!(group.tabular_source_present(&["data/M26_01_tox.csv"]));
        assert!(!group.tabular_source_present(&["notes.csv"]));
        assert!(!group.tabular_source_present::<&str>(&[]));

        let qos = rules.group(Section::QualityOverallSummary).unwrap();
        assert!(!qos.tabular_source_present(&["m26_01_tox.csv"]));
    }

    #[test]
    fn unknown_section_key_is_fatal() {
        let err = RuleSet::from_yaml_str("sections:\n  M9.1:\n    required: [A]\n").unwrap_err();
        assert!(matches!(err, RuleSetError::UnknownSection(ref key) if key == "M9.1"));
    }

    #[test]
    fn unknown_value_set_is_fatal() {
        let text = "sections:\n  M2.3:\n    fields:\n      Form: { allowed_values_ref: value_sets.Nope }\n";
        let err = RuleSet::from_yaml_str(text).unwrap_err();
        assert!(matches!(err, RuleSetError::UnknownValueSet { .. }));
    }

    #[test]
    fn bad_pattern_is_fatal() {
        let text = "sections:\n  M2.3:\n    fields:\n      Name: { pattern: \"[unclosed\" }\n";
        let err = RuleSet::from_yaml_str(text).unwrap_err();
        assert!(matches!(err, RuleSetError::InvalidPattern { ref field, .. } if field == "Name"));
    }

    #[test]
    fn bad_severity_is_a_syntax_error() {
        let text = "sections:\n  M2.3:\n    severities: { Name: blocker }\n";
        let err = RuleSet::from_yaml_str(text).unwrap_err();
        assert!(matches!(err, RuleSetError::Syntax { .. }));
    }

    #[test]
    fn empty_text_is_an_empty_rule_set() {
        let rules = RuleSet::from_yaml_str("  \n").unwrap();
        assert!(rules.sections().is_empty());
        assert!(rules.red_flags().is_empty());
    }

    #[tokio::test]
    async fn load_records_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, RULES).await.unwrap();

        let rules = RuleSet::load(&path).await.unwrap();
        assert_eq!(rules.origin(), Some(path.as_path()));

        let missing = RuleSet::load(dir.path().join("missing.yaml")).await.unwrap_err();
        assert!(matches!(missing, RuleSetError::Io { .. }));
    }
}
