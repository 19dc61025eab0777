//! Structural linting of document instances against a rule set
//!
//! Checks run in a fixed order so that issue lists are deterministic:
//!
//! 1. Red flags over every string value in the document
//! 2. The section's conditional policy (tabulated vs written summary)
//! 3. Unconditionally required fields not governed by the active policy branch
//! 4. Per-field constraints (kind, pattern, allowed values, item keys) on
//!    fields that are present
//!
//! A document passes when no issue of major severity remains.

use crate::document::{is_missing, kind_name, DocumentInstance};
use crate::ruleset::{ConditionalPolicy, FieldRule, RedFlags, RuleGroup, RuleSet, Severity, ValueKind};
use crate::section::Section;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Rule identifier recorded for red-flag hits
pub const RED_FLAG_RULE: &str = "global_red_flags";

/// Why an issue was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueReason {
    /// Required field absent or empty
    MissingRequired,
    /// Value does not fully match the declared pattern
    PatternMismatch,
    /// Value outside the declared value set
    InvalidValue,
    /// Forbidden phrase or pattern present
    RedFlag,
    /// Text shorter than the declared minimum
    TooShort,
    /// Value has the wrong shape
    TypeMismatch,
    /// List item lacks a declared key
    MissingItemKey,
    /// List declared non-empty is empty
    EmptyList,
    /// Placeholder token left in free text
    Placeholder,
    /// Content is weakly supported by retrieved guidance
    LowGuidelineSimilarity,
    /// Generation backend unavailable; a placeholder was emitted
    OfflineFallback,
    /// Generation backend answered with text that does not parse
    UnparsableResponse,
}

impl IssueReason {
    /// Snake-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequired => "missing_required",
            Self::PatternMismatch => "pattern_mismatch",
            Self::InvalidValue => "invalid_value",
            Self::RedFlag => "red_flag",
            Self::TooShort => "too_short",
            Self::TypeMismatch => "type_mismatch",
            Self::MissingItemKey => "missing_item_key",
            Self::EmptyList => "empty_list",
            Self::Placeholder => "placeholder",
            Self::LowGuidelineSimilarity => "low_guideline_similarity",
            Self::OfflineFallback => "offline_fallback",
            Self::UnparsableResponse => "unparsable_response",
        }
    }
}

impl fmt::Display for IssueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Top-level field the issue belongs to
    pub field: String,
    /// Rule that fired
    pub rule_triggered: String,
    /// Severity
    pub severity: Severity,
    /// Reason code
    pub reason: IssueReason,
    /// Path inside the document (`WrittenSummary.Pharmacology`, `References[0].doc`)
    pub location_hint: String,
    /// Free-text detail (offending phrase, expected values, lengths)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Issue {
    /// Issue located at the field itself
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        rule_triggered: impl Into<String>,
        severity: Severity,
        reason: IssueReason,
    ) -> Self {
        let field = field.into();
        Self {
            location_hint: field.clone(),
            field,
            rule_triggered: rule_triggered.into(),
            severity,
            reason,
            detail: None,
        }
    }

    /// Set a more precise location
    #[inline]
    #[must_use]
    pub fn at(mut self, location_hint: impl Into<String>) -> Self {
        self.location_hint = location_hint.into();
        self
    }

    /// Attach detail text
    #[inline]
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether this issue fails validation
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.severity.is_blocking()
    }
}

/// Outcome of linting one document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LintReport {
    /// No major issues
    pub pass: bool,
    /// Every issue, in check order
    pub issues: Vec<Issue>,
}

impl LintReport {
    /// Build a report; `pass` is derived from the issues
    #[must_use]
    pub fn from_issues(issues: Vec<Issue>) -> Self {
        Self {
            pass: !issues.iter().any(Issue::is_blocking),
            issues,
        }
    }

    /// Number of major issues
    #[must_use]
    pub fn major_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_blocking()).count()
    }

    /// Whether any red flag fired
    #[must_use]
    pub fn has_red_flags(&self) -> bool {
        self.issues.iter().any(|i| i.reason == IssueReason::RedFlag)
    }
}

/// Lints documents against a shared rule set
#[derive(Debug, Clone)]
pub struct Validator {
    rules: Arc<RuleSet>,
}

impl Validator {
    /// Create validator over a rule set
    #[inline]
    #[must_use]
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    /// Rule set in use
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// Lint one document for a section
    #[must_use]
    pub fn lint(&self, document: &DocumentInstance, section: Section, csv_present: bool) -> LintReport {
        lint(document, section, &self.rules, csv_present)
    }
}

/// Lint a document against the rules for `section`
///
/// Sections without rules only get the global red-flag scan. Pure and
/// deterministic: identical inputs always yield identical reports.
#[must_use]
pub fn lint(document: &DocumentInstance, section: Section, rules: &RuleSet, csv_present: bool) -> LintReport {
    let empty = RuleGroup::default();
    let group = rules.group(section).unwrap_or(&empty);
    let mut issues = Vec::new();

    scan_red_flags(document, rules.red_flags(), &mut issues);

    let governed: Vec<&str> = match group.policy() {
        Some(policy) => {
            check_policy(document, group, policy, csv_present, &mut issues);
            policy.active_fields(csv_present)
        }
        None => Vec::new(),
    };

    for field in group.required() {
        if governed.contains(&field.as_str()) {
            continue;
        }
        if is_missing(document.get(field)) {
            issues.push(Issue::new(
                field.as_str(),
                format!("{section}.required"),
                group.severity_of(field),
                IssueReason::MissingRequired,
            ));
        }
    }

    for (field, rule) in group.fields() {
        let value = document.get(field);
        if is_missing(value) && !matches!(value, Some(Value::Array(_))) {
            continue;
        }
        if let Some(value) = value {
            let shape_checked = governed.contains(&field);
            check_field(field, value, rule, group.severity_of(field), section, shape_checked, &mut issues);
        }
    }

    let report = LintReport::from_issues(issues);
    tracing::debug!(
        section = %section,
        pass = report.pass,
        issues = report.issues.len(),
        "document linted"
    );
    report
}

fn scan_red_flags(document: &DocumentInstance, red_flags: &RedFlags, issues: &mut Vec<Issue>) {
    if red_flags.is_empty() {
        return;
    }
    for (field, value) in document.fields() {
        visit_strings(value, field.clone(), &mut |path, text| {
            for phrase in red_flags.hits(text) {
                issues.push(
                    Issue::new(field.as_str(), RED_FLAG_RULE, Severity::Major, IssueReason::RedFlag)
                        .at(path.clone())
                        .with_detail(phrase),
                );
            }
        });
    }
}

fn visit_strings(value: &Value, path: String, visit: &mut dyn FnMut(String, &str)) {
    match value {
        Value::String(text) => visit(path, text),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                visit_strings(item, format!("{path}[{i}]"), visit);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                visit_strings(item, format!("{path}.{key}"), visit);
            }
        }
        _ => {}
    }
}

fn check_policy(
    document: &DocumentInstance,
    group: &RuleGroup,
    policy: &ConditionalPolicy,
    csv_present: bool,
    issues: &mut Vec<Issue>,
) {
    let rule = if csv_present { "policy.tabulated" } else { "policy.written" };

    if csv_present {
        for field in policy.tabulated_fields() {
            let severity = group.policy_severity_of(field);
            match document.get(field) {
                Some(Value::Array(items)) if items.is_empty() => issues.push(
                    Issue::new(field.as_str(), rule, severity, IssueReason::EmptyList)
                        .with_detail("tabular source supplied but no tabulated summaries"),
                ),
                Some(Value::Array(_)) => {}
                value if is_missing(value) => issues.push(
                    Issue::new(field.as_str(), rule, severity, IssueReason::MissingRequired)
                        .with_detail("tabular source supplied"),
                ),
                Some(other) => issues.push(
                    Issue::new(field.as_str(), rule, severity, IssueReason::TypeMismatch)
                        .with_detail(format!("expected list, found {}", kind_name(other))),
                ),
                None => {}
            }
        }
        return;
    }

    let field = policy.written_field();
    let severity = group.policy_severity_of(field);
    let written = policy.written();
    let value = document.get(field);

    if is_missing(value) {
        issues.push(
            Issue::new(field, rule, severity, IssueReason::MissingRequired)
                .with_detail("no tabular source supplied"),
        );
        return;
    }

    match value {
        Some(Value::String(text)) => {
            if let Some(min_len) = written.min_len {
                let len = text.trim().chars().count();
                if len < min_len {
                    issues.push(
                        Issue::new(field, rule, severity, IssueReason::TooShort)
                            .with_detail(format!("{len} < {min_len} characters")),
                    );
                }
            }
        }
        Some(Value::Object(blocks)) => {
            for block in &written.blocks {
                let location = format!("{field}.{}", block.id);
                let block_severity = block.severity.unwrap_or(severity);
                match blocks.get(&block.id) {
                    // Absent blocks are not required; only present ones are measured.
                    None | Some(Value::Null) => {}
                    Some(Value::String(text)) => {
                        let len = text.trim().chars().count();
                        if len < block.min_len {
                            issues.push(
                                Issue::new(field, rule, block_severity, IssueReason::TooShort)
                                    .at(location)
                                    .with_detail(format!("{len} < {} characters", block.min_len)),
                            );
                        }
                    }
                    Some(other) => issues.push(
                        Issue::new(field, rule, block_severity, IssueReason::TypeMismatch)
                            .at(location)
                            .with_detail(format!("expected string, found {}", kind_name(other))),
                    ),
                }
            }
        }
        Some(other) => issues.push(
            Issue::new(field, rule, severity, IssueReason::TypeMismatch)
                .with_detail(format!("expected string or mapping, found {}", kind_name(other))),
        ),
        None => {}
    }
}

/// Constraint checks for one declared field
///
/// `shape_checked` marks fields the conditional policy already checked for
/// presence, emptiness and kind; only their remaining constraints run here.
#[allow(clippy::too_many_arguments)]
fn check_field(
    field: &str,
    value: &Value,
    rule: &FieldRule,
    severity: Severity,
    section: Section,
    shape_checked: bool,
    issues: &mut Vec<Issue>,
) {
    let rule_id = format!("{section}.fields.{field}");

    if let Some(kind) = rule.kind().filter(|_| !shape_checked) {
        let matches = match kind {
            ValueKind::String => matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)),
            ValueKind::List => value.is_array(),
            ValueKind::Mapping => value.is_object(),
        };
        if !matches {
            issues.push(
                Issue::new(field, rule_id, severity, IssueReason::TypeMismatch)
                    .with_detail(format!("expected {}, found {}", kind.as_str(), kind_name(value))),
            );
            return;
        }
    }

    if let Some(pattern) = rule.pattern() {
        match scalar_text(value) {
            Some(text) if pattern.is_match(&text) => {}
            Some(text) => issues.push(
                Issue::new(field, rule_id.clone(), severity, IssueReason::PatternMismatch).with_detail(format!(
                    "'{text}' does not match {}",
                    rule.pattern_source().unwrap_or_default()
                )),
            ),
            None => issues.push(
                Issue::new(field, rule_id.clone(), severity, IssueReason::PatternMismatch)
                    .with_detail(format!("expected a scalar, found {}", kind_name(value))),
            ),
        }
    }

    if let Some(allowed) = rule.allowed_values() {
        let ok = scalar_text(value).is_some_and(|text| allowed.values.contains(&text));
        if !ok {
            let expected: Vec<&str> = allowed.values.iter().map(String::as_str).collect();
            issues.push(
                Issue::new(field, rule_id.clone(), severity, IssueReason::InvalidValue)
                    .with_detail(format!("allowed ({}): {}", allowed.name, expected.join(", "))),
            );
        }
    }

    if let Value::Array(items) = value {
        if rule.non_empty() && items.is_empty() && !shape_checked {
            issues.push(Issue::new(field, rule_id.clone(), severity, IssueReason::EmptyList));
        }
        if !rule.item_keys().is_empty() {
            for (i, item) in items.iter().enumerate() {
                let location = format!("{field}[{i}]");
                let Value::Object(map) = item else {
                    issues.push(
                        Issue::new(field, rule_id.clone(), severity, IssueReason::TypeMismatch)
                            .at(location)
                            .with_detail(format!("expected mapping, found {}", kind_name(item))),
                    );
                    continue;
                };
                for key in rule.item_keys() {
                    if !map.contains_key(key) {
                        issues.push(
                            Issue::new(field, rule_id.clone(), severity, IssueReason::MissingItemKey)
                                .at(format!("{location}.{key}")),
                        );
                    }
                }
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
