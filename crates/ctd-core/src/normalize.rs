//! Terminology and placeholder normalisation
//!
//! Normalisation is idempotent: `normalize(normalize(x)) == normalize(x)`.
//! The rewrite passes are applied until the text stops changing, so any pass
//! ordering effects settle inside a single call.

use ctd_rules::{RuleSet, TermRule};
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex, RegexBuilder};

/// Marker written wherever information is still required
pub const NEED_INPUT: &str = "NEED_INPUT";

/// Tokens that stand in for missing content
pub const PLACEHOLDER_TOKENS: &[&str] = &[
    "tbd",
    "to be defined",
    "to be decided",
    "미정",
    "lorem ipsum",
    "as appropriate",
    "etc.",
];

const MAX_PASSES: usize = 4;

static PLACEHOLDERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    PLACEHOLDER_TOKENS
        .iter()
        .filter_map(|token| word_pattern(token).ok())
        .collect()
});

/// Build a case-insensitive whole-word matcher for a phrase
///
/// Word boundaries are only asserted next to word characters, so tokens such
/// as `etc.` still match before whitespace.
fn word_pattern(phrase: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(phrase.trim()).replace(' ', r"\s+");
    let starts_word = phrase.trim().chars().next().is_some_and(char::is_alphanumeric);
    let ends_word = phrase.trim().chars().last().is_some_and(char::is_alphanumeric);
    let pattern = format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        escaped,
        if ends_word { r"\b" } else { "" }
    );
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

/// A placeholder occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderHit {
    /// Matched text
    pub text: String,
    /// 1-based line number
    pub line: usize,
}

/// Find placeholder tokens in free text
#[must_use]
pub fn find_placeholders(text: &str) -> Vec<PlaceholderHit> {
    let mut hits = Vec::new();
    for (i, line) in text.lines().enumerate() {
        for rx in PLACEHOLDERS.iter() {
            hits.extend(rx.find_iter(line).map(|m| PlaceholderHit {
                text: m.as_str().to_string(),
                line: i + 1,
            }));
        }
    }
    hits
}

/// Deterministic text normaliser
#[derive(Debug, Clone, Default)]
pub struct TermNormalizer {
    terms: Vec<(Regex, String)>,
}

impl TermNormalizer {
    /// Normaliser with placeholder and whitespace passes only
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normaliser using the rule set's terminology table
    #[must_use]
    pub fn from_ruleset(rules: &RuleSet) -> Self {
        Self::from_terms(rules.terms())
    }

    /// Normaliser from explicit term rules
    ///
    /// Synonyms equal to their canonical form (ignoring case) and synonyms
    /// that fail to compile are skipped.
    #[must_use]
    pub fn from_terms(terms: &[TermRule]) -> Self {
        let mut compiled = Vec::new();
        for term in terms {
            for synonym in &term.synonyms {
                if synonym.trim().is_empty() || synonym.eq_ignore_ascii_case(&term.canonical) {
                    continue;
                }
                match word_pattern(synonym) {
                    Ok(rx) => compiled.push((rx, term.canonical.clone())),
                    Err(e) => tracing::warn!(synonym = %synonym, error = %e, "skipping synonym"),
                }
            }
        }
        Self { terms: compiled }
    }

    /// Canonical terms known to this normaliser
    pub fn canonical_terms(&self) -> impl Iterator<Item = &str> {
        let mut seen: Vec<&str> = Vec::new();
        for (_, canonical) in &self.terms {
            if !seen.contains(&canonical.as_str()) {
                seen.push(canonical);
            }
        }
        seen.into_iter()
    }

    /// Normalise text
    #[must_use]
    pub fn normalize(&self, text: &str) -> String {
        let mut current = self.pass(text);
        for _ in 1..MAX_PASSES {
            let next = self.pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    /// Rewrite synonyms to their canonical terms, leaving everything else
    ///
    /// Unlike [`normalize`](Self::normalize) this also rewrites inside fenced
    /// blocks and keeps placeholders, so lint still sees them.
    #[must_use]
    pub fn canonicalize_terms(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (rx, canonical) in &self.terms {
            out = rx.replace_all(&out, NoExpand(canonical)).into_owned();
        }
        out
    }

    fn pass(&self, text: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut in_fence = false;
        let mut blank_run = 0;

        for raw in text.lines() {
            let line = raw.trim_end();
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                blank_run = 0;
                lines.push(line.to_string());
                continue;
            }
            if in_fence {
                lines.push(line.to_string());
                continue;
            }
            if line.trim().is_empty() {
                blank_run += 1;
                if blank_run == 1 {
                    lines.push(String::new());
                }
                continue;
            }
            blank_run = 0;

            let mut line = collapse_inner_spaces(line);
            line = punctuate(&line);
            for (rx, canonical) in &self.terms {
                line = rx.replace_all(&line, NoExpand(canonical)).into_owned();
            }
            for rx in PLACEHOLDERS.iter() {
                line = rx
                    .replace_all(&line, |caps: &regex::Captures<'_>| {
                        let matched = &caps[0];
                        let trailing: String = matched
                            .chars()
                            .rev()
                            .take_while(|c| !c.is_alphanumeric() && !c.is_whitespace())
                            .collect::<Vec<_>>()
                            .into_iter()
                            .rev()
                            .collect();
                        format!("{NEED_INPUT}{trailing}")
                    })
                    .into_owned();
            }
            lines.push(line);
        }

        lines.join("\n").trim().to_string()
    }
}

/// Collapse runs of spaces after the indentation
fn collapse_inner_spaces(line: &str) -> String {
    let indent_len = line.len() - line.trim_start().len();
    let (indent, body) = line.split_at(indent_len);
    let mut out = String::with_capacity(line.len());
    out.push_str(indent);
    let mut prev_space = false;
    for c in body.chars() {
        if c == ' ' || c == '\t' {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

/// Terminate prose sentences
///
/// Only lines that look like prose are touched: four or more words, no
/// key-value colon, no markup prefix, ending in a letter or digit.
fn punctuate(line: &str) -> String {
    let trimmed = line.trim_start();
    let markup = ['#', '-', '*', '|', '>', '`', '[', '{', '}', ']'];
    let is_prose = trimmed.split_whitespace().count() >= 4
        && !trimmed.contains(':')
        && !trimmed.starts_with(|c: char| markup.contains(&c) || c.is_ascii_digit())
        && trimmed.chars().last().is_some_and(char::is_alphanumeric);
    if is_prose {
        format!("{line}.")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn normalizer() -> TermNormalizer {
        TermNormalizer::from_terms(&[TermRule {
            canonical: "drug substance".to_string(),
            synonyms: vec!["active substance".to_string(), "API".to_string()],
        }])
    }

    #[test]
    fn replaces_synonyms_whole_word() {
        let out = normalizer().normalize("The Active Substance is stable; rapid growth continues here");
        assert_eq!(out, "The drug substance is stable; rapid growth continues here.");
    }

    #[test]
    fn does_not_touch_partial_words() {
        let out = normalizer().normalize("capital");
        assert_eq!(out, "capital");
    }

    #[test]
    fn placeholders_become_need_input() {
        let out = TermNormalizer::new().normalize("Shelf life is TBD pending data from site");
        assert_eq!(out, "Shelf life is NEED_INPUT pending data from site.");

        let out = TermNormalizer::new().normalize("Storage conditions as appropriate.");
        assert_eq!(out, "Storage conditions NEED_INPUT.");
    }

    #[test]
    fn trailing_punctuation_of_token_is_kept() {
        let out = TermNormalizer::new().normalize("studies include toxicity, genotoxicity, etc.");
        assert_eq!(out, "studies include toxicity, genotoxicity, NEED_INPUT.");
    }

    #[test]
    fn whitespace_is_cleaned() {
        let out = TermNormalizer::new().normalize("  a   b  \n\n\n\nc\t\td  \n");
        assert_eq!(out, "a b\n\nc d");
    }

    #[test]
    fn fenced_blocks_are_left_alone() {
        let text = "```yaml\nDosageForm:   Tablet tbd\n```";
        assert_eq!(TermNormalizer::new().normalize(text), text);
    }

    #[test]
    fn key_value_lines_are_not_punctuated() {
        let out = TermNormalizer::new().normalize("ProductName: ABC 123 Film Tablet");
        assert_eq!(out, "ProductName: ABC 123 Film Tablet");
    }

    #[test]
    fn idempotent_on_examples() {
        let n = normalizer();
        for text in [
            "the data we use etc",
            "API   stability is tbd and to be decided later",
            "미정 항목이 있습니다 추가 자료 필요",
            "- bullet item with several words",
            "",
        ] {
            let once = n.normalize(text);
            assert_eq!(n.normalize(&once), once, "{text:?}");
        }
    }

    #[test]
    fn finds_placeholders_with_lines() {
        let hits = find_placeholders("fine\nvalue TBD\nlorem  ipsum dolor");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], PlaceholderHit { text: "TBD".into(), line: 2 });
        assert_eq!(hits[1].line, 3);
        assert!(find_placeholders("NEED_INPUT").is_empty());
    }

    #[test]
    fn canonicalize_terms_rewrites_fenced_values_only_for_synonyms() {
        let text = "```yaml\nSummary: The API   is stable, TBD\n```";
        assert_eq!(
            normalizer().canonicalize_terms(text),
            "```yaml\nSummary: The drug substance   is stable, TBD\n```"
        );
        assert_eq!(TermNormalizer::new().canonicalize_terms(text), text);
    }

    #[test]
    fn canonical_terms_are_unique() {
        let normalizer = normalizer();
        let terms: Vec<&str> = normalizer.canonical_terms().collect();
        assert_eq!(terms, vec!["drug substance"]);
    }
}
