//! Request routing
//!
//! A keyword heuristic always produces a complete plan. When a decision model
//! is configured its JSON answer is merged over the heuristic field by field;
//! anything missing, mistyped or unparseable keeps the heuristic value.

use crate::backend::{bounded, DecisionClient};
use crate::config::PipelineConfig;
use crate::prompts;
use crate::types::{Action, PlanSource, RouterPlan};
use ctd_rules::{DocumentInstance, OutputFormat, Section};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const PARSE_KEYWORDS: &[&str] = &[
    "pdf", "xlsx", "xls", "csv", "file", "files", "upload", "uploaded", "scan", "scanned", "ocr",
    "attached", "attachment", "parse", "파일", "스캔", "업로드", "첨부",
];

const GENERATE_KEYWORDS: &[&str] = &[
    "write", "draft", "generate", "create", "compose", "prepare", "summarize", "summarise", "작성",
    "생성", "초안",
];

const VALIDATE_KEYWORDS: &[&str] = &[
    "validate", "validation", "check", "lint", "verify", "review", "compliance", "검증", "체크",
    "적합성", "점검",
];

/// Descriptive phrases per section, checked in this order so that
/// "non-clinical summary" is claimed before "clinical summary".
const SECTION_PHRASES: &[(Section, &[&str])] = &[
    (
        Section::QualityOverallSummary,
        &["qos", "quality overall summary", "품질평가자료요약", "품질 평가 자료 요약", "품질 종합"],
    ),
    (
        Section::NonclinicalOverview,
        &["nonclinical overview", "non-clinical overview", "비임상 개요", "비임상개요"],
    ),
    (
        Section::NonclinicalSummary,
        &["nonclinical summary", "non-clinical summary", "nonclinical written", "비임상 요약", "비임상요약"],
    ),
    (Section::ClinicalOverview, &["clinical overview", "임상 개요", "임상개요"]),
    (Section::ClinicalSummary, &["clinical summary", "임상 요약", "임상요약"]),
    (
        Section::Administrative,
        &["administrative", "labeling", "labelling", "행정", "라벨"],
    ),
];

/// Lowercased text with its ASCII word list
struct Lexed {
    lowered: String,
    words: Vec<String>,
}

impl Lexed {
    fn new(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { lowered, words }
    }

    /// ASCII keywords match whole words; others match as substrings
    fn mentions(&self, keyword: &str) -> bool {
        if keyword.is_ascii() && !keyword.contains(' ') {
            self.words.iter().any(|w| w == keyword)
        } else {
            self.lowered.contains(keyword)
        }
    }

    fn mentions_any(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.mentions(k))
    }
}

/// Keyword-only routing
#[must_use]
pub fn heuristic_plan(text: &str) -> RouterPlan {
    let lexed = Lexed::new(text);

    let wants_parse = lexed.mentions_any(PARSE_KEYWORDS) || text.contains("```");
    let wants_generate = lexed.mentions_any(GENERATE_KEYWORDS);
    let wants_validate = lexed.mentions_any(VALIDATE_KEYWORDS);

    let action = match (wants_parse, wants_generate, wants_validate) {
        (true, false, false) => Action::Parse,
        (_, false, true) => Action::Validate,
        (false, true, false) => Action::Generate,
        _ => Action::Pipeline,
    };

    // Generated drafts are always re-checked; a validate-only request never drafts.
    let (need_generate, need_validate) = match (wants_generate, wants_validate) {
        (false, true) => (false, true),
        (true, _) => (true, true),
        (false, false) => (!wants_parse, true),
    };

    RouterPlan {
        action,
        section: detect_section(&lexed),
        need_parse: wants_parse,
        need_rag: true,
        need_generate,
        need_validate,
        output_format: detect_format(&lexed),
        source: PlanSource::Heuristic,
    }
}

fn detect_section(lexed: &Lexed) -> Section {
    explicit_section(&lexed.lowered)
        .or_else(|| {
            SECTION_PHRASES
                .iter()
                .find(|(_, phrases)| phrases.iter().any(|p| lexed.lowered.contains(p)))
                .map(|(section, _)| *section)
        })
        .unwrap_or(Section::Unknown)
}

/// First "m2.6" / "m 2.6" / "m-2.6" / "m26" / "m1" token not glued to a preceding word
fn explicit_section(lowered: &str) -> Option<Section> {
    let chars: Vec<char> = lowered.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if *c != 'm' || (i > 0 && chars[i - 1].is_alphanumeric()) {
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && j - i <= 2 && matches!(chars[j], ' ' | '-') {
            j += 1;
        }
        let start = j;
        while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
            j += 1;
        }
        let token: String = chars[start..j].iter().collect();
        if let Some(section) = Section::from_key(token.trim_end_matches('.')) {
            return Some(section);
        }
    }
    None
}

fn detect_format(lexed: &Lexed) -> OutputFormat {
    if lexed.mentions("yaml") || lexed.mentions("yml") {
        OutputFormat::Yaml
    } else if lexed.mentions("json") {
        OutputFormat::Json
    } else if lexed.mentions("markdown") || lexed.mentions("md") {
        OutputFormat::Markdown
    } else {
        OutputFormat::Yaml
    }
}

/// Pull a JSON object out of model text (bare, fenced, or wrapped in prose)
#[must_use]
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    DocumentInstance::from_text(raw, OutputFormat::Json)
        .ok()
        .map(|doc| doc.fields().clone())
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Overlay a model answer on a base plan; the flag reports whether anything applied
#[must_use]
pub fn merge_plan(base: &RouterPlan, answer: &Map<String, Value>) -> (RouterPlan, bool) {
    let mut plan = base.clone();
    let mut applied = false;

    if let Some(action) = answer.get("action").and_then(Value::as_str) {
        plan.action = Action::parse(action);
        applied = true;
    }
    if let Some(section) = answer.get("section").and_then(Value::as_str).map(Section::parse) {
        if section.is_known() {
            plan.section = section;
            applied = true;
        }
    }
    for (key, slot) in [
        ("need_parse", &mut plan.need_parse),
        ("need_rag", &mut plan.need_rag),
        ("need_generate", &mut plan.need_generate),
        ("need_validate", &mut plan.need_validate),
    ] {
        if let Some(flag) = answer.get(key).and_then(coerce_bool) {
            *slot = flag;
            applied = true;
        }
    }
    if let Some(format) = answer
        .get("output_format")
        .and_then(Value::as_str)
        .and_then(|f| f.parse::<OutputFormat>().ok())
    {
        plan.output_format = format;
        applied = true;
    }

    // A plan for a known section always does something.
    if plan.section.is_known() && !(plan.need_parse || plan.need_rag || plan.need_generate || plan.need_validate) {
        plan.need_parse = base.need_parse;
        plan.need_rag = base.need_rag;
        plan.need_generate = base.need_generate;
        plan.need_validate = base.need_validate;
    }

    (plan, applied)
}

/// Request router
#[derive(Clone)]
pub struct Router {
    decision: Option<Arc<dyn DecisionClient>>,
    timeout: Duration,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("decision", &self.decision.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self {
            decision: None,
            timeout: PipelineConfig::default().backend_timeout(),
        }
    }
}

impl Router {
    /// Heuristic-only router
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With decision model
    #[must_use]
    pub fn with_decision(mut self, decision: Option<Arc<dyn DecisionClient>>) -> Self {
        self.decision = decision;
        self
    }

    /// Bound on each decision-model call
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route a request
    pub async fn route(&self, text: &str) -> RouterPlan {
        let base = heuristic_plan(text);
        let Some(decision) = &self.decision else {
            return base;
        };

        let (system, user) = prompts::router_messages(text);
        let answer = match bounded(self.timeout, decision.decide(&system, &user)).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "decision model failed; using heuristic plan");
                return RouterPlan {
                    source: PlanSource::HeuristicFallback,
                    ..base
                };
            }
        };

        match extract_json_object(&answer).map(|obj| merge_plan(&base, &obj)) {
            Some((plan, true)) => RouterPlan {
                source: PlanSource::Model,
                ..plan
            },
            _ => {
                tracing::warn!("decision model answer unusable; using heuristic plan");
                RouterPlan {
                    source: PlanSource::HeuristicFallback,
                    ..base
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDecisionClient;
    use crate::error::BackendError;
    use pretty_assertions::assert_eq;

    #[test]
    fn korean_generation_request() {
        let plan = heuristic_plan("M2.6 비임상 요약 작성 요청");
        assert_eq!(plan.section, Section::NonclinicalSummary);
        assert!(plan.need_generate);
        assert!(plan.need_validate);
        assert!(plan.need_rag);
        assert_eq!(plan.action, Action::Generate);
        assert_eq!(plan.source, PlanSource::Heuristic);
    }

    #[test]
    fn english_generation_request() {
        let plan = heuristic_plan("M2.6 non-clinical summary write request");
        assert_eq!(plan.section, Section::NonclinicalSummary);
        assert_eq!(plan.action, Action::Generate);
        assert!(!plan.need_parse);
    }

    #[test]
    fn validate_only_does_not_generate() {
        let plan = heuristic_plan("Please validate the written summary for QoS");
        assert_eq!(plan.action, Action::Validate);
        assert_eq!(plan.section, Section::QualityOverallSummary);
        assert!(!plan.need_generate);
        assert!(plan.need_validate);
    }

    #[test]
    fn parse_keywords_and_fences() {
        let plan = heuristic_plan("uploaded pdf for m2.3");
        assert_eq!(plan.action, Action::Parse);
        assert!(plan.need_parse);
        assert!(!plan.need_generate);

        let plan = heuristic_plan("check this\n```yaml\nA: 1\n```");
        assert!(plan.need_parse);
        assert_eq!(plan.action, Action::Validate);
    }

    #[test]
    fn no_keywords_means_full_pipeline() {
        let plan = heuristic_plan("clinical summary please");
        assert_eq!(plan.action, Action::Pipeline);
        assert_eq!(plan.section, Section::ClinicalSummary);
        assert!(plan.need_generate && plan.need_validate && plan.need_rag);
    }

    #[test]
    fn section_phrase_order() {
        assert_eq!(heuristic_plan("non-clinical summary").section, Section::NonclinicalSummary);
        assert_eq!(heuristic_plan("비임상 개요 초안").section, Section::NonclinicalOverview);
        assert_eq!(heuristic_plan("임상 개요 초안").section, Section::ClinicalOverview);
        assert_eq!(heuristic_plan("summary of items").section, Section::Unknown);
        assert_eq!(heuristic_plan("M 2.7 and M2.3").section, Section::ClinicalSummary);
    }

    #[test]
    fn output_format_mentions() {
        assert_eq!(heuristic_plan("draft M2.3 as json").output_format, OutputFormat::Json);
        assert_eq!(heuristic_plan("draft M2.3 in markdown").output_format, OutputFormat::Markdown);
        assert_eq!(heuristic_plan("draft M2.3").output_format, OutputFormat::Yaml);
    }

    #[test]
    fn merge_coerces_and_keeps_base() {
        let base = heuristic_plan("M2.6 비임상 요약 작성 요청");
        let answer = extract_json_object(
            "```json\n{\"action\": \"summon\", \"section\": \"UNKNOWN\", \"need_parse\": \"yes\", \"output_format\": \"docx\"}\n```",
        )
        .unwrap();
        let (plan, applied) = merge_plan(&base, &answer);
        assert!(applied);
        assert_eq!(plan.action, Action::Pipeline);
        assert_eq!(plan.section, Section::NonclinicalSummary);
        assert!(plan.need_parse);
        assert_eq!(plan.output_format, OutputFormat::Yaml);
    }

    #[test]
    fn merge_never_disables_everything_for_known_section() {
        let base = heuristic_plan("M2.3 draft");
        let answer = extract_json_object(
            r#"{"need_parse": false, "need_rag": false, "need_generate": false, "need_validate": false}"#,
        )
        .unwrap();
        let (plan, _) = merge_plan(&base, &answer);
        assert!(plan.need_rag);
        assert!(plan.need_generate);
    }

    #[tokio::test]
    async fn model_override_applies() {
        let mut mock = MockDecisionClient::new();
        mock.expect_decide().times(1).returning(|_, _| {
            Ok(r#"Sure: {"action": "generate", "section": "M2.7", "output_format": "yaml"}"#.to_string())
        });
        let router = Router::new().with_decision(Some(Arc::new(mock)));

        let plan = router.route("M2.6 비임상 요약 작성 요청").await;
        assert_eq!(plan.action, Action::Generate);
        assert_eq!(plan.section, Section::ClinicalSummary);
        assert_eq!(plan.output_format, OutputFormat::Yaml);
        assert_eq!(plan.source, PlanSource::Model);
    }

    #[tokio::test]
    async fn model_failure_falls_back() {
        let mut mock = MockDecisionClient::new();
        mock.expect_decide()
            .returning(|_, _| Err(BackendError::Unavailable("refused".into())));
        let router = Router::new().with_decision(Some(Arc::new(mock)));

        let plan = router.route("M2.6 write").await;
        assert_eq!(plan.source, PlanSource::HeuristicFallback);
        assert_eq!(plan.section, Section::NonclinicalSummary);
    }

    struct Deliberate;

    #[async_trait::async_trait]
    impl DecisionClient for Deliberate {
        async fn decide(&self, _: &str, _: &str) -> Result<String, BackendError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(r#"{"section": "M2.5"}"#.to_string())
        }
    }

    #[tokio::test]
    async fn default_timeout_leaves_room_for_the_model() {
        let plan = Router::new()
            .with_decision(Some(Arc::new(Deliberate)))
            .route("M2.6 write")
            .await;
        assert_eq!(plan.source, PlanSource::Model);
        assert_eq!(plan.section, Section::ClinicalOverview);
    }

    #[tokio::test]
    async fn slow_model_hits_the_configured_timeout() {
        let plan = Router::new()
            .with_decision(Some(Arc::new(Deliberate)))
            .with_timeout(Duration::from_millis(5))
            .route("M2.6 write")
            .await;
        assert_eq!(plan.source, PlanSource::HeuristicFallback);
        assert_eq!(plan.section, Section::NonclinicalSummary);
    }

    #[tokio::test]
    async fn garbage_answer_falls_back() {
        let mut mock = MockDecisionClient::new();
        mock.expect_decide().returning(|_, _| Ok("no idea".to_string()));
        let router = Router::new().with_decision(Some(Arc::new(mock)));

        let plan = router.route("M2.3 check").await;
        assert_eq!(plan.source, PlanSource::HeuristicFallback);
        assert_eq!(plan.action, Action::Validate);
    }
}
