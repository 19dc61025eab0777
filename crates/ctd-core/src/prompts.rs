//! Prompt assembly for the decision and generation backends

use crate::backend::ChatMessage;
use crate::types::Citation;
use ctd_rules::{OutputFormat, RuleGroup, Section};
use std::fmt::Write as _;

const ROUTER_SYSTEM: &str = "You route requests for a CTD (Common Technical Document) drafting assistant. \
Answer with exactly one JSON object and nothing else.";

/// System and user prompts for the decision model
#[must_use]
pub fn router_messages(description: &str) -> (String, String) {
    let user = format!(
        "Request:\n{description}\n\n\
         Return JSON with these keys:\n\
         {{\"action\": \"parse|retrieve|generate|validate|pipeline\", \
         \"section\": \"M1|M2.3|M2.4|M2.5|M2.6|M2.7|UNKNOWN\", \
         \"need_parse\": bool, \"need_rag\": bool, \"need_generate\": bool, \"need_validate\": bool, \
         \"output_format\": \"yaml|json|markdown\"}}"
    );
    (ROUTER_SYSTEM.to_string(), user)
}

/// Render retrieved references as numbered context blocks
#[must_use]
pub fn render_context(refs: &[Citation]) -> String {
    if refs.is_empty() {
        return "(no references available)".to_string();
    }
    let mut out = String::new();
    for (i, r) in refs.iter().enumerate() {
        let _ = write!(out, "[CIT-{}] {}", i + 1, r.source);
        if let Some(page) = &r.page {
            let _ = write!(out, " p.{page}");
        }
        let _ = writeln!(out, "\n{}\n", r.snippet);
    }
    out.trim_end().to_string()
}

/// Fields the draft is expected to carry, for the skeleton hint
#[must_use]
pub fn expected_fields(group: Option<&RuleGroup>, csv_present: bool) -> Vec<String> {
    let Some(group) = group else {
        return Vec::new();
    };
    let mut fields: Vec<String> = group.required().to_vec();
    if let Some(policy) = group.policy() {
        for field in policy.active_fields(csv_present) {
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }
    }
    fields
}

/// Full message list for a generation call
#[must_use]
pub fn generation_messages(
    section: Section,
    request: &str,
    refs: &[Citation],
    format: OutputFormat,
    fields: &[String],
    language: &str,
) -> Vec<ChatMessage> {
    let system = format!(
        "You draft CTD section {token} ({title}) for a regulatory submission. \
         Write in language '{language}'. Ground every statement in the numbered references and cite them \
         inline as [CIT-n]. Never invent data; write {marker} where information is missing.",
        token = section.token(),
        title = section.title(),
        marker = crate::normalize::NEED_INPUT,
    );

    let mut user = String::new();
    let _ = writeln!(user, "Request:\n{}\n", request.trim());
    let _ = writeln!(user, "References:\n{}\n", render_context(refs));
    match format {
        OutputFormat::Markdown => {
            let _ = writeln!(
                user,
                "Output: markdown. Start with '### {} Draft' and end with a '## References' list.",
                section.token()
            );
        }
        OutputFormat::Yaml | OutputFormat::Json => {
            let _ = writeln!(
                user,
                "Output: a single fenced ```{fmt} block containing one mapping.",
                fmt = format.as_str()
            );
            if !fields.is_empty() {
                let _ = writeln!(user, "Required keys: {}", fields.join(", "));
            }
            let _ = writeln!(user, "Add a References list with doc, section, page and para_id for each citation.");
        }
    }

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatRole;

    fn citation(source: &str, page: Option<&str>) -> Citation {
        Citation {
            source: source.into(),
            section: None,
            page: page.map(Into::into),
            para_id: None,
            snippet: "text".into(),
            score: 0.9,
        }
    }

    #[test]
    fn context_is_numbered() {
        let ctx = render_context(&[citation("ICH M4S", Some("12")), citation("MFDS", None)]);
        assert!(ctx.starts_with("[CIT-1] ICH M4S p.12\ntext"));
        assert!(ctx.contains("[CIT-2] MFDS\ntext"));
    }

    #[test]
    fn empty_context_is_explicit() {
        assert_eq!(render_context(&[]), "(no references available)");
    }

    #[test]
    fn generation_prompt_mentions_section_and_fields() {
        let msgs = generation_messages(
            Section::NonclinicalSummary,
            "write it",
            &[],
            OutputFormat::Yaml,
            &["WrittenSummary".to_string()],
            "ko",
        );
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::System);
        assert!(msgs[0].content.contains("M2.6"));
        assert!(msgs[1].content.contains("```yaml"));
        assert!(msgs[1].content.contains("Required keys: WrittenSummary"));
    }

    #[test]
    fn router_prompt_embeds_request() {
        let (system, user) = router_messages("M2.7 summary");
        assert!(system.contains("JSON"));
        assert!(user.starts_with("Request:\nM2.7 summary"));
    }
}
