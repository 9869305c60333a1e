//! Instruction templates sent to the generative model.

use crate::model::{AnalyzedArticle, ArticleCandidate};

pub const EXTRACTION_PREAMBLE: &str =
    "You are a clinical information extraction assistant working on pediatric oncology cases.";

pub const ANALYSIS_PREAMBLE: &str =
    "You are a medical research analyst specializing in clinical literature review.";

pub const SYNTHESIS_PREAMBLE: &str = "You are a medical research analyst preparing evidence-based \
treatment considerations for a treating physician. You never invent references.";

pub const CHAT_PREAMBLE: &str = "You are a medical research assistant helping a physician reason \
about a patient case and the literature retrieved for it. Be precise and cite PMIDs when you \
refer to an article.";

pub const REDACTION_PREAMBLE: &str = "You remove personally identifying information from clinical \
notes. Replace names, dates of birth, addresses, phone numbers, record numbers and other \
identifiers with bracketed placeholders such as [NAME] or [DATE]. Keep all clinical content \
unchanged. Return only the redacted text.";

/// Placeholder a user event template uses to position the case notes.
pub const CASE_PLACEHOLDER: &str = "{case}";

pub fn disease_prompt(case_text: &str) -> String {
    format!(
        "Identify the primary disease or diagnosis described in the following case notes.
Return only the disease name, with no explanation and no punctuation around it.

Case notes:
{case_text}

Disease:"
    )
}

pub const DEFAULT_EVENTS_TEMPLATE: &str = "List the clinically relevant events in the case notes \
below in chronological order: diagnoses, genomic findings, treatments, responses, relapses and \
complications. Keep each event short and self-contained.
Return only a JSON array of strings, nothing else.

Case notes:
{case}

Events (JSON array only):";

/// Fills a user-supplied event template with the case text.
///
/// Templates without the `{case}` placeholder get the notes appended.
pub fn events_prompt(template: Option<&str>, case_text: &str) -> String {
    let template = template
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_EVENTS_TEMPLATE);
    if template.contains(CASE_PLACEHOLDER) {
        template.replace(CASE_PLACEHOLDER, case_text)
    } else {
        format!("{template}\n\nCase notes:\n{case_text}")
    }
}

pub fn article_prompt(
    article: &ArticleCandidate,
    content: &str,
    disease: &str,
    events: &[String],
    methodology: Option<&str>,
) -> String {
    let methodology = methodology
        .filter(|m| !m.trim().is_empty())
        .map(|m| format!("\nReview methodology to apply:\n{m}\n"))
        .unwrap_or_default();
    format!(
        r#"Assess whether the research article below is relevant to the patient case.
{methodology}
Patient disease: {disease}
Clinical events:
{events}

Article PMID {id}: {title}
{content}

Respond with a JSON object and nothing else:
{{"relevance_summary": "<two or three sentences on why the article matters, or does not, for this case>",
  "evidence": ["<each concrete finding from the article that bears on treatment>"]}}"#,
        events = bullet_list(events),
        id = article.id,
        title = article.title,
    )
}

pub fn synthesis_prompt(
    case_notes: &str,
    disease: &str,
    events: &[String],
    articles: &[AnalyzedArticle],
) -> String {
    let articles_text = if articles.is_empty() {
        "No analyzed articles are available.".to_string()
    } else {
        articles
            .iter()
            .map(|article| {
                format!(
                    "[PMID:{}] {}\nRelevance: {}\nEvidence:\n{}",
                    article.id(),
                    article.candidate.title,
                    article.relevance_summary,
                    bullet_list(&article.extracted_evidence)
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n")
    };

    format!(
        "Review the patient case and the analyzed research articles.
Recommend treatment options and the best course of action supported by the evidence.
Cite an article every time you rely on it, using exactly the form [PMID:<id>], and only cite
articles listed below.

Case notes:
{case_notes}

Primary diagnosis: {disease}
Clinical events:
{events}

Analyzed articles:
{articles_text}

Recommendation:",
        events = bullet_list(events),
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}
