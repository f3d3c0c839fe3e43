//! Prompt templates for the four extraction stages.
//!
//! Every prompt ends with the article text so the instructions stay within
//! the provider's attention window even for long inputs.

use rumina_common::StageName;

/// Appended to the combined text when it was cut to fit `max_input_chars`.
pub const TRUNCATION_MARKER: &str = "\n\n[Article truncated]";

/// Output-token ceiling requested for each stage.
pub fn max_output_tokens(stage: StageName) -> u32 {
    match stage {
        StageName::Clean     => 8192,
        StageName::Summary   => 4096,
        StageName::Molecules => 4096,
        StageName::Topics    => 2048,
    }
}

/// Sum of all stage output ceilings, used by token estimation.
pub fn total_output_ceiling() -> u64 {
    StageName::ALL.iter().map(|s| max_output_tokens(*s) as u64).sum()
}

const GROUNDING: &str = "Use ONLY information stated in the article text below. \
Do not add facts, compounds, numbers or conclusions from outside knowledge. \
If the article does not report something, leave it out.";

pub fn clean(article: &str) -> String {
    format!(
        "You are a scientific text cleaning assistant. Clean and format this scientific article text.

Remove:
- XML artifacts and encoding problems
- Excess whitespace and broken line wrapping
- Mentions of figures or tables that are not included (\"Figure 1\", \"Table 2\")
- Copyright notices, publication metadata and author information blocks

Keep:
- All scientific content, including chemical names and formulas
- Experimental methods, results and every measurement

Return only the cleaned text, in readable paragraphs. Do not summarise.

Article text:
{article}"
    )
}

pub fn summary(cleaned: &str, doc_id: &str) -> String {
    format!(
        "You are a scientific writer. Write a comprehensive 1-2 page summary of this article covering:

1. Background and context: what problem the research addresses
2. Research objectives: the specific goals or hypotheses
3. Methods: experimental design, subjects, treatments, measurements
4. Key findings: the main results
5. Mechanisms: how the authors explain the effects they observed
6. Significance: why the findings matter for the field
7. Limitations and future directions

{GROUNDING}

Write clear technical prose for researchers in the field.

Document: {doc_id}

Article text:
{cleaned}"
    )
}

pub fn molecules(cleaned: &str) -> String {
    format!(
        "You are a chemistry expert identifying chemical compounds in scientific literature.

Extract every chemical compound, molecule, substrate, additive, metabolite, gas, enzyme, mineral,
vitamin, acid or named feed ingredient mentioned in the article.

List each name exactly as it is written in the article. {GROUNDING}

Return ONLY a JSON array of strings:
[\"molecule1\", \"molecule2\", ...]

Article text:
{cleaned}"
    )
}

pub fn topics(cleaned: &str, doc_id: &str) -> String {
    format!(
        "You are a research librarian. Analyse this article and extract:

1. topics: 5-8 short category tags (1-3 words, hyphenated, e.g. \"methane-reduction\")
2. keywords: 10-15 specific scientific terms or key phrases, copied exactly as they appear in the text

{GROUNDING}

Return ONLY valid JSON:
{{\"id\": \"{doc_id}\", \"topics\": [\"topic-1\", ...], \"keywords\": [\"keyword 1\", ...]}}

Article text:
{cleaned}"
    )
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_input(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..byte_idx]), true),
        None => (text.to_string(), false),
    }
}
