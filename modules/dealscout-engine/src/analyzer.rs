//! Qualitative candidate analysis via the language model.
//!
//! The model's reply is schema-constrained; what comes back still goes
//! through `validate_response` before it becomes a typed record.

use ai_client::Claude;
use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::info;

use dealscout_common::{
    AnalysisRecord, CandidateContext, CandidateKey, DealScoutError, Recommendation,
};

/// What the model returns for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisResponse {
    /// How the company makes money, in two or three sentences
    pub business_model: String,
    /// Competitive position in its market
    pub market_position: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub opportunities: Vec<String>,
    pub threats: Vec<String>,
    /// Acquisition attractiveness from 1 (avoid) to 10 (exceptional)
    pub fit_score: i32,
    /// One of "pursue", "watch", or "pass"
    pub recommendation: String,
    /// Why this recommendation, in plain language
    pub rationale: String,
}

#[async_trait]
pub trait CandidateAnalyzer: Send + Sync {
    async fn analyze(&self, context: &CandidateContext) -> Result<AnalysisRecord>;
}

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are an acquisition analyst screening small and mid-sized companies for a buy-side mandate.

You receive one company per request: its financial profile and whatever public web signals were gathered (homepage excerpt, about page, product pages, search results). Assess it as an acquisition candidate.

## What to produce
- **business_model**: how the company actually makes money. Infer from the web signals; if they are thin, say what the financials suggest and flag the uncertainty.
- **market_position**: where it sits relative to competitors: niche leader, commodity player, regional specialist, and so on.
- **strengths / weaknesses / opportunities / threats**: three to five short bullet points each, specific to this company. No generic filler.
- **fit_score**: 1-10. Anchor points: 3 = would not shortlist, 5 = worth a second look, 8 = strong candidate for outreach.
- **recommendation**: "pursue" (contact now), "watch" (revisit next quarter), or "pass".
- **rationale**: two or three sentences connecting the financials and signals to the recommendation.

## Ground rules
- Reason only from the material provided. Do not invent customers, products, or figures.
- Low digital presence is information, not disqualification: many good industrial targets barely have a website.
- Thin margins with strong growth can still be a pursue; strong margins with shrinking revenue usually are not."#;

pub struct ClaudeAnalyzer {
    claude: Claude,
}

impl ClaudeAnalyzer {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            claude: Claude::new(api_key, model),
        }
    }
}

#[async_trait]
impl CandidateAnalyzer for ClaudeAnalyzer {
    async fn analyze(&self, context: &CandidateContext) -> Result<AnalysisRecord> {
        let prompt = render_prompt(context);

        let response: AnalysisResponse =
            self.claude.extract(ANALYSIS_SYSTEM_PROMPT, &prompt).await?;

        let record = validate_response(context.identity.key.clone(), response)?;
        info!(
            key = %record.key,
            fit_score = record.fit_score,
            recommendation = %record.recommendation,
            "Candidate analyzed"
        );
        Ok(record)
    }
}

const RESEARCH_EXCERPT_BUDGET: usize = 1_500;
const SNIPPETS_IN_PROMPT: usize = 2;

/// Render the per-candidate prompt. Deterministic: the same context always
/// produces the same text, so reruns are comparable.
pub fn render_prompt(context: &CandidateContext) -> String {
    let identity = &context.identity;
    let fin = &context.financials;

    let mut prompt = String::new();
    let _ = writeln!(prompt, "Company: {} (org {})", identity.name, identity.key);
    let _ = writeln!(prompt, "\n## Financial profile");
    let _ = writeln!(prompt, "Revenue: {} NOK", fin.revenue);
    match fin.operating_margin {
        Some(margin) => {
            let _ = writeln!(prompt, "Operating margin: {:.1}%", margin * 100.0);
        }
        None => {
            let _ = writeln!(prompt, "Operating margin: unknown");
        }
    }
    match fin.revenue_growth {
        Some(growth) => {
            let _ = writeln!(prompt, "Revenue growth: {:.1}%", growth * 100.0);
        }
        None => {
            let _ = writeln!(prompt, "Revenue growth: unknown");
        }
    }
    if let Some(employees) = fin.employees {
        let _ = writeln!(prompt, "Employees: {employees}");
    }
    if let Some(ref code) = fin.industry_code {
        let _ = writeln!(prompt, "Industry code: {code}");
    }

    match context.research {
        Some(ref research) => {
            let _ = writeln!(
                prompt,
                "\n## Web signals (digital score {}/100)",
                research.digital_score
            );
            if let Some(ref text) = research.homepage_text {
                let _ = writeln!(prompt, "\nHomepage excerpt:\n{}", excerpt(text));
            }
            if let Some(ref text) = research.about_text {
                let _ = writeln!(prompt, "\nAbout page:\n{}", excerpt(text));
            }
            if let Some(ref text) = research.products_text {
                let _ = writeln!(prompt, "\nProducts/services page:\n{}", excerpt(text));
            }
            for (query, snippets) in &research.search_snippets {
                if snippets.is_empty() {
                    continue;
                }
                let _ = writeln!(prompt, "\nSearch results for \"{query}\":");
                for snippet in snippets.iter().take(SNIPPETS_IN_PROMPT) {
                    let _ = writeln!(prompt, "- {}: {}", snippet.title, snippet.snippet);
                }
            }
        }
        None => {
            let _ = writeln!(prompt, "\n## Web signals\nNone gathered for this candidate.");
        }
    }

    prompt
}

fn excerpt(text: &str) -> &str {
    if text.len() <= RESEARCH_EXCERPT_BUDGET {
        return text;
    }
    let mut end = RESEARCH_EXCERPT_BUDGET;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Turn a raw model response into a typed record. An unknown recommendation
/// is a validation failure; an out-of-range fit score is clamped into [1,10].
pub fn validate_response(
    key: CandidateKey,
    response: AnalysisResponse,
) -> Result<AnalysisRecord, DealScoutError> {
    let recommendation: Recommendation = response.recommendation.parse()?;
    let fit_score = response.fit_score.clamp(1, 10) as i16;

    Ok(AnalysisRecord {
        key,
        business_model: response.business_model,
        market_position: response.market_position,
        strengths: response.strengths,
        weaknesses: response.weaknesses,
        opportunities: response.opportunities,
        threats: response.threats,
        fit_score,
        recommendation,
        rationale: response.rationale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context_with_research, financials, identity};
    use dealscout_common::ResearchRecord;

    fn response(fit_score: i32, recommendation: &str) -> AnalysisResponse {
        AnalysisResponse {
            business_model: "Sells valves.".to_string(),
            market_position: "Regional specialist.".to_string(),
            strengths: vec!["Recurring service revenue".to_string()],
            weaknesses: vec!["Key-person risk".to_string()],
            opportunities: vec!["Export".to_string()],
            threats: vec!["Consolidation".to_string()],
            fit_score,
            recommendation: recommendation.to_string(),
            rationale: "Solid niche.".to_string(),
        }
    }

    #[test]
    fn valid_response_becomes_a_record() {
        let record = validate_response("911111111".into(), response(7, "pursue")).unwrap();
        assert_eq!(record.fit_score, 7);
        assert_eq!(record.recommendation, Recommendation::Pursue);
    }

    #[test]
    fn fit_score_is_clamped_into_range() {
        assert_eq!(
            validate_response("x".into(), response(0, "watch")).unwrap().fit_score,
            1
        );
        assert_eq!(
            validate_response("x".into(), response(42, "watch")).unwrap().fit_score,
            10
        );
        assert_eq!(
            validate_response("x".into(), response(-3, "pass")).unwrap().fit_score,
            1
        );
    }

    #[test]
    fn unknown_recommendation_is_rejected() {
        let err = validate_response("x".into(), response(5, "acquire immediately")).unwrap_err();
        assert!(matches!(err, DealScoutError::Validation(_)));
    }

    #[test]
    fn prompt_is_deterministic() {
        let ctx = context_with_research(
            identity("911111111", "Alpha AS", Some("https://alpha.no")),
            financials(25_000_000, Some(0.08), Some(0.22)),
            Some(ResearchRecord::empty("911111111".into(), None)),
        );
        assert_eq!(render_prompt(&ctx), render_prompt(&ctx));
    }

    #[test]
    fn prompt_includes_financials_and_research_sections() {
        let mut research = ResearchRecord::empty("911111111".into(), None);
        research.homepage_text = Some("Valves for aquaculture.".to_string());
        research.digital_score = 45;

        let ctx = context_with_research(
            identity("911111111", "Alpha AS", Some("https://alpha.no")),
            financials(25_000_000, Some(0.08), Some(0.22)),
            Some(research),
        );
        let prompt = render_prompt(&ctx);

        assert!(prompt.contains("Alpha AS"));
        assert!(prompt.contains("Revenue: 25000000 NOK"));
        assert!(prompt.contains("Operating margin: 8.0%"));
        assert!(prompt.contains("Revenue growth: 22.0%"));
        assert!(prompt.contains("digital score 45/100"));
        assert!(prompt.contains("Valves for aquaculture."));
    }

    #[test]
    fn prompt_marks_missing_research() {
        let ctx = context_with_research(
            identity("911111111", "Alpha AS", None),
            financials(25_000_000, None, None),
            None,
        );
        let prompt = render_prompt(&ctx);
        assert!(prompt.contains("None gathered"));
        assert!(prompt.contains("Operating margin: unknown"));
    }
}
