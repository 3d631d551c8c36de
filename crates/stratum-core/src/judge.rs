//! Query Planner / Judge: decides whether perceptual + short-term recall is
//! sufficient to answer a query, and if not, proposes supplemental queries.
//!
//! Grounded on `offline-intelligence::context_engine::retrieval_planner::RetrievalPlanner`'s
//! shape of a planning step producing a structured plan from an LLM/heuristic
//! call, narrowed to the `{sufficient, confidence, supplemental_queries}`
//! contract fixed by `spec.md` §4.6.

use crate::error::LlmError;
use crate::gateways::{CompletionOptions, LlmGateway};
use crate::json_tolerant::parse_tolerant;

#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub sufficient: bool,
    pub confidence: f32,
    pub supplemental_queries: Vec<String>,
}

impl JudgeVerdict {
    /// The safe default on any parse failure, per `spec.md` §4.6.
    fn parse_failure_default() -> Self {
        Self {
            sufficient: false,
            confidence: 0.0,
            supplemental_queries: Vec::new(),
        }
    }
}

/// Builds the judge prompt from the query, compacted recalled items, and
/// recent chat history, calls the LLM, and tolerant-parses the verdict.
pub async fn judge(
    llm: &dyn LlmGateway,
    query: &str,
    recalled_summaries: &[String],
    recent_chat_history: &[String],
) -> Result<JudgeVerdict, LlmError> {
    let prompt = build_prompt(query, recalled_summaries, recent_chat_history);
    let raw = llm.complete(&prompt, None, &CompletionOptions::default()).await?;
    Ok(parse_verdict(&raw))
}

fn build_prompt(query: &str, recalled_summaries: &[String], recent_chat_history: &[String]) -> String {
    format!(
        "Query: {query}\n\nRecalled items:\n{}\n\nRecent chat history:\n{}\n\n\
         Decide whether the recalled items are sufficient to answer the query. \
         Respond with JSON: {{\"sufficient\": bool, \"confidence\": float, \"supplemental_queries\": [string]}}",
        recalled_summaries.join("\n"),
        recent_chat_history.join("\n"),
    )
}

fn parse_verdict(raw: &str) -> JudgeVerdict {
    let Some(value) = parse_tolerant(raw) else {
        tracing::debug!(payload = %raw, "judge response parse failed; defaulting to insufficient");
        return JudgeVerdict::parse_failure_default();
    };

    let sufficient = value.get("sufficient").and_then(|v| v.as_bool()).unwrap_or(false);
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|v| v as f32)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let supplemental_queries = value
        .get("supplemental_queries")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    JudgeVerdict { sufficient, confidence, supplemental_queries }
}

/// Strip, dedupe, and assign linearly-decreasing weights
/// `max(0.3, 1.0 - i*decay)` in a single pass, per `spec.md` §4.5 step 5.
pub fn weighted_supplemental_queries(queries: &[String], decay: f32) -> Vec<(String, f32)> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for (i, raw) in queries.iter().enumerate() {
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() || !seen.insert(trimmed.clone()) {
            continue;
        }
        let weight = (1.0 - i as f32 * decay).max(0.3);
        out.push((trimmed, weight));
    }
    out
}
