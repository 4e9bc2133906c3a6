//! Centralized prompt definitions for the LLM collaborator
//!
//! Prompts live in one place so they can be versioned together with the
//! intent schema in [`crate::intent`] that they describe.

/// System prompt for intent extraction.
pub const INTENT_EXTRACTION_PROMPT: &str = r#"You are a query intent parser for Louisiana census tract data.
Extract structured intent from natural language questions about census data.

Return ONLY valid JSON matching this schema:
{
  "task": "top|bottom|filter|range",
  "measure": "the measure name" or null,
  "geography": "the parish or city named in the question" or null,
  "op": ">=|<=|>|<|=" (filter only),
  "value": number (filter only),
  "range_min": number (range only),
  "range_max": number (range only),
  "limit": number (top/bottom only)
}

RULES:
- "top" means HIGHEST values, "bottom" means LOWEST values
- "over", "above", "more than" -> op ">"; "at least", "or more" -> op ">="
- "under", "below", "less than" -> op "<"; "at most", "or less" -> op "<="
- Use null for the measure or geography when the question does not name one
- In "X instead of Y" questions extract X, never Y
- Copy the place name as written; do not invent codes

Examples:

Q: "What tract has the highest median income in New Orleans?"
A: {"task": "top", "measure": "median income", "geography": "New Orleans", "limit": 1}

Q: "Give me all tracts with 20% or more African Americans"
A: {"task": "filter", "measure": "african american share", "geography": null, "op": ">=", "value": 0.2}

Q: "lowest 5 poverty rate tracts in Lafayette"
A: {"task": "bottom", "measure": "poverty rate", "geography": "Lafayette", "limit": 5}

Q: "median income between 40k and 75k in Caddo Parish"
A: {"task": "range", "measure": "median income", "geography": "Caddo Parish", "range_min": 40000, "range_max": 75000}

Q: "income under 35k in Baton Rouge"
A: {"task": "filter", "measure": "median income", "geography": "Baton Rouge", "op": "<", "value": 35000}

Q: "poverty rate over 40 percent"
A: {"task": "filter", "measure": "poverty rate", "geography": null, "op": ">", "value": 40}

Q: "now show me the poverty rate"
A: {"task": "top", "measure": "poverty rate", "geography": null, "limit": 10}

Q: "what about Caddo instead of Orleans"
A: {"task": "top", "measure": null, "geography": "Caddo", "limit": 10}"#;

/// Appended on the single retry after the model broke the schema.
pub const STRICT_RETRY_PROMPT: &str = r#"Your previous answer was not valid for the required schema.
Respond with exactly one JSON object and nothing else: no prose, no markdown fences.
"task" MUST be one of "top", "bottom", "filter", "range".
"filter" requires "value"; "range" requires both "range_min" and "range_max".
All numbers must be JSON numbers or strings such as "35k" or "20%"."#;

/// System prompt for choosing between close indicator candidates.
pub const DISAMBIGUATION_PROMPT: &str = r#"You are a US Census Bureau ACS variable expert.
The user asked for a measure and several catalog indicators matched it with similar scores.
Pick the single indicator that best answers the user's request.
Prefer general population statistics over subgroup-specific ones unless the user asked for a subgroup.

Return ONLY valid JSON:
{
  "indicator_id": "one of the listed ids",
  "rationale": "one sentence explaining the choice"
}"#;

/// Build the user message for intent extraction, including prior turns for follow-ups.
pub fn intent_user_message(question: &str, context_summary: Option<&str>) -> String {
    match context_summary {
        Some(summary) => format!(
            "{}\n\nNow extract intent from this question:\nQ: \"{}\"\nA:",
            summary, question
        ),
        None => format!("Now extract intent from this question:\nQ: \"{}\"\nA:", question),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_describe_every_task() {
        for task in ["top", "bottom", "filter", "range"] {
            assert!(INTENT_EXTRACTION_PROMPT.contains(task));
            assert!(STRICT_RETRY_PROMPT.contains(task));
        }
    }

    #[test]
    fn test_intent_user_message_with_context() {
        let message = intent_user_message("now show poverty", Some("Previous: income in Orleans"));
        assert!(message.starts_with("Previous: income in Orleans"));
        assert!(message.contains("Q: \"now show poverty\""));
    }

    #[test]
    fn test_intent_user_message_without_context() {
        let message = intent_user_message("top 5 by income", None);
        assert_eq!(
            message,
            "Now extract intent from this question:\nQ: \"top 5 by income\"\nA:"
        );
    }
}
