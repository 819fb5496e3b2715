// Copyright 2025 Spanscore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Scorer dispatch: turning resolved variables into score results.
//!
//! The lifecycle manager only consumes the [`ScorerDispatch`] trait. The
//! shipped [`StrategyScorer`] routes on the config variant: regex and the
//! builtin heuristics run locally, LLM-judge configs go through an
//! [`LlmClient`]. For judge calls the rendered prompt and both raw and
//! parsed responses are carried on success *and* failure, so every span
//! keeps an auditable record of what was sent and received.

use crate::llm::{CompletionParams, LlmClient, LlmError};
use async_trait::async_trait;
use serde_json::Value;
use spanscore_core::{
    BuiltinScorerConfig, BuiltinScorerName, ChatMessage, LlmScorerConfig, OutputFieldType,
    RegexScorerConfig, ResolvedVariable, ResponseFormat, ScoreResult, ScoreValue, ScorerConfig,
    ScorerType,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A successful scoring attempt.
#[derive(Debug, Clone, Default)]
pub struct ScorerOutput {
    pub score_results: Vec<ScoreResult>,
    pub prompt_sent: Option<String>,
    pub raw_response: Option<String>,
    pub parsed_response: Option<Value>,
}

/// A failed scoring attempt, still carrying whatever audit material was
/// produced before the failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ScoreFailure {
    pub error: ScorerError,
    pub prompt_sent: Option<String>,
    pub raw_response: Option<String>,
}

impl ScoreFailure {
    fn bare(error: ScorerError) -> Self {
        Self {
            error,
            prompt_sent: None,
            raw_response: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("scorer config variant is {found} but evaluator expects {expected}")]
    VariantMismatch {
        expected: ScorerType,
        found: ScorerType,
    },

    /// No resolved variable was available to score.
    #[error("no resolved variable to score")]
    NoInput,

    #[error("invalid regex pattern: {0}")]
    Pattern(String),

    #[error("no LLM client configured for llm scorer")]
    NoLlmClient,

    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The judge responded, but its output does not satisfy the configured
    /// output schema.
    #[error("judge output rejected: {0}")]
    OutputSchema(String),
}

impl ScorerError {
    /// Execution-fatal errors abort the whole execution; everything else is
    /// a span-level failure.
    pub fn is_execution_fatal(&self) -> bool {
        match self {
            ScorerError::Llm(e) => e.is_execution_fatal(),
            ScorerError::NoLlmClient => true,
            _ => false,
        }
    }
}

/// External-collaborator boundary: `score(config, variables)` as consumed by
/// the lifecycle manager and the dry-run pipeline.
#[async_trait]
pub trait ScorerDispatch: Send + Sync {
    async fn score(
        &self,
        expected: ScorerType,
        config: &ScorerConfig,
        variables: &[ResolvedVariable],
    ) -> Result<ScorerOutput, ScoreFailure>;
}

/// Default dispatcher: routes on the active config variant.
pub struct StrategyScorer {
    llm: Option<Arc<dyn LlmClient>>,
}

impl StrategyScorer {
    /// Regex and builtin scoring only; llm configs fail with
    /// [`ScorerError::NoLlmClient`].
    pub fn new() -> Self {
        Self { llm: None }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm: Some(llm) }
    }
}

impl Default for StrategyScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScorerDispatch for StrategyScorer {
    async fn score(
        &self,
        expected: ScorerType,
        config: &ScorerConfig,
        variables: &[ResolvedVariable],
    ) -> Result<ScorerOutput, ScoreFailure> {
        if config.scorer_type() != expected {
            return Err(ScoreFailure::bare(ScorerError::VariantMismatch {
                expected,
                found: config.scorer_type(),
            }));
        }

        match config {
            ScorerConfig::Regex(c) => score_regex(c, variables).map_err(ScoreFailure::bare),
            ScorerConfig::Builtin(c) => score_builtin(c, variables).map_err(ScoreFailure::bare),
            ScorerConfig::Llm(c) => match &self.llm {
                Some(client) => score_llm(client.as_ref(), c, variables).await,
                None => Err(ScoreFailure::bare(ScorerError::NoLlmClient)),
            },
        }
    }
}

/// Stringify a resolved value for text scorers. Strings are used as-is so
/// regexes see the raw text, not a quoted JSON literal.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The text a regex/builtin scorer operates on: the named variable when the
/// config selects one, otherwise the first resolved variable.
fn scorable_text(
    variables: &[ResolvedVariable],
    selected: Option<&str>,
) -> Result<String, ScorerError> {
    let var = match selected {
        Some(name) => variables
            .iter()
            .find(|v| v.variable_name == name && v.is_resolved()),
        None => variables.iter().find(|v| v.is_resolved()),
    };
    var.map(|v| value_text(&v.resolved_value))
        .ok_or(ScorerError::NoInput)
}

fn score_regex(
    config: &RegexScorerConfig,
    variables: &[ResolvedVariable],
) -> Result<ScorerOutput, ScorerError> {
    let pattern =
        regex::Regex::new(&config.pattern).map_err(|e| ScorerError::Pattern(e.to_string()))?;
    let text = scorable_text(variables, None)?;

    let mut results = Vec::new();
    match pattern.captures(&text) {
        Some(captures) => {
            results.push(ScoreResult::numeric(config.score_name.as_str(), config.match_score));
            if let Some(group) = &config.capture_group {
                if let Some(matched) = captures.name(group) {
                    results.push(ScoreResult::text(group.clone(), matched.as_str()));
                }
            }
        }
        None => {
            results.push(ScoreResult::numeric(
                config.score_name.as_str(),
                config.no_match_score,
            ));
        }
    }

    Ok(ScorerOutput {
        score_results: results,
        ..Default::default()
    })
}

fn score_builtin(
    config: &BuiltinScorerConfig,
    variables: &[ResolvedVariable],
) -> Result<ScorerOutput, ScorerError> {
    let selected = config.config.get("variable").and_then(Value::as_str);
    let text = scorable_text(variables, selected)?;

    let results = match config.scorer_name {
        BuiltinScorerName::Contains => {
            let needle = config
                .config
                .get("substring")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let case_sensitive = config
                .config
                .get("case_sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let hit = if case_sensitive {
                text.contains(needle)
            } else {
                text.to_lowercase().contains(&needle.to_lowercase())
            };
            vec![ScoreResult::boolean("contains", hit)]
        }
        BuiltinScorerName::JsonValid => {
            let valid = serde_json::from_str::<Value>(&text).is_ok();
            vec![ScoreResult::boolean("json_valid", valid)]
        }
        BuiltinScorerName::LengthCheck => {
            let len = text.chars().count() as f64;
            let min = config
                .config
                .get("min_length")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let max = config
                .config
                .get("max_length")
                .and_then(Value::as_f64)
                .unwrap_or(f64::INFINITY);
            vec![
                ScoreResult::boolean("length_ok", len >= min && len <= max),
                ScoreResult::numeric("length", len),
            ]
        }
        BuiltinScorerName::Sentiment => {
            vec![ScoreResult::numeric("sentiment", sentiment_score(&text))]
        }
        BuiltinScorerName::Toxicity => {
            vec![ScoreResult::numeric("toxicity", toxicity_score(&text))]
        }
    };

    Ok(ScorerOutput {
        score_results: results,
        ..Default::default()
    })
}

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "helpful", "thanks", "thank", "perfect", "love", "works",
    "resolved", "happy",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "useless", "broken", "wrong", "hate", "angry", "frustrated",
    "refund", "cancel",
];

const TOXIC_KEYWORDS: &[&str] = &[
    "hate", "racist", "sexist", "bigot", "slur", "kill", "murder", "attack", "harm", "threaten",
    "bully", "harass", "stalk",
];

fn whole_word_hits(text_lower: &str, words: &[&str]) -> usize {
    words
        .iter()
        .filter(|word| {
            text_lower
                .split(|c: char| !c.is_alphanumeric() && c != '-')
                .any(|token| token == **word)
        })
        .count()
}

/// Keyword sentiment in [-1, 1]: balance of positive vs negative hits.
fn sentiment_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let pos = whole_word_hits(&lower, POSITIVE_WORDS) as f64;
    let neg = whole_word_hits(&lower, NEGATIVE_WORDS) as f64;
    if pos + neg == 0.0 {
        0.0
    } else {
        (pos - neg) / (pos + neg)
    }
}

/// Keyword toxicity in [0, 1]: each whole-word hit adds 0.2, capped.
fn toxicity_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    (whole_word_hits(&lower, TOXIC_KEYWORDS) as f64 * 0.2).min(1.0)
}

/// Substitute `{{name}}` placeholders with resolved values. Unresolved
/// variables render as the empty string; unknown placeholders are left
/// intact so they stay visible in previews and audit prompts.
pub fn render_template(template: &str, variables: &[ResolvedVariable]) -> String {
    let mut rendered = template.to_string();
    for var in variables {
        let placeholder = format!("{{{{{}}}}}", var.variable_name);
        let replacement = if var.resolved_value.is_null() {
            String::new()
        } else {
            value_text(&var.resolved_value)
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

/// Render the configured messages with variables substituted. The JSON form
/// of this is what gets persisted as `prompt_sent`.
pub fn render_messages(config: &LlmScorerConfig, variables: &[ResolvedVariable]) -> Vec<ChatMessage> {
    config
        .messages
        .iter()
        .map(|m| ChatMessage::new(m.role.clone(), render_template(&m.content, variables)))
        .collect()
}

async fn score_llm(
    client: &dyn LlmClient,
    config: &LlmScorerConfig,
    variables: &[ResolvedVariable],
) -> Result<ScorerOutput, ScoreFailure> {
    let messages = render_messages(config, variables);
    let prompt_sent = serde_json::to_string(&messages).ok();

    let params = CompletionParams {
        model: config.model.clone(),
        temperature: config.temperature,
        response_format: config.response_format,
    };

    let response = match client.complete(&messages, &params).await {
        Ok(r) => r,
        Err(e) => {
            return Err(ScoreFailure {
                error: e.into(),
                prompt_sent,
                raw_response: None,
            })
        }
    };
    let raw = response.content.clone();
    debug!(model = %response.model, "judge responded");

    if config.response_format == ResponseFormat::Text {
        return Ok(ScorerOutput {
            score_results: vec![ScoreResult::text("output", raw.clone())],
            prompt_sent,
            raw_response: Some(raw),
            parsed_response: None,
        });
    }

    let parsed: Value = match response.as_json() {
        Ok(v) => v,
        Err(e) => {
            return Err(ScoreFailure {
                error: ScorerError::OutputSchema(format!("not valid JSON: {e}")),
                prompt_sent,
                raw_response: Some(raw),
            })
        }
    };

    match extract_schema_scores(config, &parsed) {
        Ok(score_results) => Ok(ScorerOutput {
            score_results,
            prompt_sent,
            raw_response: Some(raw),
            parsed_response: Some(parsed),
        }),
        Err(e) => Err(ScoreFailure {
            error: e,
            prompt_sent,
            raw_response: Some(raw),
        }),
    }
}

/// Check the parsed judge output against the output schema and collect one
/// score per field. With an empty schema, every top-level primitive becomes
/// a score.
fn extract_schema_scores(
    config: &LlmScorerConfig,
    parsed: &Value,
) -> Result<Vec<ScoreResult>, ScorerError> {
    let object = parsed
        .as_object()
        .ok_or_else(|| ScorerError::OutputSchema("expected a JSON object".to_string()))?;

    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string);
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| (0.0..=1.0).contains(c));

    let mut results = Vec::new();

    if config.output_schema.is_empty() {
        for (name, value) in object {
            if name.as_str() == "reasoning" || name.as_str() == "confidence" {
                continue;
            }
            let score_value = match value {
                Value::Number(n) => n.as_f64().map(ScoreValue::Number),
                Value::Bool(b) => Some(ScoreValue::Bool(*b)),
                Value::String(s) => Some(ScoreValue::Text(s.clone())),
                _ => None,
            };
            if let Some(v) = score_value {
                results.push(ScoreResult {
                    score_name: name.clone(),
                    value: v,
                    reasoning: reasoning.clone(),
                    confidence,
                });
            }
        }
        return Ok(results);
    }

    for field in &config.output_schema {
        let value = object
            .get(&field.name)
            .ok_or_else(|| ScorerError::OutputSchema(format!("missing field '{}'", field.name)))?;

        let score_value = match field.field_type {
            OutputFieldType::Numeric => {
                let n = value.as_f64().ok_or_else(|| {
                    ScorerError::OutputSchema(format!("field '{}' is not numeric", field.name))
                })?;
                if let Some(min) = field.min_value {
                    if n < min {
                        return Err(ScorerError::OutputSchema(format!(
                            "field '{}' value {n} below minimum {min}",
                            field.name
                        )));
                    }
                }
                if let Some(max) = field.max_value {
                    if n > max {
                        return Err(ScorerError::OutputSchema(format!(
                            "field '{}' value {n} above maximum {max}",
                            field.name
                        )));
                    }
                }
                ScoreValue::Number(n)
            }
            OutputFieldType::Categorical => {
                let s = value.as_str().ok_or_else(|| {
                    ScorerError::OutputSchema(format!("field '{}' is not a string", field.name))
                })?;
                if let Some(categories) = &field.categories {
                    if !categories.iter().any(|c| c == s) {
                        return Err(ScorerError::OutputSchema(format!(
                            "field '{}' value '{s}' is not an allowed category",
                            field.name
                        )));
                    }
                }
                ScoreValue::Text(s.to_string())
            }
            OutputFieldType::Boolean => {
                let b = value.as_bool().ok_or_else(|| {
                    ScorerError::OutputSchema(format!("field '{}' is not a boolean", field.name))
                })?;
                ScoreValue::Bool(b)
            }
        };

        results.push(ScoreResult {
            score_name: field.name.clone(),
            value: score_value,
            reasoning: reasoning.clone(),
            confidence,
        });
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use serde_json::json;
    use spanscore_core::{OutputField, VariableSource};

    fn var(name: &str, value: Value) -> ResolvedVariable {
        ResolvedVariable {
            variable_name: name.to_string(),
            source: VariableSource::SpanOutput,
            json_path: Some("text".to_string()),
            resolved_value: value,
        }
    }

    fn regex_config(pattern: &str) -> ScorerConfig {
        ScorerConfig::Regex(RegexScorerConfig::new(pattern, "ok"))
    }

    #[tokio::test]
    async fn regex_scores_match_and_no_match() {
        let scorer = StrategyScorer::new();

        let output = scorer
            .score(ScorerType::Regex, &regex_config("^OK$"), &[var("answer", json!("OK"))])
            .await
            .unwrap();
        assert_eq!(output.score_results[0].value, ScoreValue::Number(1.0));

        let output = scorer
            .score(ScorerType::Regex, &regex_config("^OK$"), &[var("answer", json!("FAIL"))])
            .await
            .unwrap();
        assert_eq!(output.score_results[0].value, ScoreValue::Number(0.0));
    }

    #[tokio::test]
    async fn regex_capture_group_adds_a_text_score() {
        let mut config = RegexScorerConfig::new(r"grade: (?P<grade>[A-F])", "graded");
        config.capture_group = Some("grade".to_string());
        let scorer = StrategyScorer::new();

        let output = scorer
            .score(
                ScorerType::Regex,
                &ScorerConfig::Regex(config),
                &[var("answer", json!("grade: B overall"))],
            )
            .await
            .unwrap();

        assert_eq!(output.score_results.len(), 2);
        assert_eq!(output.score_results[1].score_name, "grade");
        assert_eq!(output.score_results[1].value, ScoreValue::Text("B".to_string()));
    }

    #[tokio::test]
    async fn variant_mismatch_is_rejected_before_scoring() {
        let scorer = StrategyScorer::new();
        let failure = scorer
            .score(ScorerType::Llm, &regex_config("^OK$"), &[var("answer", json!("OK"))])
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ScorerError::VariantMismatch { .. }));
    }

    #[tokio::test]
    async fn unresolved_variables_leave_nothing_to_score() {
        let scorer = StrategyScorer::new();
        let failure = scorer
            .score(ScorerType::Regex, &regex_config("^OK$"), &[var("answer", Value::Null)])
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ScorerError::NoInput));
        assert!(!failure.error.is_execution_fatal());
    }

    #[tokio::test]
    async fn builtin_contains_and_json_valid() {
        let scorer = StrategyScorer::new();

        let contains = ScorerConfig::Builtin(
            BuiltinScorerConfig::new(BuiltinScorerName::Contains)
                .with_option("substring", json!("refund")),
        );
        let output = scorer
            .score(
                ScorerType::Builtin,
                &contains,
                &[var("answer", json!("We issued a refund today"))],
            )
            .await
            .unwrap();
        assert_eq!(output.score_results[0].value, ScoreValue::Bool(true));

        let json_valid = ScorerConfig::Builtin(BuiltinScorerConfig::new(BuiltinScorerName::JsonValid));
        let output = scorer
            .score(
                ScorerType::Builtin,
                &json_valid,
                &[var("answer", json!("{\"a\": 1}"))],
            )
            .await
            .unwrap();
        assert_eq!(output.score_results[0].value, ScoreValue::Bool(true));
    }

    #[tokio::test]
    async fn builtin_length_check_reports_length() {
        let scorer = StrategyScorer::new();
        let config = ScorerConfig::Builtin(
            BuiltinScorerConfig::new(BuiltinScorerName::LengthCheck)
                .with_option("min_length", json!(3))
                .with_option("max_length", json!(5)),
        );
        let output = scorer
            .score(ScorerType::Builtin, &config, &[var("answer", json!("abcd"))])
            .await
            .unwrap();
        assert_eq!(output.score_results[0].value, ScoreValue::Bool(true));
        assert_eq!(output.score_results[1].value, ScoreValue::Number(4.0));
    }

    #[test]
    fn sentiment_and_toxicity_heuristics() {
        assert!(sentiment_score("this is great, thanks!") > 0.0);
        assert!(sentiment_score("terrible, I want a refund") < 0.0);
        assert_eq!(sentiment_score("neutral statement"), 0.0);

        assert_eq!(toxicity_score("a perfectly pleasant reply"), 0.0);
        assert!(toxicity_score("I will attack and harass you") > 0.0);
    }

    #[test]
    fn template_rendering_substitutes_and_preserves_unknowns() {
        let vars = vec![var("answer", json!("42")), var("missing", Value::Null)];
        let rendered = render_template("Q: {{question}} A: {{answer}} M: {{missing}}", &vars);
        assert_eq!(rendered, "Q: {{question}} A: 42 M: ");
    }

    struct CannedJudge {
        content: String,
    }

    #[async_trait]
    impl LlmClient for CannedJudge {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: self.content.clone(),
                model: "canned".to_string(),
                usage: None,
            })
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn llm_config(schema: Vec<OutputField>) -> ScorerConfig {
        ScorerConfig::Llm(LlmScorerConfig {
            credential_id: "cred".to_string(),
            model: "canned".to_string(),
            messages: vec![ChatMessage::new("user", "Rate {{answer}}.")],
            temperature: 0.0,
            response_format: ResponseFormat::Json,
            output_schema: schema,
        })
    }

    #[tokio::test]
    async fn llm_scorer_extracts_schema_fields_and_keeps_audit() {
        let judge = Arc::new(CannedJudge {
            content: r#"{"quality": 4, "reasoning": "clear and correct", "confidence": 0.9}"#
                .to_string(),
        });
        let scorer = StrategyScorer::with_llm(judge);
        let config = llm_config(vec![OutputField::numeric("quality", 1.0, 5.0)]);

        let output = scorer
            .score(ScorerType::Llm, &config, &[var("answer", json!("the answer"))])
            .await
            .unwrap();

        assert_eq!(output.score_results[0].value, ScoreValue::Number(4.0));
        assert_eq!(
            output.score_results[0].reasoning.as_deref(),
            Some("clear and correct")
        );
        assert_eq!(output.score_results[0].confidence, Some(0.9));
        let prompt = output.prompt_sent.unwrap();
        assert!(prompt.contains("Rate the answer."));
        assert!(output.raw_response.is_some());
        assert!(output.parsed_response.is_some());
    }

    #[tokio::test]
    async fn llm_scorer_rejects_out_of_range_output_but_keeps_the_response() {
        let judge = Arc::new(CannedJudge {
            content: r#"{"quality": 9}"#.to_string(),
        });
        let scorer = StrategyScorer::with_llm(judge);
        let config = llm_config(vec![OutputField::numeric("quality", 1.0, 5.0)]);

        let failure = scorer
            .score(ScorerType::Llm, &config, &[var("answer", json!("x"))])
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ScorerError::OutputSchema(_)));
        assert!(failure.prompt_sent.is_some());
        assert_eq!(failure.raw_response.as_deref(), Some(r#"{"quality": 9}"#));
        assert!(!failure.error.is_execution_fatal());
    }

    #[tokio::test]
    async fn llm_scorer_without_a_client_is_execution_fatal() {
        let scorer = StrategyScorer::new();
        let failure = scorer
            .score(ScorerType::Llm, &llm_config(vec![]), &[var("answer", json!("x"))])
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ScorerError::NoLlmClient));
        assert!(failure.error.is_execution_fatal());
    }
}
