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

//! Scoring strategy configuration.
//!
//! [`ScorerConfig`] is a closed tagged union: exactly one variant is active
//! per evaluator, enforced by the type itself rather than a bag of optional
//! fields. All configuration is validated at creation time so malformed
//! scorers never reach execution.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Discriminant for the scorer strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerType {
    Llm,
    Builtin,
    Regex,
}

impl fmt::Display for ScorerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScorerType::Llm => "llm",
            ScorerType::Builtin => "builtin",
            ScorerType::Regex => "regex",
        };
        write!(f, "{name}")
    }
}

/// One chat message in an LLM-judge prompt template. `content` may contain
/// `{{variable}}` placeholders filled in from resolved variables at dispatch
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Expected response shape from the judge model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Json,
    Text,
}

/// Type of a single field the judge model is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFieldType {
    Numeric,
    Categorical,
    Boolean,
}

/// Schema for one score the judge must emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: OutputFieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
}

impl OutputField {
    pub fn numeric(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            field_type: OutputFieldType::Numeric,
            min_value: Some(min),
            max_value: Some(max),
            categories: None,
        }
    }

    pub fn categorical(name: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            name: name.into(),
            field_type: OutputFieldType::Categorical,
            min_value: None,
            max_value: None,
            categories: Some(categories),
        }
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: OutputFieldType::Boolean,
            min_value: None,
            max_value: None,
            categories: None,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(ValidationError::InvalidRange {
                    field: self.name.clone(),
                    min,
                    max,
                });
            }
        }
        if self.field_type == OutputFieldType::Categorical
            && self.categories.as_ref().map_or(true, |c| c.is_empty())
        {
            return Err(ValidationError::EmptyCategories(self.name.clone()));
        }
        Ok(())
    }
}

/// LLM-as-judge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmScorerConfig {
    /// Reference to a stored provider credential; never the key itself.
    pub credential_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: f64,
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub output_schema: Vec<OutputField>,
}

impl LlmScorerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.messages.is_empty() {
            return Err(ValidationError::EmptyMessages);
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::InvalidTemperature(self.temperature));
        }
        for field in &self.output_schema {
            field.validate()?;
        }
        Ok(())
    }
}

/// Deterministic scorers shipped with the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinScorerName {
    Contains,
    JsonValid,
    LengthCheck,
    Sentiment,
    Toxicity,
}

impl fmt::Display for BuiltinScorerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuiltinScorerName::Contains => "contains",
            BuiltinScorerName::JsonValid => "json_valid",
            BuiltinScorerName::LengthCheck => "length_check",
            BuiltinScorerName::Sentiment => "sentiment",
            BuiltinScorerName::Toxicity => "toxicity",
        };
        write!(f, "{name}")
    }
}

/// Builtin scorer selection plus its free-form options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinScorerConfig {
    pub scorer_name: BuiltinScorerName,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl BuiltinScorerConfig {
    pub fn new(scorer_name: BuiltinScorerName) -> Self {
        Self {
            scorer_name,
            config: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self.scorer_name {
            BuiltinScorerName::Contains => {
                if !self.config.get("substring").map_or(false, Value::is_string) {
                    return Err(ValidationError::MissingBuiltinOption {
                        scorer: self.scorer_name.to_string(),
                        key: "substring".to_string(),
                    });
                }
            }
            BuiltinScorerName::LengthCheck => {
                let min = self.config.get("min_length").and_then(Value::as_f64);
                let max = self.config.get("max_length").and_then(Value::as_f64);
                if let (Some(min), Some(max)) = (min, max) {
                    if min > max {
                        return Err(ValidationError::InvalidRange {
                            field: "length_check".to_string(),
                            min,
                            max,
                        });
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn default_match_score() -> f64 {
    1.0
}

/// Regex match scorer. Emits `match_score` when the pattern matches the
/// scored text, `no_match_score` otherwise. When `capture_group` is set, the
/// named group's text is emitted as an additional string score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexScorerConfig {
    pub pattern: String,
    pub score_name: String,
    #[serde(default = "default_match_score")]
    pub match_score: f64,
    #[serde(default)]
    pub no_match_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_group: Option<String>,
}

impl RegexScorerConfig {
    pub fn new(pattern: impl Into<String>, score_name: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            score_name: score_name.into(),
            match_score: 1.0,
            no_match_score: 0.0,
            capture_group: None,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let compiled = regex::Regex::new(&self.pattern)
            .map_err(|e| ValidationError::InvalidPattern(e.to_string()))?;
        if let Some(group) = &self.capture_group {
            let known = compiled
                .capture_names()
                .any(|name| name == Some(group.as_str()));
            if !known {
                return Err(ValidationError::UnknownCaptureGroup(group.clone()));
            }
        }
        Ok(())
    }
}

/// The closed set of scoring strategies. The serialized form carries a
/// `type` tag matching [`ScorerType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScorerConfig {
    Llm(LlmScorerConfig),
    Builtin(BuiltinScorerConfig),
    Regex(RegexScorerConfig),
}

impl ScorerConfig {
    /// The discriminant of the active variant.
    pub fn scorer_type(&self) -> ScorerType {
        match self {
            ScorerConfig::Llm(_) => ScorerType::Llm,
            ScorerConfig::Builtin(_) => ScorerType::Builtin,
            ScorerConfig::Regex(_) => ScorerType::Regex,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ScorerConfig::Llm(c) => c.validate(),
            ScorerConfig::Builtin(c) => c.validate(),
            ScorerConfig::Regex(c) => c.validate(),
        }
    }
}

/// A single named score value produced by any scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub score_name: String,
    pub value: ScoreValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Judge self-reported confidence in [0, 1], when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ScoreResult {
    pub fn numeric(score_name: impl Into<String>, value: f64) -> Self {
        Self {
            score_name: score_name.into(),
            value: ScoreValue::Number(value),
            reasoning: None,
            confidence: None,
        }
    }

    pub fn text(score_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            score_name: score_name.into(),
            value: ScoreValue::Text(value.into()),
            reasoning: None,
            confidence: None,
        }
    }

    pub fn boolean(score_name: impl Into<String>, value: bool) -> Self {
        Self {
            score_name: score_name.into(),
            value: ScoreValue::Bool(value),
            reasoning: None,
            confidence: None,
        }
    }
}

/// Score values are numbers, strings (categorical), or booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ScoreValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScoreValue::Number(n) => Some(*n),
            ScoreValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScoreValue::Text(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn llm_config() -> LlmScorerConfig {
        LlmScorerConfig {
            credential_id: "cred-1".to_string(),
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::new("user", "Rate {{answer}} from 1 to 5.")],
            temperature: 0.0,
            response_format: ResponseFormat::Json,
            output_schema: vec![OutputField::numeric("quality", 1.0, 5.0)],
        }
    }

    #[test]
    fn config_tag_matches_scorer_type() {
        assert_eq!(ScorerConfig::Llm(llm_config()).scorer_type(), ScorerType::Llm);
        assert_eq!(
            ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok")).scorer_type(),
            ScorerType::Regex
        );
    }

    #[test]
    fn serialized_form_carries_the_type_tag() {
        let config = ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok"));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], json!("regex"));
        assert_eq!(value["pattern"], json!("^OK$"));

        let parsed: ScorerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn llm_validation_catches_bad_templates() {
        let mut config = llm_config();
        config.messages.clear();
        assert_eq!(
            ScorerConfig::Llm(config).validate(),
            Err(ValidationError::EmptyMessages)
        );

        let mut config = llm_config();
        config.temperature = 3.5;
        assert!(matches!(
            ScorerConfig::Llm(config).validate(),
            Err(ValidationError::InvalidTemperature(_))
        ));

        let mut config = llm_config();
        config.output_schema = vec![OutputField::numeric("quality", 5.0, 1.0)];
        assert!(matches!(
            ScorerConfig::Llm(config).validate(),
            Err(ValidationError::InvalidRange { .. })
        ));

        let mut config = llm_config();
        config.output_schema = vec![OutputField::categorical("label", vec![])];
        assert!(matches!(
            ScorerConfig::Llm(config).validate(),
            Err(ValidationError::EmptyCategories(_))
        ));
    }

    #[test]
    fn regex_validation_compiles_the_pattern() {
        assert!(ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok"))
            .validate()
            .is_ok());
        assert!(matches!(
            ScorerConfig::Regex(RegexScorerConfig::new("(unclosed", "bad")).validate(),
            Err(ValidationError::InvalidPattern(_))
        ));

        let mut config = RegexScorerConfig::new(r"score: (?P<score>\d+)", "extracted");
        config.capture_group = Some("score".to_string());
        assert!(ScorerConfig::Regex(config.clone()).validate().is_ok());
        config.capture_group = Some("missing".to_string());
        assert_eq!(
            ScorerConfig::Regex(config).validate(),
            Err(ValidationError::UnknownCaptureGroup("missing".to_string()))
        );
    }

    #[test]
    fn builtin_validation_checks_required_options() {
        let bare = BuiltinScorerConfig::new(BuiltinScorerName::Contains);
        assert!(matches!(
            ScorerConfig::Builtin(bare).validate(),
            Err(ValidationError::MissingBuiltinOption { .. })
        ));

        let ok = BuiltinScorerConfig::new(BuiltinScorerName::Contains)
            .with_option("substring", json!("refund"));
        assert!(ScorerConfig::Builtin(ok).validate().is_ok());

        let bad_lengths = BuiltinScorerConfig::new(BuiltinScorerName::LengthCheck)
            .with_option("min_length", json!(100))
            .with_option("max_length", json!(10));
        assert!(matches!(
            ScorerConfig::Builtin(bad_lengths).validate(),
            Err(ValidationError::InvalidRange { .. })
        ));
    }

    #[test]
    fn score_values_serialize_untagged() {
        assert_eq!(serde_json::to_value(ScoreValue::Number(0.5)).unwrap(), json!(0.5));
        assert_eq!(serde_json::to_value(ScoreValue::Bool(true)).unwrap(), json!(true));
        assert_eq!(
            serde_json::to_value(ScoreValue::Text("pass".into())).unwrap(),
            json!("pass")
        );
        assert_eq!(ScoreValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ScoreValue::Text("pass".into()).as_f64(), None);
    }
}
