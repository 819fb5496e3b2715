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

//! Variable resolution: extracting named scorer inputs from span/trace
//! payloads.
//!
//! Resolution is fail-soft by contract. It always returns exactly one
//! [`ResolvedVariable`] per mapping so an execution can report which
//! variables were resolvable; an unreachable path yields a null value, never
//! an error.

use crate::span::{SpanRecord, TraceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which payload a mapping reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    SpanInput,
    SpanOutput,
    SpanMetadata,
    TraceInput,
}

/// Declares one named scorer input and where to find it.
///
/// `json_path` uses dot-separated keys with `[i]` array indices, e.g.
/// `messages[0].content` or `choices[0].message.content`. An empty path
/// selects the whole source payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub variable_name: String,
    pub source: VariableSource,
    pub json_path: String,
}

impl VariableMapping {
    pub fn new(
        variable_name: impl Into<String>,
        source: VariableSource,
        json_path: impl Into<String>,
    ) -> Self {
        Self {
            variable_name: variable_name.into(),
            source,
            json_path: json_path.into(),
        }
    }
}

/// The outcome of resolving one mapping against one span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVariable {
    pub variable_name: String,
    pub source: VariableSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// `Value::Null` when the path could not be resolved.
    pub resolved_value: Value,
}

impl ResolvedVariable {
    pub fn is_resolved(&self) -> bool {
        !self.resolved_value.is_null()
    }
}

/// Resolve every mapping against the given span and trace.
///
/// Never fails; the output has the same length and order as `mappings`.
pub fn resolve(
    mappings: &[VariableMapping],
    span: &SpanRecord,
    trace: &TraceRecord,
) -> Vec<ResolvedVariable> {
    mappings
        .iter()
        .map(|mapping| {
            let root = match mapping.source {
                VariableSource::SpanInput => &span.input,
                VariableSource::SpanOutput => &span.output,
                VariableSource::SpanMetadata => &span.metadata,
                VariableSource::TraceInput => &trace.input,
            };
            let resolved_value = resolve_path(root, &mapping.json_path).unwrap_or(Value::Null);
            ResolvedVariable {
                variable_name: mapping.variable_name.clone(),
                source: mapping.source,
                json_path: Some(mapping.json_path.clone()),
                resolved_value,
            }
        })
        .collect()
}

/// Walk a dot-separated path with optional `[i]` index segments over an
/// untyped value. Returns `None` on any missing key, out-of-range index, or
/// malformed segment.
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return match root {
            Value::Null => None,
            other => Some(other.clone()),
        };
    }

    let mut current = root;
    for segment in path.split('.') {
        let (key, indices) = parse_segment(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }

    Some(current.clone())
}

/// Split a segment like `name[0][2]` into its key and index list. A segment
/// of just `[0]` has an empty key and indexes the current value directly.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let bracket = match segment.find('[') {
        Some(pos) => pos,
        None => return Some((segment, Vec::new())),
    };

    let key = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indices.push(inner[..close].parse::<usize>().ok()?);
        rest = &inner[close + 1..];
    }

    Some((key, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn span_with_output(output: Value) -> SpanRecord {
        SpanRecord::new("s1", "t1", "completion").with_output(output)
    }

    #[test]
    fn resolves_nested_keys_and_indices() {
        let output = json!({
            "choices": [
                {"message": {"content": "hello"}},
                {"message": {"content": "world"}}
            ]
        });
        assert_eq!(
            resolve_path(&output, "choices[1].message.content"),
            Some(json!("world"))
        );
        assert_eq!(
            resolve_path(&json!([["a", "b"]]), "[0][1]"),
            Some(json!("b"))
        );
    }

    #[test]
    fn empty_path_selects_the_whole_payload() {
        let output = json!({"answer": 42});
        assert_eq!(resolve_path(&output, ""), Some(output.clone()));
        assert_eq!(resolve_path(&Value::Null, ""), None);
    }

    #[test]
    fn missing_keys_and_bad_indices_resolve_to_none() {
        let output = json!({"choices": [{"text": "x"}]});
        assert_eq!(resolve_path(&output, "choices[3].text"), None);
        assert_eq!(resolve_path(&output, "missing.deeply.nested"), None);
        assert_eq!(resolve_path(&output, "choices[not-a-number]"), None);
        assert_eq!(resolve_path(&output, "choices[0"), None);
    }

    #[test]
    fn resolve_returns_one_entry_per_mapping_in_order() {
        let span = span_with_output(json!({"text": "response"}))
            .with_input(json!({"prompt": "question"}));
        let trace = TraceRecord::new("t1").with_input(json!({"user": "alice"}));

        let mappings = vec![
            VariableMapping::new("prompt", VariableSource::SpanInput, "prompt"),
            VariableMapping::new("answer", VariableSource::SpanOutput, "text"),
            VariableMapping::new("user", VariableSource::TraceInput, "user"),
            VariableMapping::new("ghost", VariableSource::SpanMetadata, "no.such.path"),
        ];

        let resolved = resolve(&mappings, &span, &trace);
        assert_eq!(resolved.len(), 4);
        assert_eq!(resolved[0].resolved_value, json!("question"));
        assert_eq!(resolved[1].resolved_value, json!("response"));
        assert_eq!(resolved[2].resolved_value, json!("alice"));
        assert_eq!(resolved[3].resolved_value, Value::Null);
        assert!(!resolved[3].is_resolved());
        assert_eq!(resolved[3].variable_name, "ghost");
    }

    #[test]
    fn resolution_never_fails_on_malformed_payloads() {
        let span = span_with_output(json!("just a string"));
        let trace = TraceRecord::new("t1");
        let mappings = vec![
            VariableMapping::new("a", VariableSource::SpanOutput, "field[0].x"),
            VariableMapping::new("b", VariableSource::TraceInput, "anything"),
        ];
        let resolved = resolve(&mappings, &span, &trace);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.resolved_value.is_null()));
    }
}
