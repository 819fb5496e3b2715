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

//! Candidate span and trace records as seen by the targeting engine.
//!
//! Payloads (`input`, `output`, `metadata`) are untyped `serde_json::Value`s
//! because they come straight off the wire from arbitrary instrumentation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A single recorded unit of work within a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: String,
    pub trace_id: String,
    pub span_name: String,
    /// Span kind as reported by instrumentation (e.g. "llm", "tool").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_kind: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metadata: Value,
    /// Flat attributes, addressable by filter clauses.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Start time in microseconds since the Unix epoch.
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl SpanRecord {
    pub fn new(
        span_id: impl Into<String>,
        trace_id: impl Into<String>,
        span_name: impl Into<String>,
    ) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
            span_name: span_name.into(),
            span_kind: None,
            input: Value::Null,
            output: Value::Null,
            metadata: Value::Null,
            attributes: HashMap::new(),
            started_at: crate::execution::now_micros(),
            duration_ms: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.span_kind = Some(kind.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Look up a filterable field by name.
    ///
    /// Well-known record fields are resolved first; anything else falls back
    /// to the `attributes` map. Returns `None` when the field is absent,
    /// which the filter engine treats per-operator (only `is_empty` matches
    /// absence).
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "span_id" => Some(Value::String(self.span_id.clone())),
            "trace_id" => Some(Value::String(self.trace_id.clone())),
            "span_name" => Some(Value::String(self.span_name.clone())),
            "span_kind" => self.span_kind.clone().map(Value::String),
            "duration_ms" => self.duration_ms.map(|d| Value::Number(d.into())),
            "input" => Some(self.input.clone()),
            "output" => Some(self.output.clone()),
            "metadata" => Some(self.metadata.clone()),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

/// An end-to-end request: the trace-level payloads referenced by
/// `trace_input` variable mappings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl TraceRecord {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}
