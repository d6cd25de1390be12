//! Rewriting of the upstream `reasoning` field into the shape chat clients expect.
//!
//! Upstream providers such as OpenRouter stream chain-of-thought in a field named
//! `reasoning`. Clients written against DeepSeek-style APIs read it from
//! `reasoning_content` instead, while clients that only understand plain text want
//! it inlined into `content` between `<think>` tags. [`ReasoningFormat`] selects
//! one of the two conventions for the whole process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Field name used by the upstream provider.
pub const UPSTREAM_FIELD: &str = "reasoning";

/// Field name used by `reasoning_content` clients.
pub const REASONING_CONTENT_FIELD: &str = "reasoning_content";

const CONTENT_FIELD: &str = "content";
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// How an upstream `reasoning` field is presented downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    /// Rename `reasoning` to `reasoning_content`, leaving its value untouched.
    ReasoningContent,
    /// Drop `reasoning` and prepend `<think>{reasoning}</think>` to `content`.
    ThinkTags,
}

impl ReasoningFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReasoningContent => "reasoning_content",
            Self::ThinkTags => "think_tags",
        }
    }

    /// Rewrite every entry of a chat payload's `choices` array.
    ///
    /// Payloads without a `choices` array (error bodies, usage-only chunks) are
    /// left as they are.
    pub fn apply_to_payload(self, payload: &mut Value) {
        let Some(choices) = payload.get_mut("choices").and_then(Value::as_array_mut) else {
            return;
        };
        for choice in choices.iter_mut() {
            self.apply_to_choice(choice);
        }
    }

    /// Rewrite the `delta` (streaming) and `message` (non-streaming) objects of a
    /// single choice. Absence of the field is a no-op.
    pub fn apply_to_choice(self, choice: &mut Value) {
        for key in ["delta", "message"] {
            if let Some(Value::Object(inner)) = choice.get_mut(key) {
                self.apply_to_object(inner);
            }
        }
    }

    fn apply_to_object(self, obj: &mut Map<String, Value>) {
        if !obj.contains_key(UPSTREAM_FIELD) {
            return;
        }
        match self {
            Self::ReasoningContent => rename_in_place(obj),
            Self::ThinkTags => fold_into_content(obj),
        }
    }
}

impl fmt::Display for ReasoningFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reasoning_content" => Ok(Self::ReasoningContent),
            "think_tags" | "think" => Ok(Self::ThinkTags),
            other => Err(format!(
                "unknown reasoning format '{other}' (expected 'reasoning_content' or 'think_tags')"
            )),
        }
    }
}

/// Rename `reasoning` to `reasoning_content`, keeping its position among the
/// other keys. An existing `reasoning_content` is replaced.
fn rename_in_place(obj: &mut Map<String, Value>) {
    let renamed: Map<String, Value> = std::mem::take(obj)
        .into_iter()
        .filter(|(key, _)| key != REASONING_CONTENT_FIELD)
        .map(|(key, value)| {
            if key == UPSTREAM_FIELD {
                (REASONING_CONTENT_FIELD.to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect();
    *obj = renamed;
}

/// Move `reasoning` into `content` as a `<think>` block.
///
/// Null or empty reasoning is removed without touching `content`. A string
/// `content` is prefixed, an absent or null one becomes the block itself, and
/// a content-part array gets a leading text part. Any other value is kept as
/// the second element of a two-part array behind the block.
fn fold_into_content(obj: &mut Map<String, Value>) {
    // OpenRouter sends `"reasoning": null` on plain content deltas.
    let text = match obj.get(UPSTREAM_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    obj.retain(|key, _| key != UPSTREAM_FIELD);

    let Some(text) = text else {
        return;
    };
    let block = format!("{THINK_OPEN}{text}{THINK_CLOSE}");

    let content = obj.entry(CONTENT_FIELD).or_insert(Value::Null);
    *content = match content.take() {
        Value::Null => Value::String(block),
        Value::String(existing) => Value::String(block + &existing),
        Value::Array(mut parts) => {
            parts.insert(0, text_part(block));
            Value::Array(parts)
        }
        other => Value::Array(vec![text_part(block), other]),
    };
}

fn text_part(text: String) -> Value {
    serde_json::json!({ "type": "text", "text": text })
}
