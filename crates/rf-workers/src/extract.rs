//! Summary text extraction.
//!
//! Summarizer responses come in several shapes depending on the API flavour
//! behind the endpoint. Each known shape is tried in turn; the first one
//! yielding non-blank text wins.

use serde_json::Value;

type Shape = fn(&Value) -> Option<String>;

const SHAPES: &[(&str, Shape)] = &[
    ("bare string", bare_string),
    ("output_text", output_text),
    ("output content", output_content),
    ("chat choice", chat_choice),
    ("completion choice", completion_choice),
    ("summary field", |v| field(v, "summary")),
    ("text field", |v| field(v, "text")),
];

/// Plain summary text, or `None` when no known shape carries any.
pub fn summary_text(response: &Value) -> Option<String> {
    SHAPES.iter().find_map(|(shape, extract)| {
        let text = extract(response)?;
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        tracing::trace!(shape, "summary text extracted");
        Some(text.to_string())
    })
}

fn bare_string(v: &Value) -> Option<String> {
    v.as_str().map(str::to_string)
}

fn field(v: &Value, name: &str) -> Option<String> {
    v.get(name)?.as_str().map(str::to_string)
}

fn output_text(v: &Value) -> Option<String> {
    match v.get("output_text")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(join_strings(parts.iter().filter_map(Value::as_str))),
        _ => None,
    }
}

/// `{"output": [{"content": [{"type": "output_text", "text": "..."}]}]}`
fn output_content(v: &Value) -> Option<String> {
    let items = v.get("output")?.as_array()?;
    let texts = items
        .iter()
        .filter_map(|item| item.get("content")?.as_array())
        .flatten()
        .filter_map(|part| part.get("text")?.as_str());
    Some(join_strings(texts))
}

/// `{"choices": [{"message": {"content": "..."}}]}`
fn chat_choice(v: &Value) -> Option<String> {
    let message = v.get("choices")?.get(0)?.get("message")?;
    match message.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(join_strings(
            parts.iter().filter_map(|p| p.get("text")?.as_str()),
        )),
        _ => None,
    }
}

fn completion_choice(v: &Value) -> Option<String> {
    v.get("choices")?.get(0)?.get("text")?.as_str().map(str::to_string)
}

fn join_strings<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_string() {
        assert_eq!(summary_text(&json!("  A short recap. ")).as_deref(), Some("A short recap."));
    }

    #[test]
    fn test_output_text_field() {
        let v = json!({ "id": "resp_1", "output_text": "Recap." });
        assert_eq!(summary_text(&v).as_deref(), Some("Recap."));
    }

    #[test]
    fn test_nested_output_content() {
        let v = json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "First part." },
                    { "type": "output_text", "text": "Second part." }
                ]}
            ]
        });
        assert_eq!(summary_text(&v).as_deref(), Some("First part.\nSecond part."));
    }

    #[test]
    fn test_chat_choice() {
        let v = json!({ "choices": [{ "message": { "role": "assistant", "content": "Chat recap." } }] });
        assert_eq!(summary_text(&v).as_deref(), Some("Chat recap."));
    }

    #[test]
    fn test_completion_choice() {
        let v = json!({ "choices": [{ "text": "Legacy recap." }] });
        assert_eq!(summary_text(&v).as_deref(), Some("Legacy recap."));
    }

    #[test]
    fn test_plain_fields() {
        assert_eq!(summary_text(&json!({ "summary": "S" })).as_deref(), Some("S"));
        assert_eq!(summary_text(&json!({ "text": "T" })).as_deref(), Some("T"));
    }

    #[test]
    fn test_blank_shape_falls_through() {
        let v = json!({ "output_text": "   ", "choices": [{ "message": { "content": "Fallback." } }] });
        assert_eq!(summary_text(&v).as_deref(), Some("Fallback."));
    }

    #[test]
    fn test_unusable_responses() {
        assert_eq!(summary_text(&json!(null)), None);
        assert_eq!(summary_text(&json!({ "output": [] })), None);
        assert_eq!(summary_text(&json!({ "error": { "message": "rate limited" } })), None);
        assert_eq!(summary_text(&json!({ "choices": [{ "message": { "content": null } }] })), None);
    }
}
