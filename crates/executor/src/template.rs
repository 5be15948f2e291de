//! Prompt template rendering.
//!
//! Templates use name-based substitution (`{{text}}`, `{{language}}`) plus a
//! small helper set. `{{messages}}` is not rendered here: the resolver
//! detects it and splices the chat history at message-assembly time.

use std::sync::OnceLock;

use minijinja::{Environment, value::Value};
use regex::Regex;

use crate::ExecutorError;

/// The chat-history splice marker handled by the resolver.
pub(crate) const MESSAGES_MARKER: &str = "{{messages}}";

fn html_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex must compile"))
}

fn environment() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();

    ENV.get_or_init(|| {
        let mut env = Environment::new();

        env.add_function("now", || jiff::Zoned::now().to_string());

        env.add_function("strip_html", |value: String| {
            html_tag_regex().replace_all(&value, "").into_owned()
        });

        env.add_function("to_json", |value: Value| {
            serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
        });

        // Character-to-word estimate: ⌊n/6⌋ for numbers, pass-through
        // for anything else.
        env.add_function("cto_w", |value: Value| {
            let json = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);

            match json.as_f64() {
                Some(number) => Value::from((number / 6.0).floor() as i64),
                None => value,
            }
        });

        env
    })
}

/// Render one prompt template against the input bindings.
pub(crate) fn render(source: &str, bindings: &serde_json::Map<String, serde_json::Value>) -> crate::Result<String> {
    // The marker is spliced by the resolver; render the surrounding text.
    let source = source.replace(MESSAGES_MARKER, "");

    environment()
        .render_str(&source, bindings)
        .map_err(|e| ExecutorError::Template(e.to_string()))
}

/// Whether a template splices the chat history.
pub(crate) fn splices_messages(source: &str) -> bool {
    source.contains(MESSAGES_MARKER)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bindings(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn named_scalars_substitute() {
        let rendered = render(
            "Translate to {{language}}: {{text}}",
            &bindings(json!({"language": "French", "text": "Hello"})),
        )
        .unwrap();

        assert_eq!(rendered, "Translate to French: Hello");
    }

    #[test]
    fn strip_html_removes_tags() {
        let rendered = render(
            "{{ strip_html(text) }}",
            &bindings(json!({"text": "<p>Hello <b>world</b></p>"})),
        )
        .unwrap();

        assert_eq!(rendered, "Hello world");
    }

    #[test]
    fn to_json_serializes_values() {
        let rendered = render(
            "{{ to_json(items) }}",
            &bindings(json!({"items": ["a", "b"]})),
        )
        .unwrap();

        assert_eq!(rendered, r#"["a","b"]"#);
    }

    #[test]
    fn cto_w_floors_numeric_input_and_passes_through_text() {
        let rendered = render("{{ cto_w(count) }}", &bindings(json!({"count": 100}))).unwrap();
        assert_eq!(rendered, "16");

        let rendered = render("{{ cto_w(count) }}", &bindings(json!({"count": "many"}))).unwrap();
        assert_eq!(rendered, "many");
    }

    #[test]
    fn now_produces_a_timestamp() {
        let rendered = render("{{ now() }}", &bindings(json!({}))).unwrap();
        assert!(!rendered.is_empty());
    }

    #[test]
    fn messages_marker_is_detected_and_removed() {
        assert!(splices_messages("Intro\n{{messages}}"));
        assert!(!splices_messages("{{text}}"));

        let rendered = render("Intro\n{{messages}}", &bindings(json!({}))).unwrap();
        assert_eq!(rendered, "Intro\n");
    }
}
