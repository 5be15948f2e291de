//! Output parsers applying a pathway's declared result shape.

use std::sync::OnceLock;

use config::OutputKind;
use regex::Regex;
use serde_json::{Map, Value};

fn item_marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([0-9]+)[.)\-:]\s*").expect("static regex must compile"))
}

/// Parse the aggregated model text into the declared output shape.
pub fn apply_output(kind: &OutputKind, text: &str) -> Value {
    match kind {
        OutputKind::Text => Value::String(text.to_string()),
        OutputKind::NumberedList => Value::Array(
            parse_numbered_list(text)
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
        OutputKind::NumberedObjectList { fields } => {
            let fields: Vec<&str> = fields.split_whitespace().collect();
            Value::Array(
                parse_numbered_list(text)
                    .iter()
                    .map(|item| Value::Object(parse_object_item(item, &fields)))
                    .collect(),
            )
        }
        OutputKind::CommaList => Value::Array(
            split_outside_quotes(text, ',')
                .into_iter()
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .map(|piece| Value::String(piece.to_string()))
                .collect(),
        ),
        OutputKind::Json => parse_json(text),
    }
}

/// Split a numbered list on `1.`, `1)`, `1-` or `1:` item markers.
/// Continuation lines attach to the preceding item.
fn parse_numbered_list(text: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();

    for line in text.lines() {
        if let Some(found) = item_marker_regex().find(line) {
            items.push(line[found.end()..].trim().to_string());
        } else if let Some(current) = items.last_mut() {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                current.push('\n');
                current.push_str(trimmed);
            }
        }
    }

    items
}

/// Parse one list item against a field spec.
///
/// Keyed form (`name: John, age: 30`) is matched case-insensitively, with
/// `:`, `-` or `,` accepted after the key and commas tolerated inside
/// values. When no key appears, values map positionally onto the field
/// list.
fn parse_object_item(item: &str, fields: &[&str]) -> Map<String, Value> {
    let mut object = Map::new();

    // Locate each known field name followed by a key/value splitter.
    let mut found: Vec<(usize, usize, &str)> = Vec::new();
    let lower = item.to_lowercase();

    for field in fields {
        let needle = field.to_lowercase();
        let mut from = 0;

        while let Some(position) = lower[from..].find(&needle) {
            let start = from + position;
            let end = start + needle.len();

            let preceded_ok = start == 0
                || !lower[..start]
                    .chars()
                    .next_back()
                    .is_some_and(char::is_alphanumeric);

            let mut rest = item[end..].chars();
            let splitter_ok = matches!(rest.find(|c: &char| !c.is_whitespace()), Some(':' | '-' | ','));

            if preceded_ok && splitter_ok {
                found.push((start, end, field));
                break;
            }

            from = end;
        }
    }

    if found.is_empty() {
        // Positional: values in spec order.
        for (field, value) in fields.iter().zip(split_outside_quotes(item, ',')) {
            object.insert(field.to_string(), parse_scalar(value.trim()));
        }

        return object;
    }

    found.sort_by_key(|(start, ..)| *start);

    for (index, (_, key_end, field)) in found.iter().enumerate() {
        let value_end = found
            .get(index + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(item.len());

        let raw = item[*key_end..value_end]
            .trim_start_matches([':', '-', ',', ' '])
            .trim()
            .trim_end_matches(',')
            .trim();

        object.insert(field.to_string(), parse_scalar(raw));
    }

    object
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(number) = raw.parse::<i64>() {
        return Value::Number(number.into());
    }

    if let Ok(number) = raw.parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(number)
    {
        return Value::Number(number);
    }

    Value::String(raw.to_string())
}

/// Split on a separator, ignoring separators inside single or double quotes.
fn split_outside_quotes(text: &str, separator: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;

    for (offset, ch) in text.char_indices() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch == separator => {
                pieces.push(&text[start..offset]);
                start = offset + ch.len_utf8();
            }
            None => {}
        }
    }

    pieces.push(&text[start..]);
    pieces
}

/// Extract and parse the largest balanced JSON object or array in the text,
/// repairing common model faults. Unrepairable input yields `{}`.
fn parse_json(text: &str) -> Value {
    let candidate = largest_balanced(text).unwrap_or(text);

    if let Ok(value) = serde_json::from_str(candidate) {
        return value;
    }

    let mut repaired = candidate.to_string();

    for repair in [strip_trailing_commas, quote_unquoted_keys, replace_single_quotes] {
        repaired = repair(&repaired);

        if let Ok(value) = serde_json::from_str(&repaired) {
            return value;
        }
    }

    log::warn!("unrepairable JSON output; substituting an empty object");
    Value::Object(Map::new())
}

/// The longest substring spanning a balanced `{...}` or `[...]`, honoring
/// strings and escapes.
fn largest_balanced(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut search_from = 0;

    while let Some(open) = bytes[search_from..]
        .iter()
        .position(|b| *b == b'{' || *b == b'[')
        .map(|position| search_from + position)
    {
        if let Some(close) = matching_bracket(text, open) {
            let length = close - open + 1;

            if best.is_none_or(|(_, best_length)| length > best_length) {
                best = Some((open, length));
            }

            search_from = close + 1;
        } else {
            search_from = open + 1;
        }
    }

    best.map(|(start, length)| &text[start..start + length])
}

fn matching_bracket(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in bytes.iter().enumerate().skip(open) {
        if escaped {
            escaped = false;
            continue;
        }

        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => depth += 1,
            b'}' | b']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(offset);
                }
            }
            _ => {}
        }
    }

    None
}

fn strip_trailing_commas(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex must compile"));
    regex.replace_all(text, "$1").into_owned()
}

fn quote_unquoted_keys(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex =
        RE.get_or_init(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("static regex must compile"));
    regex.replace_all(text, "$1\"$2\":").into_owned()
}

fn replace_single_quotes(text: &str) -> String {
    text.replace('\'', "\"")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbered_lists_accept_all_markers() {
        let items = parse_numbered_list("1. first\n2) second\n3- third\n4: fourth");
        assert_eq!(items, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn continuation_lines_attach_to_their_item() {
        let items = parse_numbered_list("1. first line\ncontinued\n2. second");
        assert_eq!(items, vec!["first line\ncontinued", "second"]);
    }

    #[test]
    fn numbered_object_list_parses_keyed_items() {
        let kind = OutputKind::NumberedObjectList {
            fields: "name age".to_string(),
        };

        let value = apply_output(&kind, "1. name: John, age: 30\n2. name: Jane, age: 25");

        assert_eq!(
            value,
            json!([
                {"name": "John", "age": 30},
                {"name": "Jane", "age": 25}
            ])
        );
    }

    #[test]
    fn field_matching_is_case_insensitive_with_mixed_splitters() {
        let fields = vec!["name", "age"];
        let object = parse_object_item("Name - Smith, Jr., AGE: 41", &fields);

        assert_eq!(object["name"], json!("Smith, Jr."));
        assert_eq!(object["age"], json!(41));
    }

    #[test]
    fn keyless_items_map_positionally() {
        let fields = vec!["name", "age"];
        let object = parse_object_item("John, 30", &fields);

        assert_eq!(object["name"], json!("John"));
        assert_eq!(object["age"], json!(30));
    }

    #[test]
    fn missing_fields_are_omitted_and_extras_ignored() {
        let fields = vec!["name", "age"];
        let object = parse_object_item("name: Ada, shoe: 38", &fields);

        assert_eq!(object["name"], json!("Ada, shoe: 38"));
        assert!(!object.contains_key("age"));
        assert!(!object.contains_key("shoe"));
    }

    #[test]
    fn comma_lists_respect_quotes() {
        let value = apply_output(&OutputKind::CommaList, r#"alpha, "beta, gamma", delta"#);
        assert_eq!(value, json!(["alpha", "\"beta, gamma\"", "delta"]));
    }

    #[test]
    fn json_extracts_the_largest_balanced_region() {
        let value = apply_output(
            &OutputKind::Json,
            "Here you go:\n{\"a\": 1, \"b\": [2, 3]}\nHope that helps!",
        );
        assert_eq!(value, json!({"a": 1, "b": [2, 3]}));
    }

    #[test]
    fn json_repairs_trailing_commas_and_single_quotes() {
        let value = apply_output(&OutputKind::Json, "{'a': 1, 'b': 2,}");
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn json_repairs_unquoted_keys() {
        let value = apply_output(&OutputKind::Json, "{a: 1, b: \"two\"}");
        assert_eq!(value, json!({"a": 1, "b": "two"}));
    }

    #[test]
    fn unrepairable_json_becomes_an_empty_object() {
        let value = apply_output(&OutputKind::Json, "no json here at all");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn text_output_passes_through() {
        let value = apply_output(&OutputKind::Text, "plain answer");
        assert_eq!(value, json!("plain answer"));
    }
}
