use std::sync::OnceLock;

use regex::Regex;

use crate::{ChunkError, Tokenizer, splitter};

/// Elements that never take a closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9-]*)([^>]*)>").expect("static regex must compile"))
}

/// Whether the text contains any markup tag, open, close, self-closing or void.
pub(crate) fn contains_tag(text: &str) -> bool {
    tag_regex().is_match(text)
}

/// A top-level portion of a markup document.
enum Unit<'a> {
    /// Text between elements; split by the plain-text algorithm.
    Text(&'a str),
    /// A complete top-level element; never split.
    Element(&'a str),
}

/// Split markup text so every top-level element stays intact.
pub(crate) fn split_html(tokenizer: &Tokenizer, text: &str, max: usize) -> Result<Vec<String>, ChunkError> {
    let mut pieces = Vec::new();

    for unit in units(text) {
        match unit {
            Unit::Element(element) => {
                let tokens = tokenizer.count(element);

                if tokens > max {
                    return Err(ChunkError::OversizedAtom { tokens, max });
                }

                pieces.push(element.to_string());
            }
            Unit::Text(between) => pieces.extend(splitter::split_text(tokenizer, between, max)),
        }
    }

    Ok(pieces)
}

/// Walk the document once, pairing top-level open tags with their closing
/// tags. Unmatched closing tags at the top level and unclosed trailing
/// elements are kept as single units rather than dropped.
fn units(text: &str) -> Vec<Unit<'_>> {
    let mut units = Vec::new();
    let mut cursor = 0;
    let mut unit_start = 0;
    let mut stack: Vec<String> = Vec::new();

    for caps in tag_regex().captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };

        let (start, end) = (whole.start(), whole.end());
        let closing = !caps[1].is_empty();
        let name = caps[2].to_ascii_lowercase();
        let self_contained = caps[3].trim_end().ends_with('/') || VOID_ELEMENTS.contains(&name.as_str());

        if stack.is_empty() {
            if cursor < start {
                units.push(Unit::Text(&text[cursor..start]));
            }

            if closing || self_contained {
                units.push(Unit::Element(&text[start..end]));
            } else {
                unit_start = start;
                stack.push(name);
            }

            cursor = end;
        } else if closing {
            if let Some(open) = stack.iter().rposition(|tag| *tag == name) {
                stack.truncate(open);
            }

            if stack.is_empty() {
                units.push(Unit::Element(&text[unit_start..end]));
                cursor = end;
            }
        } else if !self_contained {
            stack.push(name);
        }
    }

    if stack.is_empty() {
        if cursor < text.len() {
            units.push(Unit::Text(&text[cursor..]));
        }
    } else {
        units.push(Unit::Element(&text[unit_start..]));
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(text: &str) -> Vec<String> {
        units(text)
            .into_iter()
            .map(|unit| match unit {
                Unit::Text(t) => format!("T:{t}"),
                Unit::Element(e) => format!("E:{e}"),
            })
            .collect()
    }

    #[test]
    fn detects_all_tag_shapes() {
        assert!(contains_tag("<p>x</p>"));
        assert!(contains_tag("a <img/> b"));
        assert!(contains_tag("a <br> b"));
        assert!(!contains_tag("2 < 3 and 4 > 1"));
        assert!(!contains_tag("plain text"));
    }

    #[test]
    fn pairs_top_level_elements() {
        assert_eq!(
            render("<p>a</p>mid<img/>"),
            vec!["E:<p>a</p>", "T:mid", "E:<img/>"]
        );
    }

    #[test]
    fn nested_same_name_elements_close_correctly() {
        assert_eq!(
            render("<div>a<div>b</div>c</div>tail"),
            vec!["E:<div>a<div>b</div>c</div>", "T:tail"]
        );
    }

    #[test]
    fn unclosed_element_becomes_one_trailing_unit() {
        assert_eq!(render("x<div>rest"), vec!["T:x", "E:<div>rest"]);
    }

    #[test]
    fn stray_closing_tag_is_its_own_unit() {
        assert_eq!(render("a</b>c"), vec!["T:a", "E:</b>", "T:c"]);
    }
}
