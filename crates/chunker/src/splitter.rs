use std::sync::OnceLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::Tokenizer;

/// Sentence terminators, including Arabic-script and CJK full stops.
const TERMINATORS: &[char] = &['.', '!', '?', '۔', '。', '…'];

/// Boundary kinds, coarsest first. Splitting always tries the coarsest
/// level that actually divides the text before falling through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Paragraph,
    Sentence,
    NumberedItem,
    Whitespace,
    Grapheme,
}

impl Level {
    fn finer(self) -> Option<Level> {
        match self {
            Level::Paragraph => Some(Level::Sentence),
            Level::Sentence => Some(Level::NumberedItem),
            Level::NumberedItem => Some(Level::Whitespace),
            Level::Whitespace => Some(Level::Grapheme),
            Level::Grapheme => None,
        }
    }
}

fn numbered_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n[0-9]+[.)\-:]").expect("static regex must compile"))
}

/// Split plain text into pieces of at most `max` tokens each.
///
/// Concatenating the result reproduces the input exactly; every byte of the
/// original, including whitespace runs, belongs to exactly one piece.
pub(crate) fn split_text(tokenizer: &Tokenizer, text: &str, max: usize) -> Vec<String> {
    split_level(tokenizer, text, max, Level::Paragraph)
}

fn split_level(tokenizer: &Tokenizer, text: &str, max: usize, level: Level) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    if tokenizer.count(text) <= max {
        return vec![text.to_string()];
    }

    let parts = segment(text, level);

    if parts.len() <= 1 {
        return match level.finer() {
            Some(finer) => split_level(tokenizer, text, max, finer),
            // A single grapheme over budget cannot be split further.
            None => vec![text.to_string()],
        };
    }

    pack(tokenizer, parts, max, level)
}

/// Greedily pack consecutive parts into pieces under the budget. Parts that
/// are individually over budget are re-split at the next finer level.
fn pack(tokenizer: &Tokenizer, parts: Vec<&str>, max: usize, level: Level) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for part in parts {
        if tokenizer.count(part) > max {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }

            match level.finer() {
                Some(finer) => pieces.extend(split_level(tokenizer, part, max, finer)),
                None => pieces.push(part.to_string()),
            }

            continue;
        }

        if current.is_empty() {
            current.push_str(part);
            continue;
        }

        let mut candidate = current.clone();
        candidate.push_str(part);

        if tokenizer.count(&candidate) <= max {
            current = candidate;
        } else {
            pieces.push(std::mem::replace(&mut current, part.to_string()));
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

/// Segment `text` at the given level into contiguous slices covering it.
fn segment(text: &str, level: Level) -> Vec<&str> {
    let points = match level {
        Level::Paragraph => paragraph_points(text),
        Level::Sentence => sentence_points(text),
        Level::NumberedItem => numbered_item_points(text),
        Level::Whitespace => whitespace_points(text),
        Level::Grapheme => grapheme_points(text),
    };

    cut(text, points)
}

/// Split after every blank-line separator, keeping it with the left piece.
fn paragraph_points(text: &str) -> Vec<usize> {
    let mut points = Vec::new();
    let mut from = 0;

    while let Some(found) = text[from..].find("\n\n") {
        let cut = from + found + 2;
        points.push(cut);
        from = cut;
    }

    points
}

/// Split after runs of sentence terminators, so closing punctuation and any
/// adjacent ellipsis stay attached to the sentence they end.
fn sentence_points(text: &str) -> Vec<usize> {
    let mut points = Vec::new();
    let mut in_run = false;

    for (offset, ch) in text.char_indices() {
        if TERMINATORS.contains(&ch) {
            in_run = true;
        } else {
            if in_run {
                points.push(offset);
            }
            in_run = false;
        }
    }

    points
}

/// Split before each `\n<number><punct>` list-item marker.
fn numbered_item_points(text: &str) -> Vec<usize> {
    numbered_item_regex().find_iter(text).map(|m| m.start()).collect()
}

/// Split before each word, so a piece is a word plus its trailing whitespace.
fn whitespace_points(text: &str) -> Vec<usize> {
    let mut points = Vec::new();
    let mut prev_ws = false;

    for (offset, ch) in text.char_indices() {
        if prev_ws && !ch.is_whitespace() {
            points.push(offset);
        }
        prev_ws = ch.is_whitespace();
    }

    points
}

fn grapheme_points(text: &str) -> Vec<usize> {
    text.grapheme_indices(true).skip(1).map(|(offset, _)| offset).collect()
}

/// Cut `text` at the given byte offsets, dropping empty slices.
fn cut(text: &str, points: Vec<usize>) -> Vec<&str> {
    let mut slices = Vec::with_capacity(points.len() + 1);
    let mut start = 0;

    for point in points {
        if point > start && point < text.len() {
            slices.push(&text[start..point]);
            start = point;
        }
    }

    if start < text.len() {
        slices.push(&text[start..]);
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_the_input() {
        for level in [
            Level::Paragraph,
            Level::Sentence,
            Level::NumberedItem,
            Level::Whitespace,
            Level::Grapheme,
        ] {
            let text = "One. Two!\n\n1. item\n2. item   done";
            let joined: String = segment(text, level).concat();
            assert_eq!(joined, text, "level {level:?} lost bytes");
        }
    }

    #[test]
    fn sentence_runs_keep_punctuation_left() {
        let parts = segment("Hm... ok? Sure!", Level::Sentence);
        assert_eq!(parts, vec!["Hm...", " ok?", " Sure!"]);
    }

    #[test]
    fn whitespace_pieces_are_word_plus_trailing_space() {
        let parts = segment("a  b c", Level::Whitespace);
        assert_eq!(parts, vec!["a  ", "b ", "c"]);
    }

    #[test]
    fn paragraph_separator_stays_with_the_left_piece() {
        let parts = segment("one\n\ntwo", Level::Paragraph);
        assert_eq!(parts, vec!["one\n\n", "two"]);
    }
}
