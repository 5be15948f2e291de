//! Token counting and semantic chunking.
//!
//! Splits arbitrary text into pieces that each fit a token budget while
//! respecting the structure of the input: paragraphs before sentences,
//! sentences before list items, list items before whitespace, and grapheme
//! clusters as the floor. HTML input is split around top-level elements,
//! which are kept intact. Concatenating the pieces always reproduces the
//! input byte for byte.

mod error;
mod html;
mod splitter;
mod tokenizer;

pub use error::ChunkError;
pub use tokenizer::Tokenizer;

/// Split `text` into ordered pieces of at most `max_chunk_tokens` tokens.
///
/// Format is detected from the content: anything containing a markup tag is
/// split in HTML mode, everything else in text mode.
pub fn semantic_chunks(
    tokenizer: &Tokenizer,
    text: &str,
    max_chunk_tokens: usize,
) -> Result<Vec<String>, ChunkError> {
    if max_chunk_tokens == 0 {
        return Err(ChunkError::InvalidMaxToken(max_chunk_tokens));
    }

    if text.is_empty() {
        return Ok(Vec::new());
    }

    if html::contains_tag(text) {
        html::split_html(tokenizer, text, max_chunk_tokens)
    } else {
        Ok(splitter::split_text(tokenizer, text, max_chunk_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new().unwrap()
    }

    fn assert_lossless(pieces: &[String], input: &str) {
        assert_eq!(pieces.concat(), input);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let tok = tokenizer();
        let err = semantic_chunks(&tok, "hello", 0).unwrap_err();
        assert!(matches!(err, ChunkError::InvalidMaxToken(0)));
    }

    #[test]
    fn short_text_is_a_single_piece() {
        let tok = tokenizer();
        let pieces = semantic_chunks(&tok, "Hello, world!", 100).unwrap();
        assert_eq!(pieces, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn empty_input_yields_no_pieces() {
        let tok = tokenizer();
        assert!(semantic_chunks(&tok, "", 10).unwrap().is_empty());
    }

    #[test]
    fn paragraphs_are_preferred_boundaries() {
        let tok = tokenizer();
        let text = "First paragraph with several words in it.\n\nSecond paragraph with several words in it.\n\nThird paragraph with several words in it.";
        let budget = tok.count("First paragraph with several words in it.\n\n") + 2;

        let pieces = semantic_chunks(&tok, text, budget).unwrap();

        assert_lossless(&pieces, text);
        assert!(pieces.len() >= 3);
        for piece in &pieces {
            assert!(tok.count(piece) <= budget);
        }
        assert!(pieces[0].ends_with("\n\n"));
    }

    #[test]
    fn sentences_split_on_script_specific_terminators() {
        let tok = tokenizer();
        let text = "یہ پہلا جملہ ہے۔ یہ دوسرا جملہ ہے۔ これは文です。短い文。";
        let pieces = semantic_chunks(&tok, text, 12).unwrap();

        assert_lossless(&pieces, text);
        for piece in &pieces {
            assert!(tok.count(piece) <= 12, "piece over budget: {piece:?}");
        }
    }

    #[test]
    fn ellipsis_stays_attached_to_the_preceding_sentence() {
        let tok = tokenizer();
        let text = "Wait... really? Yes! Absolutely.";
        let budget = tok.count("Wait... ") + 1;
        let pieces = semantic_chunks(&tok, text, budget.max(4)).unwrap();

        assert_lossless(&pieces, text);
        assert!(pieces[0].starts_with("Wait..."));
    }

    #[test]
    fn numbered_lists_split_between_items() {
        let tok = tokenizer();
        let text = "Intro line\n1. first item with some words\n2. second item with some words\n3) third item with some words";
        let pieces = semantic_chunks(&tok, text, 12).unwrap();

        assert_lossless(&pieces, text);
        for piece in &pieces {
            assert!(tok.count(piece) <= 12);
        }
    }

    #[test]
    fn combining_marks_never_detach_from_their_base() {
        let tok = tokenizer();
        // "é" written as 'e' + U+0301, repeated past any budget.
        let text = "e\u{301}".repeat(64);
        let pieces = semantic_chunks(&tok, &text, 2).unwrap();

        assert_lossless(&pieces, &text);
        for piece in &pieces {
            assert!(!piece.starts_with('\u{301}'), "piece starts with a bare combining mark");
        }
    }

    #[test]
    fn whitespace_is_preserved_exactly() {
        let tok = tokenizer();
        let text = "a  b\t\tc\n d   \u{a0} e  ";
        let pieces = semantic_chunks(&tok, text, 3).unwrap();
        assert_lossless(&pieces, text);
    }

    #[test]
    fn html_elements_are_atomic_units() {
        let tok = tokenizer();
        let text = "<p>long paragraph</p>plain text<img/>";
        let longest_atom = tok.count("<p>long paragraph</p>");
        let pieces = semantic_chunks(&tok, text, longest_atom + 1).unwrap();

        assert_eq!(
            pieces,
            vec![
                "<p>long paragraph</p>".to_string(),
                "plain text".to_string(),
                "<img/>".to_string(),
            ]
        );
        assert_lossless(&pieces, text);
    }

    #[test]
    fn nested_elements_stay_inside_their_top_level_unit() {
        let tok = tokenizer();
        let text = "<div><p>one</p><p>two</p></div>tail";
        let budget = tok.count("<div><p>one</p><p>two</p></div>") + 1;
        let pieces = semantic_chunks(&tok, text, budget).unwrap();

        assert_eq!(pieces[0], "<div><p>one</p><p>two</p></div>");
        assert_lossless(&pieces, text);
    }

    #[test]
    fn void_elements_need_no_closing_tag() {
        let tok = tokenizer();
        let text = "before<br>middle<hr>after";
        let pieces = semantic_chunks(&tok, text, 4).unwrap();

        assert_lossless(&pieces, text);
        assert!(pieces.contains(&"<br>".to_string()));
        assert!(pieces.contains(&"<hr>".to_string()));
    }

    #[test]
    fn oversized_html_atom_is_an_error() {
        let tok = tokenizer();
        let text = "<p>this paragraph is far too large for the tiny budget we give it</p>";
        let err = semantic_chunks(&tok, text, 3).unwrap_err();
        assert!(matches!(err, ChunkError::OversizedAtom { .. }));
    }

    #[test]
    fn long_plain_text_respects_the_budget_everywhere() {
        let tok = tokenizer();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let pieces = semantic_chunks(&tok, &text, 16).unwrap();

        assert_lossless(&pieces, &text);
        for piece in &pieces {
            assert!(tok.count(piece) <= 16);
        }
    }
}
