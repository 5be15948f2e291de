use dashmap::DashMap;
use tiktoken_rs::CoreBPE;
use xxhash_rust::xxh3::xxh3_64;

/// Longest prefix scanned when searching for a single-token boundary.
const SINGLE_TOKEN_SCAN: usize = 32;

/// A shared text tokenizer with a count cache keyed by content hash.
///
/// Encoding is by far the hottest operation in the chunk engine: the greedy
/// packer re-counts candidate pieces repeatedly, and prompts are measured
/// once per request on top of that. Counts are memoized across the process.
pub struct Tokenizer {
    bpe: CoreBPE,
    counts: DashMap<u64, usize>,
}

impl Tokenizer {
    /// Build a tokenizer over the `cl100k_base` encoding.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
            counts: DashMap::new(),
        })
    }

    /// Number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let key = xxh3_64(text.as_bytes());

        if let Some(count) = self.counts.get(&key) {
            return *count;
        }

        let count = self.bpe.encode_with_special_tokens(text).len();
        self.counts.insert(key, count);

        count
    }

    /// Split `text` into pieces where each piece is the shortest non-empty
    /// prefix of the remaining text that the encoder treats as one token.
    ///
    /// Concatenating the pieces reproduces `text` exactly. A character the
    /// encoder cannot represent as a single token becomes its own piece.
    pub fn single_token_chunks(&self, text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            let mut taken = None;

            for (count, (offset, ch)) in rest.char_indices().enumerate() {
                if count == SINGLE_TOKEN_SCAN {
                    break;
                }

                let end = offset + ch.len_utf8();

                if self.count(&rest[..end]) == 1 {
                    taken = Some(end);
                    break;
                }
            }

            let end = taken.unwrap_or_else(|| {
                // No single-token prefix in range; emit one character as-is.
                rest.chars().next().map(char::len_utf8).unwrap_or(rest.len())
            });

            pieces.push(rest[..end].to_string());
            rest = &rest[end..];
        }

        pieces
    }
}
