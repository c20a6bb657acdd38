use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::Token;
use crate::schema::schema::TokenizerKind;

/// Turns property values and query strings into terms. The same tokenizer
/// must run on both sides so indexed terms and query terms line up.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Token>;

    fn name(&self) -> &str;
}

/// Unicode-word tokenizer used for `TokenizerKind::Plain`. Splits on word
/// boundaries, so punctuation and hyphens separate terms ("bar-baz" yields
/// "bar" and "baz"), lowercases, and truncates overlong terms at a char
/// boundary.
#[derive(Debug, Clone)]
pub struct PlainTokenizer {
    pub max_token_length: usize,
}

impl Tokenizer for PlainTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut position = 0u32;

        for (offset, word) in text.unicode_word_indices() {
            let lowered = word.to_lowercase();
            let truncated = truncate_term(&lowered, self.max_token_length);
            if truncated.is_empty() {
                continue;
            }
            tokens.push(Token::new(truncated.to_string(), position, offset));
            position += 1;
        }

        tokens
    }

    fn name(&self) -> &str {
        "plain"
    }
}

/// Emits the whole value as a single term, untouched apart from length
/// truncation. Used for `TokenizerKind::Verbatim` (exact-id style fields).
#[derive(Debug, Clone)]
pub struct VerbatimTokenizer {
    pub max_token_length: usize,
}

impl Tokenizer for VerbatimTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        if text.is_empty() {
            return Vec::new();
        }
        let truncated = truncate_term(text, self.max_token_length);
        vec![Token::new(truncated.to_string(), 0, 0)]
    }

    fn name(&self) -> &str {
        "verbatim"
    }
}

pub fn create_tokenizer(kind: TokenizerKind, max_token_length: usize) -> Box<dyn Tokenizer> {
    match kind {
        TokenizerKind::Plain => Box::new(PlainTokenizer { max_token_length }),
        TokenizerKind::Verbatim => Box::new(VerbatimTokenizer { max_token_length }),
    }
}

/// Truncates to at most `max_len` bytes, backing up to a valid UTF-8
/// boundary. Truncation is symmetric between indexing and queries, so a
/// truncated indexed term still matches the equally truncated query term.
pub fn truncate_term(term: &str, max_len: usize) -> &str {
    if term.len() <= max_len {
        return term;
    }
    let mut boundary = max_len;
    while boundary > 0 && !term.is_char_boundary(boundary) {
        boundary -= 1;
    }
    &term[..boundary]
}
