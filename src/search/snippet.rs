use crate::analysis::tokenizer::{create_tokenizer, truncate_term};
use crate::core::types::Document;
use crate::query::parser::TermClause;
use crate::schema::schema::TermMatch;
use crate::schema::store::SectionMetadata;

/// How much snippeting a search wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnippetSpec {
    /// Number of top results to compute snippets for. 0 disables snippets.
    pub num_to_snippet: usize,
    /// Matches reported per property value before moving on.
    pub num_matches_per_property: usize,
    /// Rough byte budget of the context window around each match.
    pub max_window_bytes: usize,
}

/// One match window inside a document property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetEntry {
    pub property_path: String,
    pub value_index: usize,
    /// The token that matched the query.
    pub exact_match: String,
    /// Context window around the match, bounded by `max_window_bytes`.
    pub window: String,
}

/// Computes match windows for one document against the query terms.
/// A clause restricted to a property only snippets that property; bare
/// clauses snippet every indexed section.
pub fn snippet_document(
    document: &Document,
    sections: &[SectionMetadata],
    clauses: &[TermClause],
    term_match: TermMatch,
    spec: SnippetSpec,
    max_token_length: usize,
) -> Vec<SnippetEntry> {
    if spec.num_matches_per_property == 0 {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for section in sections {
        let terms: Vec<&str> = clauses
            .iter()
            .filter(|c| c.property.as_deref().map_or(true, |p| p == section.path))
            .map(|c| c.term.as_str())
            .collect();
        if terms.is_empty() {
            continue;
        }

        let tokenizer = create_tokenizer(section.indexing.tokenizer, max_token_length);
        for (value_index, value) in resolve_string_values(document, &section.path)
            .into_iter()
            .enumerate()
        {
            let mut matches_left = spec.num_matches_per_property;
            for token in tokenizer.tokenize(value) {
                if matches_left == 0 {
                    break;
                }
                if !token_matches(&token.text, &terms, term_match, max_token_length) {
                    continue;
                }
                let window = extract_window(value, token.offset, token.text.len(), spec.max_window_bytes);
                entries.push(SnippetEntry {
                    property_path: section.path.clone(),
                    value_index,
                    exact_match: original_slice(value, token.offset, &token.text),
                    window,
                });
                matches_left -= 1;
            }
        }
    }
    entries
}

fn token_matches(
    token: &str,
    terms: &[&str],
    term_match: TermMatch,
    max_token_length: usize,
) -> bool {
    terms.iter().any(|term| {
        let term = truncate_term(term, max_token_length);
        match term_match {
            TermMatch::Exact => token == term,
            TermMatch::Prefix => token.starts_with(term),
        }
    })
}

/// Values of a (possibly nested, dotted) property path.
pub(crate) fn resolve_string_values<'d>(document: &'d Document, path: &str) -> Vec<&'d str> {
    fn walk<'d>(document: &'d Document, parts: &[&str], out: &mut Vec<&'d str>) {
        let Some((head, rest)) = parts.split_first() else {
            return;
        };
        let Some(values) = document.properties.get(*head) else {
            return;
        };
        for value in values {
            match value {
                crate::core::types::PropertyValue::Str(s) if rest.is_empty() => out.push(s),
                crate::core::types::PropertyValue::Document(nested) if !rest.is_empty() => {
                    walk(nested, rest, out);
                }
                _ => {}
            }
        }
    }

    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(document, &parts, &mut out);
    out
}

/// The matched text as it appears in the value (pre-lowercasing), best
/// effort: falls back to the token text when offsets do not line up.
fn original_slice(value: &str, offset: usize, token_text: &str) -> String {
    let end = offset + token_text.len();
    if value.is_char_boundary(offset) && end <= value.len() && value.is_char_boundary(end) {
        value[offset..end].to_string()
    } else {
        token_text.to_string()
    }
}

/// Cuts a window of roughly `max_window_bytes` centered on the match,
/// snapped outward to char boundaries. A zero budget means the whole value.
fn extract_window(value: &str, offset: usize, match_len: usize, max_window_bytes: usize) -> String {
    if max_window_bytes == 0 || value.len() <= max_window_bytes {
        return value.to_string();
    }

    let half = max_window_bytes.saturating_sub(match_len) / 2;
    let mut start = offset.saturating_sub(half);
    let mut end = (offset + match_len + half).min(value.len());

    while start > 0 && !value.is_char_boundary(start) {
        start -= 1;
    }
    while end < value.len() && !value.is_char_boundary(end) {
        end += 1;
    }
    value[start..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SectionId;
    use crate::schema::schema::{StringIndexing, TokenizerKind};

    fn section(path: &str) -> SectionMetadata {
        SectionMetadata {
            id: SectionId(0),
            path: path.to_string(),
            indexing: StringIndexing {
                term_match: TermMatch::Prefix,
                tokenizer: TokenizerKind::Plain,
            },
        }
    }

    fn clause(term: &str) -> TermClause {
        TermClause {
            property: None,
            term: term.to_string(),
        }
    }

    #[test]
    fn finds_match_window() {
        let document =
            Document::new("ns", "uri", "Message").add_string_property("body", "message body");
        let entries = snippet_document(
            &document,
            &[section("body")],
            &[clause("message")],
            TermMatch::Exact,
            SnippetSpec {
                num_to_snippet: 1,
                num_matches_per_property: 5,
                max_window_bytes: 64,
            },
            30,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exact_match, "message");
        assert_eq!(entries[0].window, "message body");
    }

    #[test]
    fn prefix_match_snippets_the_full_token() {
        let document =
            Document::new("ns", "uri", "Message").add_string_property("body", "message body");
        let entries = snippet_document(
            &document,
            &[section("body")],
            &[clause("mess")],
            TermMatch::Prefix,
            SnippetSpec {
                num_to_snippet: 1,
                num_matches_per_property: 5,
                max_window_bytes: 64,
            },
            30,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exact_match, "message");
    }

    #[test]
    fn window_respects_byte_budget() {
        let long = "aaa bbb ccc needle ddd eee fff".to_string();
        let document = Document::new("ns", "uri", "Message").add_string_property("body", &long);
        let entries = snippet_document(
            &document,
            &[section("body")],
            &[clause("needle")],
            TermMatch::Exact,
            SnippetSpec {
                num_to_snippet: 1,
                num_matches_per_property: 1,
                max_window_bytes: 12,
            },
            30,
        );
        assert_eq!(entries.len(), 1);
        assert!(entries[0].window.len() <= 14); // budget plus boundary slack
        assert!(entries[0].window.contains("needle"));
    }
}
