use crate::analysis::tokenizer::{PlainTokenizer, Tokenizer};
use crate::core::error::{Error, Result};

/// One required term of a query, optionally pinned to a property path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermClause {
    pub property: Option<String>,
    pub term: String,
}

/// A parsed query: every clause must match the same document (implicit AND).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    pub clauses: Vec<TermClause>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Parses the term-query grammar: whitespace-separated segments, where a
/// `property:value` segment restricts its terms to that property. Segment
/// values run through the plain tokenizer, so `foo:bar-baz` yields two
/// clauses ("bar" and "baz"), both restricted to `foo` — a hyphen never
/// negates.
pub struct QueryParser {
    tokenizer: PlainTokenizer,
}

impl QueryParser {
    pub fn new(max_token_length: usize) -> Self {
        QueryParser {
            tokenizer: PlainTokenizer { max_token_length },
        }
    }

    pub fn parse(&self, query: &str) -> Result<ParsedQuery> {
        let mut clauses = Vec::new();

        for segment in query.split_whitespace() {
            let (property, value) = match segment.split_once(':') {
                Some((prop, rest)) if !prop.is_empty() && !rest.is_empty() => {
                    if !is_property_path(prop) {
                        return Err(Error::invalid_argument(format!(
                            "invalid property restrict '{}'",
                            prop
                        )));
                    }
                    (Some(prop.to_string()), rest)
                }
                _ => (None, segment),
            };

            for token in self.tokenizer.tokenize(value) {
                clauses.push(TermClause {
                    property: property.clone(),
                    term: token.text,
                });
            }
        }

        Ok(ParsedQuery { clauses })
    }
}

fn is_property_path(path: &str) -> bool {
    path.split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(query: &str) -> ParsedQuery {
        QueryParser::new(30).parse(query).unwrap()
    }

    #[test]
    fn bare_terms_have_no_restrict() {
        let parsed = parse("message body");
        assert_eq!(parsed.clauses.len(), 2);
        assert_eq!(parsed.clauses[0].property, None);
        assert_eq!(parsed.clauses[0].term, "message");
        assert_eq!(parsed.clauses[1].term, "body");
    }

    #[test]
    fn property_restrict_applies_to_every_token_of_the_segment() {
        let parsed = parse("foo:bar-baz");
        assert_eq!(parsed.clauses.len(), 2);
        assert_eq!(parsed.clauses[0].property.as_deref(), Some("foo"));
        assert_eq!(parsed.clauses[0].term, "bar");
        assert_eq!(parsed.clauses[1].property.as_deref(), Some("foo"));
        assert_eq!(parsed.clauses[1].term, "baz");
    }

    #[test]
    fn empty_query_parses_to_no_clauses() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
    }

    #[test]
    fn terms_are_lowercased() {
        let parsed = parse("Message");
        assert_eq!(parsed.clauses[0].term, "message");
    }
}
