use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};

use crate::core::error::{Error, Result};

/// How a string property's terms can be matched at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TermMatch {
    Exact,
    #[default]
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenizerKind {
    Plain,
    Verbatim,
}

/// Indexing configuration for a string property. A property without one is
/// stored but not searchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringIndexing {
    pub term_match: TermMatch,
    pub tokenizer: TokenizerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataKind {
    Str,
    Int64,
    Double,
    Boolean,
    Bytes,
    /// Nested document of the named type. `index_nested_properties` pulls the
    /// nested type's indexed sections into the parent document.
    Document {
        schema_type: String,
        index_nested_properties: bool,
    },
}

impl DataKind {
    /// Whether two kinds are the same shape (nested target included).
    pub fn same_shape(&self, other: &DataKind) -> bool {
        match (self, other) {
            (
                DataKind::Document { schema_type: a, .. },
                DataKind::Document { schema_type: b, .. },
            ) => a == b,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    Required,
    Optional,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub name: String,
    pub kind: DataKind,
    pub cardinality: Cardinality,
    /// Only meaningful for `DataKind::Str`.
    pub string_indexing: Option<StringIndexing>,
}

impl PropertyConfig {
    pub fn is_indexed_string(&self) -> bool {
        matches!(self.kind, DataKind::Str) && self.string_indexing.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaType {
    pub name: String,
    pub properties: Vec<PropertyConfig>,
}

impl SchemaType {
    pub fn property(&self, name: &str) -> Option<&PropertyConfig> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// The full set of type configurations proposed or stored by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub types: Vec<SchemaType>,
}

impl Schema {
    pub fn new(types: Vec<SchemaType>) -> Self {
        Schema { types }
    }

    pub fn get_type(&self, name: &str) -> Option<&SchemaType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Structural validation of a proposed schema: unique non-empty type
    /// names, unique non-empty property names, nested types resolving, and
    /// no cycle in the "index nested properties" graph.
    pub fn validate(&self) -> Result<()> {
        let mut type_names = HashSet::new();
        for schema_type in &self.types {
            if schema_type.name.is_empty() {
                return Err(Error::invalid_argument("schema type name must not be empty"));
            }
            if !type_names.insert(schema_type.name.as_str()) {
                return Err(Error::already_exists(format!(
                    "duplicate schema type '{}'",
                    schema_type.name
                )));
            }

            let mut property_names = HashSet::new();
            for property in &schema_type.properties {
                if property.name.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "empty property name in type '{}'",
                        schema_type.name
                    )));
                }
                if !property_names.insert(property.name.as_str()) {
                    return Err(Error::invalid_argument(format!(
                        "duplicate property '{}' in type '{}'",
                        property.name, schema_type.name
                    )));
                }
                if property.string_indexing.is_some() && !matches!(property.kind, DataKind::Str) {
                    return Err(Error::invalid_argument(format!(
                        "property '{}.{}' has indexing config but is not a string",
                        schema_type.name, property.name
                    )));
                }
                if let DataKind::Document { schema_type: nested, .. } = &property.kind {
                    if self.get_type(nested).is_none() {
                        return Err(Error::invalid_argument(format!(
                            "property '{}.{}' references unknown type '{}'",
                            schema_type.name, property.name, nested
                        )));
                    }
                }
            }
        }

        self.check_nested_indexing_cycles()?;
        Ok(())
    }

    /// Rejects cycles among document properties that index nested
    /// properties. Plain nested references (without indexing) are allowed to
    /// be circular; only the indexing graph must be a DAG, since section
    /// assignment walks it.
    fn check_nested_indexing_cycles(&self) -> Result<()> {
        // edge (parent -> nested) exists iff index_nested_properties is set
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for schema_type in &self.types {
            for property in &schema_type.properties {
                if let DataKind::Document {
                    schema_type: nested,
                    index_nested_properties: true,
                } = &property.kind
                {
                    edges
                        .entry(schema_type.name.as_str())
                        .or_default()
                        .push(nested.as_str());
                }
            }
        }

        fn visit<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if done.contains(node) {
                return Ok(());
            }
            if !visiting.insert(node) {
                return Err(Error::invalid_argument(format!(
                    "cycle in nested property indexing involving type '{}'",
                    node
                )));
            }
            if let Some(targets) = edges.get(node) {
                for target in targets {
                    visit(target, edges, visiting, done)?;
                }
            }
            visiting.remove(node);
            done.insert(node);
            Ok(())
        }

        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        for schema_type in &self.types {
            visit(schema_type.name.as_str(), &edges, &mut visiting, &mut done)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_property(name: &str) -> PropertyConfig {
        PropertyConfig {
            name: name.to_string(),
            kind: DataKind::Str,
            cardinality: Cardinality::Optional,
            string_indexing: Some(StringIndexing {
                term_match: TermMatch::Prefix,
                tokenizer: TokenizerKind::Plain,
            }),
        }
    }

    fn nested_property(name: &str, target: &str, indexed: bool) -> PropertyConfig {
        PropertyConfig {
            name: name.to_string(),
            kind: DataKind::Document {
                schema_type: target.to_string(),
                index_nested_properties: indexed,
            },
            cardinality: Cardinality::Optional,
            string_indexing: None,
        }
    }

    #[test]
    fn duplicate_type_names_are_a_conflict() {
        let schema = Schema::new(vec![
            SchemaType { name: "A".into(), properties: vec![] },
            SchemaType { name: "A".into(), properties: vec![] },
        ]);
        let err = schema.validate().unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::AlreadyExists);
    }

    #[test]
    fn duplicate_property_names_are_invalid() {
        let schema = Schema::new(vec![SchemaType {
            name: "A".into(),
            properties: vec![string_property("p"), string_property("p")],
        }]);
        let err = schema.validate().unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn indexed_nested_cycle_is_rejected() {
        let schema = Schema::new(vec![
            SchemaType {
                name: "A".into(),
                properties: vec![nested_property("b", "B", true)],
            },
            SchemaType {
                name: "B".into(),
                properties: vec![nested_property("a", "A", true)],
            },
        ]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn unindexed_nested_cycle_is_allowed() {
        let schema = Schema::new(vec![
            SchemaType {
                name: "A".into(),
                properties: vec![nested_property("b", "B", false)],
            },
            SchemaType {
                name: "B".into(),
                properties: vec![nested_property("a", "A", false)],
            },
        ]);
        assert!(schema.validate().is_ok());
    }
}
