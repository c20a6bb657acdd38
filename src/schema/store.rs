use std::collections::HashMap;
use std::path::PathBuf;

use tracing::info;

use crate::core::error::{Error, Result};
use crate::core::types::{Document, PropertyValue, SchemaTypeId, SectionId};
use crate::schema::schema::{Cardinality, DataKind, Schema, SchemaType, StringIndexing};
use crate::storage::file::{checksum_of, read_checksummed, write_checksummed};
use crate::storage::layout::StorageLayout;

/// One indexed string section of a type. Nested indexed properties appear
/// with their dotted path ("sender.name").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionMetadata {
    pub id: SectionId,
    pub path: String,
    pub indexing: StringIndexing,
}

/// Shape-level changes a proposed schema makes to one surviving type.
/// Whether they actually invalidate anything depends on the documents that
/// exist, which is the coordinator's side of the join.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeChange {
    /// A property was removed or changed kind. Documents carrying that
    /// property no longer validate.
    pub property_removed_or_retyped: bool,
    /// A property's cardinality became more restrictive (e.g. optional to
    /// required). Only documents that do not satisfy the new cardinality
    /// are affected.
    pub cardinality_tightened: bool,
}

impl TypeChange {
    pub fn is_empty(&self) -> bool {
        !self.property_removed_or_retyped && !self.cardinality_tightened
    }
}

/// Shape-level diff of a proposed schema against the stored one. The
/// coordinator joins `types_removed` and `types_changed` against document
/// presence to decide what is backward-incompatible; the index fields are
/// purely structural and final as-is.
#[derive(Debug, Clone, Default)]
pub struct SchemaDelta {
    pub types_removed: Vec<String>,
    pub types_changed: Vec<(String, TypeChange)>,
    pub types_index_incompatible: Vec<String>,
    /// SchemaTypeId or SectionId assignments shifted; the index must be
    /// rebuilt.
    pub ids_changed: bool,
}

impl SchemaDelta {
    pub fn requires_index_rebuild(&self) -> bool {
        self.ids_changed || !self.types_index_incompatible.is_empty()
    }
}

/// Persists the active schema and owns the derived SchemaTypeId / SectionId
/// assignments the index keys on.
pub struct SchemaStore {
    path: PathBuf,
    schema: Option<Schema>,
    type_ids: HashMap<String, SchemaTypeId>,
    sections: HashMap<String, Vec<SectionMetadata>>,
}

impl SchemaStore {
    /// Opens the stored schema if present. A schema file that fails its
    /// checksum is not recoverable: the ground truth for what documents mean
    /// is gone, so this surfaces `Internal` rather than silently resetting.
    pub fn open(layout: &StorageLayout) -> Result<Self> {
        let path = layout.schema_path();
        let mut store = SchemaStore {
            path,
            schema: None,
            type_ids: HashMap::new(),
            sections: HashMap::new(),
        };
        if store.path.exists() {
            let schema: Schema = read_checksummed(&store.path)
                .map_err(|err| Error::internal(format!("schema unrecoverable: {}", err.context)))?;
            store.install(schema);
        }
        Ok(store)
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn get_type(&self, name: &str) -> Option<&SchemaType> {
        self.schema.as_ref().and_then(|s| s.get_type(name))
    }

    pub fn type_id(&self, name: &str) -> Option<SchemaTypeId> {
        self.type_ids.get(name).copied()
    }

    pub fn num_types(&self) -> usize {
        self.schema.as_ref().map(|s| s.types.len()).unwrap_or(0)
    }

    /// Ordered indexed sections of a type. Empty for unknown types.
    pub fn sections_of(&self, type_name: &str) -> &[SectionMetadata] {
        self.sections
            .get(type_name)
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn section_of_property(&self, type_name: &str, path: &str) -> Option<&SectionMetadata> {
        self.sections_of(type_name).iter().find(|s| s.path == path)
    }

    /// Mask of prefix-matchable sections of a type.
    pub fn prefix_section_mask(&self, type_name: &str) -> u64 {
        self.sections_of(type_name)
            .iter()
            .filter(|s| s.indexing.term_match == crate::schema::schema::TermMatch::Prefix)
            .fold(0u64, |mask, s| mask | s.id.mask_bit())
    }

    /// Validates a proposed schema and computes its shape-level delta
    /// without mutating state. `apply_schema` commits it afterwards.
    pub fn compute_delta(&self, proposed: &Schema) -> Result<SchemaDelta> {
        proposed.validate()?;

        let mut delta = SchemaDelta::default();
        let old = match &self.schema {
            Some(old) => old,
            None => return Ok(delta),
        };

        for old_type in &old.types {
            match proposed.get_type(&old_type.name) {
                None => delta.types_removed.push(old_type.name.clone()),
                Some(new_type) => {
                    let change = diff_type(old_type, new_type);
                    if !change.is_empty() {
                        delta.types_changed.push((old_type.name.clone(), change));
                    }
                    let old_sections = compute_sections(old, old_type)?;
                    let new_sections = compute_sections(proposed, new_type)?;
                    if old_sections != new_sections {
                        delta.types_index_incompatible.push(old_type.name.clone());
                    }
                }
            }
        }

        let old_ids = assign_type_ids(old);
        let new_ids = assign_type_ids(proposed);
        delta.ids_changed = old_ids != new_ids;

        Ok(delta)
    }

    /// Commits a validated schema: persists it and recomputes id and section
    /// assignments.
    pub fn apply_schema(&mut self, schema: Schema) -> Result<()> {
        // Section computation can fail on over-wide types, so run it before
        // touching disk.
        for schema_type in &schema.types {
            compute_sections(&schema, schema_type)?;
        }
        write_checksummed(&self.path, &schema)?;
        info!(num_types = schema.types.len(), "schema applied");
        self.install(schema);
        Ok(())
    }

    /// Validates a document against the active schema. Returns the id of its
    /// type on success.
    pub fn validate_document(&self, document: &Document) -> Result<SchemaTypeId> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("schema not set"))?;
        validate_document_against(schema, document)?;

        // type_ids is rebuilt whenever the schema is, so the lookup holds
        Ok(self.type_ids[&document.schema_type])
    }

    pub fn compute_checksum(&self) -> Result<u32> {
        checksum_of(&self.schema)
    }

    fn install(&mut self, schema: Schema) {
        self.type_ids = assign_type_ids(&schema);
        self.sections = schema
            .types
            .iter()
            .map(|t| {
                let sections = compute_sections(&schema, t).unwrap_or_default();
                (t.name.clone(), sections)
            })
            .collect();
        self.schema = Some(schema);
    }
}

fn assign_type_ids(schema: &Schema) -> HashMap<String, SchemaTypeId> {
    schema
        .types
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), SchemaTypeId(i as u16)))
        .collect()
}

/// Collects the indexed string sections of a type, following nested document
/// properties that opted into indexing. Paths are sorted so SectionIds are
/// deterministic for a given schema.
fn compute_sections(schema: &Schema, schema_type: &SchemaType) -> Result<Vec<SectionMetadata>> {
    let mut paths: Vec<(String, StringIndexing)> = Vec::new();
    collect_section_paths(schema, schema_type, "", &mut paths);
    paths.sort_by(|a, b| a.0.cmp(&b.0));

    if paths.len() > SectionId::MAX.0 as usize + 1 {
        return Err(Error::out_of_space(format!(
            "type '{}' has {} indexed sections, max {}",
            schema_type.name,
            paths.len(),
            SectionId::MAX.0 as usize + 1
        )));
    }

    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(i, (path, indexing))| SectionMetadata {
            id: SectionId(i as u8),
            path,
            indexing,
        })
        .collect())
}

fn collect_section_paths(
    schema: &Schema,
    schema_type: &SchemaType,
    prefix: &str,
    out: &mut Vec<(String, StringIndexing)>,
) {
    for property in &schema_type.properties {
        let path = if prefix.is_empty() {
            property.name.clone()
        } else {
            format!("{}.{}", prefix, property.name)
        };
        match &property.kind {
            DataKind::Str => {
                if let Some(indexing) = property.string_indexing {
                    out.push((path, indexing));
                }
            }
            DataKind::Document {
                schema_type: nested,
                index_nested_properties: true,
            } => {
                // Cycles are rejected at validation, so recursion terminates.
                if let Some(nested_type) = schema.get_type(nested) {
                    collect_section_paths(schema, nested_type, &path, out);
                }
            }
            _ => {}
        }
    }
}

/// Checks a document against one specific schema, active or proposed.
/// The coordinator runs this with a proposed schema to find the documents a
/// forced incompatible change would invalidate.
pub fn validate_document_against(schema: &Schema, document: &Document) -> Result<()> {
    let schema_type = schema
        .get_type(&document.schema_type)
        .ok_or_else(|| {
            Error::not_found(format!("unknown schema type '{}'", document.schema_type))
        })?;

    for property in &schema_type.properties {
        let values = document
            .properties
            .get(&property.name)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        match property.cardinality {
            Cardinality::Required if values.is_empty() => {
                return Err(Error::invalid_argument(format!(
                    "required property '{}.{}' is missing",
                    schema_type.name, property.name
                )));
            }
            Cardinality::Required | Cardinality::Optional if values.len() > 1 => {
                return Err(Error::invalid_argument(format!(
                    "property '{}.{}' takes at most one value",
                    schema_type.name, property.name
                )));
            }
            _ => {}
        }
        for value in values {
            if !value_matches_kind(value, &property.kind) {
                return Err(Error::invalid_argument(format!(
                    "property '{}.{}' has a value of the wrong kind",
                    schema_type.name, property.name
                )));
            }
        }
    }

    for name in document.properties.keys() {
        if schema_type.property(name).is_none() {
            return Err(Error::invalid_argument(format!(
                "unknown property '{}.{}'",
                schema_type.name, name
            )));
        }
    }

    Ok(())
}

fn diff_type(old: &SchemaType, new: &SchemaType) -> TypeChange {
    let mut change = TypeChange::default();
    for old_property in &old.properties {
        match new.property(&old_property.name) {
            // Removing a property orphans any existing values.
            None => change.property_removed_or_retyped = true,
            Some(new_property) => {
                if !old_property.kind.same_shape(&new_property.kind) {
                    change.property_removed_or_retyped = true;
                }
                if cardinality_rank(new_property.cardinality)
                    < cardinality_rank(old_property.cardinality)
                {
                    change.cardinality_tightened = true;
                }
            }
        }
    }
    change
}

fn cardinality_rank(cardinality: Cardinality) -> u8 {
    match cardinality {
        Cardinality::Required => 0,
        Cardinality::Optional => 1,
        Cardinality::Repeated => 2,
    }
}

fn value_matches_kind(value: &PropertyValue, kind: &DataKind) -> bool {
    match (value, kind) {
        (PropertyValue::Str(_), DataKind::Str) => true,
        (PropertyValue::Int(_), DataKind::Int64) => true,
        (PropertyValue::Double(_), DataKind::Double) => true,
        (PropertyValue::Boolean(_), DataKind::Boolean) => true,
        (PropertyValue::Bytes(_), DataKind::Bytes) => true,
        (PropertyValue::Document(doc), DataKind::Document { schema_type, .. }) => {
            doc.schema_type == *schema_type
        }
        _ => false,
    }
}
