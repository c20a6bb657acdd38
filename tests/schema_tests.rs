mod common;

use common::*;
use lodestone::{
    Cardinality, DataKind, Document, ErrorKind, PropertyConfig, Schema, SchemaType, TermMatch,
};

fn two_property_schema() -> Schema {
    Schema::new(vec![SchemaType {
        name: "Message".to_string(),
        properties: vec![
            indexed_property("body", TermMatch::Prefix),
            indexed_property("subject", TermMatch::Prefix),
        ],
    }])
}

#[test]
fn get_schema_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());

    assert_eq!(engine.get_schema().unwrap_err().kind, ErrorKind::NotFound);

    let schema = two_property_schema();
    engine.set_schema(schema.clone(), false).unwrap();
    assert_eq!(engine.get_schema().unwrap(), schema);

    let message = engine.get_schema_type("Message").unwrap();
    assert_eq!(message.properties.len(), 2);
    assert_eq!(
        engine.get_schema_type("Missing").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn duplicate_type_names_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());

    let schema = Schema::new(vec![
        SchemaType {
            name: "Message".to_string(),
            properties: vec![],
        },
        SchemaType {
            name: "Message".to_string(),
            properties: vec![],
        },
    ]);
    let err = engine.set_schema(schema, false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyExists);
    // Nothing was applied.
    assert_eq!(engine.get_schema().unwrap_err().kind, ErrorKind::NotFound);
}

#[test]
fn cyclic_nested_indexing_is_rejected_without_state_change() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();

    let nested = |name: &str, target: &str| PropertyConfig {
        name: name.to_string(),
        kind: DataKind::Document {
            schema_type: target.to_string(),
            index_nested_properties: true,
        },
        cardinality: Cardinality::Optional,
        string_indexing: None,
    };
    let cyclic = Schema::new(vec![
        SchemaType {
            name: "A".to_string(),
            properties: vec![nested("b", "B")],
        },
        SchemaType {
            name: "B".to_string(),
            properties: vec![nested("a", "A")],
        },
    ]);

    let err = engine.set_schema(cyclic, false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert_eq!(engine.get_schema().unwrap(), message_schema());
}

#[test]
fn incompatible_change_requires_force() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();
    engine.put(message("uri1", "message")).unwrap();

    // Dropping the Message type deletes documents; without force this must
    // be rejected with the offending type named.
    let empty = Schema::new(vec![]);
    let err = engine.set_schema(empty.clone(), false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    assert!(err.context.contains("Message"));
    assert!(engine.get("namespace", "uri1").is_ok());

    // With force the schema lands and the documents go away.
    let result = engine.set_schema(empty.clone(), true).unwrap();
    assert_eq!(result.deleted_types, vec!["Message"]);
    assert_eq!(engine.get_schema().unwrap(), empty);
    assert_eq!(
        engine.get("namespace", "uri1").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn tightening_cardinality_is_compatible_when_documents_satisfy_it() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();
    // Every live document already carries a body, so optional -> required
    // invalidates nothing and needs no force.
    engine.put(message("uri1", "message")).unwrap();

    let mut tightened = message_schema();
    tightened.types[0].properties[0].cardinality = Cardinality::Required;
    let result = engine.set_schema(tightened, false).unwrap();
    assert!(result.incompatible_types.is_empty());

    assert!(engine.get("namespace", "uri1").is_ok());
    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&results), vec!["uri1"]);
}

#[test]
fn forced_tightening_revalidates_documents_individually() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();

    engine.put(message("with_body", "message body")).unwrap();
    // body is optional, so a document without it is valid today.
    engine
        .put(Document::new("namespace", "without_body", "Message").with_creation_timestamp(START_MS))
        .unwrap();

    let mut tightened = message_schema();
    tightened.types[0].properties[0].cardinality = Cardinality::Required;

    // A live document lacks the field, so the change needs force.
    let err = engine.set_schema(tightened.clone(), false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    assert!(err.context.contains("Message"));

    // Forced: only the document missing the now-required field goes away.
    let result = engine.set_schema(tightened, true).unwrap();
    assert_eq!(result.incompatible_types, vec!["Message"]);
    assert!(engine.get("namespace", "with_body").is_ok());
    assert_eq!(
        engine.get("namespace", "without_body").unwrap_err().kind,
        ErrorKind::NotFound
    );

    // The survivor is still searchable.
    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&results), vec!["with_body"]);
}

#[test]
fn deleting_a_type_without_documents_needs_no_force() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());

    let mut two_types = message_schema();
    two_types.types.push(SchemaType {
        name: "Unused".to_string(),
        properties: vec![indexed_property("note", TermMatch::Prefix)],
    });
    engine.set_schema(two_types, false).unwrap();
    engine.put(message("uri1", "message")).unwrap();

    // Dropping "Unused" deletes nothing, so no force is needed and the
    // result reports no deleted types.
    let result = engine.set_schema(message_schema(), false).unwrap();
    assert!(result.deleted_types.is_empty());
    assert!(result.incompatible_types.is_empty());

    assert!(engine.get("namespace", "uri1").is_ok());
}

#[test]
fn removing_a_property_with_documents_still_needs_force() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(two_property_schema(), false).unwrap();

    engine
        .put(
            Document::new("namespace", "uri1", "Message")
                .add_string_property("body", "hello")
                .add_string_property("subject", "greetings")
                .with_creation_timestamp(START_MS),
        )
        .unwrap();

    // Dropping "subject" orphans the value the document carries.
    let err = engine.set_schema(message_schema(), false).unwrap_err();
    assert_eq!(err.kind, ErrorKind::FailedPrecondition);

    let result = engine.set_schema(message_schema(), true).unwrap();
    assert_eq!(result.incompatible_types, vec!["Message"]);
    // The document still carries the orphaned property, so it fails the new
    // schema and is gone.
    assert_eq!(
        engine.get("namespace", "uri1").unwrap_err().kind,
        ErrorKind::NotFound
    );
}

#[test]
fn forced_schema_survives_search() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();
    engine.put(message("uri1", "message")).unwrap();

    engine.set_schema(Schema::new(vec![]), true).unwrap();
    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert!(results.results.is_empty());
}

#[test]
fn newly_indexed_property_reindexes_existing_documents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());

    // v1: body stored but not indexed.
    let v1 = Schema::new(vec![SchemaType {
        name: "Message".to_string(),
        properties: vec![unindexed_property("body")],
    }]);
    engine.set_schema(v1, false).unwrap();
    engine.put(message("uri1", "message")).unwrap();

    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert!(results.results.is_empty());

    // v2: body becomes indexed; the index restore must pick up the old doc.
    let result = engine.set_schema(message_schema(), false).unwrap();
    assert_eq!(result.index_incompatible_types, vec!["Message"]);

    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&results), vec!["uri1"]);
}

#[test]
fn adding_a_type_is_compatible() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(message_schema(), false).unwrap();
    engine.put(message("uri1", "message")).unwrap();

    let mut extended = message_schema();
    extended.types.push(SchemaType {
        name: "Person".to_string(),
        properties: vec![indexed_property("name", TermMatch::Prefix)],
    });
    let result = engine.set_schema(extended, false).unwrap();
    assert!(result.incompatible_types.is_empty());
    assert!(result.deleted_types.is_empty());

    // Existing documents still searchable after the id-shifting change.
    let results = engine
        .search(
            &search("message", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&results), vec!["uri1"]);

    engine
        .put(
            Document::new("namespace", "p1", "Person")
                .add_string_property("name", "ada")
                .with_creation_timestamp(START_MS),
        )
        .unwrap();
    let results = engine
        .search(
            &search("ada", TermMatch::Prefix),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&results), vec!["p1"]);
}

#[test]
fn property_restrict_only_matches_that_property() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());
    engine.set_schema(two_property_schema(), false).unwrap();

    engine
        .put(
            Document::new("namespace", "uri1", "Message")
                .add_string_property("body", "hello world")
                .add_string_property("subject", "greetings")
                .with_creation_timestamp(START_MS),
        )
        .unwrap();

    let hit = engine
        .search(
            &search("subject:greetings", TermMatch::Exact),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert_eq!(result_uris(&hit), vec!["uri1"]);

    let miss = engine
        .search(
            &search("body:greetings", TermMatch::Exact),
            &default_scoring(),
            &default_results(),
        )
        .unwrap();
    assert!(miss.results.is_empty());
}

#[test]
fn required_property_is_enforced_on_put() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(dir.path(), clock());

    let mut schema = message_schema();
    schema.types[0].properties[0].cardinality = Cardinality::Required;
    engine.set_schema(schema, false).unwrap();

    let missing_body =
        Document::new("namespace", "uri1", "Message").with_creation_timestamp(START_MS);
    assert_eq!(
        engine.put(missing_body).unwrap_err().kind,
        ErrorKind::InvalidArgument
    );
}
