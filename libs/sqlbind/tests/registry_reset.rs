#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::note;
use sqlbind::MetadataRegistry;
use sqlbind::model::{Column, ModelClass, ModelDecl, ModelIndex, SqlType};
use std::sync::Arc;

const KEY: &str = "reset_archive";

fn declare() -> Arc<ModelClass> {
    ModelDecl::new("tests::ArchivedNote")
        .database(KEY)
        .table_name("notes")
        .entity::<note::Entity>()
        .column(Column::new("id", SqlType::Integer).primary_key())
        .register()
        .unwrap()
}

#[test]
fn test_reset_forgets_binds_and_models() {
    declare();
    assert!(MetadataRegistry::find(KEY).is_some());
    assert!(ModelIndex::contains("tests::ArchivedNote"));
    assert!(ModelIndex::by_type::<note::Entity>().is_some());

    MetadataRegistry::reset();
    ModelIndex::reset();

    assert!(MetadataRegistry::find(KEY).is_none());
    assert!(MetadataRegistry::find("default").is_none());
    assert!(!ModelIndex::contains("tests::ArchivedNote"));
    assert!(ModelIndex::by_type::<note::Entity>().is_none());
    assert!(ModelIndex::all().is_empty());

    // a fresh container for the key, and the model can be declared again
    assert!(MetadataRegistry::make_or_get(KEY).metadata.table("notes").is_none());
    let model = declare();
    assert_eq!(model.bind_key(), KEY);
    assert!(MetadataRegistry::make_or_get(KEY).metadata.table("notes").is_some());
}
