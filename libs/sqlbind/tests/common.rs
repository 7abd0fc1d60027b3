#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use sqlbind::model::{Column, ModelClass, ModelDecl, SqlType};

pub mod note {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "notes")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub title: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Register the `Note` model on `bind_key`, once per test binary.
///
/// # Panics
/// Panics if registration fails.
pub fn register_notes(bind_key: &str) {
    static NOTES: OnceLock<Arc<ModelClass>> = OnceLock::new();
    let model = NOTES.get_or_init(|| {
        ModelDecl::new("tests::Note")
            .database(bind_key)
            .table_name("notes")
            .entity::<note::Entity>()
            .column(Column::new("id", SqlType::Integer).primary_key().auto_increment())
            .column(Column::new("title", SqlType::String(Some(200))).not_null())
            .register()
            .unwrap()
    });
    assert_eq!(model.bind_key(), bind_key, "notes already registered elsewhere");
}

#[must_use]
pub fn new_note(title: &str) -> note::ActiveModel {
    use sea_orm::ActiveValue::{NotSet, Set};
    note::ActiveModel {
        id: NotSet,
        title: Set(title.to_owned()),
    }
}
