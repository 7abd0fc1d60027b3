//! Demo models: users on the default database, groups on `groups`.

use sqlbind::Result;
use sqlbind::model::{Column, ModelDecl, SqlType};

pub const GROUPS_KEY: &str = "groups";

pub mod user {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "user")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod group {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "group")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

fn key_columns() -> [Column; 2] {
    [
        Column::new("id", SqlType::Integer).primary_key().auto_increment(),
        Column::new("name", SqlType::String(Some(100))).not_null().unique(),
    ]
}

/// Register both models; their table names derive from the model names.
///
/// # Errors
/// Returns the registration error, e.g. when called twice.
pub fn register() -> Result<()> {
    ModelDecl::new("demo::User")
        .entity::<user::Entity>()
        .columns(key_columns())
        .register()?;
    ModelDecl::new("demo::Group")
        .database(GROUPS_KEY)
        .entity::<group::Entity>()
        .columns(key_columns())
        .register()?;
    Ok(())
}
