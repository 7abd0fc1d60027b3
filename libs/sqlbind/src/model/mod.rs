//! Explicit model declaration.
//!
//! A [`ModelDecl`] describes one model class (its path, bind key, table name,
//! columns and parent). [`ModelDecl::register`] runs the registration steps in
//! a fixed order:
//!
//! 1. table-name resolution
//! 2. bind-key resolution
//! 3. schema-container resolution
//! 4. table construction (plain, joined or single-table inheritance)
//! 5. mapper registration
//! 6. model-index tracking
//!
//! Export is available on every serializable model value through
//! [`ModelDataExport`].

pub mod export;
pub mod index;
pub mod naming;
mod table;

pub use crate::metadata::{Column, ForeignKeyRef, SqlType};
pub use export::ModelDataExport;
pub use index::ModelIndex;
pub use naming::camel_to_snake_case;
pub use table::TableDecl;

use sea_orm::{EntityName, EntityTrait};
use std::sync::Arc;
use tracing::debug;

use crate::metadata::{
    EntityLink, Inheritance, Mapper, MapperRegistry, MetadataRegistry, SKIP_AUTOGEN,
    SchemaContainer, Table,
};
use crate::{DEFAULT_KEY, DbError, Result};

/// Computed table-name accessor; receives the class name.
pub type TableNameFn = fn(&str) -> String;

/// What a declaration produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    /// Mapped to a table and tracked in the model index.
    Concrete,
    /// Carries shared columns and settings; never mapped.
    Abstract,
    /// Declarative base: the root that models extend.
    Base,
}

#[derive(Clone, Debug)]
enum TableName {
    Derived,
    Fixed(String),
    Computed(TableNameFn),
}

/// A registered model.
#[derive(Debug)]
pub struct ModelClass {
    path: String,
    name: String,
    kind: ModelKind,
    bind_key: String,
    metadata: Arc<SchemaContainer>,
    registry: Arc<MapperRegistry>,
    declared_name: TableName,
    columns: Vec<Column>,
    table: Option<Arc<Table>>,
    mapper: Option<Arc<Mapper>>,
    parent: Option<Arc<ModelClass>>,
}

impl ModelClass {
    /// Fully-qualified model path, e.g. `app::models::User`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Class name (last path segment).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    #[must_use]
    pub fn bind_key(&self) -> &str {
        &self.bind_key
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<SchemaContainer> {
        &self.metadata
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MapperRegistry> {
        &self.registry
    }

    /// Resolved table name; `None` for abstract models and bases.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        self.table.as_ref().map(|t| t.name())
    }

    #[must_use]
    pub fn table(&self) -> Option<&Arc<Table>> {
        self.table.as_ref()
    }

    #[must_use]
    pub fn mapper(&self) -> Option<&Arc<Mapper>> {
        self.mapper.as_ref()
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<ModelClass>> {
        self.parent.as_ref()
    }

    /// Columns declared on this model itself.
    #[must_use]
    pub fn declared_columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Builder describing one model before registration.
#[derive(Debug)]
pub struct ModelDecl {
    path: String,
    kind: ModelKind,
    bind_key: Option<String>,
    table_name: TableName,
    metadata: Option<Arc<SchemaContainer>>,
    table: Option<Arc<Table>>,
    parent: Option<Arc<ModelClass>>,
    columns: Vec<Column>,
    entity: Option<(EntityLink, String)>,
    skip_autogen: bool,
}

struct BuiltTable {
    table: Arc<Table>,
    inheritance: Inheritance,
    parent_mapper: Option<Arc<Mapper>>,
}

impl ModelDecl {
    /// Concrete model at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ModelKind::Concrete,
            bind_key: None,
            table_name: TableName::Derived,
            metadata: None,
            table: None,
            parent: None,
            columns: Vec::new(),
            entity: None,
            skip_autogen: false,
        }
    }

    /// Explicit bind key.
    #[must_use]
    pub fn database(mut self, bind_key: impl Into<String>) -> Self {
        self.bind_key = Some(bind_key.into());
        self
    }

    /// Fixed table name, kept verbatim.
    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = TableName::Fixed(name.into());
        self
    }

    /// Table name computed from the class name; also applies to subclasses.
    #[must_use]
    pub fn computed_table_name(mut self, f: TableNameFn) -> Self {
        self.table_name = TableName::Computed(f);
        self
    }

    /// Use this schema container instead of the bind key's one.
    #[must_use]
    pub fn metadata(mut self, metadata: Arc<SchemaContainer>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Map onto an already defined table.
    #[must_use]
    pub fn table(mut self, table: Arc<Table>) -> Self {
        self.table = Some(table);
        self
    }

    #[must_use]
    pub fn abstract_(mut self) -> Self {
        self.kind = ModelKind::Abstract;
        self
    }

    #[must_use]
    pub fn declarative_base(mut self) -> Self {
        self.kind = ModelKind::Base;
        self
    }

    #[must_use]
    pub fn extends(mut self, parent: &Arc<ModelClass>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Link a `SeaORM` entity; its table name must match the resolved one.
    #[must_use]
    pub fn entity<E: EntityTrait + Default>(mut self) -> Self {
        self.entity = Some((EntityLink::of::<E>(), E::default().table_name().to_owned()));
        self
    }

    /// Exclude the model's table from migration autogeneration.
    #[must_use]
    pub fn skip_autogen(mut self) -> Self {
        self.skip_autogen = true;
        self
    }

    /// Register the model.
    ///
    /// # Errors
    /// Returns `DbError::InvalidModel` when the declaration cannot be mapped
    /// (no primary key, duplicate table, missing inheritance foreign key,
    /// entity/table mismatch).
    pub fn register(self) -> Result<Arc<ModelClass>> {
        let name = self
            .path
            .rsplit("::")
            .next()
            .unwrap_or(&self.path)
            .to_owned();

        let table_name = self.resolve_table_name(&name);
        let bind_key = self.resolve_bind_key();
        let (metadata, registry) = self.resolve_container(&bind_key)?;

        let built = match &table_name {
            Some(table_name) => Some(self.build_table(&name, table_name, &metadata)?),
            None => None,
        };

        let mapper = match &built {
            Some(built) => {
                if let Some((link, entity_table)) = &self.entity
                    && entity_table != built.table.name()
                {
                    return Err(DbError::InvalidModel(format!(
                        "Entity '{}' maps table '{entity_table}' but model '{}' resolved table '{}'",
                        link.type_name,
                        self.path,
                        built.table.name()
                    )));
                }
                if self.skip_autogen {
                    built.table.set_info(SKIP_AUTOGEN, serde_json::Value::Bool(true));
                }
                let mapper = Arc::new(Mapper::new(
                    self.path.clone(),
                    self.entity.as_ref().map(|(link, _)| *link),
                    Arc::clone(&built.table),
                    built.parent_mapper.clone(),
                    built.inheritance,
                ));
                registry.register(Arc::clone(&mapper));
                Some(mapper)
            }
            None => None,
        };

        let model = Arc::new(ModelClass {
            path: self.path,
            name,
            kind: self.kind,
            bind_key,
            metadata,
            registry,
            declared_name: self.table_name,
            columns: self.columns,
            table: built.map(|b| b.table),
            mapper,
            parent: self.parent,
        });

        if model.mapper.is_some() {
            ModelIndex::insert(&model);
        }
        debug!(
            model = model.path(),
            bind_key = model.bind_key(),
            table = model.table_name().unwrap_or("-"),
            "model registered"
        );
        Ok(model)
    }

    fn resolve_table_name(&self, name: &str) -> Option<String> {
        if self.kind != ModelKind::Concrete {
            return None;
        }
        if let Some(table) = &self.table {
            return Some(table.name().to_owned());
        }
        match &self.table_name {
            TableName::Fixed(n) => return Some(n.clone()),
            TableName::Computed(f) => return Some(f(name)),
            TableName::Derived => {}
        }

        let mut ancestor = self.parent.as_deref();
        while let Some(parent) = ancestor {
            match &parent.declared_name {
                TableName::Computed(f) => return Some(f(name)),
                TableName::Fixed(n) if parent.kind == ModelKind::Abstract => {
                    return Some(n.clone());
                }
                _ => {}
            }
            if let Some(parent_table) = &parent.table {
                // single-table inheritance keeps the parent's table
                return if self.collect_columns().1.iter().any(|c| c.primary_key) {
                    Some(camel_to_snake_case(name))
                } else {
                    Some(parent_table.name().to_owned())
                };
            }
            ancestor = parent.parent.as_deref();
        }
        Some(camel_to_snake_case(name))
    }

    fn resolve_bind_key(&self) -> String {
        self.bind_key
            .clone()
            .or_else(|| self.table.as_ref().and_then(|t| t.bind_key()))
            .or_else(|| self.parent.as_ref().map(|p| p.bind_key.clone()))
            .unwrap_or_else(|| DEFAULT_KEY.to_owned())
    }

    fn resolve_container(
        &self,
        bind_key: &str,
    ) -> Result<(Arc<SchemaContainer>, Arc<MapperRegistry>)> {
        if let Some(table) = &self.table {
            let metadata = table.metadata().ok_or_else(|| {
                DbError::InvalidModel(format!(
                    "Table '{}' is not attached to a schema container",
                    table.name()
                ))
            })?;
            let registry =
                MetadataRegistry::registry_for(&metadata).unwrap_or_else(MapperRegistry::new);
            return Ok((metadata, registry));
        }

        if let Some(metadata) = &self.metadata {
            if metadata.bind_key().is_none() {
                metadata.stamp_bind_key(bind_key);
            }
            if self.kind == ModelKind::Base {
                if !MetadataRegistry::exists(bind_key) {
                    MetadataRegistry::put(bind_key, Arc::clone(metadata), MapperRegistry::new());
                }
                let bind = MetadataRegistry::get(bind_key)?;
                return Ok((bind.metadata, bind.registry));
            }
            let registry =
                MetadataRegistry::registry_for(metadata).unwrap_or_else(MapperRegistry::new);
            return Ok((Arc::clone(metadata), registry));
        }

        let bind = MetadataRegistry::make_or_get(bind_key);
        Ok((bind.metadata, bind.registry))
    }

    /// Nearest mapped ancestor, plus the columns this model contributes:
    /// its own and those of unmapped ancestors below that mapped one.
    fn collect_columns(&self) -> (Option<Arc<ModelClass>>, Vec<Column>) {
        let mut chain = Vec::new();
        let mut mapped = None;
        let mut ancestor = self.parent.clone();
        while let Some(parent) = ancestor {
            if parent.table.is_some() {
                mapped = Some(parent);
                break;
            }
            ancestor = parent.parent.clone();
            chain.push(parent);
        }

        let mut columns: Vec<Column> = Vec::new();
        let declared = chain
            .iter()
            .rev()
            .flat_map(|p| p.columns.iter())
            .chain(self.columns.iter());
        for col in declared {
            columns.retain(|c| c.name != col.name);
            columns.push(col.clone());
        }
        (mapped, columns)
    }

    fn build_table(
        &self,
        name: &str,
        table_name: &str,
        metadata: &Arc<SchemaContainer>,
    ) -> Result<BuiltTable> {
        if let Some(table) = &self.table {
            return Ok(BuiltTable {
                table: Arc::clone(table),
                inheritance: Inheritance::None,
                parent_mapper: None,
            });
        }

        let (mapped_parent, columns) = self.collect_columns();
        let has_pk = columns.iter().any(|c| c.primary_key);

        if let Some(parent) = mapped_parent
            && let Some(parent_table) = parent.table.clone()
        {
            let parent_mapper = parent.mapper.clone();
            if !has_pk {
                parent_table.append_columns(&columns)?;
                return Ok(BuiltTable {
                    table: parent_table,
                    inheritance: Inheritance::SingleTable,
                    parent_mapper,
                });
            }
            let joined = columns.iter().any(|c| {
                c.references
                    .as_ref()
                    .is_some_and(|r| r.table == parent_table.name())
            });
            if !joined {
                return Err(DbError::InvalidModel(format!(
                    "Can't find any foreign key relationships between '{}' and '{table_name}'.",
                    parent_table.name()
                )));
            }
            let table = metadata.define_table(table_name, columns)?;
            return Ok(BuiltTable {
                table,
                inheritance: Inheritance::Joined,
                parent_mapper,
            });
        }

        if let Some(existing) = metadata.table(table_name) {
            if columns.is_empty() {
                return Ok(BuiltTable {
                    table: existing,
                    inheritance: Inheritance::None,
                    parent_mapper: None,
                });
            }
            return Err(DbError::InvalidModel(format!(
                "Table '{table_name}' is already defined for this schema container \
                 (while registering '{name}')"
            )));
        }

        if !has_pk {
            return Err(DbError::InvalidModel(format!(
                "Mapper could not assemble any primary key columns for mapped table '{table_name}'"
            )));
        }
        metadata.define_table(table_name, columns)
            .map(|table| BuiltTable {
                table,
                inheritance: Inheritance::None,
                parent_mapper: None,
            })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn id() -> Column {
        Column::new("id", SqlType::Integer).primary_key()
    }

    #[test]
    fn test_derived_and_explicit_table_names() {
        let derived = ModelDecl::new("model_tests::names::UserAccount")
            .database("model_names")
            .column(id())
            .register()
            .unwrap();
        assert_eq!(derived.table_name(), Some("user_account"));

        let explicit = ModelDecl::new("model_tests::names::Legacy")
            .database("model_names")
            .table_name("LEGACY_Table")
            .column(id())
            .register()
            .unwrap();
        assert_eq!(explicit.table_name(), Some("LEGACY_Table"));
        assert!(ModelIndex::contains("model_tests::names::Legacy"));
    }

    #[test]
    fn test_abstract_model_gets_no_table() {
        let base = ModelDecl::new("model_tests::abstract_::Timestamped")
            .database("model_abstract")
            .abstract_()
            .column(Column::new("created_at", SqlType::DateTime))
            .register()
            .unwrap();
        assert_eq!(base.table_name(), None);
        assert!(base.mapper().is_none());
        assert!(!ModelIndex::contains("model_tests::abstract_::Timestamped"));

        let post = ModelDecl::new("model_tests::abstract_::BlogPost")
            .extends(&base)
            .column(id())
            .register()
            .unwrap();
        assert_eq!(post.table_name(), Some("blog_post"));
        assert_eq!(post.bind_key(), "model_abstract");
        let table = post.table().unwrap();
        assert!(table.column("created_at").is_some());
    }

    #[test]
    fn test_joined_inheritance_gets_fresh_name() {
        let employee = ModelDecl::new("model_tests::joined::Employee")
            .database("model_joined")
            .column(id())
            .column(Column::new("kind", SqlType::String(Some(32))))
            .register()
            .unwrap();
        let engineer = ModelDecl::new("model_tests::joined::Engineer")
            .extends(&employee)
            .column(id().references("employee", "id"))
            .column(Column::new("language", SqlType::String(Some(32))))
            .register()
            .unwrap();
        assert_eq!(engineer.table_name(), Some("engineer"));
        let mapper = engineer.mapper().unwrap();
        assert_eq!(mapper.inheritance(), Inheritance::Joined);
        assert_eq!(mapper.inherits().unwrap().model(), "model_tests::joined::Employee");
    }

    #[test]
    fn test_joined_inheritance_requires_foreign_key() {
        let parent = ModelDecl::new("model_tests::joined_fk::Vehicle")
            .database("model_joined_fk")
            .column(id())
            .register()
            .unwrap();
        let err = ModelDecl::new("model_tests::joined_fk::Truck")
            .extends(&parent)
            .column(id())
            .register()
            .unwrap_err();
        assert!(err.to_string().contains("Can't find any foreign key"), "{err}");
    }

    #[test]
    fn test_single_table_inheritance_keeps_parent_name() {
        let employee = ModelDecl::new("model_tests::single::Staff")
            .database("model_single")
            .column(id())
            .register()
            .unwrap();
        let manager = ModelDecl::new("model_tests::single::Manager")
            .extends(&employee)
            .column(Column::new("reports", SqlType::Integer))
            .register()
            .unwrap();
        assert_eq!(manager.table_name(), Some("staff"));
        assert!(Arc::ptr_eq(manager.table().unwrap(), employee.table().unwrap()));
        assert!(employee.table().unwrap().column("reports").is_some());
        assert_eq!(
            manager.mapper().unwrap().inheritance(),
            Inheritance::SingleTable
        );
    }

    #[test]
    fn test_computed_name_propagates_to_subclasses() {
        fn upper(name: &str) -> String {
            format!("tbl_{}", name.to_ascii_uppercase())
        }
        let base = ModelDecl::new("model_tests::computed::Base")
            .database("model_computed")
            .abstract_()
            .computed_table_name(upper)
            .register()
            .unwrap();
        let item = ModelDecl::new("model_tests::computed::Item")
            .extends(&base)
            .column(id())
            .register()
            .unwrap();
        assert_eq!(item.table_name(), Some("tbl_ITEM"));
    }

    #[test]
    fn test_missing_primary_key_is_rejected() {
        let err = ModelDecl::new("model_tests::no_pk::Orphan")
            .database("model_no_pk")
            .column(Column::new("name", SqlType::Text))
            .register()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Mapper could not assemble any primary key columns for mapped table 'orphan'"
        );
    }

    #[test]
    fn test_same_bind_key_shares_container() {
        let a = ModelDecl::new("model_tests::share::A")
            .database("model_share_one")
            .column(id())
            .register()
            .unwrap();
        let b = ModelDecl::new("model_tests::share::B")
            .database("model_share_one")
            .column(id())
            .register()
            .unwrap();
        let c = ModelDecl::new("model_tests::share::C")
            .database("model_share_two")
            .column(id())
            .register()
            .unwrap();
        assert!(Arc::ptr_eq(a.metadata(), b.metadata()));
        assert!(!Arc::ptr_eq(a.metadata(), c.metadata()));
        assert_eq!(
            c.table().unwrap().bind_key().as_deref(),
            Some("model_share_two")
        );
    }

    #[test]
    fn test_explicit_container_is_stamped_but_not_registered() {
        let container = SchemaContainer::new();
        let model = ModelDecl::new("model_tests::explicit::Report")
            .database("model_explicit_key")
            .metadata(Arc::clone(&container))
            .column(id())
            .register()
            .unwrap();
        assert!(Arc::ptr_eq(model.metadata(), &container));
        assert_eq!(container.bind_key().as_deref(), Some("model_explicit_key"));
        assert!(!MetadataRegistry::exists("model_explicit_key"));
    }

    #[test]
    fn test_model_over_existing_table() {
        let table = TableDecl::new("audit_entry")
            .database("model_existing")
            .column(id())
            .register()
            .unwrap();
        let model = ModelDecl::new("model_tests::existing::AuditEntry")
            .table(Arc::clone(&table))
            .register()
            .unwrap();
        assert!(Arc::ptr_eq(model.table().unwrap(), &table));
        assert_eq!(
            model.metadata().bind_key().as_deref(),
            Some("model_existing")
        );
    }
}
