//! Object-to-table mappings, one registry per bind key.

use parking_lot::RwLock;
use std::any::TypeId;
use std::sync::Arc;

use super::schema::Table;

/// How a mapped model relates to its parent model's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inheritance {
    /// No mapped parent.
    None,
    /// Own table whose primary key references the parent's table.
    Joined,
    /// Shares the parent's table.
    SingleTable,
}

/// Typed `SeaORM` entity linked to a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLink {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl EntityLink {
    #[must_use]
    pub fn of<E: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
        }
    }
}

/// Mapping of one concrete model onto its local table.
#[derive(Debug)]
pub struct Mapper {
    model: String,
    entity: Option<EntityLink>,
    local_table: Arc<Table>,
    inherits: Option<Arc<Mapper>>,
    inheritance: Inheritance,
}

impl Mapper {
    pub(crate) fn new(
        model: String,
        entity: Option<EntityLink>,
        local_table: Arc<Table>,
        inherits: Option<Arc<Mapper>>,
        inheritance: Inheritance,
    ) -> Self {
        Self {
            model,
            entity,
            local_table,
            inherits,
            inheritance,
        }
    }

    /// Fully-qualified model path.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn entity(&self) -> Option<EntityLink> {
        self.entity
    }

    /// The table this mapper writes its own columns to.
    #[must_use]
    pub fn local_table(&self) -> &Arc<Table> {
        &self.local_table
    }

    #[must_use]
    pub fn inherits(&self) -> Option<&Arc<Mapper>> {
        self.inherits.as_ref()
    }

    #[must_use]
    pub fn inheritance(&self) -> Inheritance {
        self.inheritance
    }
}

/// Registry of mappers paired 1:1 with a schema container.
#[derive(Debug, Default)]
pub struct MapperRegistry {
    mappers: RwLock<Vec<Arc<Mapper>>>,
}

impl MapperRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, mapper: Arc<Mapper>) {
        self.mappers.write().push(mapper);
    }

    #[must_use]
    pub fn mappers(&self) -> Vec<Arc<Mapper>> {
        self.mappers.read().clone()
    }

    /// Mapper for a model path.
    #[must_use]
    pub fn get(&self, model: &str) -> Option<Arc<Mapper>> {
        self.mappers.read().iter().find(|m| m.model == model).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappers.read().is_empty()
    }

    /// Forget every mapper.
    pub fn dispose(&self) {
        self.mappers.write().clear();
    }
}
