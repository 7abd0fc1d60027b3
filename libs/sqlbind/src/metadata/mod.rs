//! Process-wide `bind key -> (schema container, mapper registry)` table.
//!
//! Registration normally happens while the application declares its models,
//! before any concurrent request handling starts. All mutation still goes
//! through one `RwLock`, and [`MetadataRegistry::make_or_get`] performs its
//! check-and-create under the write lock so concurrent first use of a key
//! always yields a single container.

pub mod ddl;
pub mod mapper;
pub mod schema;

pub use mapper::{EntityLink, Inheritance, Mapper, MapperRegistry};
pub use schema::{
    Column, ConstraintTokens, ForeignKeyRef, InfoMap, NamingConvention, SKIP_AUTOGEN,
    SchemaContainer, SqlType, Table, TableSpec, TypeFamily,
};

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::{DEFAULT_KEY, DbError, Result};

/// Schema container and mapper registry registered for one bind key.
#[derive(Clone, Debug)]
pub struct DatabaseBind {
    pub metadata: Arc<SchemaContainer>,
    pub registry: Arc<MapperRegistry>,
}

impl DatabaseBind {
    /// Identity comparison of both halves.
    #[must_use]
    pub fn ptr_eq(&self, other: &DatabaseBind) -> bool {
        Arc::ptr_eq(&self.metadata, &other.metadata) && Arc::ptr_eq(&self.registry, &other.registry)
    }
}

static REGISTRY: LazyLock<RwLock<BTreeMap<String, DatabaseBind>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Accessor for the global bind-key registry.
pub struct MetadataRegistry;

impl MetadataRegistry {
    /// Lookup in "certain" mode.
    ///
    /// # Errors
    /// Returns `DbError::KeyNotFound` if nothing is registered under `key`.
    pub fn get(key: &str) -> Result<DatabaseBind> {
        Self::find(key).ok_or_else(|| DbError::KeyNotFound(key.to_owned()))
    }

    /// Lookup that tolerates a missing key.
    #[must_use]
    pub fn find(key: &str) -> Option<DatabaseBind> {
        REGISTRY.read().get(key).cloned()
    }

    /// Store a container/registry pair as-is, replacing any previous entry.
    pub fn put(key: &str, metadata: Arc<SchemaContainer>, registry: Arc<MapperRegistry>) {
        REGISTRY
            .write()
            .insert(key.to_owned(), DatabaseBind { metadata, registry });
    }

    #[must_use]
    pub fn exists(key: &str) -> bool {
        REGISTRY.read().contains_key(key)
    }

    /// Every registered container, keyed by bind key.
    #[must_use]
    pub fn get_all() -> BTreeMap<String, Arc<SchemaContainer>> {
        REGISTRY
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(&v.metadata)))
            .collect()
    }

    /// Mapper registry paired with an already registered container.
    #[must_use]
    pub fn registry_for(metadata: &Arc<SchemaContainer>) -> Option<Arc<MapperRegistry>> {
        REGISTRY
            .read()
            .values()
            .find(|b| Arc::ptr_eq(&b.metadata, metadata))
            .map(|b| Arc::clone(&b.registry))
    }

    /// Return the entry for `key`, creating it first if needed.
    ///
    /// A new container copies the naming convention of the `"default"`
    /// container (creating that one first, with the built-in convention) and
    /// records its bind key in its info map.
    #[must_use]
    pub fn make_or_get(key: &str) -> DatabaseBind {
        if let Some(existing) = Self::find(key) {
            return existing;
        }
        let mut map = REGISTRY.write();
        make_locked(&mut map, key)
    }

    /// Forget every registered key.
    pub fn reset() {
        REGISTRY.write().clear();
    }
}

fn make_locked(map: &mut BTreeMap<String, DatabaseBind>, key: &str) -> DatabaseBind {
    if let Some(existing) = map.get(key) {
        return existing.clone();
    }

    let naming_convention = if key == DEFAULT_KEY {
        NamingConvention::default()
    } else {
        make_locked(map, DEFAULT_KEY)
            .metadata
            .naming_convention()
            .clone()
    };

    let metadata = SchemaContainer::with_naming_convention(naming_convention);
    metadata.stamp_bind_key(key);
    let bind = DatabaseBind {
        metadata,
        registry: MapperRegistry::new(),
    };
    map.insert(key.to_owned(), bind.clone());
    debug!(bind_key = key, "schema container created");
    bind
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::DATABASE_BIND_KEY;

    #[test]
    fn test_make_or_get_is_idempotent() {
        let first = MetadataRegistry::make_or_get("registry_idempotent");
        let second = MetadataRegistry::make_or_get("registry_idempotent");
        assert!(first.ptr_eq(&second));
        assert_eq!(
            first.metadata.bind_key().as_deref(),
            Some("registry_idempotent")
        );
        assert_eq!(
            first.metadata.info().get(DATABASE_BIND_KEY),
            Some(&serde_json::json!("registry_idempotent"))
        );
    }

    #[test]
    fn test_make_or_get_concurrently_yields_one_container() {
        let handles: Vec<_> = (0..16)
            .map(|_| std::thread::spawn(|| MetadataRegistry::make_or_get("registry_concurrent")))
            .collect();
        let binds: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for bind in &binds[1..] {
            assert!(bind.ptr_eq(&binds[0]));
        }
    }

    #[test]
    fn test_distinct_keys_get_distinct_containers() {
        let a = MetadataRegistry::make_or_get("registry_a");
        let b = MetadataRegistry::make_or_get("registry_b");
        assert!(!Arc::ptr_eq(&a.metadata, &b.metadata));
        assert!(!Arc::ptr_eq(&a.registry, &b.registry));
    }

    #[test]
    fn test_put_then_get_returns_same_pair() {
        let metadata = SchemaContainer::new();
        let registry = MapperRegistry::new();
        MetadataRegistry::put("registry_put", Arc::clone(&metadata), Arc::clone(&registry));

        let bind = MetadataRegistry::get("registry_put").unwrap();
        assert!(Arc::ptr_eq(&bind.metadata, &metadata));
        assert!(Arc::ptr_eq(&bind.registry, &registry));
        assert!(MetadataRegistry::exists("registry_put"));
        assert!(MetadataRegistry::get_all().contains_key("registry_put"));
    }

    #[test]
    fn test_get_certain_missing_key_fails() {
        let err = MetadataRegistry::get("registry_never_registered").unwrap_err();
        assert!(matches!(err, DbError::KeyNotFound(k) if k == "registry_never_registered"));
        assert!(MetadataRegistry::find("registry_never_registered").is_none());
    }

    #[test]
    fn test_new_key_copies_default_naming_convention() {
        let default = MetadataRegistry::make_or_get(DEFAULT_KEY);
        let other = MetadataRegistry::make_or_get("registry_naming");
        assert_eq!(
            default.metadata.naming_convention(),
            other.metadata.naming_convention()
        );
    }
}
