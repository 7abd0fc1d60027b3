//! Global index of registered concrete models.

use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use tracing::warn;

use super::ModelClass;

#[derive(Default)]
struct Inner {
    by_path: BTreeMap<String, Arc<ModelClass>>,
    by_type: HashMap<TypeId, Arc<ModelClass>>,
}

static INDEX: LazyLock<RwLock<Inner>> = LazyLock::new(|| RwLock::new(Inner::default()));

/// Lookup of registered models by path or by linked entity type.
pub struct ModelIndex;

impl ModelIndex {
    pub(crate) fn insert(model: &Arc<ModelClass>) {
        let mut inner = INDEX.write();
        if inner
            .by_path
            .insert(model.path().to_owned(), Arc::clone(model))
            .is_some()
        {
            warn!(model = model.path(), "model path registered twice, replacing");
        }
        if let Some(entity) = model.mapper().and_then(|m| m.entity()) {
            inner.by_type.insert(entity.type_id, Arc::clone(model));
        }
    }

    #[must_use]
    pub fn get(path: &str) -> Option<Arc<ModelClass>> {
        INDEX.read().by_path.get(path).cloned()
    }

    /// Model whose mapper is linked to entity type `E`.
    #[must_use]
    pub fn by_type<E: 'static>() -> Option<Arc<ModelClass>> {
        INDEX.read().by_type.get(&TypeId::of::<E>()).cloned()
    }

    /// Copy of the whole index, keyed by model path.
    #[must_use]
    pub fn all() -> BTreeMap<String, Arc<ModelClass>> {
        INDEX.read().by_path.clone()
    }

    #[must_use]
    pub fn contains(path: &str) -> bool {
        INDEX.read().by_path.contains_key(path)
    }

    /// Forget every registered model.
    pub fn reset() {
        let mut inner = INDEX.write();
        inner.by_path.clear();
        inner.by_type.clear();
    }
}
