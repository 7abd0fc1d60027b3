use serde::Serialize;
use serde_json::{Map, Value};

use crate::{DbError, Result};

/// Field export for any serializable model value.
pub trait ModelDataExport: Serialize {
    /// Every field except those whose value is `null`.
    ///
    /// # Errors
    /// Returns an error if the value does not serialize to a JSON object.
    fn dict(&self) -> Result<Map<String, Value>> {
        self.dict_with(None, &[], true)
    }

    /// Export with an optional allow-list, a deny-list and null filtering.
    ///
    /// # Errors
    /// Returns an error if the value does not serialize to a JSON object.
    fn dict_with(
        &self,
        include: Option<&[&str]>,
        exclude: &[&str],
        exclude_none: bool,
    ) -> Result<Map<String, Value>> {
        let Value::Object(map) = serde_json::to_value(self)? else {
            return Err(DbError::InvalidModel(
                "model value does not serialize to an object".to_owned(),
            ));
        };
        Ok(map
            .into_iter()
            .filter(|(k, _)| include.is_none_or(|inc| inc.contains(&k.as_str())))
            .filter(|(k, _)| !exclude.contains(&k.as_str()))
            .filter(|(_, v)| !(exclude_none && v.is_null()))
            .collect())
    }
}

impl<T: Serialize + ?Sized> ModelDataExport for T {}
