use std::sync::Arc;

use crate::metadata::{Column, MetadataRegistry, SKIP_AUTOGEN, SchemaContainer, Table};
use crate::{DEFAULT_KEY, Result};

/// A table that no model owns (association tables, legacy tables).
#[derive(Debug)]
pub struct TableDecl {
    name: String,
    bind_key: Option<String>,
    metadata: Option<Arc<SchemaContainer>>,
    columns: Vec<Column>,
    skip_autogen: bool,
}

impl TableDecl {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_key: None,
            metadata: None,
            columns: Vec::new(),
            skip_autogen: false,
        }
    }

    #[must_use]
    pub fn database(mut self, bind_key: impl Into<String>) -> Self {
        self.bind_key = Some(bind_key.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Arc<SchemaContainer>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn skip_autogen(mut self) -> Self {
        self.skip_autogen = true;
        self
    }

    /// Define the table in its container.
    ///
    /// # Errors
    /// Returns `DbError::InvalidModel` if the container already has a table with this name.
    pub fn register(self) -> Result<Arc<Table>> {
        let metadata = match self.metadata {
            Some(metadata) => metadata,
            None => {
                MetadataRegistry::make_or_get(self.bind_key.as_deref().unwrap_or(DEFAULT_KEY))
                    .metadata
            }
        };
        let table = metadata.define_table(&self.name, self.columns)?;
        if self.skip_autogen {
            table.set_info(SKIP_AUTOGEN, serde_json::Value::Bool(true));
        }
        Ok(table)
    }
}
