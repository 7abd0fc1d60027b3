use std::sync::Arc;

use crate::metadata::Table;

/// What a raw statement targets, for routing purposes.
#[derive(Clone, Debug)]
pub enum Clause {
    /// A table itself (e.g. a select from it).
    Table(Arc<Table>),
    Insert(Arc<Table>),
    Update(Arc<Table>),
    Delete(Arc<Table>),
    /// Textual SQL with no known table.
    Text,
}

impl Clause {
    /// The table the statement targets, if known.
    #[must_use]
    pub fn table(&self) -> Option<&Arc<Table>> {
        match self {
            Clause::Table(t) | Clause::Insert(t) | Clause::Update(t) | Clause::Delete(t) => Some(t),
            Clause::Text => None,
        }
    }
}
