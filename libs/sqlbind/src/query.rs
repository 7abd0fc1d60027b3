//! Lookup helpers that turn "no row" into `DbError::NotFound`.

use sea_orm::{EntityTrait, PrimaryKeyTrait, QuerySelect, Select};

use crate::session::RoutingSession;
use crate::{DbError, Result};

impl RoutingSession {
    /// Row with primary key `id`, or `NotFound` carrying `error_message`.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` when no row matches; routing or driver errors otherwise.
    pub async fn get_or_404<E, K>(&self, id: K, error_message: Option<&str>) -> Result<E::Model>
    where
        E: EntityTrait,
        K: Into<<E::PrimaryKey as PrimaryKeyTrait>::ValueType>,
    {
        self.get::<E, K>(id)
            .await?
            .ok_or_else(|| DbError::NotFound(error_message.map(ToOwned::to_owned)))
    }

    /// # Errors
    /// Returns routing or driver errors.
    pub async fn get_or_none<E, K>(&self, id: K) -> Result<Option<E::Model>>
    where
        E: EntityTrait,
        K: Into<<E::PrimaryKey as PrimaryKeyTrait>::ValueType>,
    {
        self.get::<E, K>(id).await
    }

    /// First row of `select`, or `NotFound` carrying `error_message`.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` when the select is empty; routing or driver errors otherwise.
    pub async fn first_or_404<E: EntityTrait>(
        &self,
        select: Select<E>,
        error_message: Option<&str>,
    ) -> Result<E::Model> {
        self.one(select)
            .await?
            .ok_or_else(|| DbError::NotFound(error_message.map(ToOwned::to_owned)))
    }

    /// # Errors
    /// Returns routing or driver errors.
    pub async fn first_or_none<E: EntityTrait>(&self, select: Select<E>) -> Result<Option<E::Model>> {
        self.one(select).await
    }

    /// The only row of `select`.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` carrying `error_message` when the select
    /// yields no row or more than one.
    pub async fn one_or_404<E: EntityTrait>(
        &self,
        select: Select<E>,
        error_message: Option<&str>,
    ) -> Result<E::Model> {
        let mut rows = self.all(select.limit(2)).await?;
        match (rows.pop(), rows.is_empty()) {
            (Some(row), true) => Ok(row),
            _ => Err(DbError::NotFound(error_message.map(ToOwned::to_owned))),
        }
    }
}
