//! Unit-of-work sessions that route every statement to its bind key's engine.
//!
//! A [`RoutingSession`] never caches a session-wide bind: each operation
//! resolves its engine again through [`RoutingSession::get_bind`], because one
//! unit of work routinely touches models bound to different databases. The
//! session keeps one open transaction per engine it has touched.

mod clause;
mod scoped;

pub use clause::Clause;
pub use scoped::{ScopeFn, ScopedSession, thread_scope};

use anyhow::anyhow;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, PaginatorTrait, PrimaryKeyTrait, QueryResult, QueryTrait, Select,
    Statement, StatementBuilder, TransactionTrait,
};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::config::SessionOptions;
use crate::engine::Engine;
use crate::metadata::{Mapper, Table};
use crate::model::ModelIndex;
use crate::{DEFAULT_KEY, DbError, Result};

/// Session that picks the engine per operation.
pub struct RoutingSession {
    engines: Arc<BTreeMap<String, Arc<Engine>>>,
    options: SessionOptions,
    transactions: Mutex<BTreeMap<String, DatabaseTransaction>>,
}

impl fmt::Debug for RoutingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSession")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RoutingSession {
    #[must_use]
    pub fn new(engines: Arc<BTreeMap<String, Arc<Engine>>>) -> Self {
        Self::with_options(engines, SessionOptions::default())
    }

    /// Build a session with explicit options; callers validate them first.
    #[must_use]
    pub fn with_options(engines: Arc<BTreeMap<String, Arc<Engine>>>, options: SessionOptions) -> Self {
        Self {
            engines,
            options,
            transactions: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn engines(&self) -> &BTreeMap<String, Arc<Engine>> {
        &self.engines
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Resolve the engine for one operation.
    ///
    /// First match wins: an explicit `bind`; the bind key stamped on the
    /// mapper's table container; the same lookup on the clause's table; the
    /// `"default"` engine; finally the session's `binds`/`bind` options.
    ///
    /// # Errors
    /// Returns `DbError::UnboundExecution` when a stamped key has no engine
    /// or nothing resolves.
    pub fn get_bind(
        &self,
        mapper: Option<&Mapper>,
        clause: Option<&Clause>,
        bind: Option<&Arc<Engine>>,
    ) -> Result<Arc<Engine>> {
        if let Some(engine) = bind {
            return Ok(Arc::clone(engine));
        }
        if let Some(mapper) = mapper
            && let Some(engine) = self.engine_for_table(mapper.local_table())?
        {
            return Ok(engine);
        }
        if let Some(table) = clause.and_then(Clause::table)
            && let Some(engine) = self.engine_for_table(table)?
        {
            return Ok(engine);
        }
        if let Some(engine) = self.engines.get(DEFAULT_KEY) {
            return Ok(Arc::clone(engine));
        }
        self.base_bind(mapper, clause)
    }

    fn engine_for_table(&self, table: &Table) -> Result<Option<Arc<Engine>>> {
        let Some(key) = table.bind_key() else {
            return Ok(None);
        };
        self.engines
            .get(&key)
            .map(|engine| Some(Arc::clone(engine)))
            .ok_or_else(|| DbError::unbound_bind_key(&key))
    }

    fn base_bind(&self, mapper: Option<&Mapper>, clause: Option<&Clause>) -> Result<Arc<Engine>> {
        let table_name = mapper
            .map(|m| m.local_table().name().to_owned())
            .or_else(|| clause.and_then(Clause::table).map(|t| t.name().to_owned()));
        let key = table_name
            .and_then(|name| self.options.binds.get(&name).cloned())
            .or_else(|| self.options.bind.clone());
        match key {
            Some(key) => self
                .engines
                .get(&key)
                .cloned()
                .ok_or_else(|| DbError::unbound_bind_key(&key)),
            None => Err(DbError::UnboundExecution(
                "Could not locate a bind configured on mapper, SQL expression or this Session."
                    .to_owned(),
            )),
        }
    }

    /// Mapper of the model registered for entity `E`.
    ///
    /// # Errors
    /// Returns `DbError::UnmappedClass` if no registered model links `E`.
    pub fn mapper_for<E: 'static>(&self) -> Result<Arc<Mapper>> {
        ModelIndex::by_type::<E>()
            .and_then(|model| model.mapper().cloned())
            .ok_or_else(|| DbError::UnmappedClass(std::any::type_name::<E>().to_owned()))
    }

    /// Engine that operations on entity `E` route to.
    ///
    /// # Errors
    /// See [`RoutingSession::mapper_for`] and [`RoutingSession::get_bind`].
    pub fn bind_for<E: 'static>(&self) -> Result<Arc<Engine>> {
        let mapper = self.mapper_for::<E>()?;
        self.get_bind(Some(&mapper), None, None)
    }

    /// Begin a transaction on `engine` unless one is already open.
    ///
    /// # Errors
    /// Returns the driver error.
    pub async fn begin(&self, engine: &Arc<Engine>) -> Result<()> {
        let mut txns = self.transactions.lock().await;
        if let Entry::Vacant(slot) = txns.entry(engine.bind_key().to_owned()) {
            slot.insert(engine.connection().begin().await?);
            debug!(bind_key = engine.bind_key(), "session transaction begun");
        }
        Ok(())
    }

    /// The open transaction on `engine`, begun on first use when `autobegin` is on.
    async fn transaction(&self, engine: &Engine) -> Result<MappedMutexGuard<'_, DatabaseTransaction>> {
        let key = engine.bind_key();
        let mut txns = self.transactions.lock().await;
        if !txns.contains_key(key) {
            if !self.options.autobegin {
                return Err(DbError::Other(anyhow!(
                    "Autobegin is disabled on this Session; call begin() to start a transaction on '{key}'"
                )));
            }
            txns.insert(key.to_owned(), engine.connection().begin().await?);
            debug!(bind_key = key, "session transaction begun");
        }
        MutexGuard::try_map(txns, |txns| txns.get_mut(key))
            .map_err(|_| DbError::Other(anyhow!("no open transaction for '{key}'")))
    }

    /// Bind keys with an open transaction.
    pub async fn in_transaction(&self) -> Vec<String> {
        self.transactions.lock().await.keys().cloned().collect()
    }

    /// Execute a statement routed by `clause`; returns the affected row count.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn execute<S: StatementBuilder>(&self, clause: &Clause, stmt: &S) -> Result<u64> {
        let engine = self.get_bind(None, Some(clause), None)?;
        let stmt = engine.backend().build(stmt);
        self.execute_on(&engine, stmt).await
    }

    /// Execute raw SQL routed by `clause`.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn execute_sql(&self, clause: &Clause, sql: &str) -> Result<u64> {
        let engine = self.get_bind(None, Some(clause), None)?;
        let stmt = Statement::from_string(engine.backend(), sql);
        self.execute_on(&engine, stmt).await
    }

    /// Run a raw query routed by `clause`.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn query_sql(&self, clause: &Clause, sql: &str) -> Result<Vec<QueryResult>> {
        let engine = self.get_bind(None, Some(clause), None)?;
        let stmt = Statement::from_string(engine.backend(), sql);
        engine.log_statement(&stmt);
        let txn = self.transaction(&engine).await?;
        Ok(txn.query_all(stmt).await?)
    }

    async fn execute_on(&self, engine: &Engine, stmt: Statement) -> Result<u64> {
        engine.log_statement(&stmt);
        let txn = self.transaction(engine).await?;
        Ok(txn.execute(stmt).await?.rows_affected())
    }

    /// # Errors
    /// Returns routing or driver errors.
    pub async fn all<E: EntityTrait>(&self, select: Select<E>) -> Result<Vec<E::Model>> {
        let engine = self.bind_for::<E>()?;
        engine.log_statement(&select.build(engine.backend()));
        let txn = self.transaction(&engine).await?;
        Ok(select.all(&*txn).await?)
    }

    /// # Errors
    /// Returns routing or driver errors.
    pub async fn one<E: EntityTrait>(&self, select: Select<E>) -> Result<Option<E::Model>> {
        let engine = self.bind_for::<E>()?;
        engine.log_statement(&select.build(engine.backend()));
        let txn = self.transaction(&engine).await?;
        Ok(select.one(&*txn).await?)
    }

    /// Number of rows `select` would return.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn scalar_count<E>(&self, select: Select<E>) -> Result<u64>
    where
        E: EntityTrait,
        E::Model: Sync,
    {
        let engine = self.bind_for::<E>()?;
        engine.log_statement(&select.build(engine.backend()));
        let txn = self.transaction(&engine).await?;
        Ok(select.count(&*txn).await?)
    }

    /// Fetch one row by primary key.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn get<E, K>(&self, id: K) -> Result<Option<E::Model>>
    where
        E: EntityTrait,
        K: Into<<E::PrimaryKey as PrimaryKeyTrait>::ValueType>,
    {
        self.one(E::find_by_id(id)).await
    }

    /// Insert an active model on its entity's engine.
    ///
    /// # Errors
    /// Returns routing or driver errors.
    pub async fn insert<A>(&self, model: A) -> Result<<A::Entity as EntityTrait>::Model>
    where
        A: ActiveModelTrait + ActiveModelBehavior + Send,
        <A::Entity as EntityTrait>::Model: IntoActiveModel<A>,
    {
        let engine = self.bind_for::<A::Entity>()?;
        let txn = self.transaction(&engine).await?;
        Ok(model.insert(&*txn).await?)
    }

    /// Commit every open transaction.
    ///
    /// On the first failure the remaining transactions are rolled back and
    /// the failure is returned.
    ///
    /// # Errors
    /// Returns the first commit error.
    pub async fn commit(&self) -> Result<()> {
        let txns = std::mem::take(&mut *self.transactions.lock().await);
        let mut pending = txns.into_iter();
        while let Some((key, txn)) = pending.next() {
            if let Err(e) = txn.commit().await {
                error!(bind_key = %key, error = %e, "session commit failed");
                for (key, txn) in pending {
                    if let Err(e) = txn.rollback().await {
                        error!(bind_key = %key, error = %e, "session rollback failed");
                    }
                }
                return Err(e.into());
            }
            debug!(bind_key = %key, "session transaction committed");
        }
        Ok(())
    }

    /// Roll back every open transaction.
    ///
    /// # Errors
    /// Returns the first rollback error after attempting all of them.
    pub async fn rollback(&self) -> Result<()> {
        let txns = std::mem::take(&mut *self.transactions.lock().await);
        let mut first_error = None;
        for (key, txn) in txns {
            match txn.rollback().await {
                Ok(()) => debug!(bind_key = %key, "session transaction rolled back"),
                Err(e) => {
                    error!(bind_key = %key, error = %e, "session rollback failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Release the session, discarding uncommitted work.
    ///
    /// # Errors
    /// See [`RoutingSession::rollback`].
    pub async fn close(&self) -> Result<()> {
        self.rollback().await
    }
}
