//! Schema containers, tables and columns.
//!
//! A [`SchemaContainer`] is the per-bind-key set of table definitions. Tables
//! keep a weak back-reference to the container that owns them so a routed
//! statement can go `table -> container -> bind key`.

use parking_lot::RwLock;
use sea_orm::sea_query::{Alias, ColumnDef, Expr};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::{DATABASE_BIND_KEY, DbError, Result};

/// Free-form info map attached to containers and tables.
pub type InfoMap = serde_json::Map<String, Value>;

/// Table info key that excludes a table from autogeneration.
pub const SKIP_AUTOGEN: &str = "skip_autogen";

/// Constraint naming templates keyed by constraint kind (`ix`, `uq`, `ck`, `fk`, `pk`).
///
/// Templates use `%(token)s` placeholders: `table_name`, `column_0_name`,
/// `column_0_label`, `referred_table_name`, `constraint_name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConvention(BTreeMap<String, String>);

impl Default for NamingConvention {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert("ix".to_owned(), "ix_%(column_0_label)s".to_owned());
        map.insert(
            "uq".to_owned(),
            "uq_%(table_name)s_%(column_0_name)s".to_owned(),
        );
        map.insert(
            "ck".to_owned(),
            "ck_%(table_name)s_%(constraint_name)s".to_owned(),
        );
        map.insert(
            "fk".to_owned(),
            "fk_%(table_name)s_%(column_0_name)s_%(referred_table_name)s".to_owned(),
        );
        map.insert("pk".to_owned(), "pk_%(table_name)s".to_owned());
        Self(map)
    }
}

/// Values substituted into a naming template.
#[derive(Debug, Default)]
pub struct ConstraintTokens<'a> {
    pub table_name: &'a str,
    pub column_0_name: &'a str,
    pub referred_table_name: &'a str,
    pub constraint_name: &'a str,
}

impl NamingConvention {
    /// Empty convention (no templates at all).
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Set (or replace) the template for one constraint kind.
    #[must_use]
    pub fn with(mut self, kind: &str, template: &str) -> Self {
        self.0.insert(kind.to_owned(), template.to_owned());
        self
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&str> {
        self.0.get(kind).map(String::as_str)
    }

    /// Render the name for a constraint of `kind`, or `None` if the convention has no template for it.
    #[must_use]
    pub fn render(&self, kind: &str, tokens: &ConstraintTokens<'_>) -> Option<String> {
        let template = self.get(kind)?;
        let label = format!("{}_{}", tokens.table_name, tokens.column_0_name);
        Some(
            template
                .replace("%(table_name)s", tokens.table_name)
                .replace("%(column_0_name)s", tokens.column_0_name)
                .replace("%(column_0_label)s", &label)
                .replace("%(referred_table_name)s", tokens.referred_table_name)
                .replace("%(constraint_name)s", tokens.constraint_name),
        )
    }
}

/// Portable column type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "snake_case")]
pub enum SqlType {
    Integer,
    BigInteger,
    SmallInteger,
    Boolean,
    Float,
    Double,
    Decimal(Option<(u32, u32)>),
    String(Option<u32>),
    Text,
    Date,
    Time,
    DateTime,
    Timestamp,
    Binary,
    Json,
    Uuid,
    Custom(String),
}

/// Coarse type family used when comparing declared and reflected columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Real,
    Boolean,
    Text,
    Date,
    Time,
    DateTime,
    Binary,
    Json,
    Uuid,
    Custom(String),
}

impl SqlType {
    pub(crate) fn apply(&self, def: &mut ColumnDef) {
        match self {
            SqlType::Integer => def.integer(),
            SqlType::BigInteger => def.big_integer(),
            SqlType::SmallInteger => def.small_integer(),
            SqlType::Boolean => def.boolean(),
            SqlType::Float => def.float(),
            SqlType::Double => def.double(),
            SqlType::Decimal(Some((precision, scale))) => def.decimal_len(*precision, *scale),
            SqlType::Decimal(None) => def.decimal(),
            SqlType::String(Some(len)) => def.string_len(*len),
            SqlType::String(None) => def.string(),
            SqlType::Text => def.text(),
            SqlType::Date => def.date(),
            SqlType::Time => def.time(),
            SqlType::DateTime => def.date_time(),
            SqlType::Timestamp => def.timestamp(),
            SqlType::Binary => def.binary(),
            SqlType::Json => def.json(),
            SqlType::Uuid => def.uuid(),
            SqlType::Custom(name) => def.custom(Alias::new(name)),
        };
    }

    #[must_use]
    pub fn family(&self) -> TypeFamily {
        match self {
            SqlType::Integer | SqlType::BigInteger | SqlType::SmallInteger => TypeFamily::Integer,
            SqlType::Float | SqlType::Double | SqlType::Decimal(_) => TypeFamily::Real,
            SqlType::Boolean => TypeFamily::Boolean,
            SqlType::String(_) | SqlType::Text => TypeFamily::Text,
            SqlType::Date => TypeFamily::Date,
            SqlType::Time => TypeFamily::Time,
            SqlType::DateTime | SqlType::Timestamp => TypeFamily::DateTime,
            SqlType::Binary => TypeFamily::Binary,
            SqlType::Json => TypeFamily::Json,
            SqlType::Uuid => TypeFamily::Uuid,
            SqlType::Custom(name) => TypeFamily::Custom(name.to_ascii_lowercase()),
        }
    }

    /// Whether a reflected column type differs from this declared one.
    ///
    /// Types are compared by family; string lengths are compared when both sides declare one.
    #[must_use]
    pub fn differs_from(&self, reflected: &SqlType) -> bool {
        if self.family() != reflected.family() {
            return true;
        }
        matches!(
            (self, reflected),
            (SqlType::String(Some(a)), SqlType::String(Some(b))) if a != b
        )
    }

    /// Parse a type declaration as reported by the database catalog.
    #[must_use]
    pub fn from_reflected(declared: &str) -> SqlType {
        let lowered = declared.trim().to_ascii_lowercase();
        let (base, args) = match lowered.split_once('(') {
            Some((base, rest)) => (base.trim(), rest.trim_end_matches(')').trim()),
            None => (lowered.as_str(), ""),
        };
        // sqlite stores some portable types with a `_text` affinity suffix
        let base = base.strip_suffix("_text").unwrap_or(base);
        let first_arg = args.split(',').next().and_then(|a| a.trim().parse::<u32>().ok());

        match base {
            "integer" | "int" | "int4" | "mediumint" | "serial" => SqlType::Integer,
            "bigint" | "int8" | "bigserial" => SqlType::BigInteger,
            "tinyint" if first_arg == Some(1) => SqlType::Boolean,
            "smallint" | "int2" | "tinyint" => SqlType::SmallInteger,
            "boolean" | "bool" => SqlType::Boolean,
            "real" | "float" | "float4" => SqlType::Float,
            "double" | "double precision" | "float8" => SqlType::Double,
            "decimal" | "numeric" => {
                let mut parts = args.split(',').map(|a| a.trim().parse::<u32>().ok());
                match (parts.next().flatten(), parts.next().flatten()) {
                    (Some(p), Some(s)) => SqlType::Decimal(Some((p, s))),
                    _ => SqlType::Decimal(None),
                }
            }
            "varchar" | "character varying" | "char" | "character" | "nvarchar" | "nchar" => {
                SqlType::String(first_arg)
            }
            "text" | "clob" | "mediumtext" | "longtext" | "tinytext" => SqlType::Text,
            "date" => SqlType::Date,
            "time" | "time without time zone" | "time with time zone" => SqlType::Time,
            "datetime" => SqlType::DateTime,
            "timestamp"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "timestamptz"
            | "timestamp_with_timezone" => SqlType::Timestamp,
            "blob" | "bytea" | "binary" | "varbinary" | "longblob" | "mediumblob" => {
                SqlType::Binary
            }
            "json" | "jsonb" => SqlType::Json,
            "uuid" => SqlType::Uuid,
            other => SqlType::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::Integer => f.write_str("INTEGER"),
            SqlType::BigInteger => f.write_str("BIGINT"),
            SqlType::SmallInteger => f.write_str("SMALLINT"),
            SqlType::Boolean => f.write_str("BOOLEAN"),
            SqlType::Float => f.write_str("FLOAT"),
            SqlType::Double => f.write_str("DOUBLE"),
            SqlType::Decimal(Some((p, s))) => write!(f, "DECIMAL({p}, {s})"),
            SqlType::Decimal(None) => f.write_str("DECIMAL"),
            SqlType::String(Some(len)) => write!(f, "VARCHAR({len})"),
            SqlType::String(None) => f.write_str("VARCHAR"),
            SqlType::Text => f.write_str("TEXT"),
            SqlType::Date => f.write_str("DATE"),
            SqlType::Time => f.write_str("TIME"),
            SqlType::DateTime => f.write_str("DATETIME"),
            SqlType::Timestamp => f.write_str("TIMESTAMP"),
            SqlType::Binary => f.write_str("BLOB"),
            SqlType::Json => f.write_str("JSON"),
            SqlType::Uuid => f.write_str("UUID"),
            SqlType::Custom(name) => f.write_str(&name.to_ascii_uppercase()),
        }
    }
}

/// Foreign key target of a column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Column definition.
#[allow(clippy::struct_excessive_bools)] // one flag per column attribute
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "nullable_default")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyRef>,
}

fn nullable_default() -> bool {
    true
}

impl Column {
    /// New nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            primary_key: false,
            nullable: true,
            unique: false,
            index: false,
            auto_increment: false,
            default: None,
            references: None,
        }
    }

    /// Mark as (part of) the primary key; primary key columns are never nullable.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Server-side default, as a raw SQL expression.
    #[must_use]
    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    #[must_use]
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyRef {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// `sea-query` column definition. `inline_pk` is false for composite keys.
    pub(crate) fn to_column_def(&self, inline_pk: bool) -> ColumnDef {
        let mut def = ColumnDef::new(Alias::new(&self.name));
        self.sql_type.apply(&mut def);
        if self.primary_key && inline_pk {
            def.primary_key();
        }
        if !self.nullable {
            def.not_null();
        }
        if self.auto_increment {
            def.auto_increment();
        }
        if let Some(expr) = &self.default {
            def.default(Expr::cust(expr));
        }
        def
    }
}

/// Serializable snapshot of a table definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSpec {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn primary_key(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }
}

/// A table owned by a [`SchemaContainer`].
#[derive(Debug)]
pub struct Table {
    name: String,
    columns: RwLock<Vec<Column>>,
    info: RwLock<InfoMap>,
    metadata: Weak<SchemaContainer>,
}

impl Table {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn columns(&self) -> Vec<Column> {
        self.columns.read().clone()
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<Column> {
        self.columns.read().iter().find(|c| c.name == name).cloned()
    }

    #[must_use]
    pub fn primary_key(&self) -> Vec<Column> {
        self.columns
            .read()
            .iter()
            .filter(|c| c.primary_key)
            .cloned()
            .collect()
    }

    /// The owning container, if it is still alive.
    #[must_use]
    pub fn metadata(&self) -> Option<Arc<SchemaContainer>> {
        self.metadata.upgrade()
    }

    /// Bind key stamped on the owning container.
    #[must_use]
    pub fn bind_key(&self) -> Option<String> {
        self.metadata().and_then(|m| m.bind_key())
    }

    #[must_use]
    pub fn info(&self) -> InfoMap {
        self.info.read().clone()
    }

    pub fn set_info(&self, key: &str, value: Value) {
        self.info.write().insert(key.to_owned(), value);
    }

    #[must_use]
    pub fn skip_autogen(&self) -> bool {
        self.info
            .read()
            .get(SKIP_AUTOGEN)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn spec(&self) -> TableSpec {
        TableSpec {
            name: self.name.clone(),
            columns: self.columns(),
        }
    }

    /// Append columns declared by a single-table-inheritance subclass.
    ///
    /// # Errors
    /// Returns `DbError::InvalidModel` if a column with the same name already exists.
    pub fn append_columns(&self, columns: &[Column]) -> Result<()> {
        let mut current = self.columns.write();
        for col in columns {
            if current.iter().any(|c| c.name == col.name) {
                return Err(DbError::InvalidModel(format!(
                    "Column '{}' already exists on table '{}'",
                    col.name, self.name
                )));
            }
        }
        current.extend(columns.iter().cloned());
        Ok(())
    }
}

/// Per-bind-key set of table definitions plus naming rules and an info map.
#[derive(Debug)]
pub struct SchemaContainer {
    naming_convention: NamingConvention,
    info: RwLock<InfoMap>,
    tables: RwLock<Vec<Arc<Table>>>,
}

impl SchemaContainer {
    /// Container using the built-in naming convention.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_naming_convention(NamingConvention::default())
    }

    #[must_use]
    pub fn with_naming_convention(naming_convention: NamingConvention) -> Arc<Self> {
        Arc::new(Self {
            naming_convention,
            info: RwLock::new(InfoMap::new()),
            tables: RwLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn naming_convention(&self) -> &NamingConvention {
        &self.naming_convention
    }

    /// Bind key stored in the info map, if any.
    #[must_use]
    pub fn bind_key(&self) -> Option<String> {
        self.info
            .read()
            .get(DATABASE_BIND_KEY)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    pub(crate) fn stamp_bind_key(&self, key: &str) {
        self.set_info(DATABASE_BIND_KEY, Value::String(key.to_owned()));
    }

    #[must_use]
    pub fn info(&self) -> InfoMap {
        self.info.read().clone()
    }

    pub fn set_info(&self, key: &str, value: Value) {
        self.info.write().insert(key.to_owned(), value);
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().iter().find(|t| t.name == name).cloned()
    }

    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.read().iter().any(|t| t.name == name)
    }

    /// Tables in declaration order.
    #[must_use]
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().clone()
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().iter().map(|t| t.name.clone()).collect()
    }

    /// Define a new table in this container.
    ///
    /// # Errors
    /// Returns `DbError::InvalidModel` if the table already exists or a column name repeats.
    pub fn define_table(self: &Arc<Self>, name: &str, columns: Vec<Column>) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.iter().any(|t| t.name == name) {
            return Err(DbError::InvalidModel(format!(
                "Table '{name}' is already defined for this schema container"
            )));
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(DbError::InvalidModel(format!(
                    "Column '{}' is declared twice on table '{name}'",
                    col.name
                )));
            }
        }
        let table = Arc::new(Table {
            name: name.to_owned(),
            columns: RwLock::new(columns),
            info: RwLock::new(InfoMap::new()),
            metadata: Arc::downgrade(self),
        });
        tables.push(Arc::clone(&table));
        Ok(table)
    }

    /// Add a reflected table unless one with the same name is already declared.
    ///
    /// Returns `true` if the table was added.
    pub fn reflect_table(self: &Arc<Self>, spec: TableSpec) -> bool {
        let mut tables = self.tables.write();
        if tables.iter().any(|t| t.name == spec.name) {
            return false;
        }
        tables.push(Arc::new(Table {
            name: spec.name,
            columns: RwLock::new(spec.columns),
            info: RwLock::new(InfoMap::new()),
            metadata: Arc::downgrade(self),
        }));
        true
    }

    /// Drop every table definition.
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}
