//! Reading the live schema out of `pg_catalog`.
//!
//! Each call returns a fresh snapshot owned by the caller. Nothing is cached:
//! the orchestrator asks again whenever it needs to look at a table, so it
//! always sees the effect of statements it has just applied.

use crate::ddl::{Direction, QualifiedName, canonical_type_name};
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};
use indexmap::IndexMap;

/// Type and nullability of a column, the two properties that are reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnShape {
    /// Canonical type name, as produced by [`canonical_type_name`].
    pub ty: String,
    pub not_null: bool,
}

impl ColumnShape {
    pub fn new(ty: &str, not_null: bool) -> Self {
        Self {
            ty: canonical_type_name(ty),
            not_null,
        }
    }
}

/// One key of an index, by column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub column: String,
    pub direction: Direction,
}

/// Dialect-independent description of an index, enough to compare it with a
/// declared one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexShape {
    /// Keys in key order.
    pub keys: Vec<IndexKey>,
    pub unique: bool,
}

pub type ColumnSnapshot = IndexMap<String, ColumnShape>;
pub type IndexSnapshot = IndexMap<String, IndexShape>;

/// Read access to the live schema.
#[allow(async_fn_in_trait)]
pub trait Introspect {
    async fn table_exists(&self, table: &QualifiedName) -> Result<bool>;

    /// All columns of `table`, including ones the declaration does not manage.
    /// Empty when the table does not exist.
    async fn existing_columns(&self, table: &QualifiedName) -> Result<ColumnSnapshot>;

    /// All indexes of `table`. Expression keys carry the expression text in
    /// place of a column name, so such an index never matches a declared one.
    /// Partial-index predicates and `INCLUDE` columns are not reported.
    async fn existing_indexes(&self, table: &QualifiedName) -> Result<IndexSnapshot>;
}

impl<T: Introspect> Introspect for &T {
    async fn table_exists(&self, table: &QualifiedName) -> Result<bool> {
        (**self).table_exists(table).await
    }

    async fn existing_columns(&self, table: &QualifiedName) -> Result<ColumnSnapshot> {
        (**self).existing_columns(table).await
    }

    async fn existing_indexes(&self, table: &QualifiedName) -> Result<IndexSnapshot> {
        (**self).existing_indexes(table).await
    }
}

const TABLE_EXISTS_SQL: &str = "\
SELECT EXISTS (
    SELECT 1
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
)";

const COLUMNS_SQL: &str = "\
SELECT a.attname::text, pg_catalog.format_type(a.atttypid, a.atttypmod), a.attnotnull
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

// Expression keys (attnum 0) have no pg_attribute row; they are reported by
// their expression text, which never matches a declared column name.
const INDEXES_SQL: &str = "\
SELECT i.relname::text,
       ix.indisunique,
       array_agg(
           COALESCE(a.attname::text, pg_catalog.pg_get_indexdef(ix.indexrelid, k.ord::int, true))
           ORDER BY k.ord
       ),
       array_agg((ix.indoption[(k.ord - 1)::int] & 1) = 1 ORDER BY k.ord)
FROM pg_catalog.pg_index ix
JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
LEFT JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum AND k.attnum > 0
WHERE n.nspname = $1 AND t.relname = $2 AND k.ord <= ix.indnkeyatts
GROUP BY i.relname, ix.indisunique
ORDER BY i.relname";

/// [`Introspect`] over a Postgres connection.
pub struct Catalog<'c, C: Connection> {
    conn: &'c C,
}

impl<'c, C: Connection> Catalog<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }
}

impl<C: Connection> Introspect for Catalog<'_, C> {
    async fn table_exists(&self, table: &QualifiedName) -> Result<bool> {
        let row = self
            .conn
            .traced()
            .query_one(TABLE_EXISTS_SQL, &[&table.schema.as_str(), &table.name.as_str()])
            .await
            .map_err(|e| Error::introspection(format!("existence of table {}", table), e))?;
        row.try_get(0)
            .map_err(|e| Error::introspection(format!("existence of table {}", table), e))
    }

    async fn existing_columns(&self, table: &QualifiedName) -> Result<ColumnSnapshot> {
        let what = || format!("columns of table {}", table);
        let rows = self
            .conn
            .traced()
            .query(COLUMNS_SQL, &[&table.schema.as_str(), &table.name.as_str()])
            .await
            .map_err(|e| Error::introspection(what(), e))?;

        let mut columns = ColumnSnapshot::new();
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| Error::introspection(what(), e))?;
            let ty: String = row.try_get(1).map_err(|e| Error::introspection(what(), e))?;
            let not_null: bool = row.try_get(2).map_err(|e| Error::introspection(what(), e))?;
            columns.insert(name, ColumnShape::new(&ty, not_null));
        }
        Ok(columns)
    }

    async fn existing_indexes(&self, table: &QualifiedName) -> Result<IndexSnapshot> {
        let what = || format!("indexes of table {}", table);
        let rows = self
            .conn
            .traced()
            .query(INDEXES_SQL, &[&table.schema.as_str(), &table.name.as_str()])
            .await
            .map_err(|e| Error::introspection(what(), e))?;

        let mut indexes = IndexSnapshot::new();
        for row in rows {
            let name: String = row.try_get(0).map_err(|e| Error::introspection(what(), e))?;
            let unique: bool = row.try_get(1).map_err(|e| Error::introspection(what(), e))?;
            let columns: Vec<String> =
                row.try_get(2).map_err(|e| Error::introspection(what(), e))?;
            let descending: Vec<bool> =
                row.try_get(3).map_err(|e| Error::introspection(what(), e))?;

            let keys = columns
                .into_iter()
                .zip(descending)
                .map(|(column, desc)| IndexKey {
                    column,
                    direction: if desc { Direction::Desc } else { Direction::Asc },
                })
                .collect();
            indexes.insert(name, IndexShape { keys, unique });
        }
        Ok(indexes)
    }
}
