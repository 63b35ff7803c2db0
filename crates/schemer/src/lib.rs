//! Declarative schema reconciliation for Postgres.
//!
//! Describe the tables, columns and indexes you want as data (a [`Migration`]),
//! hand it a connection, and schemer works out which `CREATE`, `ALTER` and
//! `DROP` statements bring the live schema in line, then runs them.
//!
//! ```ignore
//! let migration: Migration = facet_styx::from_str(&source)?;
//! let report = schemer::migrate(&client, &migration).await?;
//! println!("{report}");
//! ```
//!
//! # What gets compared
//!
//! Every entity is classified as `Create`, `Update`, `Delete` or `Noop` from
//! whether it exists, whether it is marked `delete`, and whether it matches:
//!
//! - tables by existence alone,
//! - columns by type (after folding synonyms such as `int4`/`integer`) and
//!   nullability,
//! - indexes by their ordered key columns, each key's direction, and
//!   uniqueness.
//!
//! Anything the declaration does not mention is left untouched.
//!
//! # Safety
//!
//! Identifiers and type expressions are checked against a strict grammar
//! before anything is sent to the database, and identifiers are always
//! quoted. A declaration that fails the check is rejected as a whole.
//!
//! # Failure
//!
//! There is no surrounding transaction. The first failing statement stops the
//! run and leaves earlier statements applied; running again picks up where it
//! stopped. Pass a `tokio_postgres::Transaction` as the connection to get
//! all-or-nothing behavior instead.

mod ddl;
mod diff;
mod error;
mod execute;
mod introspect;
mod migrate;
mod model;
mod traced;

#[cfg(test)]
mod testing;

pub use ddl::{
    ColumnDef, Ddl, Direction, Ident, KeyPart, QualifiedName, SqlType, canonical_type_name,
};
pub use diff::{
    Action, classify_column, classify_index, classify_table, decide, desired_column_shape,
    desired_index_shape, rename_source,
};
pub use error::{BoxError, Error};
pub use execute::{ColumnUpdate, Execute, Executor, SqlExecutor};
pub use introspect::{
    Catalog, ColumnShape, ColumnSnapshot, IndexKey, IndexShape, IndexSnapshot, Introspect,
};
pub use migrate::{AppliedChange, Entity, MigrationReport, Migrator, migrate};
pub use model::{Column, Index, IndexColumn, Migration, Table};
pub use traced::{Connection, ConnectionExt, TracedConn};

pub type Result<T> = std::result::Result<T, Error>;
