//! Classifying what each declared entity needs.
//!
//! Every table, column and index goes through the same decision table:
//!
//! | exists | delete | equal | action   |
//! |--------|--------|-------|----------|
//! | no     | no     |       | `Create` |
//! | no     | yes    |       | `Noop`   |
//! | yes    | yes    |       | `Delete` |
//! | yes    | no     | yes   | `Noop`   |
//! | yes    | no     | no    | `Update` |
//!
//! Only the equality test differs per entity kind. Everything here is a pure
//! function of its arguments.
//!
//! ## Renames
//!
//! A column may name the column it used to be (`previous`). The rename is only
//! taken when it is unambiguous: the declared name does not exist yet, the
//! previous name does, and nothing else in the declaration claims the previous
//! name. In every other case the hint is ignored and the column is classified
//! like any other.

use crate::introspect::{ColumnShape, ColumnSnapshot, IndexKey, IndexShape, IndexSnapshot};
use crate::Result;
use crate::ddl::SqlType;
use crate::model::{Column, Index};
use indexmap::IndexMap;
use std::fmt;

/// What needs to happen to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Noop,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Noop => "=",
            Action::Create => "+",
            Action::Update => "~",
            Action::Delete => "-",
        })
    }
}

/// The decision table. `equal` is only consulted when the entity exists and
/// is not being deleted.
pub fn decide(exists: bool, delete: bool, equal: impl FnOnce() -> bool) -> Action {
    match (exists, delete) {
        (false, false) => Action::Create,
        (false, true) => Action::Noop,
        (true, true) => Action::Delete,
        (true, false) if equal() => Action::Noop,
        (true, false) => Action::Update,
    }
}

/// Tables are compared by existence only; their contents are reconciled
/// column by column and index by index.
pub fn classify_table(delete: bool, exists: bool) -> Action {
    decide(exists, delete, || true)
}

/// Columns are equal when canonical type and nullability both match.
pub fn classify_column(desired: &Column, existing: Option<&ColumnShape>) -> Result<Action> {
    let shape = match existing {
        Some(_) if !desired.delete => Some(desired_column_shape(desired)?),
        _ => None,
    };
    Ok(decide(existing.is_some(), desired.delete, || {
        shape.as_ref() == existing
    }))
}

/// Indexes are equal when key columns (in order), their directions and
/// uniqueness all match.
pub fn classify_index(
    table: &str,
    name: &str,
    desired: &Index,
    existing: Option<&IndexShape>,
) -> Result<Action> {
    let shape = match existing {
        Some(_) if !desired.delete => Some(desired_index_shape(table, name, desired)?),
        _ => None,
    };
    Ok(decide(existing.is_some(), desired.delete, || {
        shape.as_ref() == existing
    }))
}

/// The shape a declared column should have once reconciled.
pub fn desired_column_shape(column: &Column) -> Result<ColumnShape> {
    let ty = SqlType::parse(&column.ty)?;
    Ok(ColumnShape {
        not_null: column.not_null || ty.is_serial(),
        ty: ty.canonical(),
    })
}

/// The shape a declared index should have once reconciled.
pub fn desired_index_shape(table: &str, name: &str, index: &Index) -> Result<IndexShape> {
    let keys = index
        .key_parts(table, name)?
        .into_iter()
        .map(|part| IndexKey {
            column: part.column.as_str().to_string(),
            direction: part.direction,
        })
        .collect();
    Ok(IndexShape {
        keys,
        unique: index.is_unique(),
    })
}

/// The existing column that `name` should be renamed from, if any.
pub fn rename_source<'a>(
    name: &str,
    column: &'a Column,
    declared: &IndexMap<String, Column>,
    existing: &ColumnSnapshot,
) -> Option<&'a str> {
    let previous = column.previous.as_deref()?;
    let unambiguous = !column.delete
        && previous != name
        && !existing.contains_key(name)
        && existing.contains_key(previous)
        && !declared.contains_key(previous);
    unambiguous.then_some(previous)
}

/// Convenience for callers holding a whole snapshot.
pub fn classify_index_in(
    table: &str,
    name: &str,
    desired: &Index,
    existing: &IndexSnapshot,
) -> Result<Action> {
    classify_index(table, name, desired, existing.get(name))
}
