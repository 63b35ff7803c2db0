//! An in-memory stand-in for a Postgres schema, for unit tests.
//!
//! [`MemoryDatabase`] interprets [`Ddl`] the way Postgres would for the
//! statements this crate emits, including the side effects that matter for
//! reconciliation: serial columns are `NOT NULL`, dropping a column drops the
//! indexes using it, and renaming a column renames it inside indexes. Schema
//! names are ignored.

use crate::ddl::{Ddl, QualifiedName};
use crate::execute::Execute;
use crate::introspect::{ColumnShape, ColumnSnapshot, IndexKey, IndexShape, IndexSnapshot, Introspect};
use crate::{Error, Result};
use indexmap::IndexMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: ColumnSnapshot,
    pub indexes: IndexSnapshot,
}

#[derive(Debug, Default)]
struct State {
    tables: IndexMap<String, MemoryTable>,
    executed: Vec<String>,
    attempts: usize,
    fail_at: Option<usize>,
    queries: usize,
    fail_query_at: Option<usize>,
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`th statement from now (1-based) fail without effect.
    pub fn fail_at(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_at = Some(state.attempts + n);
    }

    /// Make the `n`th catalog query from now (1-based) fail.
    pub fn fail_introspection_at(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_query_at = Some(state.queries + n);
    }

    /// Statements that were applied successfully, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().executed.clear();
    }

    pub fn tables(&self) -> IndexMap<String, MemoryTable> {
        self.state.lock().unwrap().tables.clone()
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.state.lock().unwrap().tables.get(name).cloned()
    }
}

fn rejected(statement: &Ddl, reason: &str) -> Error {
    Error::execution(statement.to_sql(), reason.to_string())
}

impl State {
    fn table_mut(&mut self, statement: &Ddl, table: &QualifiedName) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table.name.as_str())
            .ok_or_else(|| rejected(statement, "relation does not exist"))
    }

    fn query(&mut self, what: &str, table: &QualifiedName) -> Result<Option<&MemoryTable>> {
        self.queries += 1;
        if self.fail_query_at == Some(self.queries) {
            return Err(Error::introspection(
                format!("{what} of table {table}"),
                "injected failure".to_string(),
            ));
        }
        Ok(self.tables.get(table.name.as_str()))
    }

    fn index_exists(&self, name: &str) -> bool {
        self.tables.values().any(|t| t.indexes.contains_key(name))
    }

    fn apply(&mut self, statement: &Ddl) -> Result<()> {
        match statement {
            Ddl::CreateTable { table, columns } => {
                if self.tables.contains_key(table.name.as_str()) {
                    return Err(rejected(statement, "relation already exists"));
                }
                let columns = columns
                    .iter()
                    .map(|c| {
                        let shape = ColumnShape {
                            ty: c.ty.canonical(),
                            not_null: c.not_null || c.ty.is_serial(),
                        };
                        (c.name.as_str().to_string(), shape)
                    })
                    .collect();
                self.tables.insert(
                    table.name.as_str().to_string(),
                    MemoryTable {
                        columns,
                        indexes: IndexSnapshot::new(),
                    },
                );
            }
            Ddl::DropTable { table } => {
                if self.tables.shift_remove(table.name.as_str()).is_none() {
                    return Err(rejected(statement, "table does not exist"));
                }
            }
            Ddl::AddColumn { table, column } => {
                let t = self.table_mut(statement, table)?;
                if t.columns.contains_key(column.name.as_str()) {
                    return Err(rejected(statement, "column already exists"));
                }
                t.columns.insert(
                    column.name.as_str().to_string(),
                    ColumnShape {
                        ty: column.ty.canonical(),
                        not_null: column.not_null || column.ty.is_serial(),
                    },
                );
            }
            Ddl::AlterColumnType { table, column, ty } => {
                let t = self.table_mut(statement, table)?;
                let shape = t
                    .columns
                    .get_mut(column.as_str())
                    .ok_or_else(|| rejected(statement, "column does not exist"))?;
                shape.ty = ty.canonical();
            }
            Ddl::SetNotNull {
                table,
                column,
                not_null,
            } => {
                let t = self.table_mut(statement, table)?;
                let shape = t
                    .columns
                    .get_mut(column.as_str())
                    .ok_or_else(|| rejected(statement, "column does not exist"))?;
                shape.not_null = *not_null;
            }
            Ddl::DropColumn { table, column } => {
                let t = self.table_mut(statement, table)?;
                if t.columns.shift_remove(column.as_str()).is_none() {
                    return Err(rejected(statement, "column does not exist"));
                }
                t.indexes
                    .retain(|_, index| index.keys.iter().all(|k| k.column != column.as_str()));
            }
            Ddl::RenameColumn { table, from, to } => {
                let t = self.table_mut(statement, table)?;
                if t.columns.contains_key(to.as_str()) {
                    return Err(rejected(statement, "column already exists"));
                }
                let shape = t
                    .columns
                    .shift_remove(from.as_str())
                    .ok_or_else(|| rejected(statement, "column does not exist"))?;
                t.columns.insert(to.as_str().to_string(), shape);
                for index in t.indexes.values_mut() {
                    for key in &mut index.keys {
                        if key.column == from.as_str() {
                            key.column = to.as_str().to_string();
                        }
                    }
                }
            }
            Ddl::CreateIndex {
                name,
                table,
                unique,
                keys,
            } => {
                if self.index_exists(name.as_str()) {
                    return Err(rejected(statement, "relation already exists"));
                }
                let t = self.table_mut(statement, table)?;
                let mut shape_keys = Vec::with_capacity(keys.len());
                for part in keys {
                    if !t.columns.contains_key(part.column.as_str()) {
                        return Err(rejected(statement, "column does not exist"));
                    }
                    shape_keys.push(IndexKey {
                        column: part.column.as_str().to_string(),
                        direction: part.direction,
                    });
                }
                t.indexes.insert(
                    name.as_str().to_string(),
                    IndexShape {
                        keys: shape_keys,
                        unique: *unique,
                    },
                );
            }
            Ddl::DropIndex { name } => {
                let removed = self
                    .tables
                    .values_mut()
                    .any(|t| t.indexes.shift_remove(name.name.as_str()).is_some());
                if !removed {
                    return Err(rejected(statement, "index does not exist"));
                }
            }
        }
        Ok(())
    }
}

impl Introspect for MemoryDatabase {
    async fn table_exists(&self, table: &QualifiedName) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.query("existence", table)?.is_some())
    }

    async fn existing_columns(&self, table: &QualifiedName) -> Result<ColumnSnapshot> {
        let mut state = self.state.lock().unwrap();
        let table = state.query("columns", table)?;
        Ok(table.map(|t| t.columns.clone()).unwrap_or_default())
    }

    async fn existing_indexes(&self, table: &QualifiedName) -> Result<IndexSnapshot> {
        let mut state = self.state.lock().unwrap();
        let table = state.query("indexes", table)?;
        Ok(table.map(|t| t.indexes.clone()).unwrap_or_default())
    }
}

impl Execute for MemoryDatabase {
    async fn execute(&self, statement: &Ddl) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.fail_at == Some(state.attempts) {
            return Err(rejected(statement, "injected failure"));
        }
        state.apply(statement)?;
        state.executed.push(statement.to_sql());
        Ok(())
    }
}
