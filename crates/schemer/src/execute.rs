//! Turning classified actions into DDL and running it.
//!
//! [`Executor`] knows which statements implement which action; [`Execute`]
//! is the seam where a statement actually reaches the database. Statements of
//! one action run in order and the first failure stops the action. Nothing
//! already applied is undone.

use crate::ddl::{Ddl, Ident, QualifiedName};
use crate::diff::desired_column_shape;
use crate::introspect::ColumnShape;
use crate::model::{Column, Index, Table};
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};

/// How a column whose type or nullability changed is brought in line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColumnUpdate {
    /// `ALTER COLUMN ... TYPE` and `SET`/`DROP NOT NULL`, keeping the data.
    #[default]
    Alter,
    /// `DROP COLUMN` followed by `ADD COLUMN`. Loses the column's data.
    Recreate,
}

/// Write access to the live schema.
#[allow(async_fn_in_trait)]
pub trait Execute {
    async fn execute(&self, statement: &Ddl) -> Result<()>;
}

impl<T: Execute> Execute for &T {
    async fn execute(&self, statement: &Ddl) -> Result<()> {
        (**self).execute(statement).await
    }
}

/// [`Execute`] over a Postgres connection.
pub struct SqlExecutor<'c, C: Connection> {
    conn: &'c C,
}

impl<'c, C: Connection> SqlExecutor<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self { conn }
    }
}

impl<C: Connection> Execute for SqlExecutor<'_, C> {
    async fn execute(&self, statement: &Ddl) -> Result<()> {
        let sql = statement.to_sql();
        self.conn
            .traced()
            .execute(&sql, &[])
            .await
            .map_err(|e| Error::execution(sql.clone(), e))?;
        Ok(())
    }
}

/// Renders and applies the statements for each kind of change.
///
/// Every operation returns the statements it ran, in order.
pub struct Executor<'e, E: Execute> {
    sink: &'e E,
    schema: Ident,
    column_update: ColumnUpdate,
}

impl<'e, E: Execute> Executor<'e, E> {
    pub fn new(sink: &'e E, schema: Ident) -> Self {
        Self {
            sink,
            schema,
            column_update: ColumnUpdate::default(),
        }
    }

    pub fn with_column_update(mut self, column_update: ColumnUpdate) -> Self {
        self.column_update = column_update;
        self
    }

    fn qualified(&self, name: &Ident) -> QualifiedName {
        QualifiedName::new(self.schema.clone(), name.clone())
    }

    async fn run(&self, statements: Vec<Ddl>) -> Result<Vec<Ddl>> {
        for statement in &statements {
            self.sink.execute(statement).await?;
        }
        Ok(statements)
    }

    /// One `CREATE TABLE` with every column not marked for deletion.
    pub async fn create_table(&self, table: &Ident, def: &Table) -> Result<Vec<Ddl>> {
        let columns = def
            .columns
            .iter()
            .filter(|(_, c)| !c.delete)
            .map(|(name, c)| c.to_def(name))
            .collect::<Result<Vec<_>>>()?;
        self.run(vec![Ddl::CreateTable {
            table: self.qualified(table),
            columns,
        }])
        .await
    }

    pub async fn delete_table(&self, table: &Ident) -> Result<Vec<Ddl>> {
        self.run(vec![Ddl::DropTable {
            table: self.qualified(table),
        }])
        .await
    }

    pub async fn create_column(&self, table: &Ident, name: &str, column: &Column) -> Result<Vec<Ddl>> {
        self.run(vec![Ddl::AddColumn {
            table: self.qualified(table),
            column: column.to_def(name)?,
        }])
        .await
    }

    /// Bring an existing column to the declared type and nullability.
    pub async fn update_column(
        &self,
        table: &Ident,
        name: &str,
        column: &Column,
        existing: &ColumnShape,
    ) -> Result<Vec<Ddl>> {
        let def = column.to_def(name)?;
        let desired = desired_column_shape(column)?;
        let table = self.qualified(table);

        let statements = match self.column_update {
            ColumnUpdate::Alter => {
                let mut statements = Vec::new();
                if desired.ty != existing.ty {
                    statements.push(Ddl::AlterColumnType {
                        table: table.clone(),
                        column: def.name.clone(),
                        ty: def.ty.clone(),
                    });
                }
                if desired.not_null != existing.not_null {
                    statements.push(Ddl::SetNotNull {
                        table,
                        column: def.name,
                        not_null: desired.not_null,
                    });
                }
                statements
            }
            ColumnUpdate::Recreate => vec![
                Ddl::DropColumn {
                    table: table.clone(),
                    column: def.name.clone(),
                },
                Ddl::AddColumn { table, column: def },
            ],
        };
        self.run(statements).await
    }

    pub async fn delete_column(&self, table: &Ident, name: &str) -> Result<Vec<Ddl>> {
        self.run(vec![Ddl::DropColumn {
            table: self.qualified(table),
            column: Ident::new(name)?,
        }])
        .await
    }

    pub async fn rename_column(&self, table: &Ident, from: &str, to: &str) -> Result<Vec<Ddl>> {
        self.run(vec![Ddl::RenameColumn {
            table: self.qualified(table),
            from: Ident::new(from)?,
            to: Ident::new(to)?,
        }])
        .await
    }

    fn create_index_statement(&self, table: &Ident, name: &str, index: &Index) -> Result<Ddl> {
        Ok(Ddl::CreateIndex {
            name: Ident::new(name)?,
            table: self.qualified(table),
            unique: index.is_unique(),
            keys: index.key_parts(table.as_str(), name)?,
        })
    }

    fn drop_index_statement(&self, name: &str) -> Result<Ddl> {
        Ok(Ddl::DropIndex {
            name: self.qualified(&Ident::new(name)?),
        })
    }

    /// One `CREATE [UNIQUE] INDEX` over the full, ordered key list.
    pub async fn create_index(&self, table: &Ident, name: &str, index: &Index) -> Result<Vec<Ddl>> {
        let create = self.create_index_statement(table, name, index)?;
        self.run(vec![create]).await
    }

    /// Drop, then create again. If the create fails the index stays dropped.
    pub async fn update_index(&self, table: &Ident, name: &str, index: &Index) -> Result<Vec<Ddl>> {
        // build both before sending anything
        let drop = self.drop_index_statement(name)?;
        let create = self.create_index_statement(table, name, index)?;
        self.run(vec![drop, create]).await
    }

    pub async fn delete_index(&self, name: &str) -> Result<Vec<Ddl>> {
        let drop = self.drop_index_statement(name)?;
        self.run(vec![drop]).await
    }
}
