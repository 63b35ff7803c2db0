//! The desired schema, as declared by the user.
//!
//! These types are plain data. They deserialize from a styx declaration via
//! facet, e.g.:
//!
//! ```styx
//! tables {
//!   user {
//!     columns {
//!       id { type bigserial, not_null true }
//!       email { type "varchar(255)", not_null true }
//!       mail { delete true }
//!     }
//!     indexes {
//!       uq_user_email { columns { email { unique true } } }
//!     }
//!   }
//! }
//! ```
//!
//! Map order of `tables`, `columns` and `indexes` carries no meaning, except
//! for the columns of an [`Index`], whose order is the key order of the index.

use crate::ddl::{ColumnDef, Direction, Ident, KeyPart, SqlType};
use crate::{Error, Result};
use facet::Facet;
use indexmap::IndexMap;

/// A complete schema declaration.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct Migration {
    #[facet(default)]
    pub tables: IndexMap<String, Table>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct Table {
    #[facet(default)]
    pub columns: IndexMap<String, Column>,

    #[facet(default)]
    pub indexes: IndexMap<String, Index>,

    /// Drop the table. Columns and indexes are ignored when set.
    #[facet(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct Column {
    /// Dialect type expression, e.g. `integer` or `varchar(255)`. May be
    /// left out when the column is deleted.
    #[facet(default, rename = "type")]
    pub ty: String,

    #[facet(default)]
    pub not_null: bool,

    /// Name this column had before, used to rename instead of drop + add.
    #[facet(default)]
    pub previous: Option<String>,

    #[facet(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct Index {
    /// Key columns, in key order.
    #[facet(default)]
    pub columns: IndexMap<String, IndexColumn>,

    #[facet(default)]
    pub unique: bool,

    #[facet(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct IndexColumn {
    /// `ASC` or `DESC`, case-insensitive. Defaults to `ASC`.
    #[facet(default)]
    pub direction: Option<String>,

    /// Marks the index as unique.
    #[facet(default)]
    pub unique: bool,
}

impl Migration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check every name, type and index in the declaration.
    ///
    /// Entities marked for deletion are checked too: their names still end up
    /// in `DROP` statements.
    pub fn validate(&self) -> Result<()> {
        for (table_name, table) in &self.tables {
            Ident::new(table_name.as_str())?;
            if table.delete {
                continue;
            }
            for (column_name, column) in &table.columns {
                Ident::new(column_name.as_str())?;
                if let Some(previous) = &column.previous {
                    Ident::new(previous.as_str())?;
                }
                if !column.delete {
                    SqlType::parse(&column.ty)?;
                }
            }
            for (index_name, index) in &table.indexes {
                Ident::new(index_name.as_str())?;
                if !index.delete {
                    index.key_parts(table_name, index_name)?;
                }
            }
        }
        Ok(())
    }
}

impl Table {
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, index: Index) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }

    pub fn deleted() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }
}

impl Column {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            ..Self::default()
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn renamed_from(mut self, previous: impl Into<String>) -> Self {
        self.previous = Some(previous.into());
        self
    }

    pub fn deleted() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    pub(crate) fn to_def(&self, name: &str) -> Result<ColumnDef> {
        Ok(ColumnDef {
            name: Ident::new(name)?,
            ty: SqlType::parse(&self.ty)?,
            not_null: self.not_null,
        })
    }
}

impl Index {
    /// An index over `columns`, all ascending.
    pub fn on<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|c| (c.into(), IndexColumn::default()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column: IndexColumn) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn deleted() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    /// Unique when the index itself or any of its columns says so.
    pub fn is_unique(&self) -> bool {
        self.unique || self.columns.values().any(|c| c.unique)
    }

    pub(crate) fn key_parts(&self, table: &str, index: &str) -> Result<Vec<KeyPart>> {
        if self.columns.is_empty() {
            return Err(Error::InvalidIndex {
                table: table.to_string(),
                index: index.to_string(),
                reason: "an index needs at least one column".to_string(),
            });
        }
        self.columns
            .iter()
            .map(|(name, column)| {
                let direction = column.direction().ok_or_else(|| Error::InvalidIndex {
                    table: table.to_string(),
                    index: index.to_string(),
                    reason: format!(
                        "column {} has direction {:?}, expected ASC or DESC",
                        name,
                        column.direction.as_deref().unwrap_or_default()
                    ),
                })?;
                Ok(KeyPart {
                    column: Ident::new(name.as_str())?,
                    direction,
                })
            })
            .collect()
    }
}

impl IndexColumn {
    pub fn desc() -> Self {
        Self {
            direction: Some("DESC".to_string()),
            ..Self::default()
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::parse(self.direction.as_deref())
    }
}
