//! Driving a whole declaration against the live schema.
//!
//! Tables are visited in name order, and so are the columns and indexes
//! inside each table, so the run never depends on how the declaration's maps
//! were built. Per table the order is fixed: the table itself, then its
//! columns, then its indexes. Each step introspects again, so it sees what the
//! previous step just did (a freshly created table, an index that went away
//! with a dropped column).
//!
//! The first error stops the run. Statements already applied stay applied;
//! running again classifies them as `Noop` and carries on from there.

use crate::Result;
use crate::ddl::{Ddl, Ident, QualifiedName};
use crate::diff::{Action, classify_column, classify_index_in, classify_table, rename_source};
use crate::execute::{ColumnUpdate, Execute, Executor, SqlExecutor};
use crate::introspect::{Catalog, Introspect};
use crate::model::{Migration, Table};
use crate::traced::Connection;
use indexmap::IndexMap;
use std::fmt;
use tracing::Instrument;

/// What kind of entity a change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Table,
    Column,
    Index,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Table => "table",
            Entity::Column => "column",
            Entity::Index => "index",
        })
    }
}

/// One change that was applied, with the statements that applied it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub table: String,
    pub entity: Entity,
    pub name: String,
    pub action: Action,
    /// Set when a column was renamed into place.
    pub renamed_from: Option<String>,
    pub statements: Vec<String>,
}

impl fmt::Display for AppliedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.renamed_from) {
            (Entity::Table, _) => write!(f, "{} table {}", self.action, self.name),
            (_, Some(from)) => write!(f, "{} rename {} -> {}", self.action, from, self.name),
            (entity, None) => write!(f, "{} {} {}", self.action, entity, self.name),
        }
    }
}

/// Everything a [`Migrator::migrate`] run changed, in the order it happened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub changes: Vec<AppliedChange>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn statement_count(&self) -> usize {
        self.changes.iter().map(|c| c.statements.len()).sum()
    }

    /// All applied statements, in order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .flat_map(|c| c.statements.iter().map(String::as_str))
    }

    fn record(
        &mut self,
        table: &str,
        entity: Entity,
        name: &str,
        action: Action,
        renamed_from: Option<String>,
        statements: Vec<Ddl>,
    ) {
        let statements: Vec<String> = statements.iter().map(Ddl::to_sql).collect();
        tracing::info!(
            table,
            entity = %entity,
            name,
            action = ?action,
            statements = statements.len(),
            "applied change"
        );
        self.changes.push(AppliedChange {
            table: table.to_string(),
            entity,
            name: name.to_string(),
            action,
            renamed_from,
            statements,
        });
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "Schema is up to date.");
        }
        writeln!(f, "Applied changes:\n")?;
        let mut current: Option<&str> = None;
        for change in &self.changes {
            if current != Some(change.table.as_str()) {
                writeln!(f, "  {}:", change.table)?;
                current = Some(change.table.as_str());
            }
            writeln!(f, "    {}", change)?;
        }
        Ok(())
    }
}

fn sorted<V>(map: &IndexMap<String, V>) -> Vec<(&String, &V)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Reconciles a live schema with a [`Migration`].
pub struct Migrator<I, E> {
    introspect: I,
    execute: E,
    schema: Ident,
    column_update: ColumnUpdate,
}

impl<'c, C: Connection> Migrator<Catalog<'c, C>, SqlExecutor<'c, C>> {
    /// A migrator working on the `public` schema of `conn`.
    pub fn new(conn: &'c C) -> Self {
        Self::with_parts(Catalog::new(conn), SqlExecutor::new(conn))
    }
}

impl<I: Introspect, E: Execute> Migrator<I, E> {
    pub fn with_parts(introspect: I, execute: E) -> Self {
        Self {
            introspect,
            execute,
            schema: Ident::public(),
            column_update: ColumnUpdate::default(),
        }
    }

    /// Work on another schema. The name goes through the same checks as any
    /// other identifier.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Result<Self> {
        self.schema = Ident::new(schema)?;
        Ok(self)
    }

    pub fn column_update(mut self, column_update: ColumnUpdate) -> Self {
        self.column_update = column_update;
        self
    }

    pub fn schema(&self) -> &Ident {
        &self.schema
    }

    /// Bring the live schema in line with `migration`.
    pub async fn migrate(&self, migration: &Migration) -> Result<MigrationReport> {
        migration.validate()?;
        tracing::info!(
            schema = %self.schema.as_str(),
            tables = migration.tables.len(),
            "reconciling schema"
        );

        let executor = Executor::new(&self.execute, self.schema.clone())
            .with_column_update(self.column_update);
        let mut report = MigrationReport::default();
        for (name, table) in sorted(&migration.tables) {
            let span = tracing::info_span!("table", name = %name);
            self.migrate_table(&executor, name, table, &mut report)
                .instrument(span)
                .await?;
        }

        tracing::info!(
            changes = report.changes.len(),
            statements = report.statement_count(),
            "schema reconciled"
        );
        Ok(report)
    }

    async fn migrate_table(
        &self,
        executor: &Executor<'_, E>,
        name: &str,
        table: &Table,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let ident = Ident::new(name)?;
        let qualified = QualifiedName::new(self.schema.clone(), ident.clone());

        let exists = self.introspect.table_exists(&qualified).await?;
        let action = classify_table(table.delete, exists);
        tracing::debug!(exists, action = ?action, "classified table");
        match action {
            Action::Create => {
                let ran = executor.create_table(&ident, table).await?;
                report.record(name, Entity::Table, name, action, None, ran);
            }
            Action::Delete => {
                let ran = executor.delete_table(&ident).await?;
                report.record(name, Entity::Table, name, action, None, ran);
                return Ok(());
            }
            Action::Noop | Action::Update => {
                if table.delete {
                    return Ok(());
                }
            }
        }

        let mut columns = self.introspect.existing_columns(&qualified).await?;
        for (column_name, column) in sorted(&table.columns) {
            if let Some(previous) = rename_source(column_name, column, &table.columns, &columns) {
                let ran = executor
                    .rename_column(&ident, previous, column_name)
                    .await?;
                if let Some(shape) = columns.shift_remove(previous) {
                    columns.insert(column_name.clone(), shape);
                }
                report.record(
                    name,
                    Entity::Column,
                    column_name,
                    Action::Update,
                    Some(previous.to_string()),
                    ran,
                );
            }

            let existing = columns.get(column_name.as_str());
            let action = classify_column(column, existing)?;
            tracing::debug!(column = %column_name, action = ?action, "classified column");
            let ran = match (action, existing) {
                (Action::Create, _) => executor.create_column(&ident, column_name, column).await?,
                (Action::Update, Some(shape)) => {
                    executor
                        .update_column(&ident, column_name, column, shape)
                        .await?
                }
                (Action::Delete, _) => executor.delete_column(&ident, column_name).await?,
                _ => continue,
            };
            report.record(name, Entity::Column, column_name, action, None, ran);
        }

        let indexes = self.introspect.existing_indexes(&qualified).await?;
        for (index_name, index) in sorted(&table.indexes) {
            let action = classify_index_in(name, index_name, index, &indexes)?;
            tracing::debug!(index = %index_name, action = ?action, "classified index");
            let ran = match action {
                Action::Create => executor.create_index(&ident, index_name, index).await?,
                Action::Update => executor.update_index(&ident, index_name, index).await?,
                Action::Delete => executor.delete_index(index_name).await?,
                Action::Noop => continue,
            };
            report.record(name, Entity::Index, index_name, action, None, ran);
        }

        Ok(())
    }
}

/// Reconcile the `public` schema of `conn` with `migration`.
pub async fn migrate<C: Connection>(conn: &C, migration: &Migration) -> Result<MigrationReport> {
    Migrator::new(conn).migrate(migration).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::ddl::Direction;
    use crate::introspect::{ColumnShape, IndexKey, IndexShape};
    use crate::model::{Column, Index, IndexColumn};
    use crate::testing::MemoryDatabase;
    use proptest::prelude::*;

    fn user_table() -> Table {
        Table::default()
            .with_column("id", Column::new("bigserial").not_null())
            .with_column("email", Column::new("varchar(255)").not_null())
            .with_column("name", Column::new("text"))
            .with_index("uq_user_email", Index::on(["email"]).unique())
    }

    fn post_table() -> Table {
        Table::default()
            .with_column("id", Column::new("bigserial").not_null())
            .with_column("author_id", Column::new("bigint").not_null())
            .with_column("created_at", Column::new("timestamptz").not_null())
            .with_index(
                "idx_post_author_recent",
                Index::default()
                    .with_column("author_id", IndexColumn::default())
                    .with_column("created_at", IndexColumn::desc()),
            )
    }

    fn blog() -> Migration {
        let mut migration = Migration::new();
        migration.tables.insert("user".into(), user_table());
        migration.tables.insert("post".into(), post_table());
        migration
    }

    fn migrator(db: &MemoryDatabase) -> Migrator<&MemoryDatabase, &MemoryDatabase> {
        Migrator::with_parts(db, db)
    }

    fn outcomes(report: &MigrationReport) -> Vec<(String, Entity, String, Action)> {
        report
            .changes
            .iter()
            .map(|c| (c.table.clone(), c.entity, c.name.clone(), c.action))
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_database_gets_tables_then_indexes() {
        let db = MemoryDatabase::new();
        let report = migrator(&db).migrate(&blog()).await.unwrap();

        insta::assert_snapshot!(report.statements().collect::<Vec<_>>().join("\n"), @r#"
        CREATE TABLE "public"."post" ("id" bigserial NOT NULL, "author_id" bigint NOT NULL, "created_at" timestamptz NOT NULL)
        CREATE INDEX "idx_post_author_recent" ON "public"."post" ("author_id" ASC, "created_at" DESC)
        CREATE TABLE "public"."user" ("id" bigserial NOT NULL, "email" varchar(255) NOT NULL, "name" text)
        CREATE UNIQUE INDEX "uq_user_email" ON "public"."user" ("email" ASC)
        "#);
        assert_eq!(report.statements().collect::<Vec<_>>(), db.executed());

        let user = db.table("user").unwrap();
        assert_eq!(user.columns["email"], ColumnShape::new("character varying(255)", true));
        assert_eq!(user.columns["id"], ColumnShape::new("bigint", true));
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();
        db.clear_log();

        let report = migrator(&db).migrate(&blog()).await.unwrap();
        assert!(report.is_empty());
        assert!(db.executed().is_empty());
        assert_eq!(report.to_string(), "Schema is up to date.\n");
    }

    #[tokio::test]
    async fn test_deleted_table_is_dropped_and_left_alone() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();
        db.clear_log();

        let mut migration = blog();
        let mut gone = Table::deleted()
            .with_column("extra", Column::new("text"))
            .with_index("idx_post_extra", Index::on(["extra"]));
        gone.columns.insert("id".into(), Column::deleted());
        migration.tables.insert("post".into(), gone);

        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert_eq!(
            outcomes(&report),
            [("post".into(), Entity::Table, "post".into(), Action::Delete)]
        );
        assert_eq!(db.executed(), [r#"DROP TABLE "public"."post""#]);
        assert!(db.table("post").is_none());

        // and once it is gone, declaring it deleted is a no-op
        db.clear_log();
        assert!(migrator(&db).migrate(&migration).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_column_type_change() {
        let db = MemoryDatabase::new();
        let mut migration = Migration::new();
        migration.tables.insert(
            "user".into(),
            Table::default().with_column("name", Column::new("varchar(50)")),
        );
        migrator(&db).migrate(&migration).await.unwrap();
        db.clear_log();

        migration.tables["user"].columns["name"].ty = "varchar(100)".into();
        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert_eq!(
            outcomes(&report),
            [("user".into(), Entity::Column, "name".into(), Action::Update)]
        );
        assert_eq!(
            db.table("user").unwrap().columns["name"],
            ColumnShape::new("character varying(100)", false)
        );
    }

    #[tokio::test]
    async fn test_column_update_recreate() {
        let db = MemoryDatabase::new();
        let mut migration = Migration::new();
        migration.tables.insert(
            "user".into(),
            Table::default().with_column("age", Column::new("int")),
        );
        migrator(&db).migrate(&migration).await.unwrap();
        db.clear_log();

        migration.tables["user"].columns["age"] = Column::new("bigint").not_null();
        migrator(&db)
            .column_update(ColumnUpdate::Recreate)
            .migrate(&migration)
            .await
            .unwrap();
        assert_eq!(
            db.executed(),
            [
                r#"ALTER TABLE "public"."user" DROP COLUMN "age""#,
                r#"ALTER TABLE "public"."user" ADD COLUMN "age" bigint NOT NULL"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_composite_index_order_is_significant() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();
        db.clear_log();

        let mut migration = blog();
        migration.tables["post"].indexes["idx_post_author_recent"] =
            Index::on(["created_at", "author_id"]);
        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert_eq!(
            outcomes(&report),
            [(
                "post".into(),
                Entity::Index,
                "idx_post_author_recent".into(),
                Action::Update
            )]
        );
        assert_eq!(
            db.table("post").unwrap().indexes["idx_post_author_recent"],
            IndexShape {
                keys: vec![
                    IndexKey {
                        column: "created_at".into(),
                        direction: Direction::Asc
                    },
                    IndexKey {
                        column: "author_id".into(),
                        direction: Direction::Asc
                    },
                ],
                unique: false,
            }
        );
    }

    #[tokio::test]
    async fn test_unsafe_names_are_rejected_up_front() {
        let db = MemoryDatabase::new();
        let mut migration = blog();
        migration.tables.insert(
            "zzz".into(),
            Table::default().with_column("x\"; DROP TABLE user; --", Column::new("text")),
        );

        let err = migrator(&db).migrate(&migration).await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier { .. }));
        assert!(err.is_validation());
        assert!(db.executed().is_empty());
        assert!(db.tables().is_empty());

        let err = migrator(&db).with_schema("public; --").err().unwrap();
        assert!(matches!(err, Error::InvalidIdentifier { .. }));
        assert_eq!(migrator(&db).schema().as_str(), "public");
        assert_eq!(
            migrator(&db).with_schema("app").unwrap().schema().as_str(),
            "app"
        );
    }

    #[tokio::test]
    async fn test_resume_after_partial_failure() {
        let full = MemoryDatabase::new();
        migrator(&full).migrate(&blog()).await.unwrap();
        let all = full.executed();
        assert_eq!(all.len(), 4);

        for k in 1..=all.len() {
            let db = MemoryDatabase::new();
            db.fail_at(k);
            let err = migrator(&db).migrate(&blog()).await.unwrap_err();
            assert!(matches!(err, Error::Execution { .. }));
            assert_eq!(db.executed(), all[..k - 1]);

            db.clear_log();
            migrator(&db).migrate(&blog()).await.unwrap();
            assert_eq!(db.executed(), all[k - 1..], "resuming after failure at {k}");
            assert_eq!(db.tables(), full.tables());
        }
    }

    #[tokio::test]
    async fn test_introspection_failure_stops_the_run() {
        let full = MemoryDatabase::new();
        migrator(&full).migrate(&blog()).await.unwrap();
        let all = full.executed();

        // per table: existence, create, columns, indexes, create index
        let applied_before = [0, 1, 1, 2, 3, 3];
        for (n, applied) in applied_before.into_iter().enumerate() {
            let db = MemoryDatabase::new();
            db.fail_introspection_at(n + 1);
            let err = migrator(&db).migrate(&blog()).await.unwrap_err();
            assert!(
                matches!(err, Error::Introspection { .. }),
                "query {}: {err:?}",
                n + 1
            );
            assert_eq!(db.executed(), all[..applied], "failing query {}", n + 1);

            db.clear_log();
            migrator(&db).migrate(&blog()).await.unwrap();
            assert_eq!(db.executed(), all[applied..]);
            assert_eq!(db.tables(), full.tables());
        }
    }

    #[tokio::test]
    async fn test_dropping_a_column_recreates_its_index() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();
        db.clear_log();

        let mut migration = blog();
        migration.tables["user"].columns["email"] = Column::deleted();
        migration.tables["user"]
            .columns
            .insert("mail".into(), Column::new("text"));
        migration.tables["user"].indexes["uq_user_email"] = Index::on(["mail"]).unique();

        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert_eq!(
            outcomes(&report),
            [
                ("user".into(), Entity::Column, "email".into(), Action::Delete),
                ("user".into(), Entity::Column, "mail".into(), Action::Create),
                ("user".into(), Entity::Index, "uq_user_email".into(), Action::Create),
            ]
        );
    }

    #[tokio::test]
    async fn test_rename_column() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();
        db.clear_log();

        let mut migration = blog();
        let user = &mut migration.tables["user"];
        user.columns.shift_remove("name");
        user.columns
            .insert("display_name".into(), Column::new("text").not_null().renamed_from("name"));

        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert_eq!(
            db.executed(),
            [
                r#"ALTER TABLE "public"."user" RENAME COLUMN "name" TO "display_name""#,
                r#"ALTER TABLE "public"."user" ALTER COLUMN "display_name" SET NOT NULL"#,
            ]
        );
        insta::assert_snapshot!(report.to_string(), @r"
        Applied changes:

          user:
            ~ rename name -> display_name
            ~ column display_name
        ");

        // the hint is inert once the old column is gone
        db.clear_log();
        assert!(migrator(&db).migrate(&migration).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_columns_and_indexes_are_kept() {
        let db = MemoryDatabase::new();
        migrator(&db).migrate(&blog()).await.unwrap();

        let mut migration = Migration::new();
        migration.tables.insert(
            "user".into(),
            Table::default().with_column("id", Column::new("bigint").not_null()),
        );
        let report = migrator(&db).migrate(&migration).await.unwrap();
        assert!(report.is_empty());
        let user = db.table("user").unwrap();
        assert!(user.columns.contains_key("email"));
        assert!(user.indexes.contains_key("uq_user_email"));
    }

    fn shuffled(migration: &Migration, seed: &[usize]) -> Migration {
        fn shuffle<V: Clone>(map: &IndexMap<String, V>, seed: &[usize]) -> IndexMap<String, V> {
            let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (i, s) in seed.iter().enumerate() {
                let len = entries.len();
                if len > 1 {
                    entries.swap(i % len, s % len);
                }
            }
            entries.into_iter().collect()
        }

        let tables = migration
            .tables
            .iter()
            .map(|(name, table)| {
                let mut table = table.clone();
                table.columns = shuffle(&table.columns, seed);
                table.indexes = shuffle(&table.indexes, seed);
                (name.clone(), table)
            })
            .collect();
        Migration {
            tables: shuffle(&tables, seed),
        }
    }

    fn mixed_migration() -> Migration {
        let mut migration = blog();
        migration.tables["user"]
            .columns
            .insert("bio".into(), Column::new("varchar(500)"));
        migration.tables["user"].columns["name"] = Column::deleted();
        migration.tables["user"]
            .indexes
            .insert("idx_user_bio".into(), Index::on(["bio"]));
        migration.tables["post"].indexes["idx_post_author_recent"] =
            Index::on(["created_at", "author_id"]);
        migration
            .tables
            .insert("tag".into(), Table::default().with_column("label", Column::new("text")));
        migration.tables.insert("legacy".into(), Table::deleted());
        migration
    }

    proptest! {
        #[test]
        fn test_order_independence(seed in proptest::collection::vec(0usize..16, 0..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let base = MemoryDatabase::new();
                migrator(&base).migrate(&blog()).await.unwrap();
                let expected_report = migrator(&base).migrate(&mixed_migration()).await.unwrap();

                let db = MemoryDatabase::new();
                migrator(&db).migrate(&shuffled(&blog(), &seed)).await.unwrap();
                let report = migrator(&db)
                    .migrate(&shuffled(&mixed_migration(), &seed))
                    .await
                    .unwrap();

                prop_assert_eq!(outcomes(&report), outcomes(&expected_report));
                prop_assert_eq!(db.tables(), base.tables());
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }
}
