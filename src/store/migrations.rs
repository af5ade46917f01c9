use super::{StoreError, format_timestamp};
use crate::entity::schema_migrations;
use chrono::Utc;
use sea_orm::*;
use std::collections::HashSet;
use tracing::info;

pub(super) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Ordered by version. Applied migrations are never edited, only appended to.
pub(super) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_chat_history",
        sql: include_str!("../../migrations/0001_create_chat_history.sql"),
    },
    Migration {
        version: 2,
        name: "index_chat_history_created_at",
        sql: include_str!("../../migrations/0002_index_chat_history_created_at.sql"),
    },
];

/// Applies every migration not yet recorded in `schema_migrations` and
/// returns the versions applied by this call.
pub(super) fn run(db: &DatabaseConnection) -> Result<Vec<i64>, StoreError> {
    db.get_schema_builder()
        .register(schema_migrations::Entity)
        .apply(db)?;

    let applied: HashSet<i64> = schema_migrations::Entity::find()
        .all(db)?
        .into_iter()
        .map(|m| m.version)
        .collect();

    let mut newly_applied = Vec::new();
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let txn = db.begin()?;
        txn.execute_unprepared(migration.sql)
            .map_err(|source| StoreError::Migration {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        schema_migrations::Entity::insert(schema_migrations::ActiveModel {
            version: Set(migration.version),
            name: Set(migration.name.to_string()),
            applied_at: Set(format_timestamp(Utc::now())),
        })
        .exec(&txn)?;
        txn.commit()?;

        info!("Applied migration {} ({})", migration.version, migration.name);
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(dir: &tempfile::TempDir) -> DatabaseConnection {
        let db_url = format!("sqlite:{}?mode=rwc", dir.path().join("db.sqlite").display());
        Database::connect(&db_url).unwrap()
    }

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn reapplying_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let db = connect(&dir);

        let first = run(&db).unwrap();
        let second = run(&db).unwrap();

        assert_eq!(first, vec![1, 2]);
        assert!(second.is_empty());
        assert_eq!(schema_migrations::Entity::find().count(&db).unwrap(), 2);
    }
}
