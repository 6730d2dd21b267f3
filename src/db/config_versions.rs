use crate::db::{parse_datetime, Database, DbError};
use crate::db::models::ConfigVersion;

impl Database {
    /// Append a new immutable config snapshot. Version numbers are
    /// monotonically increasing; this never overwrites an existing row.
    pub fn save_config_version(&self, yaml: &str, author: &str) -> Result<ConfigVersion, DbError> {
        self.with_conn(|conn| {
            let next_version: i64 = conn
                .query_row("SELECT COALESCE(MAX(version), 0) + 1 FROM config_versions", [], |row| row.get(0))?;
            let now = chrono::Utc::now();

            conn.execute(
                "INSERT INTO config_versions (version, yaml, author, created_at) VALUES (?, ?, ?, ?)",
                rusqlite::params![next_version, yaml, author, now.to_rfc3339()],
            )?;

            Ok(ConfigVersion {
                version: next_version,
                yaml: yaml.to_string(),
                author: author.to_string(),
                created_at: now,
            })
        })
    }

    pub fn list_config_versions(&self) -> Result<Vec<ConfigVersion>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, yaml, author, created_at FROM config_versions ORDER BY version DESC",
            )?;
            let versions = stmt
                .query_map([], |row| {
                    Ok(ConfigVersion {
                        version: row.get(0)?,
                        yaml: row.get(1)?,
                        author: row.get(2)?,
                        created_at: parse_datetime(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
    }

    pub fn get_config_version(&self, version: i64) -> Result<ConfigVersion, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, yaml, author, created_at FROM config_versions WHERE version = ?",
            )?;
            stmt.query_row([version], |row| {
                Ok(ConfigVersion {
                    version: row.get(0)?,
                    yaml: row.get(1)?,
                    author: row.get(2)?,
                    created_at: parse_datetime(row.get(3)?),
                })
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("ConfigVersion {}", version)),
                other => DbError::Sqlite(other),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_config_version_increments() {
        let db = Database::open_in_memory().unwrap();
        let v1 = db.save_config_version("a: 1", "local").unwrap();
        let v2 = db.save_config_version("a: 2", "local").unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn list_config_versions_orders_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.save_config_version("a: 1", "local").unwrap();
        db.save_config_version("a: 2", "local").unwrap();

        let versions = db.list_config_versions().unwrap();
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[1].version, 1);
    }

    #[test]
    fn get_config_version_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_config_version(5), Err(DbError::NotFound(_))));
    }
}
