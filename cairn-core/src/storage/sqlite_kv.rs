use crate::storage::kv::{CasOutcome, KvStore, Versioned};
use crate::{CairnError, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One SQLite table per namespace, `cas` bumped on every committed write.
pub struct SqliteKv {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteKv {
    /// Opens `db_path`, creating `table` if needed.
    pub fn open(db_path: &Path, table: &str) -> Result<Self> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CairnError::Config(format!(
                "invalid metadata table name: {}",
                table
            )));
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CairnError::Internal("sqlite connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    cas INTEGER NOT NULL
                )",
                self.table
            ),
            [],
        )?;
        Ok(())
    }

    fn get_sync(conn: &Connection, table: &str, key: &str) -> Result<Option<Versioned>> {
        let row = conn
            .query_row(
                &format!("SELECT value, cas FROM {} WHERE key = ?1", table),
                [key],
                |row| {
                    Ok(Versioned {
                        value: row.get(0)?,
                        cas: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let conn = self.get_conn()?;
        Self::get_sync(&conn, &self.table, key)
    }

    async fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, Versioned>> {
        let conn = self.get_conn()?;
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(entry) = Self::get_sync(&conn, &self.table, key)? {
                found.insert(key.clone(), entry);
            }
        }
        Ok(found)
    }

    async fn put_if(&self, key: &str, expected: Option<u64>, value: Vec<u8>) -> Result<CasOutcome> {
        let conn = self.get_conn()?;

        match expected {
            None => {
                let affected = conn.execute(
                    &format!(
                        "INSERT INTO {} (key, value, cas) VALUES (?1, ?2, 1)
                         ON CONFLICT(key) DO NOTHING",
                        self.table
                    ),
                    params![key, value],
                )?;
                if affected == 1 {
                    Ok(CasOutcome::Committed(1))
                } else {
                    Ok(CasOutcome::Conflict)
                }
            }
            Some(cas) => {
                let affected = conn.execute(
                    &format!(
                        "UPDATE {} SET value = ?1, cas = cas + 1 WHERE key = ?2 AND cas = ?3",
                        self.table
                    ),
                    params![value, key, cas as i64],
                )?;
                if affected == 1 {
                    Ok(CasOutcome::Committed(cas + 1))
                } else {
                    Ok(CasOutcome::Conflict)
                }
            }
        }
    }

    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<(String, Versioned)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, value, cas FROM {} WHERE key > ?1 ORDER BY key LIMIT ?2",
            self.table
        ))?;

        let rows = stmt.query_map(params![after.unwrap_or(""), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Versioned {
                    value: row.get(1)?,
                    cas: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::update_with_retry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sqlite_put_if_and_scan() {
        let temp_dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::open(&temp_dir.path().join("meta.db"), "files").unwrap();

        assert_eq!(
            kv.put_if("b", None, b"1".to_vec()).await.unwrap(),
            CasOutcome::Committed(1)
        );
        assert_eq!(
            kv.put_if("b", None, b"1".to_vec()).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(
            kv.put_if("b", Some(1), b"2".to_vec()).await.unwrap(),
            CasOutcome::Committed(2)
        );
        assert_eq!(
            kv.put_if("b", Some(1), b"3".to_vec()).await.unwrap(),
            CasOutcome::Conflict
        );
        kv.put_if("a", None, b"x".to_vec()).await.unwrap();

        let keys: Vec<String> = kv
            .scan(None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);

        let stored = kv.get("b").await.unwrap().unwrap();
        assert_eq!(stored.value, b"2".to_vec());
        assert_eq!(stored.cas, 2);
    }

    #[tokio::test]
    async fn test_sqlite_namespaces_are_isolated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("meta.db");
        let files = SqliteKv::open(&db_path, "files").unwrap();
        let blobs = SqliteKv::open(&db_path, "blobs").unwrap();

        files.put_if("k", None, b"file".to_vec()).await.unwrap();
        assert!(blobs.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_update_with_retry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(SqliteKv::open(&temp_dir.path().join("meta.db"), "files").unwrap());

        for _ in 0..3 {
            update_with_retry(kv.as_ref(), "n", |current| {
                let mut value = current.map(|raw| raw.to_vec()).unwrap_or_default();
                value.push(b'x');
                Ok(value)
            })
            .await
            .unwrap();
        }

        assert_eq!(kv.get("n").await.unwrap().unwrap().value, b"xxx".to_vec());
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(SqliteKv::open(&temp_dir.path().join("meta.db"), "files; drop").is_err());
    }
}
