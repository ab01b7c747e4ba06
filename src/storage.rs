use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::session::Session;

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

const SESSION_COLUMNS: &str =
    "user_id, email, username, access_token, refresh_token, expires_at";

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = match opts.path {
            Some(path) => path,
            None => default_path().context("storage: resolve default path")?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        if session.user_id.is_empty() {
            bail!("storage: user id required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO sessions (user_id, email, username, access_token, refresh_token, expires_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(user_id) DO UPDATE SET
  email = excluded.email,
  username = excluded.username,
  access_token = excluded.access_token,
  refresh_token = excluded.refresh_token,
  expires_at = excluded.expires_at,
  updated_at = excluded.updated_at
"#,
            params![
                session.user_id,
                session.email,
                session.username,
                session.access_token,
                session.refresh_token,
                session.expires_at.timestamp(),
                Utc::now().timestamp_millis(),
            ],
        )
        .context("storage: upsert session")?;
        Ok(())
    }

    pub fn get_session(&self, user_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE user_id = ?1", SESSION_COLUMNS),
            params![user_id],
            session_from_row,
        )
        .optional()
        .context("storage: query session")
    }

    /// The session written most recently, if any.
    pub fn latest_session(&self) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions ORDER BY updated_at DESC LIMIT 1",
                SESSION_COLUMNS
            ),
            [],
            session_from_row,
        )
        .optional()
        .context("storage: query latest session")
    }

    pub fn delete_session(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])
            .context("storage: delete session")?;
        Ok(())
    }

    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            bail!("storage: preference key required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO preferences (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, Utc::now().timestamp()],
        )
        .context("storage: set preference")?;
        Ok(())
    }

    pub fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM preferences WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("storage: query preference")
    }

    pub fn delete_preference(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM preferences WHERE key = ?1", params![key])
            .context("storage: delete preference")?;
        Ok(())
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let expires: i64 = row.get(5)?;
    Ok(Session {
        user_id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: timestamp(expires),
    })
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {}", version))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS sessions (
  user_id TEXT PRIMARY KEY,
  email TEXT NOT NULL,
  username TEXT NOT NULL,
  access_token TEXT NOT NULL,
  refresh_token TEXT NOT NULL,
  expires_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);

CREATE TABLE IF NOT EXISTS preferences (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("parkfeed").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn session(user_id: &str, token: &str) -> Session {
        Session {
            user_id: user_id.into(),
            email: format!("{user_id}@example.com"),
            username: user_id.into(),
            access_token: token.into(),
            refresh_token: format!("{token}-refresh"),
            expires_at: timestamp(1_700_003_600),
        }
    }

    fn open(dir: &tempfile::TempDir) -> Store {
        Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap()
    }

    #[test]
    fn open_creates_database_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn sessions_round_trip_and_upsert() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        assert!(store.latest_session().unwrap().is_none());

        store.upsert_session(&session("u1", "a")).unwrap();
        store.upsert_session(&session("u1", "b")).unwrap();
        let stored = store.get_session("u1").unwrap().unwrap();
        assert_eq!(stored, session("u1", "b"));
        assert!(store.get_session("u2").unwrap().is_none());

        store.delete_session("u1").unwrap();
        assert!(store.get_session("u1").unwrap().is_none());
    }

    #[test]
    fn latest_session_is_most_recently_written() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        store.upsert_session(&session("u1", "a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.upsert_session(&session("u2", "b")).unwrap();
        assert_eq!(store.latest_session().unwrap().unwrap().user_id, "u2");
    }

    #[test]
    fn empty_user_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        assert!(store.upsert_session(&session("", "a")).is_err());
    }

    #[test]
    fn preferences_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.get_preference("onboarding_completed").unwrap(), None);
        store.set_preference("onboarding_completed", "true").unwrap();
        store.set_preference("onboarding_completed", "false").unwrap();
        assert_eq!(
            store.get_preference("onboarding_completed").unwrap().as_deref(),
            Some("false")
        );
        store.delete_preference("onboarding_completed").unwrap();
        assert_eq!(store.get_preference("onboarding_completed").unwrap(), None);
    }

    #[test]
    fn reopen_keeps_data_and_skips_applied_migrations() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        store.upsert_session(&session("u1", "a")).unwrap();
        store.close().unwrap();

        let store = open(&dir);
        assert!(store.get_session("u1").unwrap().is_some());
    }
}
