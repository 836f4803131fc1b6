use std::path::{Path, PathBuf};

use anyhow::Context;
use core_model::{
    Message, MessageKind, MessageStore, Origin, Risk, StoreError, content_fingerprint,
};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, Row, params};
use tracing::{debug, info};

/// SQLite-backed message log, shaped like a handset's SMS provider: one row
/// per message, thread ids allocated per peer address.
pub struct SqliteStore {
    conn: Connection,
}

/// A row as the platform SMS app would write it. Address and body may be
/// NULL in the store; readers coerce them to empty strings.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender: Option<String>,
    pub body: Option<String>,
    pub timestamp: i64,
    pub kind: MessageKind,
    pub is_read: bool,
}

const SELECT_COLUMNS: &str = "SELECT id, thread_id, address, body, date, kind, read FROM sms";

impl SqliteStore {
    pub fn default_path(tenant: &str) -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("smsguard").join(format!("{tenant}.db"))
    }

    /// Creates the parent directory, opens the store and initialises the
    /// schema.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        let store = Self::open(path)?;
        store.init_schema()?;
        Ok(store)
    }

    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("opening sqlite db {}: {e}", path.display()))
        })?;
        Self::configure(conn)
    }

    /// Opens an existing, initialised store. A missing file or schema is
    /// reported as [`StoreError::Unavailable`], never as an empty store.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            StoreError::Unavailable(format!("opening sqlite db {}: {e}", path.display()))
        })?;
        let store = Self::configure(conn)?;
        let has_schema: bool = store
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sms')",
                [],
                |r| r.get(0),
            )
            .map_err(store_err)?;
        if !has_schema {
            return Err(StoreError::Unavailable(format!(
                "{} has no message table; run init first",
                path.display()
            )));
        }
        Ok(store)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )
        .map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS threads (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              address TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS sms (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              thread_id INTEGER NOT NULL,
              address TEXT,
              body TEXT,
              date INTEGER NOT NULL,
              kind TEXT NOT NULL DEFAULT 'SMS',
              read INTEGER NOT NULL DEFAULT 0,
              fingerprint TEXT NOT NULL,
              FOREIGN KEY(thread_id) REFERENCES threads(id)
            );
            CREATE INDEX IF NOT EXISTS sms_thread_date ON sms(thread_id, date);
            CREATE INDEX IF NOT EXISTS sms_fingerprint ON sms(fingerprint);
            "#,
            )
            .map_err(store_err)?;
        info!("message store schema ready");
        Ok(())
    }

    /// Appends a message the way the platform SMS app would, allocating the
    /// thread for its address on first use.
    pub fn insert(&self, msg: &NewMessage) -> Result<Message, StoreError> {
        let id = insert_row(&self.conn, msg)?;
        self.get(&id.to_string())?
            .ok_or_else(|| StoreError::Query(format!("inserted row {id} vanished")))
    }

    /// Inserts rows in one transaction, skipping any whose content
    /// fingerprint is already present. Returns the number of new rows.
    pub fn import(&mut self, rows: &[NewMessage]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction().map_err(store_err)?;
        let mut inserted = 0;
        for row in rows {
            let fingerprint = fingerprint_of(row);
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sms WHERE fingerprint = ?1)",
                    params![fingerprint],
                    |r| r.get(0),
                )
                .map_err(store_err)?;
            if exists {
                continue;
            }
            insert_row(&tx, row)?;
            inserted += 1;
        }
        tx.commit().map_err(store_err)?;
        info!(rows = rows.len(), inserted, "import committed");
        Ok(inserted)
    }

    pub fn get(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let Ok(id) = message_id.parse::<i64>() else {
            return Ok(None);
        };
        self.conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn message_count(&self) -> Result<i64, StoreError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM sms", [], |r| r.get(0))
            .map_err(store_err)
    }

    pub fn integrity_check(&self) -> Result<String, StoreError> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(store_err)
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt.query_map(params, row_to_message).map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }
}

impl MessageStore for SqliteStore {
    fn load_all(&self) -> Result<Vec<Message>, StoreError> {
        let messages = self.query_messages(&format!("{SELECT_COLUMNS} ORDER BY date DESC"), [])?;
        debug!(count = messages.len(), "loaded all messages");
        Ok(messages)
    }

    fn load_by_thread(&self, thread_key: &str) -> Result<Vec<Message>, StoreError> {
        let Ok(thread_id) = thread_key.parse::<i64>() else {
            return Ok(Vec::new());
        };
        self.query_messages(
            &format!("{SELECT_COLUMNS} WHERE thread_id = ?1 ORDER BY date ASC"),
            params![thread_id],
        )
    }

    fn delete(&self, message_id: &str) -> Result<bool, StoreError> {
        let Ok(id) = message_id.parse::<i64>() else {
            return Ok(false);
        };
        let removed = self
            .conn
            .execute("DELETE FROM sms WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    fn mark_read(&self, message_id: &str) -> Result<bool, StoreError> {
        let Ok(id) = message_id.parse::<i64>() else {
            return Ok(false);
        };
        let updated = self
            .conn
            .execute("UPDATE sms SET read = 1 WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(updated > 0)
    }
}

fn insert_row(conn: &Connection, msg: &NewMessage) -> Result<i64, StoreError> {
    let address = msg.sender.clone().unwrap_or_default();
    conn.execute(
        "INSERT OR IGNORE INTO threads (address) VALUES (?1)",
        params![address],
    )
    .map_err(store_err)?;
    let thread_id: i64 = conn
        .query_row(
            "SELECT id FROM threads WHERE address = ?1",
            params![address],
            |r| r.get(0),
        )
        .map_err(store_err)?;
    conn.execute(
        r#"INSERT INTO sms (thread_id, address, body, date, kind, read, fingerprint)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        params![
            thread_id,
            msg.sender,
            msg.body,
            msg.timestamp,
            msg.kind.as_str(),
            msg.is_read,
            fingerprint_of(msg)
        ],
    )
    .map_err(store_err)?;
    Ok(conn.last_insert_rowid())
}

fn fingerprint_of(msg: &NewMessage) -> String {
    content_fingerprint(
        msg.sender.as_deref().unwrap_or_default(),
        msg.timestamp,
        msg.body.as_deref().unwrap_or_default(),
        msg.kind,
    )
}

fn row_to_message(r: &Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = r.get(0)?;
    let thread_id: i64 = r.get(1)?;
    let kind: String = r.get(5)?;
    Ok(Message {
        id: id.to_string(),
        sender: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
        body: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
        timestamp: r.get(4)?,
        kind: kind.parse().unwrap_or_default(),
        thread_key: thread_id.to_string(),
        is_read: r.get::<_, i64>(6)? != 0,
        risk: Risk::Unscored,
        origin: Origin::Store,
    })
}

fn store_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::NotADatabase
            | ErrorCode::ReadOnly,
        ) => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Query(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").expect("open");
        store.init_schema().expect("schema");
        store
    }

    fn sms(sender: &str, body: &str, timestamp: i64) -> NewMessage {
        NewMessage {
            sender: Some(sender.to_string()),
            body: Some(body.to_string()),
            timestamp,
            kind: MessageKind::Sms,
            is_read: false,
        }
    }

    #[test]
    fn schema_and_integrity() {
        let store = store();
        assert_eq!(store.integrity_check().unwrap(), "ok");
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn init_schema_idempotent() {
        let store = store();
        store.init_schema().unwrap();
        store.insert(&sms("+1", "a", 1)).unwrap();
        store.init_schema().unwrap();
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn threads_allocated_per_address() {
        let store = store();
        let a1 = store.insert(&sms("+1", "a", 1)).unwrap();
        let b1 = store.insert(&sms("+2", "b", 2)).unwrap();
        let a2 = store.insert(&sms("+1", "c", 3)).unwrap();
        assert_eq!(a1.thread_key, a2.thread_key);
        assert_ne!(a1.thread_key, b1.thread_key);
        assert_eq!(a1.origin, Origin::Store);
    }

    #[test]
    fn load_all_newest_first() {
        let store = store();
        store.insert(&sms("+1", "old", 100)).unwrap();
        store.insert(&sms("+2", "new", 300)).unwrap();
        store.insert(&sms("+1", "mid", 200)).unwrap();
        let all = store.load_all().unwrap();
        let bodies: Vec<_> = all.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["new", "mid", "old"]);
    }

    #[test]
    fn load_by_thread_oldest_first() {
        let store = store();
        let first = store.insert(&sms("+1", "second", 200)).unwrap();
        store.insert(&sms("+2", "other", 150)).unwrap();
        store.insert(&sms("+1", "first", 100)).unwrap();
        let thread = store.load_by_thread(&first.thread_key).unwrap();
        let bodies: Vec<_> = thread.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn unknown_thread_is_empty_not_error() {
        let store = store();
        store.insert(&sms("+1", "a", 1)).unwrap();
        assert!(store.load_by_thread("999").unwrap().is_empty());
        assert!(store.load_by_thread("push:+1").unwrap().is_empty());
    }

    #[test]
    fn null_address_and_body_coerced() {
        let store = store();
        let stored = store
            .insert(&NewMessage {
                sender: None,
                body: None,
                timestamp: 5,
                kind: MessageKind::Mms,
                is_read: true,
            })
            .unwrap();
        assert_eq!(stored.sender, "");
        assert_eq!(stored.body, "");
        assert_eq!(stored.kind, MessageKind::Mms);
        assert!(stored.is_read);
    }

    #[test]
    fn delete_reports_whether_row_removed() {
        let store = store();
        let m = store.insert(&sms("+1", "a", 1)).unwrap();
        assert!(store.delete(&m.id).unwrap());
        assert!(!store.delete(&m.id).unwrap());
        assert!(!store.delete("not-a-number").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn mark_read_reports_match() {
        let store = store();
        let m = store.insert(&sms("+1", "a", 1)).unwrap();
        assert!(!m.is_read);
        assert!(store.mark_read(&m.id).unwrap());
        assert!(store.mark_read(&m.id).unwrap());
        assert!(store.get(&m.id).unwrap().unwrap().is_read);
        assert!(!store.mark_read("12345").unwrap());
    }

    #[test]
    fn import_skips_known_fingerprints() {
        let mut store = store();
        let rows = vec![sms("+1", "a", 1), sms("+1", "b", 2), sms("+2", "c", 3)];
        assert_eq!(store.import(&rows).unwrap(), 3);
        assert_eq!(store.import(&rows).unwrap(), 0);
        assert_eq!(store.message_count().unwrap(), 3);
    }

    #[test]
    fn open_existing_missing_file_is_unavailable() {
        let dir = std::env::temp_dir().join(format!("smsguard-missing-{}", std::process::id()));
        let err = SqliteStore::open_existing(dir.join("nope.db"))
            .err()
            .expect("missing store must not open");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn open_existing_without_schema_is_unavailable() {
        let path =
            std::env::temp_dir().join(format!("smsguard-noschema-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        drop(SqliteStore::open(&path).unwrap());
        let err = SqliteStore::open_existing(&path).err().expect("no schema");
        assert!(matches!(err, StoreError::Unavailable(_)));
        let store = SqliteStore::open(&path).unwrap();
        store.init_schema().unwrap();
        drop(store);
        assert!(SqliteStore::open_existing(&path).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn create_makes_parent_dirs_and_schema() {
        let dir = std::env::temp_dir().join(format!("smsguard-create-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("tenants").join("acme.db");
        let store = SqliteStore::create(&path).unwrap();
        store.insert(&sms("+1", "hello", 1)).unwrap();
        drop(store);
        let reopened = SqliteStore::open_existing(&path).unwrap();
        assert_eq!(reopened.message_count().unwrap(), 1);
        drop(reopened);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
