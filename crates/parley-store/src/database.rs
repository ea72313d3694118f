//! Store connection management and the ordered key-value primitives.
//!
//! The [`Store`] owns a [`rusqlite::Connection`] whose single `kv` table is
//! kept in key order, which gives prefix scans in key order for free.  Keys
//! are plaintext (they carry the sort order); values are sealed with
//! XChaCha20-Poly1305 when the store was opened with a passphrase.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;

use parley_shared::constants::APP_NAME;
use parley_shared::crypto::{self, KdfParams, SymmetricKey};

use crate::error::{Result, StoreError};
use crate::migrations;

const CHECK_KEY: &str = "system:check";
const CHECK_VALUE: &[u8] = b"parley-store-v1";

/// Handle to the persistent log store.
///
/// All methods take `&self`; each call is one SQLite statement or one
/// transaction, so every call is atomic on its own.
pub struct Store {
    conn: Mutex<Connection>,
    key: Option<SymmetricKey>,
}

impl Store {
    /// Platform data directory for the store:
    /// - Linux:   `~/.local/share/parley`
    /// - macOS:   `~/Library/Application Support/org.parley.parley`
    /// - Windows: `{FOLDERID_RoamingAppData}\parley\parley\data`
    pub fn default_dir() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("org", APP_NAME, APP_NAME).ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().to_path_buf())
    }

    /// Open (or create) the store inside `dir` with the production key schedule.
    ///
    /// An empty or absent passphrase opens a plaintext store.
    pub fn open_in_dir(dir: &Path, passphrase: Option<&str>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("store.db");
        tracing::info!(path = %db_path.display(), encrypted = passphrase.is_some_and(|p| !p.is_empty()), "opening store");
        Self::open_at(&db_path, passphrase, KdfParams::default())
    }

    /// Open (or create) a store file at an explicit path.
    pub fn open_at(path: &Path, passphrase: Option<&str>, kdf: KdfParams) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, passphrase, kdf)
    }

    /// Open a throwaway in-memory store (tests and local simulation).
    pub fn open_in_memory(passphrase: Option<&str>, kdf: KdfParams) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, passphrase, kdf)
    }

    fn from_connection(conn: Connection, passphrase: Option<&str>, kdf: KdfParams) -> Result<Self> {
        migrations::run_migrations(&conn)?;

        let key = match passphrase.filter(|p| !p.is_empty()) {
            Some(p) => Some(crypto::derive_store_key(p.as_bytes(), kdf)?),
            None => None,
        };

        let store = Self {
            conn: Mutex::new(conn),
            key,
        };
        store.check_passphrase()?;
        Ok(store)
    }

    /// Whether values are sealed at rest.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// The first open writes a canary; later opens must be able to read it back.
    fn check_passphrase(&self) -> Result<()> {
        match self.get(CHECK_KEY) {
            Ok(value) if value == CHECK_VALUE => Ok(()),
            Ok(_) | Err(StoreError::Crypto(_)) => Err(StoreError::WrongPassphrase),
            Err(StoreError::NotFound) => {
                tracing::debug!("initialising store canary");
                self.put(CHECK_KEY, CHECK_VALUE)
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => Ok(crypto::encrypt(key, plaintext)?),
            None => Ok(plaintext.to_vec()),
        }
    }

    fn unseal(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => Ok(crypto::decrypt(key, &stored)?),
            None => Ok(stored),
        }
    }

    // ------------------------------------------------------------------
    // Raw key-value access
    // ------------------------------------------------------------------

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let sealed = self.seal(value)?;
        self.lock()?.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, sealed],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let stored: Option<Vec<u8>> = self
            .lock()?
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        self.unseal(stored.ok_or(StoreError::NotFound)?)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .lock()?
            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a key.  Returns `true` if a row was deleted.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let affected = self.lock()?.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// Write several entries in one transaction.
    pub fn put_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let sealed = entries
            .iter()
            .map(|(k, v)| -> Result<(&str, Vec<u8>)> { Ok((k.as_str(), self.seal(v)?)) })
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, value) in &sealed {
            upsert(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replace everything under `prefix` with `entries`.
    pub fn replace_prefix(&self, prefix: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let sealed = entries
            .iter()
            .map(|(k, v)| -> Result<(&str, Vec<u8>)> { Ok((k.as_str(), self.seal(v)?)) })
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
            params![prefix, prefix_upper_bound(prefix)],
        )?;
        for (key, value) in &sealed {
            upsert(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
            )?;
            let rows = stmt.query_map(params![prefix, prefix_upper_bound(prefix)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        rows.into_iter()
            .map(|(k, v)| -> Result<(String, Vec<u8>)> { Ok((k, self.unseal(v)?)) })
            .collect()
    }

    /// Keys only; values are neither read back nor decrypted.
    pub fn scan_prefix_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![prefix, prefix_upper_bound(prefix)], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    /// The entry with the greatest key under `prefix`.
    pub fn last_with_prefix(&self, prefix: &str) -> Result<Option<(String, Vec<u8>)>> {
        let row: Option<(String, Vec<u8>)> = self
            .lock()?
            .query_row(
                "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key DESC LIMIT 1",
                params![prefix, prefix_upper_bound(prefix)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(k, v)| -> Result<(String, Vec<u8>)> { Ok((k, self.unseal(v)?)) })
            .transpose()
    }

    // ------------------------------------------------------------------
    // JSON helpers
    // ------------------------------------------------------------------

    pub(crate) fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, &serde_json::to_vec(value)?)
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.get(key)?)?)
    }
}

fn upsert(tx: &Transaction<'_>, key: &str, value: &[u8]) -> Result<()> {
    tx.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_upper_bound(prefix: &str) -> String {
    let mut upper: Vec<char> = prefix.chars().collect();
    while let Some(last) = upper.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            upper.push(next);
            return upper.into_iter().collect();
        }
    }
    // Empty prefix: everything sorts below U+10FFFF.
    char::MAX.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: KdfParams = KdfParams {
        time_cost: 1,
        memory_kib: 64,
        parallelism: 1,
    };

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        store.put("msg:c1:002", b"b").unwrap();
        store.put("msg:c1:001", b"a").unwrap();
        store.put("msg:c10:001", b"other chat").unwrap();
        store.put("msg:c2:001", b"c").unwrap();

        let rows = store.scan_prefix("msg:c1:").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["msg:c1:001", "msg:c1:002"]);

        let (last, value) = store.last_with_prefix("msg:c1:").unwrap().unwrap();
        assert_eq!(last, "msg:c1:002");
        assert_eq!(value, b"b");
        assert!(store.last_with_prefix("msg:c3:").unwrap().is_none());
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound)));
        assert!(!store.contains("nope").unwrap());
    }

    #[test]
    fn put_overwrites_and_delete_removes() {
        let store = Store::open_in_memory(None, FAST).unwrap();
        store.put("k", b"1").unwrap();
        store.put("k", b"2").unwrap();
        assert_eq!(store.get("k").unwrap(), b"2");
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
    }

    #[test]
    fn values_are_sealed_with_a_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = Store::open_at(&path, Some("magic word"), FAST).unwrap();
            assert!(store.is_encrypted());
            store.put("contact:x", b"secret alias").unwrap();
        }

        let raw = Connection::open(&path).unwrap();
        let stored: Vec<u8> = raw
            .query_row("SELECT value FROM kv WHERE key = 'contact:x'", [], |r| r.get(0))
            .unwrap();
        assert_ne!(stored, b"secret alias");

        let reopened = Store::open_at(&path, Some("magic word"), FAST).unwrap();
        assert_eq!(reopened.get("contact:x").unwrap(), b"secret alias");
    }

    #[test]
    fn wrong_passphrase_is_rejected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        drop(Store::open_at(&path, Some("right"), FAST).unwrap());

        assert!(matches!(
            Store::open_at(&path, Some("wrong"), FAST),
            Err(StoreError::WrongPassphrase)
        ));
        assert!(matches!(
            Store::open_at(&path, None, FAST),
            Err(StoreError::WrongPassphrase)
        ));
    }

    #[test]
    fn empty_passphrase_means_plaintext() {
        let store = Store::open_in_memory(Some(""), FAST).unwrap();
        assert!(!store.is_encrypted());
    }

    #[test]
    fn open_in_dir_uses_production_key_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path(), Some("pw")).unwrap();
        store.put("k", b"v").unwrap();
        drop(store);
        assert!(Store::open_in_dir(dir.path(), Some("pw")).is_ok());
    }

    #[test]
    fn upper_bound_of_prefix() {
        assert_eq!(prefix_upper_bound("msg:"), "msg;");
        assert_eq!(prefix_upper_bound("a"), "b");
    }
}
