//! v001 -- Initial schema creation.
//!
//! One ordered key-value table.  Record kinds are distinguished by key
//! prefix (`contact:`, `chat:`, `member:`, `msg:`, `boot:`, `system:`).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,   -- prefix-encoded, compared bytewise
    value BLOB NOT NULL                -- JSON, sealed when encrypted
) WITHOUT ROWID;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
