//! Starter SQLite database provisioned next to dynamic deployments.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::debug;

pub const DATABASE_FILE: &str = "app.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    data TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
";

/// Create `app.db` under `dir` with the starter schema and one sample row per table.
pub fn provision_starter_db(dir: &Path) -> Result<()> {
    let path = dir.join(DATABASE_FILE);
    let conn = Connection::open(&path).with_context(|| format!("open {}", path.display()))?;
    conn.execute_batch(SCHEMA).context("create starter schema")?;

    let sample_data = serde_json::json!({ "key": "value" }).to_string();
    conn.execute(
        "INSERT INTO items (name, data) VALUES (?1, ?2)",
        params!["Sample Item", sample_data],
    )
    .context("seed items")?;
    conn.execute(
        "INSERT OR IGNORE INTO users (username, email) VALUES (?1, ?2)",
        params!["admin", "admin@example.com"],
    )
    .context("seed users")?;
    debug!(path = %path.display(), "provisioned starter database");
    Ok(())
}
