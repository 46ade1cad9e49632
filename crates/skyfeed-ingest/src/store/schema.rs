//! SQLite schema for the feed store.
//!
//! This module defines the database schema and records its version in a
//! `schema_version` table.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. v1 is the only schema so far, so
/// there is nothing to migrate.
pub fn init_schema(conn: &Connection) -> Result<()> {
    if get_schema_version(conn)? == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Content records, keyed by AT-URI
        CREATE TABLE IF NOT EXISTS items (
            uri TEXT PRIMARY KEY,
            id TEXT NOT NULL,
            author TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL,
            indexed_at INTEGER NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            embed TEXT,
            labels TEXT
        );

        -- Feed membership (the item's feedTags set)
        CREATE TABLE IF NOT EXISTS item_feed_tags (
            feed TEXT NOT NULL,
            uri TEXT NOT NULL,
            PRIMARY KEY (feed, uri)
        );

        -- Authors each feed has already backfilled
        CREATE TABLE IF NOT EXISTS feed_authors (
            feed TEXT NOT NULL,
            did TEXT NOT NULL,
            added_at INTEGER NOT NULL,
            PRIMARY KEY (feed, did)
        );

        CREATE INDEX IF NOT EXISTS idx_items_order ON items(indexed_at DESC, id DESC);
        CREATE INDEX IF NOT EXISTS idx_items_author ON items(author);
        CREATE INDEX IF NOT EXISTS idx_items_missing_labels
            ON items(indexed_at DESC) WHERE labels IS NULL;
        CREATE INDEX IF NOT EXISTS idx_item_feed_tags_uri ON item_feed_tags(uri);
        "#,
    )?;

    Ok(())
}
