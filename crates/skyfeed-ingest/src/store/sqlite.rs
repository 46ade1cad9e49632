//! SQLite implementation of [`FeedStore`].

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;
use skyfeed_core::{ContentItem, Cursor};

use super::schema;
use super::{BulkWriteReport, FeedStore, LabelUpdate, TagPage};
use crate::{Error, Result};

const ITEM_COLUMNS: &str =
    "i.uri, i.id, i.author, i.text, i.created_at, i.indexed_at, i.tags, i.embed, i.labels";

/// Feed store backed by a single SQLite connection.
///
/// Statements are short and run on the caller's task; the connection lock is
/// never held across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Storage(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Storage(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total number of stored items.
    pub fn item_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn json_column<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    let tags: String = row.get(6)?;
    let embed: Option<String> = row.get(7)?;
    let labels: Option<String> = row.get(8)?;

    Ok(ContentItem {
        uri: row.get(0)?,
        id: row.get(1)?,
        author: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        indexed_at: row.get(5)?,
        tags: json_column(6, &tags)?,
        embed: embed.as_deref().map(|raw| json_column(7, raw)).transpose()?,
        labels: labels.as_deref().map(|raw| json_column(8, raw)).transpose()?,
        feed_tags: BTreeSet::new(),
    })
}

fn load_feed_tags(conn: &Connection, item: &mut ContentItem) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached("SELECT feed FROM item_feed_tags WHERE uri = ?1")?;
    item.feed_tags = stmt
        .query_map([&item.uri], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(())
}

fn delete_item(conn: &Connection, uri: &str) -> rusqlite::Result<bool> {
    conn.execute("DELETE FROM item_feed_tags WHERE uri = ?1", [uri])?;
    let deleted = conn.execute("DELETE FROM items WHERE uri = ?1", [uri])?;
    Ok(deleted > 0)
}

#[async_trait]
impl FeedStore for SqliteStore {
    async fn upsert_by_uri(&self, item: &ContentItem) -> Result<()> {
        let mut conn = self.conn.lock();

        if item.feed_tags.is_empty() {
            delete_item(&conn, &item.uri)?;
            return Ok(());
        }

        let tags = serde_json::to_string(&item.tags)?;
        let embed = item.embed.as_ref().map(serde_json::to_string).transpose()?;
        let labels = item.labels.as_ref().map(serde_json::to_string).transpose()?;

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO items (uri, id, author, text, created_at, indexed_at, tags, embed, labels)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(uri) DO UPDATE SET
                id = excluded.id,
                author = excluded.author,
                text = excluded.text,
                created_at = excluded.created_at,
                indexed_at = excluded.indexed_at,
                tags = excluded.tags,
                embed = excluded.embed,
                labels = COALESCE(excluded.labels, items.labels)",
            params![
                item.uri,
                item.id,
                item.author,
                item.text,
                item.created_at,
                item.indexed_at,
                tags,
                embed,
                labels,
            ],
        )?;

        tx.execute("DELETE FROM item_feed_tags WHERE uri = ?1", [&item.uri])?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO item_feed_tags (feed, uri) VALUES (?1, ?2)")?;
            for feed in &item.feed_tags {
                stmt.execute(params![feed, item.uri])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    async fn get_by_uri(&self, uri: &str) -> Result<Option<ContentItem>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items i WHERE i.uri = ?1");

        let item = conn.query_row(&sql, [uri], row_to_item).optional()?;
        match item {
            Some(mut item) => {
                load_feed_tags(&conn, &mut item)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn delete_by_uri(&self, uri: &str) -> Result<bool> {
        let conn = self.conn.lock();
        Ok(delete_item(&conn, uri)?)
    }

    async fn latest_by_tag(
        &self,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<TagPage> {
        let limit = limit.max(1);
        let conn = self.conn.lock();

        let mut items = match cursor {
            None => {
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM items i
                     JOIN item_feed_tags t ON t.uri = i.uri
                     WHERE t.feed = ?1
                     ORDER BY i.indexed_at DESC, i.id DESC
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_map(params![tag, limit as i64], row_to_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(cursor) => {
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM items i
                     JOIN item_feed_tags t ON t.uri = i.uri
                     WHERE t.feed = ?1
                       AND (i.indexed_at < ?2 OR (i.indexed_at = ?2 AND i.id < ?3))
                     ORDER BY i.indexed_at DESC, i.id DESC
                     LIMIT ?4"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_map(
                    params![tag, cursor.indexed_at_millis, cursor.id, limit as i64],
                    row_to_item,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        for item in &mut items {
            load_feed_tags(&conn, item)?;
        }

        let next_cursor = if items.len() == limit {
            items.last().map(Cursor::after)
        } else {
            None
        };

        Ok(TagPage { items, next_cursor })
    }

    async fn distinct_authors(&self, feed: &str) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT did FROM feed_authors WHERE feed = ?1")?;
        let authors = stmt
            .query_map([feed], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(authors)
    }

    async fn upsert_author(&self, feed: &str, did: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO feed_authors (feed, did, added_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(feed, did) DO NOTHING",
            params![feed, did, skyfeed_core::now_millis()],
        )?;
        Ok(())
    }

    async fn delete_author(&self, feed: &str, did: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM feed_authors WHERE feed = ?1 AND did = ?2",
            params![feed, did],
        )?;
        Ok(deleted > 0)
    }

    async fn remove_tag_for_author(&self, feed: &str, did: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM item_feed_tags
             WHERE feed = ?1 AND uri IN (SELECT uri FROM items WHERE author = ?2)",
            params![feed, did],
        )?;
        Ok(removed)
    }

    async fn remove_tag_older_than(&self, tag: &str, cutoff_millis: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM item_feed_tags
             WHERE feed = ?1 AND uri IN (SELECT uri FROM items WHERE indexed_at < ?2)",
            params![tag, cutoff_millis],
        )?;
        Ok(removed)
    }

    async fn delete_untagged(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM items WHERE uri NOT IN (SELECT uri FROM item_feed_tags)",
            [],
        )?;

        if deleted > 0 {
            metrics::counter!("store_items_expired_total").increment(deleted as u64);
        }
        Ok(deleted)
    }

    async fn items_missing_labels(&self, limit: usize) -> Result<Vec<ContentItem>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items i
             WHERE i.labels IS NULL
             ORDER BY i.indexed_at DESC, i.id DESC
             LIMIT ?1"
        );

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut items = stmt
            .query_map([limit as i64], row_to_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for item in &mut items {
            load_feed_tags(&conn, item)?;
        }
        Ok(items)
    }

    async fn bulk_set_labels(&self, ops: &[LabelUpdate]) -> Result<BulkWriteReport> {
        let mut conn = self.conn.lock();
        let mut report = BulkWriteReport::default();

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("UPDATE items SET labels = ?1 WHERE uri = ?2")?;
            for op in ops {
                let outcome = serde_json::to_string(&op.labels)
                    .map_err(Error::from)
                    .and_then(|labels| Ok(stmt.execute(params![labels, op.uri])?));

                match outcome {
                    Ok(0) => report.missing += 1,
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        tracing::warn!(uri = %op.uri, "Failed to write labels: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit()?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyfeed_core::EmbedMeta;

    fn post(n: u32, indexed_at: i64) -> ContentItem {
        ContentItem::new(
            format!("at://did:plc:author/app.bsky.feed.post/{n:04}"),
            "did:plc:author",
            format!("post {n}"),
            indexed_at,
        )
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_keeps_latest_payload() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = post(1, 1_000).with_feed_tag("rust");
        let mut second = first.clone();
        second.text = "edited".to_string();
        second.feed_tags.insert("lang".to_string());

        store.upsert_by_uri(&first).await.unwrap();
        store.upsert_by_uri(&second).await.unwrap();

        assert_eq!(store.item_count().unwrap(), 1);
        let stored = store.get_by_uri(&first.uri).await.unwrap().unwrap();
        assert_eq!(stored.text, "edited");
        assert_eq!(stored.feed_tags.len(), 2);
        assert_eq!(stored.id, first.id);
    }

    #[tokio::test]
    async fn test_replay_keeps_reconciled_labels() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = post(1, 1_000).with_feed_tag("rust");
        store.upsert_by_uri(&item).await.unwrap();
        store
            .bulk_set_labels(&[LabelUpdate {
                uri: item.uri.clone(),
                labels: vec!["porn".to_string()],
            }])
            .await
            .unwrap();

        store.upsert_by_uri(&item).await.unwrap();

        let stored = store.get_by_uri(&item.uri).await.unwrap().unwrap();
        assert_eq!(stored.labels, Some(vec!["porn".to_string()]));
    }

    #[tokio::test]
    async fn test_upsert_without_tags_removes_item() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = post(1, 1_000).with_feed_tag("rust");
        store.upsert_by_uri(&item).await.unwrap();

        let mut untagged = item.clone();
        untagged.feed_tags.clear();
        store.upsert_by_uri(&untagged).await.unwrap();

        assert!(store.get_by_uri(&item.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trips_embed_and_tags() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut item = post(1, 1_000).with_feed_tag("rust");
        item.tags = vec!["rustlang".to_string()];
        item.embed = Some(EmbedMeta {
            kind: "app.bsky.embed.images".to_string(),
            alt_texts: vec!["ferris".to_string()],
            ..Default::default()
        });

        store.upsert_by_uri(&item).await.unwrap();
        let stored = store.get_by_uri(&item.uri).await.unwrap().unwrap();
        assert_eq!(stored, item);
    }

    #[tokio::test]
    async fn test_delete_by_uri() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = post(1, 1_000).with_feed_tag("rust");
        store.upsert_by_uri(&item).await.unwrap();

        assert!(store.delete_by_uri(&item.uri).await.unwrap());
        assert!(!store.delete_by_uri(&item.uri).await.unwrap());
        let page = store.latest_by_tag("rust", 10, None).await.unwrap();
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn test_pagination_has_no_gaps_or_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();

        // Three items share each timestamp so the id tie-break matters
        for n in 0..25 {
            let item = post(n, 1_000 + (n / 3) as i64).with_feed_tag("rust");
            store.upsert_by_uri(&item).await.unwrap();
        }
        for n in 100..105 {
            store
                .upsert_by_uri(&post(n, 5_000).with_feed_tag("other"))
                .await
                .unwrap();
        }

        let full = store.latest_by_tag("rust", 100, None).await.unwrap();
        assert_eq!(full.items.len(), 25);
        assert!(full.next_cursor.is_none());

        let mut paged = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = store.latest_by_tag("rust", 4, cursor.as_ref()).await.unwrap();
            paged.extend(page.items);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let full_uris: Vec<_> = full.items.iter().map(|i| i.uri.clone()).collect();
        let paged_uris: Vec<_> = paged.iter().map(|i| i.uri.clone()).collect();
        assert_eq!(paged_uris, full_uris);

        // Ordered by (indexed_at desc, id desc)
        for pair in full.items.windows(2) {
            assert!((pair[0].indexed_at, &pair[0].id) > (pair[1].indexed_at, &pair[1].id));
        }
    }

    #[tokio::test]
    async fn test_cursor_from_wire_form() {
        let store = SqliteStore::open_in_memory().unwrap();
        for n in 0..3 {
            store
                .upsert_by_uri(&post(n, 1_000 + n as i64).with_feed_tag("rust"))
                .await
                .unwrap();
        }

        let first = store.latest_by_tag("rust", 1, None).await.unwrap();
        let wire = first.next_cursor.unwrap().to_string();
        let cursor: Cursor = wire.parse().unwrap();

        let rest = store.latest_by_tag("rust", 10, Some(&cursor)).await.unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.items.iter().all(|i| i.uri != first.items[0].uri));
    }

    #[tokio::test]
    async fn test_tag_garbage_collection() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = post(1, 1_000).with_feed_tag("a").with_feed_tag("b");
        let fresh = post(2, 9_000).with_feed_tag("a");
        store.upsert_by_uri(&old).await.unwrap();
        store.upsert_by_uri(&fresh).await.unwrap();

        assert_eq!(store.remove_tag_older_than("a", 5_000).await.unwrap(), 1);
        assert_eq!(store.delete_untagged().await.unwrap(), 0);

        // Still reachable through its other tag
        let b = store.latest_by_tag("b", 10, None).await.unwrap();
        assert_eq!(b.items.len(), 1);
        let a = store.latest_by_tag("a", 10, None).await.unwrap();
        assert_eq!(a.items.len(), 1);
        assert_eq!(a.items[0].uri, fresh.uri);

        // Last tag removed: the item disappears from every query
        store.remove_tag_older_than("b", 5_000).await.unwrap();
        assert_eq!(store.delete_untagged().await.unwrap(), 1);
        assert!(store.latest_by_tag("b", 10, None).await.unwrap().items.is_empty());
        assert!(store.get_by_uri(&old.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_author_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_author("rust", "did:plc:a").await.unwrap();
        store.upsert_author("rust", "did:plc:a").await.unwrap();
        store.upsert_author("rust", "did:plc:b").await.unwrap();
        store.upsert_author("other", "did:plc:c").await.unwrap();

        let authors = store.distinct_authors("rust").await.unwrap();
        assert_eq!(
            authors,
            BTreeSet::from(["did:plc:a".to_string(), "did:plc:b".to_string()])
        );

        assert!(store.delete_author("rust", "did:plc:a").await.unwrap());
        assert!(!store.delete_author("rust", "did:plc:a").await.unwrap());
        assert_eq!(store.distinct_authors("rust").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_tag_for_author() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mine = post(1, 1_000).with_feed_tag("rust").with_feed_tag("lang");
        let mut theirs = post(2, 1_000).with_feed_tag("rust");
        theirs.author = "did:plc:someone-else".to_string();
        store.upsert_by_uri(&mine).await.unwrap();
        store.upsert_by_uri(&theirs).await.unwrap();

        assert_eq!(
            store.remove_tag_for_author("rust", "did:plc:author").await.unwrap(),
            1
        );

        let rust = store.latest_by_tag("rust", 10, None).await.unwrap();
        assert_eq!(rust.items.len(), 1);
        assert_eq!(rust.items[0].uri, theirs.uri);
        let stored = store.get_by_uri(&mine.uri).await.unwrap().unwrap();
        assert_eq!(stored.feed_tags, BTreeSet::from(["lang".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_labels_and_bulk_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        for n in 0..4 {
            store
                .upsert_by_uri(&post(n, 1_000 + n as i64).with_feed_tag("rust"))
                .await
                .unwrap();
        }

        let missing = store.items_missing_labels(3).await.unwrap();
        assert_eq!(missing.len(), 3);
        // Most recent first
        assert_eq!(missing[0].indexed_at, 1_003);

        let ops = vec![
            LabelUpdate {
                uri: missing[0].uri.clone(),
                labels: vec![],
            },
            LabelUpdate {
                uri: missing[1].uri.clone(),
                labels: vec!["spam".to_string()],
            },
            LabelUpdate {
                uri: "at://did:plc:gone/app.bsky.feed.post/x".to_string(),
                labels: vec![],
            },
        ];
        let report = store.bulk_set_labels(&ops).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.missing, 1);
        assert_eq!(report.failed, 0);

        let remaining = store.items_missing_labels(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        let reconciled = store.get_by_uri(&missing[0].uri).await.unwrap().unwrap();
        assert_eq!(reconciled.labels, Some(vec![]));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("feeds.db");
        let item = post(1, 1_000).with_feed_tag("rust");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_by_uri(&item).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let stored = store.get_by_uri(&item.uri).await.unwrap().unwrap();
        assert_eq!(stored.id, skyfeed_core::content_id(&item.uri));
    }
}
