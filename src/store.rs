//! Durable content store. Single SQLite file, prepared
//! statements reused via rusqlite's statement cache, single-writer with a
//! busy-retry budget absorbed by SQLite's own busy handler.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{KapricaError, Result};
use crate::model::{HistoryEntry, MimePayload, SearchKind};
use crate::source::SourceBuffer;

/// Busy-retry budget: 5 x 100ms.
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Store {
    conn: Connection,
    /// Guarantees timestamp monotonicity within a single daemon run.
    last_timestamp: Option<DateTime<Utc>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(KapricaError::StoreUnavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA secure_delete = OFF;
             PRAGMA auto_vacuum = NONE;",
        )?;
        let mut store = Self {
            conn,
            last_timestamp: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clipboard_history (
                history_id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp  TEXT NOT NULL,
                snippet    TEXT NOT NULL,
                thumbnail  BLOB,
                hash       TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS content (
                entry     INTEGER NOT NULL,
                length    INTEGER NOT NULL,
                data      BLOB NOT NULL,
                mime_type TEXT NOT NULL,
                FOREIGN KEY (entry) REFERENCES clipboard_history(history_id)
                    ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_content_data ON content(data);
             CREATE INDEX IF NOT EXISTS idx_content_mime_type ON content(mime_type);
             CREATE INDEX IF NOT EXISTS idx_history_snippet ON clipboard_history(snippet);
             CREATE INDEX IF NOT EXISTS idx_history_thumbnail ON clipboard_history(thumbnail);
             CREATE INDEX IF NOT EXISTS idx_history_timestamp ON clipboard_history(timestamp);
             CREATE INDEX IF NOT EXISTS idx_history_hash ON clipboard_history(hash);",
        )?;
        Ok(())
    }

    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    /// Insert one history row and its content rows in a single transaction,
    /// then dedup by hash (keeping the max history_id for that hash).
    pub fn insert_entry(&mut self, src: &SourceBuffer) -> Result<i64> {
        let timestamp = self.next_timestamp();
        let hash = src.data_hash.clone();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO clipboard_history (timestamp, snippet, thumbnail, hash) VALUES (?1, ?2, ?3, ?4)",
            params![
                timestamp.to_rfc3339(),
                src.snippet,
                src.thumbnail.as_ref().map(|b| b.as_ref()),
                hash,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO content (entry, length, data, mime_type) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for payload in &src.payloads {
                stmt.execute(params![
                    id,
                    payload.length() as i64,
                    payload.bytes.as_ref(),
                    payload.mime_type,
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM clipboard_history
                WHERE hash = ?1
                  AND history_id != (SELECT MAX(history_id) FROM clipboard_history WHERE hash = ?1)",
            params![hash],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Populate `src` from the stored entry. Returns false if `id` is missing.
    pub fn get_entry(&self, id: i64, src: &mut SourceBuffer) -> Result<bool> {
        let header: Option<(String, Option<Vec<u8>>, String)> = self
            .conn
            .query_row(
                "SELECT snippet, thumbnail, hash FROM clipboard_history WHERE history_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((snippet, thumbnail, hash)) = header else {
            return Ok(false);
        };

        let mut stmt = self
            .conn
            .prepare_cached("SELECT mime_type, data FROM content WHERE entry = ?1")?;
        let payloads = stmt
            .query_map(params![id], |row| {
                let mime_type: String = row.get(0)?;
                let data: Vec<u8> = row.get(1)?;
                Ok(MimePayload::new(mime_type, Bytes::from(data)))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        src.fill_from_stored(payloads, snippet, thumbnail.map(Bytes::from), hash);
        Ok(true)
    }

    pub fn get_snippet(&self, id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT snippet FROM clipboard_history WHERE history_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_thumbnail(&self, id: i64) -> Result<Option<Bytes>> {
        let thumbnail: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT thumbnail FROM clipboard_history WHERE history_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(thumbnail.flatten().map(Bytes::from))
    }

    pub fn get_total_entries(&self) -> Result<u32> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM clipboard_history", [], |row| {
                row.get(0)
            })?)
    }

    /// Ids of the `limit` most recent entries (by timestamp desc), starting
    /// after `offset`.
    pub fn get_latest_entries(&self, limit: u32, offset: u32) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT history_id FROM clipboard_history ORDER BY timestamp DESC LIMIT ?1 OFFSET ?2",
        )?;
        let ids = stmt
            .query_map(params![limit, offset], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Ids matching `pattern` under `kind`, newest-id-first, capped at `limit`.
    pub fn find_matching_entries(
        &self,
        pattern: &[u8],
        limit: u32,
        kind: SearchKind,
    ) -> Result<Vec<i64>> {
        let sql = match kind {
            SearchKind::Content => {
                "SELECT DISTINCT entry FROM content WHERE instr(data, ?1) > 0 ORDER BY entry DESC LIMIT ?2"
            }
            SearchKind::MimeType => {
                "SELECT DISTINCT entry FROM content WHERE mime_type LIKE '%' || ?1 || '%' ORDER BY entry DESC LIMIT ?2"
            }
            SearchKind::Glob => {
                "SELECT DISTINCT entry FROM content WHERE CAST(data AS TEXT) GLOB CAST(?1 AS TEXT) ORDER BY entry DESC LIMIT ?2"
            }
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let ids = match kind {
            SearchKind::MimeType | SearchKind::Glob => {
                let pattern = String::from_utf8_lossy(pattern).into_owned();
                stmt.query_map(params![pattern, limit], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            SearchKind::Content => stmt
                .query_map(params![pattern, limit], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        Ok(ids)
    }

    /// Exact-match snippet lookup; 0 means none found, matching the C ABI's
    /// "id 0 is invalid" convention.
    pub fn find_entry_from_snippet(&self, text: &str) -> Result<i64> {
        Ok(self
            .conn
            .query_row(
                "SELECT history_id FROM clipboard_history WHERE snippet = ?1 ORDER BY history_id DESC LIMIT 1",
                params![text],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    pub fn delete_entry(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM clipboard_history WHERE history_id = ?1", params![id])?;
        Ok(())
    }

    /// Drop entries older than `days` (a negative count). `exclude`, when
    /// set, is never deleted even if it matches the age window — used to
    /// protect the entry the engine is currently serving (§8 property 7).
    pub fn delete_old_entries(&self, days: i64, exclude: Option<i64>) -> Result<u32> {
        let cutoff = Utc::now() + chrono::Duration::days(days);
        let changed = self.conn.execute(
            "DELETE FROM clipboard_history
                WHERE timestamp < ?1 AND (?2 IS NULL OR history_id != ?2)",
            params![cutoff.to_rfc3339(), exclude],
        )?;
        Ok(changed as u32)
    }

    /// Drop the `n` oldest entries by timestamp, never including `exclude`.
    pub fn delete_last_entries(&self, n: u32, exclude: Option<i64>) -> Result<u32> {
        let changed = self.conn.execute(
            "DELETE FROM clipboard_history WHERE history_id IN (
                SELECT history_id FROM clipboard_history
                 WHERE (?2 IS NULL OR history_id != ?2)
                 ORDER BY timestamp ASC LIMIT ?1
             )",
            params![n, exclude],
        )?;
        Ok(changed as u32)
    }

    /// Keep only the max(history_id) row per hash.
    pub fn delete_duplicate_entries(&self) -> Result<u32> {
        let changed = self.conn.execute(
            "DELETE FROM clipboard_history WHERE history_id NOT IN (
                SELECT MAX(history_id) FROM clipboard_history GROUP BY hash
             )",
            [],
        )?;
        Ok(changed as u32)
    }

    /// Drop the `n` entries whose largest content payload is biggest, then
    /// VACUUM. Never includes `exclude`.
    pub fn delete_largest_entries(&self, n: u32, exclude: Option<i64>) -> Result<u32> {
        let changed = self.conn.execute(
            "DELETE FROM clipboard_history WHERE history_id IN (
                SELECT entry FROM content
                 WHERE (?2 IS NULL OR entry != ?2)
                 GROUP BY entry
                 ORDER BY MAX(length) DESC
                 LIMIT ?1
             )",
            params![n, exclude],
        )?;
        if changed > 0 {
            self.conn.execute_batch("VACUUM;")?;
        }
        Ok(changed as u32)
    }

    pub fn get_size(&self) -> Result<u64> {
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok((page_count * page_size).max(0) as u64)
    }

    /// `PRAGMA optimize`, run on every retention tick that doesn't already
    /// VACUUM.
    pub fn optimize(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    pub fn latest_entry(&self) -> Result<Option<HistoryEntry>> {
        self.conn
            .query_row(
                "SELECT history_id, timestamp, snippet, thumbnail, hash
                   FROM clipboard_history ORDER BY timestamp DESC LIMIT 1",
                [],
                |row| {
                    let ts: String = row.get(1)?;
                    let thumbnail: Option<Vec<u8>> = row.get(3)?;
                    Ok(HistoryEntry {
                        id: row.get(0)?,
                        timestamp: DateTime::parse_from_rfc3339(&ts)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        snippet: row.get(2)?,
                        thumbnail: thumbnail.map(Bytes::from),
                        hash: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(KapricaError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let store = Store::open(&path).unwrap();
        (dir, store)
    }

    fn text_source(text: &str) -> SourceBuffer {
        let mut src = SourceBuffer::new();
        src.fill_from_payloads(vec![MimePayload::new(
            "UTF8_STRING",
            Bytes::copy_from_slice(text.as_bytes()),
        )]);
        src
    }

    #[test]
    fn insert_then_get_entry_round_trips() {
        let (_dir, mut store) = scratch_store();
        let src = text_source("hello\nworld");
        let id = store.insert_entry(&src).unwrap();

        let mut fetched = SourceBuffer::new();
        assert!(store.get_entry(id, &mut fetched).unwrap());
        assert_eq!(fetched.snippet, src.snippet);
        assert_eq!(fetched.thumbnail, src.thumbnail);

        let mut original: Vec<_> = src
            .payloads
            .iter()
            .map(|p| (p.mime_type.clone(), p.bytes.clone()))
            .collect();
        let mut got: Vec<_> = fetched
            .payloads
            .iter()
            .map(|p| (p.mime_type.clone(), p.bytes.clone()))
            .collect();
        original.sort();
        got.sort();
        assert_eq!(original, got);
    }

    #[test]
    fn get_entry_missing_id_returns_false() {
        let (_dir, store) = scratch_store();
        let mut src = SourceBuffer::new();
        assert!(!store.get_entry(999, &mut src).unwrap());
    }

    #[test]
    fn duplicate_inserts_dedup_to_one_row() {
        let (_dir, mut store) = scratch_store();
        for _ in 0..3 {
            store.insert_entry(&text_source("foo")).unwrap();
        }
        assert_eq!(store.get_total_entries().unwrap(), 1);
    }

    #[test]
    fn delete_duplicate_entries_is_idempotent() {
        let (_dir, mut store) = scratch_store();
        store.insert_entry(&text_source("foo")).unwrap();
        store.insert_entry(&text_source("bar")).unwrap();
        let first = store.delete_duplicate_entries().unwrap();
        let second = store.delete_duplicate_entries().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 0);
    }

    #[test]
    fn find_matching_entries_content_substring() {
        let (_dir, mut store) = scratch_store();
        store.insert_entry(&text_source("the quick brown fox")).unwrap();
        store.insert_entry(&text_source("lazy dog")).unwrap();
        let ids = store
            .find_matching_entries(b"quick", 10, SearchKind::Content)
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn find_matching_entries_mime_type_substring() {
        let (_dir, mut store) = scratch_store();
        store.insert_entry(&text_source("hi")).unwrap();
        let ids = store
            .find_matching_entries(b"text/plain", 10, SearchKind::MimeType)
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn find_entry_from_snippet_exact_match() {
        let (_dir, mut store) = scratch_store();
        let id = store.insert_entry(&text_source("needle")).unwrap();
        assert_eq!(store.find_entry_from_snippet("needle").unwrap(), id);
        assert_eq!(store.find_entry_from_snippet("nope").unwrap(), 0);
    }

    #[test]
    fn delete_last_entries_drops_oldest_by_timestamp() {
        let (_dir, mut store) = scratch_store();
        let first = store.insert_entry(&text_source("one")).unwrap();
        let _second = store.insert_entry(&text_source("two")).unwrap();
        let third = store.insert_entry(&text_source("three")).unwrap();

        let removed = store.delete_last_entries(1, None).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.get_latest_entries(10, 0).unwrap();
        assert!(!remaining.contains(&first));
        assert!(remaining.contains(&third));
    }

    #[test]
    fn delete_last_entries_never_drops_the_excluded_id() {
        let (_dir, mut store) = scratch_store();
        let first = store.insert_entry(&text_source("one")).unwrap();
        let _second = store.insert_entry(&text_source("two")).unwrap();

        let removed = store.delete_last_entries(2, Some(first)).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.get_latest_entries(10, 0).unwrap();
        assert!(remaining.contains(&first));
    }

    #[test]
    fn delete_old_entries_respects_negative_day_window() {
        let (_dir, mut store) = scratch_store();
        store.insert_entry(&text_source("fresh")).unwrap();
        // Cutoff is effectively "now" for a 0-day window, so nothing this
        // recent should ever be removed by a meaningfully negative window.
        let removed = store.delete_old_entries(-30, None).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn total_entries_tracks_inserts_and_deletes() {
        let (_dir, mut store) = scratch_store();
        let id = store.insert_entry(&text_source("a")).unwrap();
        store.insert_entry(&text_source("b")).unwrap();
        assert_eq!(store.get_total_entries().unwrap(), 2);
        store.delete_entry(id).unwrap();
        assert_eq!(store.get_total_entries().unwrap(), 1);
    }
}
