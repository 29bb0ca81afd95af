//! Capture index repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::warn;

use wayproxy_core::timestamp::parse_timestamp14;

use crate::error::Result;
use crate::select::Candidate;

/// A row to add to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIndexEntry {
    /// Canonical URL key.
    pub urlkey: String,
    /// 14-digit capture timestamp.
    pub timestamp: String,
    /// Original URL.
    pub url: String,
    /// Response status code.
    pub status: u16,
    /// Bare MIME type.
    pub mime: Option<String>,
    /// Archive file name, relative to the collection's archive directory.
    pub filename: String,
    /// Offset of the gzip member.
    pub offset: u64,
    /// Length of the gzip member.
    pub length: u64,
}

/// An indexed capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Row id; later rows were indexed later.
    pub id: i64,
    /// Canonical URL key.
    pub urlkey: String,
    /// Capture datetime.
    pub datetime: DateTime<Utc>,
    /// Original URL.
    pub url: String,
    /// Response status code.
    pub status: u16,
    /// Bare MIME type.
    pub mime: Option<String>,
    /// Archive file name.
    pub filename: String,
    /// Offset of the gzip member.
    pub offset: u64,
    /// Length of the gzip member.
    pub length: u64,
}

impl Candidate for IndexEntry {
    fn datetime(&self) -> DateTime<Utc> {
        self.datetime
    }

    fn sequence(&self) -> i64 {
        self.id
    }
}

/// Repository for capture index operations.
pub struct IndexRepo;

impl IndexRepo {
    /// Insert an entry.
    pub fn insert(conn: &Connection, entry: &NewIndexEntry) -> Result<i64> {
        conn.execute(
            "INSERT INTO captures (urlkey, timestamp, url, status, mime, filename, offset, length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.urlkey,
                entry.timestamp,
                entry.url,
                entry.status,
                entry.mime,
                entry.filename,
                entry.offset as i64,
                entry.length as i64,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// All captures sharing a URL key, oldest first.
    pub fn find_by_urlkey(conn: &Connection, urlkey: &str) -> Result<Vec<IndexEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, urlkey, timestamp, url, status, mime, filename, offset, length
             FROM captures WHERE urlkey = ?1 ORDER BY timestamp, id",
        )?;

        let rows = stmt
            .query_map([urlkey], |row| {
                let timestamp: String = row.get(2)?;
                Ok((
                    timestamp,
                    IndexEntry {
                        id: row.get(0)?,
                        urlkey: row.get(1)?,
                        datetime: DateTime::<Utc>::MIN_UTC,
                        url: row.get(3)?,
                        status: row.get(4)?,
                        mime: row.get(5)?,
                        filename: row.get(6)?,
                        offset: row.get::<_, i64>(7)? as u64,
                        length: row.get::<_, i64>(8)? as u64,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // rows with an unreadable timestamp cannot be selected by datetime
        let entries = rows
            .into_iter()
            .filter_map(|(timestamp, entry)| match parse_timestamp14(&timestamp) {
                Ok(datetime) => Some(IndexEntry { datetime, ..entry }),
                Err(e) => {
                    warn!("Skipping index row {} ({}): {}", entry.id, entry.url, e);
                    None
                }
            })
            .collect();

        Ok(entries)
    }

    /// Remove every entry.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM captures", [])?;
        Ok(deleted)
    }

    /// Total number of entries.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::IndexPool;

    fn entry(url: &str, timestamp: &str, offset: u64) -> NewIndexEntry {
        NewIndexEntry {
            urlkey: wayproxy_core::canonical_key(url),
            timestamp: timestamp.to_string(),
            url: url.to_string(),
            status: 200,
            mime: Some("text/html".to_string()),
            filename: "rec-20140127171251-abcdef.warc.gz".to_string(),
            offset,
            length: 100,
        }
    }

    #[test]
    fn insert_and_find() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 0)).unwrap();
        IndexRepo::insert(&conn, &entry("http://test@example.com/", "20130729195151", 100))
            .unwrap();
        IndexRepo::insert(&conn, &entry("http://example.org/", "20130729195151", 200)).unwrap();

        let found = IndexRepo::find_by_urlkey(&conn, "com,example)/").unwrap();
        assert_eq!(found.len(), 2);
        // oldest first
        assert_eq!(found[0].url, "http://test@example.com/");
        assert_eq!(found[0].offset, 100);
        assert_eq!(found[1].url, "http://example.com/");
        assert_eq!(found[1].mime.as_deref(), Some("text/html"));
    }

    #[test]
    fn find_unknown_is_empty() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();
        assert!(IndexRepo::find_by_urlkey(&conn, "com,example)/").unwrap().is_empty());
    }

    #[test]
    fn clear_and_count() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 0)).unwrap();
        IndexRepo::insert(&conn, &entry("http://example.com/a", "20140127171251", 100)).unwrap();
        assert_eq!(IndexRepo::count(&conn).unwrap(), 2);

        assert_eq!(IndexRepo::clear(&conn).unwrap(), 2);
        assert_eq!(IndexRepo::count(&conn).unwrap(), 0);
    }

    #[test]
    fn rows_with_bad_timestamps_are_skipped() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        IndexRepo::insert(&conn, &entry("http://example.com/", "not-a-date", 0)).unwrap();
        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 100)).unwrap();

        let found = IndexRepo::find_by_urlkey(&conn, "com,example)/").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 100);
    }

    #[test]
    fn row_errors_are_reported() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 0)).unwrap();
        // a text status cannot be read back as u16
        conn.execute("UPDATE captures SET status = 'ok'", []).unwrap();

        assert!(IndexRepo::find_by_urlkey(&conn, "com,example)/").is_err());
    }

    #[test]
    fn later_rows_have_larger_sequence() {
        let pool = IndexPool::in_memory().unwrap();
        let conn = pool.get().unwrap();

        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 0)).unwrap();
        IndexRepo::insert(&conn, &entry("http://example.com/", "20140127171251", 100)).unwrap();

        let found = IndexRepo::find_by_urlkey(&conn, "com,example)/").unwrap();
        assert!(found[1].sequence() > found[0].sequence());
        let picked = crate::select::select_closest(&found, None).unwrap();
        assert_eq!(picked.offset, 100);
    }
}
