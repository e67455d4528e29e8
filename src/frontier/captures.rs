//! Capture records: append-only insert plus the prefix range lookup used by
//! `skitter list-captures`.

use chrono::{DateTime, TimeZone, Utc};

use super::Frontier;
use crate::error::Result;
use crate::model::Capture;
use crate::surt;

type CaptureRow = (
    i64,
    String,
    String,
    String,
    i64,
    String,
    i64,
    Option<String>,
);

fn capture_from_row(row: CaptureRow) -> Capture {
    Capture {
        id: row.0,
        url: row.1,
        canon_surt: row.2,
        abbr_canon_surt: row.3,
        timestamp: timestamp_from_secs(row.4),
        content_digest: row.5,
        http_status: row.6,
        mimetype: row.7,
    }
}

fn timestamp_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Input for [`Frontier::record_capture`]; id and abbreviated key are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct CaptureQuery {
    pub url: String,
    pub canon_surt: String,
    pub timestamp: DateTime<Utc>,
    pub content_digest: String,
    pub http_status: i64,
    pub mimetype: Option<String>,
}

impl Frontier {
    /// Append one capture record. Captures are never mutated after insert.
    pub async fn record_capture(&self, capture: &CaptureQuery) -> Result<()> {
        let abbr = surt::abbreviated(&capture.canon_surt);
        sqlx::query(
            "INSERT INTO captures \
             (url, canon_surt, abbr_canon_surt, timestamp, content_digest, http_status, mimetype) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&capture.url)
        .bind(&capture.canon_surt)
        .bind(&abbr)
        .bind(capture.timestamp.timestamp())
        .bind(&capture.content_digest)
        .bind(capture.http_status)
        .bind(&capture.mimetype)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All captures of `url`, ordered by timestamp.
    ///
    /// The scan is bounded to the abbreviated-key range on the
    /// `(abbr_canon_surt, timestamp)` index, then filtered to the exact
    /// canonical key, since abbreviation can collide across long URLs.
    pub async fn list_captures(&self, url: &str) -> Result<Vec<Capture>> {
        let key = surt::canonical_surt(url)?;
        let abbr = surt::abbreviated(&key);
        let upper = surt::prefix_upper_bound(&abbr);

        let rows: Vec<CaptureRow> = sqlx::query_as(
            "SELECT id, url, canon_surt, abbr_canon_surt, timestamp, \
                    content_digest, http_status, mimetype \
             FROM captures \
             WHERE abbr_canon_surt >= ? AND abbr_canon_surt < ? AND canon_surt = ? \
             ORDER BY timestamp",
        )
        .bind(&abbr)
        .bind(&upper)
        .bind(&key)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(capture_from_row).collect())
    }
}
