//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding fetched content,
//! generator summaries, job records, job logs and continuous-tick usage.
//! It implements [`JobStore`] directly; [`SqliteStore`] adapts it to the
//! [`ContentStore`] plugin contract. [`MemoryStorage`] implements both
//! contracts in memory for tests and ephemeral runs.
//!
//! [`ContentStore`]: newsloom_shared::ContentStore

mod memory;
mod migrations;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStore;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database, params};
use newsloom_shared::{
    ContentItem, JobId, JobLogEntry, JobRecord, JobStatus, JobStore, JobType, LogLevel,
    NewsloomError, Result, SummaryItem, TickUsage, UsageTotals,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

fn db_err(e: libsql::Error) -> NewsloomError {
    NewsloomError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| NewsloomError::Storage(format!("invalid timestamp '{s}': {e}")))
}

const JOB_COLUMNS: &str = "id, config_name, job_type, status, progress, start_time, end_time, \
     error, cancel_reason, items_fetched, tokens_used, estimated_cost_usd, ticks";

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| NewsloomError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    NewsloomError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Content operations
    // -----------------------------------------------------------------------

    /// Look up a stored item by its content id.
    pub async fn get_content_item(&self, content_id: &str) -> Result<Option<ContentItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_id, source, kind, title, text, link, timestamp, metadata_json
                 FROM content_items WHERE content_id = ?1",
                params![content_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_content_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Upsert items by content id. Items without an id are skipped.
    pub async fn save_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let mut written = 0;

        for item in items {
            let Some(content_id) = item.content_id.as_deref() else {
                tracing::debug!(source = %item.source, "skipping item without content_id");
                continue;
            };
            let metadata_json = if item.metadata.is_empty() {
                None
            } else {
                Some(
                    serde_json::to_string(&item.metadata)
                        .map_err(|e| NewsloomError::Storage(e.to_string()))?,
                )
            };

            tx.execute(
                "INSERT INTO content_items
                   (content_id, source, kind, title, text, link, timestamp, metadata_json, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(content_id) DO UPDATE SET
                   title = excluded.title,
                   text = excluded.text,
                   link = excluded.link,
                   metadata_json = excluded.metadata_json",
                params![
                    content_id,
                    item.source.as_str(),
                    item.kind.as_str(),
                    item.title.as_deref(),
                    item.text.as_deref(),
                    item.link.as_deref(),
                    item.timestamp.to_rfc3339(),
                    metadata_json,
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
            written += 1;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    /// Number of stored content items.
    pub async fn count_content_items(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM content_items", params![])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }

    /// Upsert a summary by `(generator, kind, date)`.
    pub async fn save_summary_item(&self, item: &SummaryItem) -> Result<()> {
        let content_json =
            serde_json::to_string(&item.content).map_err(|e| NewsloomError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO summary_items
                   (generator, kind, title, date, content_json, markdown, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(generator, kind, date) DO UPDATE SET
                   title = excluded.title,
                   content_json = excluded.content_json,
                   markdown = excluded.markdown,
                   stored_at = excluded.stored_at",
                params![
                    item.generator.as_str(),
                    item.kind.as_str(),
                    item.title.as_deref(),
                    item.date.to_string(),
                    content_json,
                    item.markdown.as_deref(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All summaries stored for a day, ordered by generator.
    pub async fn get_summary_items(&self, date: NaiveDate) -> Result<Vec<SummaryItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT generator, kind, title, date, content_json, markdown
                 FROM summary_items WHERE date = ?1 ORDER BY generator, kind",
                params![date.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let date_str: String = row.get(3).map_err(db_err)?;
            let content_json: String = row.get(4).map_err(db_err)?;
            results.push(SummaryItem {
                generator: row.get::<String>(0).map_err(db_err)?,
                kind: row.get::<String>(1).map_err(db_err)?,
                title: row.get::<String>(2).ok(),
                date: date_str
                    .parse()
                    .map_err(|e| NewsloomError::Storage(format!("invalid date: {e}")))?,
                content: serde_json::from_str(&content_json)
                    .map_err(|e| NewsloomError::Storage(e.to_string()))?,
                markdown: row.get::<String>(5).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Job helpers
    // -----------------------------------------------------------------------

    async fn load_job_logs(&self, id: &JobId) -> Result<Vec<JobLogEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT timestamp, level, message FROM job_logs WHERE job_id = ?1 ORDER BY id",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let ts: String = row.get(0).map_err(db_err)?;
            let level: String = row.get(1).map_err(db_err)?;
            logs.push(JobLogEntry {
                timestamp: parse_ts(&ts)?,
                level: LogLevel::parse(&level),
                message: row.get::<String>(2).map_err(db_err)?,
            });
        }
        Ok(logs)
    }

    async fn query_jobs(&self, sql: &str) -> Result<Vec<JobRecord>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            jobs.push(row_to_job_record(&row)?);
        }
        Ok(jobs)
    }

    /// Move a non-terminal job to a terminal status. Returns whether it moved.
    async fn finish_job(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        cancel_reason: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE jobs
                 SET status = ?2,
                     end_time = ?3,
                     progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE progress END,
                     error = COALESCE(?4, error),
                     cancel_reason = COALESCE(?5, cancel_reason)
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id.to_string(), status.as_str(), now.as_str(), error, cancel_reason],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    /// Per-tick usage history for a job, oldest first.
    pub async fn get_job_ticks(&self, id: &JobId) -> Result<Vec<TickUsage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT items_fetched, tokens_used, estimated_cost_usd
                 FROM job_ticks WHERE job_id = ?1 ORDER BY id",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let mut ticks = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ticks.push(TickUsage {
                items_fetched: row.get::<i64>(0).map_err(db_err)? as u64,
                tokens_used: row.get::<i64>(1).map_err(db_err)? as u64,
                estimated_cost_usd: row.get::<f64>(2).map_err(db_err)?,
            });
        }
        Ok(ticks)
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
impl JobStore for Storage {
    async fn create_job(&self, record: &JobRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (id, config_name, job_type, status, progress, start_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.to_string(),
                    record.config_name.as_str(),
                    record.job_type.as_str(),
                    record.status.as_str(),
                    i64::from(record.progress),
                    record.start_time.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let mut record = row_to_job_record(&row)?;
        record.logs = self.load_job_logs(id).await?;
        Ok(Some(record))
    }

    /// Logs are not loaded here; use `get_job` for the full trail.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_jobs(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY start_time DESC, id DESC"
        ))
        .await
    }

    async fn start_job(&self, id: &JobId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn update_job_progress(&self, id: &JobId, progress: u8) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET progress = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id.to_string(), i64::from(progress.min(100))],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn complete_job(&self, id: &JobId) -> Result<bool> {
        self.finish_job(id, JobStatus::Completed, None, None).await
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<bool> {
        self.finish_job(id, JobStatus::Failed, Some(error), None)
            .await
    }

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<bool> {
        self.finish_job(id, JobStatus::Cancelled, None, Some(reason))
            .await
    }

    async fn add_job_log(&self, id: &JobId, entry: &JobLogEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO job_logs (job_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.to_string(),
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.message.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_running_jobs(&self) -> Result<Vec<JobRecord>> {
        self.query_jobs(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('pending', 'running') ORDER BY start_time"
        ))
        .await
    }

    async fn add_job_usage(&self, id: &JobId, usage: &TickUsage) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET
                   items_fetched = items_fetched + ?2,
                   tokens_used = tokens_used + ?3,
                   estimated_cost_usd = estimated_cost_usd + ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    usage.items_fetched as i64,
                    usage.tokens_used as i64,
                    usage.estimated_cost_usd,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_continuous_tick(&self, id: &JobId, usage: &TickUsage) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "INSERT INTO job_ticks (job_id, recorded_at, items_fetched, tokens_used, estimated_cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                now.as_str(),
                usage.items_fetched as i64,
                usage.tokens_used as i64,
                usage.estimated_cost_usd,
            ],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "UPDATE jobs SET
               items_fetched = items_fetched + ?2,
               tokens_used = tokens_used + ?3,
               estimated_cost_usd = estimated_cost_usd + ?4,
               ticks = ticks + 1
             WHERE id = ?1",
            params![
                id.to_string(),
                usage.items_fetched as i64,
                usage.tokens_used as i64,
                usage.estimated_cost_usd,
            ],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Convert a database row to a [`ContentItem`].
fn row_to_content_item(row: &libsql::Row) -> Result<ContentItem> {
    let timestamp: String = row.get(6).map_err(db_err)?;
    let metadata = match row.get::<String>(7).ok() {
        Some(json) => {
            serde_json::from_str(&json).map_err(|e| NewsloomError::Storage(e.to_string()))?
        }
        None => Default::default(),
    };

    Ok(ContentItem {
        content_id: Some(row.get::<String>(0).map_err(db_err)?),
        source: row.get::<String>(1).map_err(db_err)?,
        kind: row.get::<String>(2).map_err(db_err)?,
        title: row.get::<String>(3).ok(),
        text: row.get::<String>(4).ok(),
        link: row.get::<String>(5).ok(),
        timestamp: parse_ts(&timestamp)?,
        metadata,
    })
}

/// Convert a row selected with [`JOB_COLUMNS`] to a [`JobRecord`] (without logs).
fn row_to_job_record(row: &libsql::Row) -> Result<JobRecord> {
    let id: String = row.get(0).map_err(db_err)?;
    let job_type: String = row.get(2).map_err(db_err)?;
    let status: String = row.get(3).map_err(db_err)?;
    let start_time: String = row.get(5).map_err(db_err)?;

    Ok(JobRecord {
        id: id
            .parse()
            .map_err(|e| NewsloomError::Storage(format!("invalid job id '{id}': {e}")))?,
        config_name: row.get::<String>(1).map_err(db_err)?,
        job_type: job_type.parse::<JobType>()?,
        status: status.parse::<JobStatus>()?,
        progress: row.get::<i64>(4).map_err(db_err)?.clamp(0, 100) as u8,
        start_time: parse_ts(&start_time)?,
        end_time: match row.get::<String>(6).ok() {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        },
        error: row.get::<String>(7).ok(),
        cancel_reason: row.get::<String>(8).ok(),
        usage: UsageTotals {
            items_fetched: row.get::<i64>(9).map_err(db_err)? as u64,
            tokens_used: row.get::<i64>(10).map_err(db_err)? as u64,
            estimated_cost_usd: row.get::<f64>(11).map_err(db_err)?,
            ticks: row.get::<i64>(12).map_err(db_err)? as u64,
        },
        logs: Vec::new(),
    })
}
