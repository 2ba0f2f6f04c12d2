//! SQL migration definitions for the Newsloom database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Content schema: content_items, summary_items",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Fetched content, deduplicated by content_id
CREATE TABLE IF NOT EXISTS content_items (
    content_id    TEXT PRIMARY KEY,
    source        TEXT NOT NULL,
    kind          TEXT NOT NULL,
    title         TEXT,
    text          TEXT,
    link          TEXT,
    timestamp     TEXT NOT NULL,
    metadata_json TEXT,
    stored_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_source ON content_items(source);
CREATE INDEX IF NOT EXISTS idx_content_timestamp ON content_items(timestamp);

-- Generator output, one row per (generator, kind, date)
CREATE TABLE IF NOT EXISTS summary_items (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    generator    TEXT NOT NULL,
    kind         TEXT NOT NULL,
    title        TEXT,
    date         TEXT NOT NULL,
    content_json TEXT NOT NULL,
    markdown     TEXT,
    stored_at    TEXT NOT NULL,
    UNIQUE(generator, kind, date)
);

CREATE INDEX IF NOT EXISTS idx_summary_date ON summary_items(date);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Job schema: jobs, job_logs, job_ticks",
            sql: r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                 TEXT PRIMARY KEY,
    config_name        TEXT NOT NULL,
    job_type           TEXT NOT NULL,
    status             TEXT NOT NULL,
    progress           INTEGER NOT NULL DEFAULT 0,
    start_time         TEXT NOT NULL,
    end_time           TEXT,
    error              TEXT,
    cancel_reason      TEXT,
    items_fetched      INTEGER NOT NULL DEFAULT 0,
    tokens_used        INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd REAL NOT NULL DEFAULT 0,
    ticks              INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

CREATE TABLE IF NOT EXISTS job_logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id    TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    level     TEXT NOT NULL,
    message   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id);

-- One row per continuous tick, for usage history
CREATE TABLE IF NOT EXISTS job_ticks (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id             TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    recorded_at        TEXT NOT NULL,
    items_fetched      INTEGER NOT NULL,
    tokens_used        INTEGER NOT NULL,
    estimated_cost_usd REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_ticks_job ON job_ticks(job_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
