//! SQL migration definitions for the WikiSelect database.
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
            description: "Initial schema: builders, selections, archive_tasks, schedules, jobs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- User-defined article selection specs
CREATE TABLE IF NOT EXISTS builders (
    id                        TEXT PRIMARY KEY,
    owner_id                  TEXT NOT NULL,
    name                      TEXT NOT NULL,
    project                   TEXT NOT NULL,
    model                     TEXT NOT NULL,
    params_json               TEXT NOT NULL,
    current_version           INTEGER NOT NULL DEFAULT 0,
    selection_archive_version INTEGER,
    created_at                TEXT NOT NULL,
    updated_at                TEXT NOT NULL,
    CHECK (selection_archive_version IS NULL OR selection_archive_version <= current_version)
);

CREATE INDEX IF NOT EXISTS idx_builders_owner ON builders(owner_id);

-- Materialized, versioned artifacts
CREATE TABLE IF NOT EXISTS selections (
    id                  TEXT PRIMARY KEY,
    builder_id          TEXT NOT NULL REFERENCES builders(id) ON DELETE CASCADE,
    content_type        TEXT NOT NULL,
    version             INTEGER NOT NULL CHECK (version >= 1),
    storage_key         TEXT NOT NULL,
    status              TEXT NOT NULL CHECK (status IN ('OK', 'ERROR')),
    error_messages_json TEXT,
    article_count       INTEGER NOT NULL DEFAULT 0,
    content_hash        TEXT,
    updated_at          TEXT NOT NULL,
    UNIQUE(builder_id, content_type, version)
);

CREATE INDEX IF NOT EXISTS idx_selections_builder ON selections(builder_id);

-- Archive build requests
CREATE TABLE IF NOT EXISTS archive_tasks (
    id               TEXT PRIMARY KEY,
    selection_id     TEXT NOT NULL REFERENCES selections(id) ON DELETE CASCADE,
    status           TEXT NOT NULL
                     CHECK (status IN ('NOT_REQUESTED', 'REQUESTED', 'COMPLETED', 'FAILED')),
    external_task_id TEXT,
    schedule_id      TEXT,
    error_message    TEXT,
    requested_at     TEXT,
    updated_at       TEXT NOT NULL
);

-- At most one in-flight archive request per selection
CREATE UNIQUE INDEX IF NOT EXISTS idx_archive_tasks_in_flight
    ON archive_tasks(selection_id) WHERE status = 'REQUESTED';
CREATE INDEX IF NOT EXISTS idx_archive_tasks_external ON archive_tasks(external_task_id);

-- Recurring export schedules
CREATE TABLE IF NOT EXISTS schedules (
    id                       TEXT PRIMARY KEY,
    builder_id               TEXT NOT NULL REFERENCES builders(id) ON DELETE CASCADE,
    queue_job_id             TEXT,
    interval_secs            INTEGER CHECK (interval_secs IS NULL OR interval_secs > 0),
    remaining_generations    INTEGER
                             CHECK (remaining_generations IS NULL OR remaining_generations >= 0),
    status                   TEXT NOT NULL CHECK (status IN ('ACTIVE', 'EXHAUSTED', 'CANCELLED')),
    title                    TEXT NOT NULL,
    description              TEXT,
    long_description         TEXT,
    email                    TEXT,
    email_confirmation_token TEXT UNIQUE,
    email_confirmed          INTEGER NOT NULL DEFAULT 0,
    last_updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_builder ON schedules(builder_id);

-- Job broker
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    queue        TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status       TEXT NOT NULL,
    depends_on   TEXT,
    run_at       TEXT,
    enqueued_at  TEXT NOT NULL,
    started_at   TEXT,
    ended_at     TEXT,
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(queue, status, enqueued_at);
CREATE INDEX IF NOT EXISTS idx_jobs_depends_on ON jobs(depends_on);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Job results, unsubscribe tokens and schedule firing errors",
            sql: r#"
-- Output of a finished job, read by the jobs that depend on it
ALTER TABLE jobs ADD COLUMN result_json TEXT;

CREATE INDEX IF NOT EXISTS idx_jobs_ended ON jobs(status, ended_at);

-- Long-lived unsubscribe link, separate from the single-use confirmation token
ALTER TABLE schedules ADD COLUMN unsubscribe_token TEXT;
ALTER TABLE schedules ADD COLUMN last_error TEXT;

CREATE UNIQUE INDEX IF NOT EXISTS idx_schedules_unsubscribe_token
    ON schedules(unsubscribe_token);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
