use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_jobs` table (idempotent) plus the indexes the
/// repository queries lean on: due polling, lookups by type and by target.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            job_type         TEXT    NOT NULL,
            target_id        TEXT    NOT NULL,
            recurrence       TEXT    NOT NULL,   -- JSON RecurrenceDescriptor
            status           TEXT    NOT NULL,
            next_run_at      TEXT    NOT NULL,   -- RFC 3339, UTC, fixed width
            last_run_at      TEXT,
            occurrence_count INTEGER NOT NULL DEFAULT 0,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            payload          TEXT    NOT NULL,   -- opaque JSON
            last_error       TEXT,
            version          INTEGER NOT NULL,   -- optimistic lock
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        ) STRICT;

        -- SELECT … WHERE status IN ('pending','failed') AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
            ON scheduled_jobs (status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_type
            ON scheduled_jobs (job_type);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_target
            ON scheduled_jobs (target_id);
        ",
    )?;
    Ok(())
}
