//! SQLite-backed repository.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, ErrorCode, Row};
use tracing::debug;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    recurrence::Recurrence,
    repository::ScheduleRepository,
    status::JobStatus,
    types::{latest_schedulable, ScheduledJob},
};

const COLUMNS: &str = "id, job_type, target_id, recurrence, status, next_run_at, last_run_at,
     occurrence_count, retry_count, payload, last_error, version, created_at, updated_at";

/// Repository over a single shared `Connection`.
///
/// Cloning is cheap; clones share the connection. Several processes may open
/// the same database file: the versioned `UPDATE` keeps claims exclusive.
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query(&self, sql_tail: &str, params: impl rusqlite::Params) -> Result<Vec<ScheduledJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!("SELECT {COLUMNS} FROM scheduled_jobs {sql_tail}"))?;
        let jobs = stmt
            .query_map(params, row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}

/// Fixed-width UTC timestamps so TEXT comparison orders chronologically.
/// Instants past year 9999 are stored as the last four-digit-year second.
fn ts(dt: DateTime<Utc>) -> String {
    dt.min(latest_schedulable())
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let recurrence: String = row.get(3)?;
    let status: String = row.get(4)?;
    let next_run_at: String = row.get(5)?;
    let last_run_at: Option<String> = row.get(6)?;
    let payload: String = row.get(9)?;
    let version: i64 = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(ScheduledJob {
        id: row.get(0)?,
        job_type: row.get(1)?,
        target_id: row.get(2)?,
        recurrence: serde_json::from_str::<Recurrence>(&recurrence)
            .map_err(|e| conversion_error(3, e))?,
        status: status.parse::<JobStatus>().map_err(|e| conversion_error(4, e))?,
        next_run_at: parse_ts(5, &next_run_at)?,
        last_run_at: last_run_at.as_deref().map(|s| parse_ts(6, s)).transpose()?,
        occurrence_count: row.get(7)?,
        retry_count: row.get(8)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(9, e))?,
        last_error: row.get(10)?,
        version: u64::try_from(version).map_err(|e| conversion_error(11, e))?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
    })
}

#[async_trait]
impl ScheduleRepository for SqliteRepository {
    async fn find(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.query("WHERE id = ?1", [id])?.into_iter().next())
    }

    async fn find_due(&self, as_of: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        self.query(
            "WHERE status IN ('pending', 'failed') AND next_run_at <= ?1
             ORDER BY next_run_at, id",
            [ts(as_of)],
        )
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<ScheduledJob>> {
        self.query("WHERE job_type = ?1 ORDER BY created_at, id", [job_type])
    }

    async fn find_by_target(&self, target_id: &str) -> Result<Vec<ScheduledJob>> {
        self.query("WHERE target_id = ?1 ORDER BY created_at, id", [target_id])
    }

    async fn find_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<ScheduledJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            "WHERE status = ?1 ORDER BY created_at, id LIMIT ?2",
            params![status.as_str(), limit],
        )
    }

    async fn save(&self, job: &mut ScheduledJob) -> Result<()> {
        let recurrence = serde_json::to_string(&job.recurrence)?;
        let payload = serde_json::to_string(&job.payload)?;
        let expected = i64::try_from(job.version)
            .map_err(|_| SchedulerError::Conflict { id: job.id.clone() })?;
        let next_version = expected + 1;

        let conn = self.lock();
        let changed = if job.version == 0 {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO scheduled_jobs ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    job.id,
                    job.job_type,
                    job.target_id,
                    recurrence,
                    job.status.as_str(),
                    ts(job.next_run_at),
                    job.last_run_at.map(ts),
                    job.occurrence_count,
                    job.retry_count,
                    payload,
                    job.last_error,
                    next_version,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            );
            match inserted {
                Ok(n) => n,
                // Same id already present: someone else inserted first.
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    0
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            conn.execute(
                "UPDATE scheduled_jobs SET
                    job_type = ?2, target_id = ?3, recurrence = ?4, status = ?5,
                    next_run_at = ?6, last_run_at = ?7, occurrence_count = ?8,
                    retry_count = ?9, payload = ?10, last_error = ?11, version = ?12,
                    updated_at = ?13
                 WHERE id = ?1 AND version = ?14",
                params![
                    job.id,
                    job.job_type,
                    job.target_id,
                    recurrence,
                    job.status.as_str(),
                    ts(job.next_run_at),
                    job.last_run_at.map(ts),
                    job.occurrence_count,
                    job.retry_count,
                    payload,
                    job.last_error,
                    next_version,
                    ts(job.updated_at),
                    expected,
                ],
            )?
        };

        if changed != 1 {
            debug!(job_id = %job.id, version = job.version, "save lost version race");
            return Err(SchedulerError::Conflict { id: job.id.clone() });
        }
        job.version += 1;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let n = self.lock().execute("DELETE FROM scheduled_jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    async fn count(&self, status: Option<JobStatus>) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM scheduled_jobs WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM scheduled_jobs", [], |row| row.get(0))?,
        };
        Ok(usize::try_from(n).unwrap_or_default())
    }
}
