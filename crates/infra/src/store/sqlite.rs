//! SQLite-backed record store.
//!
//! Several worker processes may open the same database file. Mutual
//! exclusion comes from SQLite's single-writer lock: every claim runs inside a
//! `BEGIN IMMEDIATE` transaction, so counting live locks, picking a candidate
//! and writing the new lock are one atomic step across processes.
//!
//! ## Schema
//!
//! Timestamps are Unix milliseconds (`INTEGER`), payloads JSON text. A record
//! is locked while `lockedby IS NOT NULL AND lockexpiry >= now`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database, `SQLITE_BUSY`/`SQLITE_LOCKED` after the busy timeout | `Unavailable` |
//! | Database (other) | `Storage` |
//! | PoolTimedOut / PoolClosed / Io | `Unavailable` |
//! | Other | `Storage` |

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{FromRow, Row, Sqlite, Transaction};
use tracing::instrument;

use cronq_core::{
    normalize_classname, AdhocTaskRecord, ClassSummary, ConcurrencyLimiter, NewAdhocTask,
    QueueSummary, RunningCounts, Slot, TaskId, WorkerId,
};

use super::{
    ClaimByIdRequest, ClaimRequest, ClaimedTask, LockRequest, StoreError, TaskFilter, TaskStore,
};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS adhoc_tasks (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        classname    TEXT    NOT NULL,
        payload      TEXT    NOT NULL,
        nextruntime  INTEGER NOT NULL,
        faildelay    INTEGER NOT NULL DEFAULT 0,
        lockedby     TEXT    NULL,
        lockexpiry   INTEGER NULL,
        timestarted  INTEGER NULL,
        blocking     INTEGER NOT NULL DEFAULT 0,
        userid       INTEGER NULL,
        timecreated  INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS adhoc_tasks_nextruntime_idx ON adhoc_tasks (nextruntime, id)",
    "CREATE INDEX IF NOT EXISTS adhoc_tasks_classname_idx ON adhoc_tasks (classname)",
    "CREATE INDEX IF NOT EXISTS adhoc_tasks_lock_idx ON adhoc_tasks (lockedby, lockexpiry)",
];

const COLUMNS: &str = "id, classname, payload, nextruntime, faildelay, lockedby, lockexpiry, \
                       timestarted, blocking, userid, timecreated";

/// SQLite-backed ad-hoc task store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Wrap an existing pool. Call [`SqliteTaskStore::migrate`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) a database file shared with other workers.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the table and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a write transaction that holds SQLite's writer lock.
    ///
    /// Dropping the returned guard without committing rolls back, so a
    /// cancelled claim never leaves the connection inside a transaction.
    async fn begin_immediate(
        &self,
        operation: &str,
    ) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

async fn running_counts_on(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<RunningCounts, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT classname, blocking, COUNT(*) AS running
        FROM adhoc_tasks
        WHERE lockedby IS NOT NULL AND lockexpiry >= ?1
        GROUP BY classname, blocking
        "#,
    )
    .bind(now.timestamp_millis())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("running_counts", e))?;

    let mut counts = RunningCounts::default();
    for row in rows {
        let classname: String = row
            .try_get("classname")
            .map_err(|e| map_sqlx_error("running_counts", e))?;
        let blocking: bool = row
            .try_get("blocking")
            .map_err(|e| map_sqlx_error("running_counts", e))?;
        let running: i64 = row
            .try_get("running")
            .map_err(|e| map_sqlx_error("running_counts", e))?;
        counts.add(&classname, blocking, running.max(0) as usize);
    }
    Ok(counts)
}

async fn write_lock(
    conn: &mut SqliteConnection,
    record: &mut AdhocTaskRecord,
    lock: &LockRequest,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE adhoc_tasks SET lockedby = ?1, lockexpiry = ?2, timestarted = ?3 WHERE id = ?4",
    )
    .bind(lock.worker.to_string())
    .bind(lock.lock_until.timestamp_millis())
    .bind(lock.now.timestamp_millis())
    .bind(record.id.get())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock", e))?;

    record.lock(lock.worker, lock.now, lock.lock_until);
    Ok(())
}

async fn claim_next_in_tx(
    conn: &mut SqliteConnection,
    request: &ClaimRequest<'_>,
) -> Result<Option<ClaimedTask>, StoreError> {
    let now = request.lock.now;
    let counts = running_counts_on(conn, now).await?;
    let admission = request.limiter.admission(&counts);
    if admission.is_closed() {
        return Ok(None);
    }

    let excluded = serde_json::to_string(&admission.excluded_classnames)
        .map_err(|e| StoreError::Storage(format!("failed to encode exclusions: {e}")))?;

    let row = sqlx::query(&format!(
        r#"
        SELECT {COLUMNS}
        FROM adhoc_tasks
        WHERE nextruntime <= ?1
            AND (lockedby IS NULL OR lockexpiry IS NULL OR lockexpiry < ?1)
            AND (?2 IS NULL OR classname = ?2)
            AND classname NOT IN (SELECT value FROM json_each(?3))
            AND ((blocking = 0 AND ?4) OR (blocking <> 0 AND ?5))
        ORDER BY id ASC
        LIMIT 1
        "#
    ))
    .bind(now.timestamp_millis())
    .bind(request.classname)
    .bind(excluded)
    .bind(admission.ordinary_open)
    .bind(admission.blocking_open)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("claim_next", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut record = decode_record(&row)?;
    let slot = request.limiter.reserve_for(&counts, &record)?;
    write_lock(conn, &mut record, &request.lock).await?;

    Ok(Some(ClaimedTask { record, slot }))
}

async fn claim_by_id_in_tx(
    conn: &mut SqliteConnection,
    id: TaskId,
    request: &ClaimByIdRequest<'_>,
) -> Result<ClaimedTask, StoreError> {
    let now = request.lock.now;
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM adhoc_tasks WHERE id = ?1"))
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("claim_by_id", e))?;

    let mut record = match row {
        Some(row) => decode_record(&row)?,
        None => return Err(StoreError::NotFound(id)),
    };
    if record.is_locked(now) {
        return Err(StoreError::AlreadyRunning(id));
    }

    let slot = match request.limiter {
        Some(limiter) => reserve(conn, limiter, &record, now).await?,
        None => Slot {
            classname: record.classname.clone(),
            blocking: record.blocking,
        },
    };
    write_lock(conn, &mut record, &request.lock).await?;

    Ok(ClaimedTask { record, slot })
}

async fn reserve(
    conn: &mut SqliteConnection,
    limiter: &ConcurrencyLimiter,
    record: &AdhocTaskRecord,
    now: DateTime<Utc>,
) -> Result<Slot, StoreError> {
    let counts = running_counts_on(conn, now).await?;
    Ok(limiter.reserve_for(&counts, record)?)
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(classname = %task.classname), err)]
    async fn enqueue(&self, task: NewAdhocTask, now: DateTime<Utc>) -> Result<TaskId, StoreError> {
        let record = task.into_record(TaskId::new(0), now)?;

        let result = sqlx::query(
            r#"
            INSERT INTO adhoc_tasks (
                classname,
                payload,
                nextruntime,
                faildelay,
                lockedby,
                lockexpiry,
                timestarted,
                blocking,
                userid,
                timecreated
            )
            VALUES (?1, ?2, ?3, 0, NULL, NULL, NULL, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.classname)
        .bind(record.payload.to_string())
        .bind(record.nextruntime.timestamp_millis())
        .bind(record.blocking)
        .bind(record.userid)
        .bind(record.timecreated.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(TaskId::new(result.last_insert_rowid()))
    }

    async fn get(&self, id: TaskId) -> Result<Option<AdhocTaskRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM adhoc_tasks WHERE id = ?1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self, request), fields(worker = %request.lock.worker), err)]
    async fn claim_next(
        &self,
        request: &ClaimRequest<'_>,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut tx = self.begin_immediate("claim_next").await?;
        let claimed = claim_next_in_tx(&mut tx, request).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(claimed)
    }

    #[instrument(skip(self, request), fields(task_id = %id, worker = %request.lock.worker), err)]
    async fn claim_by_id(
        &self,
        id: TaskId,
        request: &ClaimByIdRequest<'_>,
    ) -> Result<ClaimedTask, StoreError> {
        let mut tx = self.begin_immediate("claim_by_id").await?;
        let claimed = claim_by_id_in_tx(&mut tx, id, request).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_by_id", e))?;
        Ok(claimed)
    }

    #[instrument(skip(self, record), fields(task_id = %record.id, worker = %worker), err)]
    async fn complete(&self, record: &AdhocTaskRecord, worker: WorkerId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM adhoc_tasks WHERE id = ?1 AND lockedby = ?2")
            .bind(record.id.get())
            .bind(worker.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LockLost(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(task_id = %record.id, worker = %worker), err)]
    async fn reschedule(
        &self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
        faildelay: u64,
        nextruntime: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE adhoc_tasks
            SET faildelay = ?1,
                nextruntime = ?2,
                lockedby = NULL,
                lockexpiry = NULL,
                timestarted = NULL
            WHERE id = ?3 AND lockedby = ?4
            "#,
        )
        .bind(i64::try_from(faildelay).unwrap_or(i64::MAX))
        .bind(nextruntime.timestamp_millis())
        .bind(record.id.get())
        .bind(worker.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LockLost(record.id));
        }
        Ok(())
    }

    async fn unlock_stale(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE adhoc_tasks
            SET lockedby = NULL,
                lockexpiry = NULL,
                timestarted = NULL
            WHERE lockedby IS NOT NULL AND (lockexpiry IS NULL OR lockexpiry < ?1)
            RETURNING id
            "#,
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock_stale", e))?;

        let mut released = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id").map(TaskId::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("unlock_stale", e))?;
        released.sort();
        Ok(released)
    }

    async fn running_counts(&self, now: DateTime<Utc>) -> Result<RunningCounts, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("running_counts", e))?;
        running_counts_on(&mut conn, now).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<AdhocTaskRecord>, StoreError> {
        let classname = filter.classname.as_deref().map(normalize_classname);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM adhoc_tasks
            WHERE (?1 IS NULL OR classname = ?1)
                AND (?2 = 0 OR faildelay > 0)
            ORDER BY id ASC
            "#
        ))
        .bind(classname)
        .bind(filter.failed_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_record).collect()
    }

    async fn summary(
        &self,
        now: DateTime<Utc>,
        classname: Option<&str>,
    ) -> Result<QueueSummary, StoreError> {
        let classname = classname.map(normalize_classname);
        let rows = sqlx::query(
            r#"
            SELECT
                classname,
                COUNT(*) AS count,
                COALESCE(SUM(CASE WHEN lockedby IS NULL AND nextruntime <= ?1 THEN 1 ELSE 0 END), 0) AS due,
                COALESCE(SUM(CASE WHEN lockedby IS NULL AND nextruntime > ?1 THEN 1 ELSE 0 END), 0) AS waiting,
                COALESCE(SUM(CASE WHEN lockedby IS NOT NULL AND lockexpiry >= ?1 THEN 1 ELSE 0 END), 0) AS running,
                COALESCE(SUM(CASE WHEN lockedby IS NOT NULL AND (lockexpiry IS NULL OR lockexpiry < ?1) THEN 1 ELSE 0 END), 0) AS stuck,
                COALESCE(SUM(CASE WHEN faildelay > 0 THEN 1 ELSE 0 END), 0) AS failing,
                MIN(nextruntime) AS next_runtime
            FROM adhoc_tasks
            WHERE (?2 IS NULL OR classname = ?2)
            GROUP BY classname
            ORDER BY classname ASC
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(classname)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("summary", e))?;

        let classes = rows
            .iter()
            .map(|row| ClassSummaryRow::from_row(row).map_err(|e| map_sqlx_error("summary", e)))
            .map(|row| row.and_then(ClassSummary::try_from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueueSummary { classes })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            // SQLITE_BUSY / SQLITE_LOCKED and their extended codes
            match db_err.code().as_deref() {
                Some("5" | "6" | "261" | "517") => StoreError::Unavailable(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn from_millis(operation: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Storage(format!("timestamp out of range in {operation}: {ms}")))
}

// SQLx row types

#[derive(Debug)]
struct AdhocTaskRow {
    id: i64,
    classname: String,
    payload: String,
    nextruntime: i64,
    faildelay: i64,
    lockedby: Option<String>,
    lockexpiry: Option<i64>,
    timestarted: Option<i64>,
    blocking: bool,
    userid: Option<i64>,
    timecreated: i64,
}

impl<'r> FromRow<'r, SqliteRow> for AdhocTaskRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(AdhocTaskRow {
            id: row.try_get("id")?,
            classname: row.try_get("classname")?,
            payload: row.try_get("payload")?,
            nextruntime: row.try_get("nextruntime")?,
            faildelay: row.try_get("faildelay")?,
            lockedby: row.try_get("lockedby")?,
            lockexpiry: row.try_get("lockexpiry")?,
            timestarted: row.try_get("timestarted")?,
            blocking: row.try_get("blocking")?,
            userid: row.try_get("userid")?,
            timecreated: row.try_get("timecreated")?,
        })
    }
}

impl TryFrom<AdhocTaskRow> for AdhocTaskRecord {
    type Error = StoreError;

    fn try_from(row: AdhocTaskRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| {
            StoreError::Storage(format!("invalid payload for task {}: {}", row.id, e))
        })?;
        let lockedby = row
            .lockedby
            .as_deref()
            .map(WorkerId::from_str)
            .transpose()
            .map_err(|e| StoreError::Storage(format!("invalid lockedby for task {}: {}", row.id, e)))?;

        Ok(AdhocTaskRecord {
            id: TaskId::new(row.id),
            classname: row.classname,
            payload,
            nextruntime: from_millis("decode", row.nextruntime)?,
            faildelay: row.faildelay.max(0) as u64,
            lockedby,
            lockexpiry: row.lockexpiry.map(|ms| from_millis("decode", ms)).transpose()?,
            timestarted: row.timestarted.map(|ms| from_millis("decode", ms)).transpose()?,
            blocking: row.blocking,
            userid: row.userid,
            timecreated: from_millis("decode", row.timecreated)?,
        })
    }
}

fn decode_record(row: &SqliteRow) -> Result<AdhocTaskRecord, StoreError> {
    let row = AdhocTaskRow::from_row(row).map_err(|e| map_sqlx_error("decode", e))?;
    AdhocTaskRecord::try_from(row)
}

#[derive(Debug)]
struct ClassSummaryRow {
    classname: String,
    count: i64,
    due: i64,
    waiting: i64,
    running: i64,
    stuck: i64,
    failing: i64,
    next_runtime: Option<i64>,
}

impl<'r> FromRow<'r, SqliteRow> for ClassSummaryRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ClassSummaryRow {
            classname: row.try_get("classname")?,
            count: row.try_get("count")?,
            due: row.try_get("due")?,
            waiting: row.try_get("waiting")?,
            running: row.try_get("running")?,
            stuck: row.try_get("stuck")?,
            failing: row.try_get("failing")?,
            next_runtime: row.try_get("next_runtime")?,
        })
    }
}

impl TryFrom<ClassSummaryRow> for ClassSummary {
    type Error = StoreError;

    fn try_from(row: ClassSummaryRow) -> Result<Self, Self::Error> {
        Ok(ClassSummary {
            classname: row.classname,
            count: row.count.max(0) as usize,
            due: row.due.max(0) as usize,
            waiting: row.waiting.max(0) as usize,
            running: row.running.max(0) as usize,
            stuck: row.stuck.max(0) as usize,
            failing: row.failing.max(0) as usize,
            next_runtime: row
                .next_runtime
                .map(|ms| from_millis("summary", ms))
                .transpose()?,
        })
    }
}
