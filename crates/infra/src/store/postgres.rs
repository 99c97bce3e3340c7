//! Postgres-backed job store.
//!
//! Jobs are stored in three tables (`job`, `job_task`, `job_task_transition`,
//! see `migrations/0001_jobs.sql`). The graph is always loaded as a whole and
//! mutated in memory; only the rows that changed are written back.
//!
//! ## Locking
//!
//! - `update_job` runs in one transaction and starts with
//!   `SELECT ... FOR UPDATE` on the job row. Every writer of a job's tasks goes
//!   through that row lock, so task state changes within a job are serialized.
//! - `claim_ready_tasks` uses `FOR UPDATE OF t, j SKIP LOCKED` over task and
//!   job rows. Concurrent claimants never receive the same task and skip
//!   jobs that are being mutated.
//! - The job loop steps first take the row locks of the jobs they may change
//!   (`FOR UPDATE SKIP LOCKED`), then run one set-based statement restricted
//!   to those jobs, all in one transaction. A job that is being mutated is
//!   left for the next pass instead of being changed from a stale read.
//! - `remove_job` checks the job state under the same row lock it deletes
//!   with.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|-----------------------|------------|
//! | Database (unique violation on `job_pkey`) | `23505` | `AlreadyExists` |
//! | Database (other unique violation) | `23505` | `Domain(Conflict)` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed, Io, timeouts | N/A | `Storage` |
//! | Row decoding | N/A | `Decode` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use dagops_core::{DomainError, DomainResult, JobId, State, TaskId};
use dagops_jobs::{Job, JobQuery, JobSchedule, JobSettings, Task, Transition};

use super::r#trait::{JobStore, StoreError, TaskRef};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

/// Postgres-backed [`JobStore`].
///
/// `Send + Sync`; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the job tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id(), tasks = job.task_count()), err)]
    async fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO job (
                id, application, job_type, name, owner, group_id,
                state, scheduled, suspend, auto_resume, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id().as_str())
        .bind(job.application().as_str())
        .bind(job.job_type().as_str())
        .bind(job.name().as_str())
        .bind(job.owner().map(|o| o.as_str()))
        .bind(job.group_id().map(|g| g.as_str()))
        .bind(job.state().as_str())
        .bind(job.schedule().scheduled)
        .bind(job.schedule().suspend)
        .bind(job.schedule().auto_resume)
        .bind(job.modified_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, Some("job_pkey")) {
                StoreError::AlreadyExists(job.id().clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        for (position, task) in job.tasks().enumerate() {
            insert_task(&mut tx, task, position).await?;
        }
        for transition in job.transitions() {
            insert_transition(&mut tx, job.id(), transition).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn load_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_job(&mut conn, job_id, false).await
    }

    #[instrument(skip(self, f), fields(job_id = %job_id), err)]
    async fn update_job<F, R>(&self, job_id: &JobId, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Job) -> DomainResult<R> + Send,
        R: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(mut job) = fetch_job(&mut tx, job_id, true).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(job_id.clone()));
        };

        let before = job.clone();
        let result = match f(&mut job) {
            Ok(result) => result,
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::Domain(err));
            }
        };

        write_changes(&mut tx, &before, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(result)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn remove_job(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(job) = fetch_job(&mut tx, job_id, true).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        };
        if let Err(err) = job.ensure_removable() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Domain(err));
        }

        let result = sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(job_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove_job", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn find_job_by_task(&self, task_id: &TaskId) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query("SELECT job_id FROM job_task WHERE id = $1")
            .bind(task_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job_by_task", e))?;
        row.map(|row| decode_job_id(&row, "job_id")).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_jobs(
        &self,
        query: &JobQuery,
        limit: usize,
    ) -> Result<Vec<JobSettings>, StoreError> {
        let pattern = query
            .filter
            .as_deref()
            .map(|f| format!("%{}%", escape_like(&f.to_lowercase())));
        let states: Vec<String> = State::ALL
            .iter()
            .filter(|s| !query.running_only || !(s.is_terminal() || **s == State::New))
            .map(|s| s.as_str().to_string())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT id, application, job_type, name, owner, group_id,
                   state, scheduled, suspend, auto_resume, modified_at
            FROM job
            WHERE ($1::text IS NULL OR lower(name) LIKE $1 OR lower(id) LIKE $1)
              AND state = ANY($2)
              AND ($3::timestamptz IS NULL OR scheduled >= $3)
              AND ($4::timestamptz IS NULL OR scheduled <= $4)
              AND ($5::text IS NULL OR group_id = $5)
            ORDER BY scheduled DESC NULLS LAST, id
            LIMIT $6
            "#,
        )
        .bind(pattern)
        .bind(states)
        .bind(query.scheduled_after)
        .bind(query.scheduled_before)
        .bind(query.group_id.as_ref().map(|g| g.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_jobs", e))?;

        rows.iter()
            .map(|row| {
                JobRow::from_row(row)
                    .map_err(|e| StoreError::Decode(format!("job row: {e}")))?
                    .into_settings()
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn start_scheduled_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs = lock_jobs(&mut tx, &[State::Ready]).await?;
        let rows = sqlx::query(
            r#"
            UPDATE job SET state = 'ACTIVE', modified_at = now()
            WHERE id = ANY($1) AND (scheduled IS NULL OR scheduled <= $2)
            RETURNING id
            "#,
        )
        .bind(jobs.as_slice())
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("start_scheduled_jobs", e))?;
        commit(tx).await?;
        rows.iter().map(|row| decode_job_id(row, "id")).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_ready_tasks(&self) -> Result<Vec<TaskRef>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs = lock_jobs(&mut tx, &[State::Active]).await?;
        let rows = sqlx::query(
            r#"
            UPDATE job_task t SET state = 'READY', modified_at = now()
            WHERE t.job_id = ANY($1)
              AND t.state = 'WAITING'
              AND NOT EXISTS (
                  SELECT 1
                  FROM job_task_transition tr
                  JOIN job_task p ON p.id = tr.from_task_id
                  WHERE tr.to_task_id = t.id AND p.state <> 'COMPLETED'
              )
            RETURNING t.job_id, t.id
            "#,
        )
        .bind(jobs.as_slice())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_ready_tasks", e))?;
        commit(tx).await?;
        rows.iter().map(decode_task_ref).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_failed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs = lock_jobs(&mut tx, &[State::Active, State::Confirm]).await?;
        let rows = sqlx::query(
            r#"
            WITH failed AS (
                UPDATE job j SET state = 'FAILED', modified_at = now()
                WHERE j.id = ANY($1)
                  AND EXISTS (
                      SELECT 1 FROM job_task t
                      WHERE t.job_id = j.id AND t.state IN ('FAILED', 'REJECTED')
                  )
                RETURNING j.id
            ), skipped AS (
                UPDATE job_task t SET state = 'SKIPPED', modified_at = now()
                WHERE t.job_id IN (SELECT id FROM failed)
                  AND t.state IN ('READY', 'WAITING')
            )
            SELECT id FROM failed
            "#,
        )
        .bind(jobs.as_slice())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_jobs", e))?;
        commit(tx).await?;
        rows.iter().map(|row| decode_job_id(row, "id")).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_confirm_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs = lock_jobs(&mut tx, &[State::Active]).await?;
        let rows = sqlx::query(
            r#"
            UPDATE job j SET state = 'CONFIRM', modified_at = now()
            WHERE j.id = ANY($1)
              AND EXISTS (
                  SELECT 1 FROM job_task t
                  WHERE t.job_id = j.id AND t.state = 'CONFIRM'
              )
            RETURNING j.id
            "#,
        )
        .bind(jobs.as_slice())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_confirm_jobs", e))?;
        commit(tx).await?;
        rows.iter().map(|row| decode_job_id(row, "id")).collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_completed_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs = lock_jobs(&mut tx, &[State::Active, State::Confirm]).await?;
        let rows = sqlx::query(
            r#"
            UPDATE job j SET state = 'COMPLETED', modified_at = now()
            WHERE j.id = ANY($1)
              AND EXISTS (SELECT 1 FROM job_task t WHERE t.job_id = j.id)
              AND NOT EXISTS (
                  SELECT 1 FROM job_task t
                  WHERE t.job_id = j.id AND t.state <> 'COMPLETED'
              )
            RETURNING j.id
            "#,
        )
        .bind(jobs.as_slice())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_completed_jobs", e))?;
        commit(tx).await?;
        rows.iter().map(|row| decode_job_id(row, "id")).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_ready_tasks(&self, limit: usize) -> Result<Vec<TaskRef>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            UPDATE job_task SET state = 'ACTIVE', modified_at = now()
            WHERE id IN (
                SELECT t.id
                FROM job_task t
                JOIN job j ON j.id = t.job_id
                WHERE t.state = 'READY' AND j.state = 'ACTIVE'
                ORDER BY t.modified_at
                FOR UPDATE OF t, j SKIP LOCKED
                LIMIT $1
            )
            RETURNING job_id, id
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_ready_tasks", e))?;

        debug!(claimed = rows.len(), "claimed ready tasks");
        rows.iter().map(decode_task_ref).collect()
    }

    #[instrument(skip(self), err)]
    async fn expire_active_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRef>, StoreError> {
        let mut tx = self.begin().await?;
        let jobs: Vec<String> = sqlx::query(
            r#"
            SELECT j.id
            FROM job j
            WHERE EXISTS (
                SELECT 1 FROM job_task t
                WHERE t.job_id = j.id AND t.state = 'ACTIVE' AND t.modified_at < $1
            )
            ORDER BY j.id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_jobs", e))?
        .iter()
        .map(decode_id)
        .collect::<Result<_, _>>()?;

        let rows = sqlx::query(
            r#"
            WITH expired AS (
                UPDATE job_task SET state = 'TIMEOUT', modified_at = now()
                WHERE job_id = ANY($1) AND state = 'ACTIVE' AND modified_at < $2
                RETURNING job_id, id
            ), touched AS (
                UPDATE job SET modified_at = now()
                WHERE id IN (SELECT job_id FROM expired)
            )
            SELECT job_id, id FROM expired
            "#,
        )
        .bind(jobs.as_slice())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("expire_active_tasks", e))?;
        commit(tx).await?;
        rows.iter().map(decode_task_ref).collect()
    }
}

impl PostgresJobStore {
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Take the row locks of every job in one of `states`. Jobs held by an
/// `update_job` transaction are skipped and picked up by the next pass.
async fn lock_jobs(conn: &mut PgConnection, states: &[State]) -> Result<Vec<String>, StoreError> {
    let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
    sqlx::query("SELECT id FROM job WHERE state = ANY($1) ORDER BY id FOR UPDATE SKIP LOCKED")
        .bind(states)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_jobs", e))?
        .iter()
        .map(decode_id)
        .collect()
}

fn decode_id(row: &PgRow) -> Result<String, StoreError> {
    row.try_get("id")
        .map_err(|e| StoreError::Decode(format!("failed to read id: {e}")))
}

/// Load a complete job graph, optionally taking the job row lock.
async fn fetch_job(
    conn: &mut PgConnection,
    job_id: &JobId,
    for_update: bool,
) -> Result<Option<Job>, StoreError> {
    let sql = if for_update {
        JOB_SELECT_FOR_UPDATE
    } else {
        JOB_SELECT
    };
    let Some(row) = sqlx::query(sql)
        .bind(job_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?
    else {
        return Ok(None);
    };
    let header = JobRow::from_row(&row).map_err(|e| StoreError::Decode(format!("job row: {e}")))?;

    let task_rows = sqlx::query(
        r#"
        SELECT id, job_id, task_type, name, state, element_id, parameters, canary, modified_at
        FROM job_task
        WHERE job_id = $1
        ORDER BY position
        "#,
    )
    .bind(job_id.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_tasks", e))?;

    let transition_rows = sqlx::query(
        r#"
        SELECT from_task_id, to_task_id, label, seq
        FROM job_task_transition
        WHERE job_id = $1
        ORDER BY seq
        "#,
    )
    .bind(job_id.as_str())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("fetch_transitions", e))?;

    let mut tasks = Vec::with_capacity(task_rows.len());
    for row in &task_rows {
        tasks.push(
            TaskRow::from_row(row).map_err(|e| StoreError::Decode(format!("task row: {e}")))?,
        );
    }
    let mut transitions = Vec::with_capacity(transition_rows.len());
    for row in &transition_rows {
        transitions.push(
            TransitionRow::from_row(row)
                .map_err(|e| StoreError::Decode(format!("transition row: {e}")))?,
        );
    }

    header.into_job(tasks, transitions).map(Some)
}

const JOB_SELECT: &str = r#"
    SELECT id, application, job_type, name, owner, group_id,
           state, scheduled, suspend, auto_resume, modified_at
    FROM job
    WHERE id = $1
"#;

const JOB_SELECT_FOR_UPDATE: &str = r#"
    SELECT id, application, job_type, name, owner, group_id,
           state, scheduled, suspend, auto_resume, modified_at
    FROM job
    WHERE id = $1
    FOR UPDATE
"#;

/// Write back what a mutation changed: the job row, new or modified tasks,
/// and the transition set if it differs.
async fn write_changes(
    conn: &mut PgConnection,
    before: &Job,
    after: &Job,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE job
        SET name = $2, owner = $3, state = $4, scheduled = $5,
            suspend = $6, auto_resume = $7, modified_at = $8
        WHERE id = $1
        "#,
    )
    .bind(after.id().as_str())
    .bind(after.name().as_str())
    .bind(after.owner().map(|o| o.as_str()))
    .bind(after.state().as_str())
    .bind(after.schedule().scheduled)
    .bind(after.schedule().suspend)
    .bind(after.schedule().auto_resume)
    .bind(after.modified_at())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    for (position, task) in after.tasks().enumerate() {
        match before.task(task.id()) {
            None => insert_task(conn, task, position).await?,
            Some(previous) if previous != task => update_task(conn, task).await?,
            Some(_) => {}
        }
    }

    if before.transitions() != after.transitions() {
        sqlx::query("DELETE FROM job_task_transition WHERE job_id = $1")
            .bind(after.id().as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("delete_transitions", e))?;
        for transition in after.transitions() {
            insert_transition(conn, after.id(), transition).await?;
        }
    }
    Ok(())
}

async fn insert_task(
    conn: &mut PgConnection,
    task: &Task,
    position: usize,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_task (
            id, job_id, task_type, name, state, element_id,
            parameters, canary, position, modified_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(task.id().as_str())
    .bind(task.job_id().as_str())
    .bind(task.task_type().as_str())
    .bind(task.name().as_str())
    .bind(task.state().as_str())
    .bind(task.element().map(|e| e.as_str()))
    .bind(task.parameters())
    .bind(task.is_canary())
    .bind(i32::try_from(position).unwrap_or(i32::MAX))
    .bind(task.modified_at())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_task", e))?;
    Ok(())
}

async fn update_task(conn: &mut PgConnection, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE job_task SET state = $2, parameters = $3, modified_at = $4
        WHERE id = $1
        "#,
    )
    .bind(task.id().as_str())
    .bind(task.state().as_str())
    .bind(task.parameters())
    .bind(task.modified_at())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("update_task", e))?;
    Ok(())
}

async fn insert_transition(
    conn: &mut PgConnection,
    job_id: &JobId,
    transition: &Transition,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_task_transition (job_id, from_task_id, to_task_id, label, seq)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(job_id.as_str())
    .bind(transition.from.as_str())
    .bind(transition.to.as_str())
    .bind(transition.label.as_deref())
    .bind(i64::try_from(transition.seq).unwrap_or(i64::MAX))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_transition", e))?;
    Ok(())
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn decode_job_id(row: &PgRow, column: &str) -> Result<JobId, StoreError> {
    let raw: String = row
        .try_get(column)
        .map_err(|e| StoreError::Decode(format!("failed to read {column}: {e}")))?;
    JobId::try_from(raw).map_err(decode_error)
}

fn decode_task_ref(row: &PgRow) -> Result<TaskRef, StoreError> {
    let task_id: String = row
        .try_get("id")
        .map_err(|e| StoreError::Decode(format!("failed to read id: {e}")))?;
    Ok(TaskRef::new(
        decode_job_id(row, "job_id")?,
        TaskId::try_from(task_id).map_err(decode_error)?,
    ))
}

fn decode_error(err: DomainError) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error, constraint: Option<&str>) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && (constraint.is_none() || db_err.constraint() == constraint)
        }
        _ => false,
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Domain(DomainError::conflict(msg)),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: String,
    application: String,
    job_type: String,
    name: String,
    owner: Option<String>,
    group_id: Option<String>,
    state: String,
    scheduled: Option<DateTime<Utc>>,
    suspend: Option<DateTime<Utc>>,
    auto_resume: bool,
    modified_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            application: row.try_get("application")?,
            job_type: row.try_get("job_type")?,
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            group_id: row.try_get("group_id")?,
            state: row.try_get("state")?,
            scheduled: row.try_get("scheduled")?,
            suspend: row.try_get("suspend")?,
            auto_resume: row.try_get("auto_resume")?,
            modified_at: row.try_get("modified_at")?,
        })
    }
}

impl JobRow {
    fn schedule(&self) -> JobSchedule {
        JobSchedule {
            scheduled: self.scheduled,
            suspend: self.suspend,
            auto_resume: self.auto_resume,
        }
    }

    fn into_settings(self) -> Result<JobSettings, StoreError> {
        Ok(JobSettings {
            schedule: self.schedule(),
            job_id: JobId::try_from(self.id).map_err(decode_error)?,
            application: self.application.into(),
            job_type: self.job_type.into(),
            name: self.name.into(),
            owner: self.owner.map(Into::into),
            group_id: self.group_id.map(Into::into),
            state: self.state.parse().map_err(decode_error)?,
            modified_at: self.modified_at,
        })
    }

    fn into_job(
        self,
        tasks: Vec<TaskRow>,
        transitions: Vec<TransitionRow>,
    ) -> Result<Job, StoreError> {
        let schedule = self.schedule();
        let state: State = self.state.parse().map_err(decode_error)?;
        let job_id = JobId::try_from(self.id).map_err(decode_error)?;

        let mut job = Job::new(
            job_id.clone(),
            self.application.into(),
            self.job_type.into(),
            self.name.into(),
        )
        .with_schedule(schedule);
        if let Some(owner) = self.owner {
            job = job.with_owner(owner.into());
        }
        if let Some(group_id) = self.group_id {
            job = job.with_group(group_id.into());
        }

        for row in tasks {
            job.add_task(row.into_task(&job_id)?).map_err(decode_error)?;
        }
        for row in transitions {
            job.restore_transition(row.into_transition()?)
                .map_err(decode_error)?;
        }
        Ok(job.restore_state(state, self.modified_at))
    }
}

#[derive(Debug)]
struct TaskRow {
    id: String,
    task_type: String,
    name: String,
    state: String,
    element_id: Option<String>,
    parameters: serde_json::Value,
    canary: bool,
    modified_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            name: row.try_get("name")?,
            state: row.try_get("state")?,
            element_id: row.try_get("element_id")?,
            parameters: row.try_get("parameters")?,
            canary: row.try_get("canary")?,
            modified_at: row.try_get("modified_at")?,
        })
    }
}

impl TaskRow {
    fn into_task(self, job_id: &JobId) -> Result<Task, StoreError> {
        let state: State = self.state.parse().map_err(decode_error)?;
        let mut task = Task::new(
            job_id.clone(),
            TaskId::try_from(self.id).map_err(decode_error)?,
            self.task_type.into(),
            self.name.into(),
        )
        .with_parameters(self.parameters)
        .with_canary(self.canary);
        if let Some(element) = self.element_id {
            task = task.with_element(element.into());
        }
        Ok(task.restore_state(state, self.modified_at))
    }
}

#[derive(Debug)]
struct TransitionRow {
    from_task_id: String,
    to_task_id: String,
    label: Option<String>,
    seq: i64,
}

impl<'r> FromRow<'r, PgRow> for TransitionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransitionRow {
            from_task_id: row.try_get("from_task_id")?,
            to_task_id: row.try_get("to_task_id")?,
            label: row.try_get("label")?,
            seq: row.try_get("seq")?,
        })
    }
}

impl TransitionRow {
    fn into_transition(self) -> Result<Transition, StoreError> {
        let seq = u64::try_from(self.seq)
            .map_err(|_| StoreError::Decode(format!("negative transition seq {}", self.seq)))?;
        Ok(Transition::new(
            TaskId::try_from(self.from_task_id).map_err(decode_error)?,
            TaskId::try_from(self.to_task_id).map_err(decode_error)?,
            self.label,
            seq,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_a\\b"), "50\\%\\_a\\\\b");
    }

    #[test]
    fn job_row_round_trips_into_a_graph() {
        let now = Utc::now();
        let header = JobRow {
            id: "job-1".into(),
            application: "upgrade".into(),
            job_type: "rolling".into(),
            name: "leafs".into(),
            owner: Some("ops".into()),
            group_id: None,
            state: "ACTIVE".into(),
            scheduled: Some(now),
            suspend: None,
            auto_resume: false,
            modified_at: now,
        };
        let task = |id: &str, state: &str| TaskRow {
            id: id.into(),
            task_type: "noop".into(),
            name: id.into(),
            state: state.into(),
            element_id: None,
            parameters: serde_json::Value::Null,
            canary: false,
            modified_at: now,
        };
        let job = header
            .into_job(
                vec![task("start", "COMPLETED"), task("next", "READY")],
                vec![TransitionRow {
                    from_task_id: "start".into(),
                    to_task_id: "next".into(),
                    label: None,
                    seq: 4,
                }],
            )
            .unwrap();

        assert_eq!(job.state(), State::Active);
        assert_eq!(job.modified_at(), now);
        assert_eq!(job.owner().map(|o| o.as_str()), Some("ops"));
        let next: TaskId = "next".parse().unwrap();
        assert_eq!(job.predecessors(&next).len(), 1);
        assert_eq!(job.task(&next).unwrap().state(), State::Ready);
        assert_eq!(job.successors(&"start".parse().unwrap())[0].seq, 4);
    }

    #[test]
    fn unknown_states_are_decode_errors() {
        let row = JobRow {
            id: "job-1".into(),
            application: "a".into(),
            job_type: "t".into(),
            name: "n".into(),
            owner: None,
            group_id: None,
            state: "BOGUS".into(),
            scheduled: None,
            suspend: None,
            auto_resume: false,
            modified_at: Utc::now(),
        };
        assert!(matches!(row.into_settings(), Err(StoreError::Decode(_))));
    }
}
