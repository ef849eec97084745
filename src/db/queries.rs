use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::job::{
    ClaimOutcome, ClaimRecord, FailOutcome, Job, JobStatus, NewJob, ReclaimedJob, StatusKind,
    StatusTally, WorkerId,
};

const JOB_COLUMNS: &str =
    "id, input_ref, status, attempts, claimed_by, claimed_at, created_at, updated_at, result";

/// Jobs a claim may pick: not running, not succeeded, attempts left.
fn eligible(max: u8) -> String {
    format!("j.status IN ('unclaimed', 'failed') AND j.attempts < ?{max}")
}

/// Restricts a run with a batch limit to the jobs it already owns once the
/// limit is reached. The distinct-job count is read inside the same
/// statement that uses it.
fn in_scope(run: u8, limit: u8) -> String {
    format!(
        "(?{limit} IS NULL
          OR j.id IN (SELECT c.job_id FROM claim_log c WHERE c.run_id = ?{run})
          OR (SELECT COUNT(DISTINCT c.job_id) FROM claim_log c WHERE c.run_id = ?{run}) < ?{limit})"
    )
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| sqlx::Error::Decode(format!("timestamp out of range: {ms}").into()))
}

fn decode_attempts(raw: i64) -> Result<u32, sqlx::Error> {
    u32::try_from(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_kind(raw: &str) -> Result<StatusKind, sqlx::Error> {
    StatusKind::from_str(raw).map_err(|_| sqlx::Error::Decode(format!("unknown job status: {raw}").into()))
}

fn parse_job_row(row: &SqliteRow) -> Result<Job, sqlx::Error> {
    let kind = parse_kind(row.try_get::<&str, _>("status")?)?;
    let claimed_by: Option<String> = row.try_get("claimed_by")?;
    let claimed_by = claimed_by.map(WorkerId::new);

    let status = match kind {
        StatusKind::Unclaimed => JobStatus::Unclaimed,
        StatusKind::Success => JobStatus::Success,
        StatusKind::Failed => JobStatus::Failed,
        StatusKind::Claimed => JobStatus::Claimed {
            worker_id: claimed_by
                .clone()
                .ok_or_else(|| sqlx::Error::Decode("claimed job without claimed_by".into()))?,
        },
    };

    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Job {
        id: row.try_get("id")?,
        input_ref: row.try_get("input_ref")?,
        status,
        attempts: decode_attempts(row.try_get("attempts")?)?,
        claimed_by,
        claimed_at: row
            .try_get::<Option<i64>, _>("claimed_at")?
            .map(from_millis)
            .transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        result,
    })
}

/// Seed jobs. Ids already present are left untouched.
pub async fn insert_jobs(
    pool: &SqlitePool,
    jobs: &[NewJob],
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let now = to_millis(now);
    let mut inserted = 0;
    let mut tx = pool.begin().await?;

    for job in jobs {
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs (id, input_ref, status, attempts, created_at, updated_at)
            VALUES (?1, ?2, 'unclaimed', 0, ?3, ?3)
            "#,
        )
        .bind(&job.id)
        .bind(&job.input_ref)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        inserted += done.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Get a job by ID
pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(parse_job_row).transpose()
}

/// List jobs in creation order, optionally restricted to one status.
pub async fn list_jobs(
    pool: &SqlitePool,
    status: Option<StatusKind>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE ?1 IS NULL OR status = ?1 ORDER BY seq ASC LIMIT ?2"
    ))
    .bind(status.map(|s| s.as_ref().to_string()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(parse_job_row).collect()
}

/// Atomically claim the next eligible job for `worker`.
///
/// Selection and the status change happen in one `UPDATE`; the outer
/// `WHERE` repeats the eligibility test so a row changed by a concurrent
/// claim is never taken twice. The claim-log row is written in the same
/// transaction.
pub async fn claim_next(
    pool: &SqlitePool,
    worker: &WorkerId,
    run_id: &str,
    batch_limit: Option<u32>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let now = to_millis(now);
    let sql = format!(
        r#"
        UPDATE jobs
        SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
        WHERE seq = (
            SELECT j.seq FROM jobs j
            WHERE {eligible}
              AND {scope}
            ORDER BY (j.attempts > 0) ASC, j.seq ASC
            LIMIT 1
        )
        AND status IN ('unclaimed', 'failed') AND attempts < ?3
        RETURNING {JOB_COLUMNS}
        "#,
        eligible = eligible(3),
        scope = in_scope(4, 5),
    );

    let mut tx = pool.begin().await?;

    let row = sqlx::query(&sql)
        .bind(worker.as_str())
        .bind(now)
        .bind(i64::from(max_attempts))
        .bind(run_id)
        .bind(batch_limit.map(i64::from))
        .fetch_optional(&mut *tx)
        .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let job = parse_job_row(&row)?;

    sqlx::query(
        r#"
        INSERT INTO claim_log (job_id, worker_id, run_id, claimed_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(&job.id)
    .bind(worker.as_str())
    .bind(run_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(job))
}

async fn close_claim(
    conn: &mut sqlx::SqliteConnection,
    job_id: &str,
    worker: Option<&str>,
    outcome: ClaimOutcome,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE claim_log
        SET released_at = ?1, outcome = ?2
        WHERE job_id = ?3 AND released_at IS NULL AND (?4 IS NULL OR worker_id = ?4)
        "#,
    )
    .bind(now)
    .bind(outcome.as_ref())
    .bind(job_id)
    .bind(worker)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a successful attempt. Returns the new attempt count, or `None` when
/// `worker` no longer holds the claim.
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: &str,
    worker: &WorkerId,
    result: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<Option<u32>, sqlx::Error> {
    let now = to_millis(now);
    let result = serde_json::to_string(result).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'success', attempts = attempts + 1, result = ?3, updated_at = ?4
        WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2
        RETURNING attempts
        "#,
    )
    .bind(job_id)
    .bind(worker.as_str())
    .bind(result)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let attempts = decode_attempts(row.try_get("attempts")?)?;

    close_claim(&mut tx, job_id, Some(worker.as_str()), ClaimOutcome::Success, now).await?;
    tx.commit().await?;
    Ok(Some(attempts))
}

/// Record a failed attempt. The job returns to `unclaimed` while attempts
/// remain and becomes terminal `failed` otherwise. `None` when `worker` no
/// longer holds the claim.
pub async fn fail_job(
    pool: &SqlitePool,
    job_id: &str,
    worker: &WorkerId,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Option<FailOutcome>, sqlx::Error> {
    let now = to_millis(now);
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        UPDATE jobs
        SET attempts = attempts + 1,
            status = CASE WHEN attempts + 1 >= ?3 THEN 'failed' ELSE 'unclaimed' END,
            updated_at = ?4
        WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2
        RETURNING attempts, status
        "#,
    )
    .bind(job_id)
    .bind(worker.as_str())
    .bind(i64::from(max_attempts))
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let outcome = FailOutcome {
        attempts: decode_attempts(row.try_get("attempts")?)?,
        exhausted: parse_kind(row.try_get::<&str, _>("status")?)? == StatusKind::Failed,
    };
    let logged = if outcome.exhausted {
        ClaimOutcome::Failed
    } else {
        ClaimOutcome::Retry
    };

    close_claim(&mut tx, job_id, Some(worker.as_str()), logged, now).await?;
    tx.commit().await?;
    Ok(Some(outcome))
}

/// Apply failed-attempt semantics to every claim older than `cutoff`.
pub async fn reclaim_stale(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Vec<ReclaimedJob>, sqlx::Error> {
    let now = to_millis(now);
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        UPDATE jobs
        SET attempts = attempts + 1,
            status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'unclaimed' END,
            updated_at = ?3
        WHERE status = 'claimed' AND claimed_at < ?1
        RETURNING id, claimed_by, claimed_at, attempts, status
        "#,
    )
    .bind(to_millis(cutoff))
    .bind(i64::from(max_attempts))
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let mut reclaimed = Vec::with_capacity(rows.len());
    for row in &rows {
        let job = ReclaimedJob {
            id: row.try_get("id")?,
            worker_id: row.try_get::<Option<String>, _>("claimed_by")?.map(WorkerId::new),
            claimed_at: row
                .try_get::<Option<i64>, _>("claimed_at")?
                .map(from_millis)
                .transpose()?,
            outcome: FailOutcome {
                attempts: decode_attempts(row.try_get("attempts")?)?,
                exhausted: parse_kind(row.try_get::<&str, _>("status")?)? == StatusKind::Failed,
            },
        };
        close_claim(&mut tx, &job.id, None, ClaimOutcome::Reclaimed, now).await?;
        reclaimed.push(job);
    }

    tx.commit().await?;
    Ok(reclaimed)
}

/// Whether the run could still claim, or is waiting on, any job.
pub async fn has_outstanding_work(
    pool: &SqlitePool,
    run_id: &str,
    batch_limit: Option<u32>,
    max_attempts: u32,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM jobs j
            WHERE (j.status = 'claimed' OR ({eligible}))
              AND {scope}
        ) AS outstanding
        "#,
        eligible = eligible(1),
        scope = in_scope(2, 3),
    );

    let row = sqlx::query(&sql)
        .bind(i64::from(max_attempts))
        .bind(run_id)
        .bind(batch_limit.map(i64::from))
        .fetch_one(pool)
        .await?;

    Ok(row.try_get::<i64, _>("outstanding")? != 0)
}

/// Count jobs per status.
pub async fn status_tally(pool: &SqlitePool) -> Result<StatusTally, sqlx::Error> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
        .fetch_all(pool)
        .await?;

    let mut tally = StatusTally::default();
    for row in &rows {
        let kind = parse_kind(row.try_get::<&str, _>("status")?)?;
        let count: i64 = row.try_get("n")?;
        tally.add(kind, u64::try_from(count).unwrap_or_default());
    }
    Ok(tally)
}

/// Operator reset of one job: back to `unclaimed` with no attempts and no
/// result. A job currently claimed is left alone.
pub async fn reset_job(
    pool: &SqlitePool,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'unclaimed', attempts = 0, result = NULL, updated_at = ?2
        WHERE id = ?1 AND status <> 'claimed'
        "#,
    )
    .bind(job_id)
    .bind(to_millis(now))
    .execute(pool)
    .await?;

    Ok(done.rows_affected() == 1)
}

/// Operator reset of every terminally failed job.
pub async fn reset_failed(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'unclaimed', attempts = 0, updated_at = ?1
        WHERE status = 'failed'
        "#,
    )
    .bind(to_millis(now))
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Claim-log rows for one job, oldest first.
pub async fn claim_history(
    pool: &SqlitePool,
    job_id: &str,
) -> Result<Vec<ClaimRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, worker_id, run_id, claimed_at, released_at, outcome
        FROM claim_log
        WHERE job_id = ?1
        ORDER BY seq ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            let outcome = r
                .try_get::<Option<&str>, _>("outcome")?
                .map(|raw| {
                    ClaimOutcome::from_str(raw).map_err(|_| {
                        sqlx::Error::Decode(format!("unknown claim outcome: {raw}").into())
                    })
                })
                .transpose()?;

            Ok(ClaimRecord {
                job_id: r.try_get("job_id")?,
                worker_id: WorkerId::new(r.try_get::<String, _>("worker_id")?),
                run_id: r.try_get("run_id")?,
                claimed_at: from_millis(r.try_get("claimed_at")?)?,
                released_at: r
                    .try_get::<Option<i64>, _>("released_at")?
                    .map(from_millis)
                    .transpose()?,
                outcome,
            })
        })
        .collect()
}

/// Check store connectivity (for health checks).
pub async fn ping(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
