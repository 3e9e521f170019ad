//! Durable work queue backed by Postgres.
//!
//! Jobs live in `sifen_jobs` with an `available_at` timestamp, so a delayed
//! retry is just a row that becomes visible in the future. Competing workers
//! claim rows with `FOR UPDATE SKIP LOCKED`; a claim that is neither acked nor
//! released within the visibility timeout is handed out again.

pub mod audit;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use sifen_core::{WorkItem, WorkItemError};

pub use audit::{write_audit_event, AuditEvent};

/// Pause applied when a claim is released back to the queue.
const REQUEUE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid work item: {0}")]
    InvalidItem(#[from] WorkItemError),
}

/// A claimed job. Every delivery must end in exactly one of
/// [`WorkQueue::ack`], [`WorkQueue::requeue`] or [`WorkQueue::reject`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub body: Vec<u8>,
}

/// Schedules the follow-up status query after a batch is accepted.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn schedule_query(&self, invoice_id: i64, attempt: u32) -> Result<(), QueueError>;
}

pub struct WorkQueue {
    pool: PgPool,
    delay: Duration,
    visibility_timeout: Duration,
}

impl WorkQueue {
    pub fn new(pool: PgPool, delay: Duration, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            delay,
            visibility_timeout,
        }
    }

    /// Creates the job and dead-letter tables when they do not exist yet.
    pub async fn declare(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sifen_jobs (
                id           UUID PRIMARY KEY,
                body         BYTEA NOT NULL,
                available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                claimed_at   TIMESTAMPTZ,
                enqueued_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sifen_dead_letters (
                id        UUID PRIMARY KEY,
                body      BYTEA NOT NULL,
                reason    TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sifen_jobs_available_at_idx \
             ON sifen_jobs (available_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enqueues an item for immediate delivery.
    pub async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.insert_job(item, Duration::ZERO).await
    }

    /// Enqueues an item that becomes visible after the configured delay.
    pub async fn publish_delayed(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.insert_job(item, self.delay).await
    }

    async fn insert_job(&self, item: &WorkItem, delay: Duration) -> Result<(), QueueError> {
        let id = Uuid::new_v4();
        let body = item.encode()?;
        sqlx::query(
            "INSERT INTO sifen_jobs (id, body, available_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3))",
        )
        .bind(id)
        .bind(&body)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        tracing::debug!(
            job_id = %id,
            invoice_id = item.invoice_id,
            action = item.action.wire_name(),
            delay_secs = delay.as_secs(),
            "job enqueued"
        );
        Ok(())
    }

    /// Claims the oldest visible job, if any. Claims that outlive the
    /// visibility timeout are treated as abandoned and handed out again.
    pub async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE sifen_jobs
            SET claimed_at = now()
            WHERE id = (
                SELECT id FROM sifen_jobs
                WHERE available_at <= now()
                  AND (claimed_at IS NULL
                       OR claimed_at < now() - make_interval(secs => $1))
                ORDER BY available_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, body
            "#,
        )
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            id: row.get("id"),
            body: row.get("body"),
        }))
    }

    /// Removes a processed job.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM sifen_jobs WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Releases the claim. The job becomes visible again after a short
    /// pause, so a database or network outage does not spin the same job
    /// at the poll rate.
    pub async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE sifen_jobs \
             SET claimed_at = NULL, available_at = now() + make_interval(secs => $2) \
             WHERE id = $1",
        )
        .bind(delivery.id)
        .bind(REQUEUE_BACKOFF.as_secs_f64())
        .execute(&self.pool)
        .await?;
        tracing::warn!(job_id = %delivery.id, "job released for redelivery");
        Ok(())
    }

    /// Moves an unprocessable job to the dead-letter table.
    pub async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO sifen_dead_letters (id, body, reason) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(delivery.id)
        .bind(&delivery.body)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sifen_jobs WHERE id = $1")
            .bind(delivery.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::error!(job_id = %delivery.id, reason, "job dead-lettered");
        Ok(())
    }

    /// Asks for an invoice to be signed and submitted.
    pub async fn request_send(&self, invoice_id: i64) -> Result<(), QueueError> {
        self.publish(&WorkItem::send(invoice_id)).await
    }

    /// Asks for a batch status query, delayed so the remote side has time
    /// to finish processing.
    pub async fn request_query(&self, invoice_id: i64, attempt: u32) -> Result<(), QueueError> {
        self.publish_delayed(&WorkItem::query(invoice_id, attempt))
            .await
    }

    /// Asks for a cancellation event. The reason is validated before the
    /// job is stored.
    pub async fn request_cancellation(
        &self,
        invoice_id: i64,
        reason: &str,
    ) -> Result<(), QueueError> {
        let item = WorkItem::cancel(invoice_id, reason)?;
        self.publish(&item).await
    }
}

#[async_trait]
impl RetryScheduler for WorkQueue {
    async fn schedule_query(&self, invoice_id: i64, attempt: u32) -> Result<(), QueueError> {
        self.request_query(invoice_id, attempt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sifen_core::Action;

    fn queue(pool: PgPool) -> WorkQueue {
        WorkQueue::new(pool, Duration::from_secs(30), Duration::from_secs(300))
    }

    #[sqlx::test]
    async fn delayed_job_stays_invisible_until_its_time(pool: PgPool) {
        let queue = queue(pool);
        queue.declare().await.unwrap();

        queue.request_query(7, 2).await.unwrap();
        assert!(queue.claim().await.unwrap().is_none());

        // An immediate job claims right away; the delayed one stays hidden.
        queue.request_send(8).await.unwrap();
        let delivery = queue.claim().await.unwrap().unwrap();
        let item = WorkItem::decode(&delivery.body).unwrap();
        assert_eq!(item.invoice_id, 8);
        assert_eq!(item.action, Action::Send);
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn acked_job_is_gone(pool: PgPool) {
        let queue = queue(pool);
        queue.declare().await.unwrap();

        queue.request_send(1).await.unwrap();
        let delivery = queue.claim().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();

        assert!(queue.claim().await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn stale_claim_is_handed_out_again(pool: PgPool) {
        let queue = WorkQueue::new(pool, Duration::from_secs(30), Duration::ZERO);
        queue.declare().await.unwrap();

        queue.request_send(2).await.unwrap();
        let first = queue.claim().await.unwrap().unwrap();
        // With a zero visibility timeout the claim expires immediately.
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.body, second.body);
    }

    #[sqlx::test]
    async fn claimed_job_is_invisible_to_other_workers(pool: PgPool) {
        let queue = queue(pool);
        queue.declare().await.unwrap();

        queue.request_send(3).await.unwrap();
        assert!(queue.claim().await.unwrap().is_some());
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn requeued_job_backs_off_before_redelivery(pool: PgPool) {
        let queue = queue(pool);
        queue.declare().await.unwrap();

        queue.request_send(4).await.unwrap();
        let delivery = queue.claim().await.unwrap().unwrap();
        queue.requeue(&delivery).await.unwrap();

        // Released, but not deliverable again at the poll rate.
        assert!(queue.claim().await.unwrap().is_none());
        let row = sqlx::query(
            "SELECT claimed_at IS NULL AS released, available_at > now() AS paused \
             FROM sifen_jobs WHERE id = $1",
        )
        .bind(delivery.id)
        .fetch_one(&queue.pool)
        .await
        .unwrap();
        assert!(row.get::<bool, _>("released"));
        assert!(row.get::<bool, _>("paused"));
    }

    #[sqlx::test]
    async fn rejected_job_moves_to_dead_letters(pool: PgPool) {
        let queue = queue(pool.clone());
        queue.declare().await.unwrap();

        queue.request_send(5).await.unwrap();
        let delivery = queue.claim().await.unwrap().unwrap();
        queue
            .reject(&delivery, "unknown action: explodir")
            .await
            .unwrap();

        assert!(queue.claim().await.unwrap().is_none());
        let jobs: i64 = sqlx::query_scalar("SELECT count(*) FROM sifen_jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(jobs, 0);

        let row = sqlx::query("SELECT body, reason FROM sifen_dead_letters WHERE id = $1")
            .bind(delivery.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<Vec<u8>, _>("body"), delivery.body);
        assert_eq!(row.get::<String, _>("reason"), "unknown action: explodir");
    }
}
