use std::time::Duration;

use application::Outbox;
use async_trait::async_trait;
use domain::{MessageId, NewPendingMessage, PendingMessage, RepositoryError, Timestamp, UserId};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

#[derive(Debug, FromRow)]
struct PendingRecord {
    id: Uuid,
    sender_id: String,
    recipient_id: String,
    payload: String,
    created_at: OffsetDateTime,
}

impl From<PendingRecord> for PendingMessage {
    fn from(value: PendingRecord) -> Self {
        PendingMessage {
            id: MessageId::from(value.id),
            from: UserId::from(value.sender_id.as_str()),
            to: UserId::from(value.recipient_id.as_str()),
            payload: value.payload,
            created_at: value.created_at,
        }
    }
}

/// PostgreSQL 实现的发件箱
///
/// 读取时过滤掉超过保留期的记录，物理删除交给定期清理任务
/// （见 [`crate::sweeper`]），因此过期记录在清理之前也不可见。
#[derive(Clone)]
pub struct PgOutbox {
    pool: PgPool,
    retention: Duration,
}

impl PgOutbox {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    fn cutoff(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() - self.retention
    }
}

#[async_trait]
impl Outbox for PgOutbox {
    async fn insert(&self, pending: NewPendingMessage) -> Result<MessageId, RepositoryError> {
        let id = MessageId::generate();
        sqlx::query(
            r#"
            INSERT INTO pending_messages (id, sender_id, recipient_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::from(id))
        .bind(pending.from.as_str())
        .bind(pending.to.as_str())
        .bind(&pending.payload)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(id)
    }

    async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_pending_for(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<PendingMessage>, RepositoryError> {
        let records = sqlx::query_as::<_, PendingRecord>(
            r#"
            SELECT id, sender_id, recipient_id, payload, created_at
            FROM pending_messages
            WHERE recipient_id = $1 AND created_at >= $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_str())
        .bind(self.cutoff())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(records.into_iter().map(PendingMessage::from).collect())
    }

    async fn expire_older_than(&self, cutoff: Timestamp) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
