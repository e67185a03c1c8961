use async_trait::async_trait;
use domain::{MessageId, NewPendingMessage, PendingMessage, RepositoryError, Timestamp, UserId};

/// 待投递消息存储（发件箱）
///
/// 接收方离线时消息被写入这里，设备重连后重放，客户端确认后删除。
/// 实现方需要自行保证超过保留期的记录不再可见：
/// 过期是静默的，调用方把消失的记录视为可接受的丢失，而不是错误。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Outbox: Send + Sync {
    /// 写入一条待投递消息，返回存储分配的ID
    async fn insert(&self, pending: NewPendingMessage) -> Result<MessageId, RepositoryError>;

    /// 按ID删除，幂等；返回是否真的删除了记录
    async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError>;

    /// 按创建时间升序列出某用户的待投递消息
    async fn list_pending_for(&self, user_id: &UserId)
        -> Result<Vec<PendingMessage>, RepositoryError>;

    /// 删除创建时间早于 `cutoff` 的记录，返回删除条数
    async fn expire_older_than(&self, cutoff: Timestamp) -> Result<u64, RepositoryError>;
}

/// 内存实现的发件箱（用于测试和无数据库的开发环境）
pub mod memory {
    use super::*;
    use crate::clock::Clock;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    pub struct MemoryOutbox {
        records: RwLock<Vec<PendingMessage>>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    }

    impl MemoryOutbox {
        pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Self {
            Self {
                records: RwLock::new(Vec::new()),
                clock,
                retention,
            }
        }

        fn cutoff(&self) -> Timestamp {
            self.clock.now() - self.retention
        }

        /// 当前仍在保留期内的记录数
        pub async fn len(&self) -> usize {
            let cutoff = self.cutoff();
            let records = self.records.read().await;
            records.iter().filter(|r| r.created_at >= cutoff).count()
        }

        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }
    }

    #[async_trait]
    impl Outbox for MemoryOutbox {
        async fn insert(&self, pending: NewPendingMessage) -> Result<MessageId, RepositoryError> {
            let id = MessageId::generate();
            let record = PendingMessage {
                id,
                from: pending.from,
                to: pending.to,
                payload: pending.payload,
                created_at: self.clock.now(),
            };
            self.records.write().await.push(record);
            Ok(id)
        }

        async fn delete(&self, id: MessageId) -> Result<bool, RepositoryError> {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        }

        async fn list_pending_for(
            &self,
            user_id: &UserId,
        ) -> Result<Vec<PendingMessage>, RepositoryError> {
            let cutoff = self.cutoff();
            let records = self.records.read().await;
            let mut pending: Vec<PendingMessage> = records
                .iter()
                .filter(|r| &r.to == user_id && r.created_at >= cutoff)
                .cloned()
                .collect();
            // 稳定排序，同一时刻写入的记录保持插入顺序
            pending.sort_by_key(|r| r.created_at);
            Ok(pending)
        }

        async fn expire_older_than(&self, cutoff: Timestamp) -> Result<u64, RepositoryError> {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|r| r.created_at >= cutoff);
            Ok((before - records.len()) as u64)
        }
    }

}
