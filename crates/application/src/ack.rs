use std::sync::Arc;
use std::time::Duration;

use domain::{Ack, Frame, MessageId};

use crate::hub::HubHandle;
use crate::outbox::Outbox;
use crate::session::OutboundPayload;

/// 确认处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// `messageId` 无法解析，确认被丢弃
    InvalidMessageId,
    Processed {
        /// 发件箱中是否确实删除了记录
        removed: bool,
        /// 收到确认通知的发送方会话数
        notified: usize,
    },
}

/// 确认处理器：删除已确认的待投递消息，并把确认转发给原发送方。
pub struct AckProcessor {
    outbox: Arc<dyn Outbox>,
    hub: HubHandle,
    write_timeout: Duration,
}

impl AckProcessor {
    pub fn new(outbox: Arc<dyn Outbox>, hub: HubHandle, write_timeout: Duration) -> Self {
        Self {
            outbox,
            hub,
            write_timeout,
        }
    }

    /// 处理一条已经通过身份校验（`to` 等于当前会话用户）的确认
    pub async fn process(&self, ack: Ack) -> AckOutcome {
        let id = match MessageId::parse(&ack.message_id) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(error = %err, message_id = %ack.message_id, "invalid message id in ack");
                return AckOutcome::InvalidMessageId;
            }
        };

        let removed = match tokio::time::timeout(self.write_timeout, self.outbox.delete(id)).await
        {
            Ok(Ok(removed)) => removed,
            Ok(Err(err)) => {
                tracing::error!(error = %err, id = %id, "failed to delete acknowledged message");
                false
            }
            Err(_) => {
                tracing::error!(id = %id, "deleting acknowledged message timed out");
                false
            }
        };

        // 无论是否删到记录，都通知原发送方
        let notified = match Frame::Ack(ack.clone()).to_json() {
            Ok(json) => match self.hub.notify(ack.from.clone(), OutboundPayload::from(json)).await {
                Ok(notified) => notified,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to notify sender of ack");
                    0
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize ack");
                0
            }
        };

        tracing::debug!(id = %id, removed, notified, sender = %ack.from, "ack processed");
        AckOutcome::Processed { removed, notified }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::hub::Hub;
    use crate::outbox::{memory::MemoryOutbox, MockOutbox};
    use config::HubConfig;
    use domain::{NewPendingMessage, RepositoryError};

    fn ack(message_id: &str) -> Ack {
        Ack {
            message_id: message_id.into(),
            from: "A".into(),
            to: "B".into(),
        }
    }

    async fn stored(outbox: &MemoryOutbox) -> MessageId {
        outbox
            .insert(NewPendingMessage {
                from: "A".into(),
                to: "B".into(),
                payload: "hi".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deletes_pending_and_notifies_sender_devices() {
        let outbox = Arc::new(MemoryOutbox::new(Arc::new(SystemClock), Duration::from_secs(60)));
        let (hub, _task) = Hub::spawn(outbox.clone(), &HubConfig::default());
        let (a1, mut a1_rx) = hub.open_session("A".into(), "a1".into());
        let (a2, mut a2_rx) = hub.open_session("A".into(), "a2".into());
        hub.register(a1).await.unwrap();
        hub.register(a2).await.unwrap();

        let id = stored(&outbox).await;
        let processor = AckProcessor::new(outbox.clone(), hub, Duration::from_secs(5));

        let outcome = processor.process(ack(&id.to_string())).await;
        assert_eq!(
            outcome,
            AckOutcome::Processed {
                removed: true,
                notified: 2
            }
        );
        assert!(outbox.is_empty().await);

        for queue in [&mut a1_rx, &mut a2_rx] {
            let frame = queue.recv().await.unwrap();
            let Frame::Ack(forwarded) = Frame::parse(&frame).unwrap() else {
                panic!("expected ack frame");
            };
            assert_eq!(forwarded.message_id, id.to_string());
            assert!(queue.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn double_ack_is_a_no_op_for_storage() {
        let outbox = Arc::new(MemoryOutbox::new(Arc::new(SystemClock), Duration::from_secs(60)));
        let (hub, _task) = Hub::spawn(outbox.clone(), &HubConfig::default());
        let id = stored(&outbox).await;
        let processor = AckProcessor::new(outbox.clone(), hub, Duration::from_secs(5));

        let first = processor.process(ack(&id.to_string())).await;
        let second = processor.process(ack(&id.to_string())).await;
        assert_eq!(first, AckOutcome::Processed { removed: true, notified: 0 });
        assert_eq!(second, AckOutcome::Processed { removed: false, notified: 0 });
    }

    #[tokio::test]
    async fn unparseable_id_is_dropped() {
        let mut outbox = MockOutbox::new();
        outbox.expect_delete().never();
        let (hub, _task) = Hub::spawn(
            Arc::new(MemoryOutbox::new(Arc::new(SystemClock), Duration::from_secs(60))),
            &HubConfig::default(),
        );
        let processor = AckProcessor::new(Arc::new(outbox), hub, Duration::from_secs(5));

        assert_eq!(
            processor.process(ack("not-a-uuid")).await,
            AckOutcome::InvalidMessageId
        );
    }

    #[tokio::test]
    async fn storage_failure_still_notifies_sender() {
        let mut outbox = MockOutbox::new();
        outbox
            .expect_delete()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("down")));
        let (hub, _task) = Hub::spawn(
            Arc::new(MemoryOutbox::new(Arc::new(SystemClock), Duration::from_secs(60))),
            &HubConfig::default(),
        );
        let (a1, mut a1_rx) = hub.open_session("A".into(), "a1".into());
        hub.register(a1).await.unwrap();
        let processor = AckProcessor::new(Arc::new(outbox), hub, Duration::from_secs(5));

        let outcome = processor.process(ack(&MessageId::generate().to_string())).await;
        assert_eq!(outcome, AckOutcome::Processed { removed: false, notified: 1 });
        assert!(a1_rx.recv().await.is_some());
    }
}
