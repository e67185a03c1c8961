use std::sync::Arc;
use std::time::Duration;

use domain::{Frame, Message, NewPendingMessage, UserId};
use tokio::sync::oneshot;

use crate::outbox::Outbox;
use crate::presence::PresenceRegistry;
use crate::session::OutboundPayload;

/// 投递分发器：把消息推给接收方的在线会话，都推不进去时写入发件箱。
///
/// 由协调器在自己的任务里调用；发件箱写入在独立任务中进行，不阻塞协调器。
pub struct Dispatcher {
    outbox: Arc<dyn Outbox>,
    write_timeout: Duration,
}

impl Dispatcher {
    pub fn new(outbox: Arc<dyn Outbox>, write_timeout: Duration) -> Self {
        Self {
            outbox,
            write_timeout,
        }
    }

    /// 路由一条消息，返回是否至少有一个会话成功入队。
    ///
    /// `reply` 在结果确定后收到同样的值；未投递时要等持久化尝试结束才回复。
    pub fn route(
        &self,
        registry: &PresenceRegistry,
        message: Message,
        reply: Option<oneshot::Sender<bool>>,
    ) -> bool {
        let delivered = match Frame::Message(message.clone()).to_json() {
            Ok(json) => fan_out(registry, &message.to, &OutboundPayload::from(json)) > 0,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize message");
                false
            }
        };

        if delivered {
            tracing::debug!(from = %message.from, to = %message.to, "message delivered live");
            if let Some(reply) = reply {
                let _ = reply.send(true);
            }
        } else {
            self.persist(message, reply);
        }
        delivered
    }

    fn persist(&self, message: Message, reply: Option<oneshot::Sender<bool>>) {
        let outbox = self.outbox.clone();
        let write_timeout = self.write_timeout;

        tokio::spawn(async move {
            let pending = NewPendingMessage::from(&message);
            match tokio::time::timeout(write_timeout, outbox.insert(pending)).await {
                Ok(Ok(id)) => {
                    tracing::debug!(
                        id = %id,
                        from = %message.from,
                        to = %message.to,
                        "message stored for later delivery"
                    );
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, to = %message.to, "failed to store pending message");
                }
                Err(_) => {
                    tracing::error!(to = %message.to, "storing pending message timed out");
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(false);
            }
        });
    }
}

/// 非阻塞地把同一份负载推给用户的全部在线会话，返回成功入队的会话数
pub fn fan_out(registry: &PresenceRegistry, user_id: &UserId, payload: &OutboundPayload) -> usize {
    registry
        .lookup_sessions(user_id)
        .filter(|session| session.try_enqueue(payload))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::outbox::{memory::MemoryOutbox, MockOutbox};
    use crate::session::{SessionHandle, SessionKey};
    use domain::RepositoryError;

    fn message(from: &str, to: &str, content: &str) -> Message {
        Message {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            timestamp: 1_700_000_000,
            id: String::new(),
        }
    }

    fn memory_outbox() -> Arc<MemoryOutbox> {
        Arc::new(MemoryOutbox::new(
            Arc::new(SystemClock),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn live_recipient_gets_one_copy_per_device() {
        let outbox = memory_outbox();
        let dispatcher = Dispatcher::new(outbox.clone(), Duration::from_secs(5));
        let mut registry = PresenceRegistry::new();
        let (phone, mut phone_rx) = SessionHandle::new(SessionKey::new("B".into(), "phone".into()), 8);
        let (laptop, mut laptop_rx) =
            SessionHandle::new(SessionKey::new("B".into(), "laptop".into()), 8);
        registry.register(phone);
        registry.register(laptop);

        let (tx, rx) = oneshot::channel();
        assert!(dispatcher.route(&registry, message("A", "B", "hi"), Some(tx)));
        assert!(rx.await.unwrap());

        for queue in [&mut phone_rx, &mut laptop_rx] {
            let frame = queue.try_recv().expect("one copy");
            let Frame::Message(received) = Frame::parse(&frame).unwrap() else {
                panic!("expected message frame");
            };
            assert_eq!(received.content, "hi");
            assert!(queue.try_recv().is_err());
        }
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn offline_recipient_gets_exactly_one_pending_record() {
        let outbox = memory_outbox();
        let dispatcher = Dispatcher::new(outbox.clone(), Duration::from_secs(5));
        let registry = PresenceRegistry::new();

        let (tx, rx) = oneshot::channel();
        assert!(!dispatcher.route(&registry, message("A", "B", "hi"), Some(tx)));
        assert!(!rx.await.unwrap());

        let pending = outbox.list_pending_for(&"B".into()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].from.as_str(), "A");
        assert_eq!(pending[0].to.as_str(), "B");
        assert_eq!(pending[0].payload, "hi");
    }

    #[tokio::test]
    async fn full_queues_fall_back_to_outbox() {
        let outbox = memory_outbox();
        let dispatcher = Dispatcher::new(outbox.clone(), Duration::from_secs(5));
        let mut registry = PresenceRegistry::new();
        let (phone, _phone_rx) = SessionHandle::new(SessionKey::new("B".into(), "phone".into()), 1);
        assert!(phone.try_enqueue(&OutboundPayload::from("filler")));
        registry.register(phone);

        let (tx, rx) = oneshot::channel();
        assert!(!dispatcher.route(&registry, message("A", "B", "hi"), Some(tx)));
        assert!(!rx.await.unwrap());
        assert_eq!(outbox.len().await, 1);
    }

    #[tokio::test]
    async fn one_full_queue_does_not_fail_the_route() {
        let outbox = memory_outbox();
        let dispatcher = Dispatcher::new(outbox.clone(), Duration::from_secs(5));
        let mut registry = PresenceRegistry::new();
        let (full, _full_rx) = SessionHandle::new(SessionKey::new("B".into(), "phone".into()), 1);
        assert!(full.try_enqueue(&OutboundPayload::from("filler")));
        let (open, mut open_rx) = SessionHandle::new(SessionKey::new("B".into(), "laptop".into()), 4);
        registry.register(full);
        registry.register(open);

        assert!(dispatcher.route(&registry, message("A", "B", "hi"), None));
        assert!(open_rx.try_recv().is_ok());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_as_undelivered() {
        let mut outbox = MockOutbox::new();
        outbox
            .expect_insert()
            .times(1)
            .returning(|_| Err(RepositoryError::storage("connection refused")));
        let dispatcher = Dispatcher::new(Arc::new(outbox), Duration::from_secs(5));

        let (tx, rx) = oneshot::channel();
        assert!(!dispatcher.route(&PresenceRegistry::new(), message("A", "B", "hi"), Some(tx)));
        assert!(!rx.await.unwrap());
    }
}
