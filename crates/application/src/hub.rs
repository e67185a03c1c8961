//! 中枢协调器
//!
//! 单个 tokio 任务独占在线状态表，按顺序处理命令通道里的 登记/注销/路由/通知/查询。
//! 在线状态只在这里被修改，不需要细粒度锁；发件箱 I/O 一律放到独立任务中，
//! 协调器本身从不等待存储。

use std::sync::Arc;
use std::time::Duration;

use config::HubConfig;
use domain::{DeviceId, Message, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backlog;
use crate::dispatcher::{fan_out, Dispatcher};
use crate::error::ApplicationError;
use crate::outbox::Outbox;
use crate::presence::PresenceRegistry;
use crate::session::{OutboundPayload, SessionHandle, SessionKey};

/// 协调器命令
#[derive(Debug)]
pub enum HubCommand {
    Register(SessionHandle),
    Unregister {
        key: SessionKey,
        connection_id: Uuid,
    },
    Route {
        message: Message,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// 推给用户所有在线会话，不落发件箱
    Notify {
        user_id: UserId,
        payload: OutboundPayload,
        reply: Option<oneshot::Sender<usize>>,
    },
    Lookup {
        user_id: UserId,
        reply: oneshot::Sender<Vec<SessionHandle>>,
    },
    /// 关闭全部会话并拒绝新的登记；所有会话注销后回复
    Shutdown { reply: oneshot::Sender<()> },
}

pub struct Hub {
    registry: PresenceRegistry,
    dispatcher: Dispatcher,
    outbox: Arc<dyn Outbox>,
    backlog_timeout: Duration,
    commands: mpsc::Receiver<HubCommand>,
    /// 停机中：等待最后一个会话注销
    draining: Option<Vec<oneshot::Sender<()>>>,
}

impl Hub {
    /// 启动协调器任务。所有 [`HubHandle`] 都被释放后任务自行退出。
    pub fn spawn(outbox: Arc<dyn Outbox>, config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (handle, commands) = HubHandle::channel(config.command_buffer, config.queue_capacity);
        let hub = Hub {
            registry: PresenceRegistry::new(),
            dispatcher: Dispatcher::new(outbox.clone(), config.outbox_write_timeout()),
            outbox,
            backlog_timeout: config.backlog_timeout(),
            commands,
            draining: None,
        };
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    async fn run(mut self) {
        tracing::info!("hub coordinator started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        tracing::info!(
            online_users = self.registry.user_count(),
            "hub coordinator stopped"
        );
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(session) => self.register(session),
            HubCommand::Unregister { key, connection_id } => {
                if let Some(session) = self.registry.unregister(&key, connection_id) {
                    session.close();
                    tracing::info!(
                        user_id = %key.user_id,
                        device_id = %key.device_id,
                        "session unregistered"
                    );
                }
                self.finish_drain();
            }
            HubCommand::Route { message, reply } => {
                self.dispatcher.route(&self.registry, message, reply);
            }
            HubCommand::Notify {
                user_id,
                payload,
                reply,
            } => {
                let notified = fan_out(&self.registry, &user_id, &payload);
                if let Some(reply) = reply {
                    let _ = reply.send(notified);
                }
            }
            HubCommand::Lookup { user_id, reply } => {
                let sessions = self.registry.lookup_sessions(&user_id).cloned().collect();
                let _ = reply.send(sessions);
            }
            HubCommand::Shutdown { reply } => self.shutdown(reply),
        }
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        let mut closed = 0;
        for session in self.registry.sessions() {
            session.close();
            closed += 1;
        }
        tracing::info!(closed, "hub draining sessions");
        self.draining.get_or_insert_with(Vec::new).push(reply);
        self.finish_drain();
    }

    fn finish_drain(&mut self) {
        if self.registry.user_count() > 0 {
            return;
        }
        if let Some(waiters) = self.draining.as_mut() {
            for reply in waiters.drain(..) {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        if session.is_closed() {
            tracing::debug!(user_id = %session.user_id(), "session closed before registration");
            return;
        }
        if self.draining.is_some() {
            tracing::debug!(user_id = %session.user_id(), "hub shutting down, registration refused");
            session.close();
            return;
        }

        if let Some(previous) = self.registry.register(session.clone()) {
            tracing::warn!(
                user_id = %session.user_id(),
                device_id = %session.device_id(),
                "device reconnected, closing previous session"
            );
            previous.close();
        }
        tracing::info!(
            user_id = %session.user_id(),
            device_id = %session.device_id(),
            devices = self.registry.device_count(session.user_id()),
            "session registered"
        );

        tokio::spawn(backlog::replay(
            self.outbox.clone(),
            session,
            self.backlog_timeout,
        ));
    }
}

/// 协调器的句柄，可在任意任务间克隆
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
}

impl HubHandle {
    fn channel(command_buffer: usize, queue_capacity: usize) -> (Self, mpsc::Receiver<HubCommand>) {
        let (commands, receiver) = mpsc::channel(command_buffer);
        (
            Self {
                commands,
                queue_capacity,
            },
            receiver,
        )
    }

    /// 没有协调器任务的句柄，由测试直接读取命令
    #[cfg(test)]
    pub(crate) fn detached(
        command_buffer: usize,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<HubCommand>) {
        Self::channel(command_buffer, queue_capacity)
    }

    /// 为新连接创建会话句柄，队列容量取自配置
    pub fn open_session(
        &self,
        user_id: UserId,
        device_id: DeviceId,
    ) -> (SessionHandle, mpsc::Receiver<OutboundPayload>) {
        SessionHandle::new(SessionKey::new(user_id, device_id), self.queue_capacity)
    }

    async fn send(&self, command: HubCommand) -> Result<(), ApplicationError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ApplicationError::HubUnavailable)
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), ApplicationError> {
        self.send(HubCommand::Register(session)).await
    }

    pub async fn unregister(
        &self,
        key: SessionKey,
        connection_id: Uuid,
    ) -> Result<(), ApplicationError> {
        self.send(HubCommand::Unregister { key, connection_id })
            .await
    }

    /// 路由消息并等待结果：`true` 表示至少一个在线会话已入队，
    /// `false` 表示已尝试写入发件箱
    pub async fn route(&self, message: Message) -> Result<bool, ApplicationError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Route {
            message,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ApplicationError::HubUnavailable)
    }

    /// 提交消息后立即返回，不等待投递结果
    pub async fn dispatch(&self, message: Message) -> Result<(), ApplicationError> {
        self.send(HubCommand::Route {
            message,
            reply: None,
        })
        .await
    }

    /// 尽力推送给用户全部在线会话，返回入队的会话数
    pub async fn notify(
        &self,
        user_id: UserId,
        payload: OutboundPayload,
    ) -> Result<usize, ApplicationError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Notify {
            user_id,
            payload,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| ApplicationError::HubUnavailable)
    }

    /// 关闭所有会话，等它们全部注销后返回
    pub async fn shutdown(&self) -> Result<(), ApplicationError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| ApplicationError::HubUnavailable)
    }

    pub async fn lookup_sessions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SessionHandle>, ApplicationError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Lookup { user_id, reply }).await?;
        rx.await.map_err(|_| ApplicationError::HubUnavailable)
    }
}
