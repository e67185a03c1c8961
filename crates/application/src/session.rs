//! 连接会话在中枢一侧的表示
//!
//! [`SessionHandle`] 是登记在在线状态表中的会话句柄：持有有界出站队列的发送端，
//! 以及用于关闭底层连接的取消令牌。[`Teardown`] 保证一个会话无论由哪个泵
//! 先检测到故障，注销都只发生一次。

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use domain::{DeviceId, UserId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::hub::HubHandle;

/// 序列化后的出站帧，一次序列化后在多个会话间共享
pub type OutboundPayload = Arc<str>;

/// 会话身份：同一时刻每个 (用户, 设备) 至多一个会话
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl SessionKey {
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id }
    }
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: SessionKey,
    connection_id: Uuid,
    outbound: mpsc::Sender<OutboundPayload>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// 创建会话句柄和对应的出站队列接收端
    pub fn new(key: SessionKey, capacity: usize) -> (Self, mpsc::Receiver<OutboundPayload>) {
        let (outbound, queue) = mpsc::channel(capacity);
        let handle = Self {
            key,
            connection_id: Uuid::new_v4(),
            outbound,
            shutdown: CancellationToken::new(),
        };
        (handle, queue)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn user_id(&self) -> &UserId {
        &self.key.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.key.device_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// 非阻塞入队。队列已满或已关闭时直接丢弃并返回 `false`。
    pub fn try_enqueue(&self, payload: &OutboundPayload) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    user_id = %self.key.user_id,
                    device_id = %self.key.device_id,
                    "outbound queue full, frame dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// 带背压的入队，会话关闭时放弃。用于积压消息重放。
    pub async fn enqueue(&self, payload: OutboundPayload) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.outbound.send(payload) => sent.is_ok(),
        }
    }

    /// 关闭会话：通知出站泵发送关闭帧并断开连接。可重复调用。
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }
}

/// 会话状态机：Connecting -> Active -> Closing -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// 单次触发的会话拆除动作，读写两个泵共享
#[derive(Clone)]
pub struct Teardown {
    inner: Arc<TeardownInner>,
}

struct TeardownInner {
    fired: AtomicBool,
    state: AtomicU8,
    hub: HubHandle,
    key: SessionKey,
    connection_id: Uuid,
    shutdown: CancellationToken,
}

impl Teardown {
    pub fn new(hub: HubHandle, session: &SessionHandle) -> Self {
        Self {
            inner: Arc::new(TeardownInner {
                fired: AtomicBool::new(false),
                state: AtomicU8::new(SessionState::Connecting as u8),
                hub,
                key: session.key.clone(),
                connection_id: session.connection_id,
                shutdown: session.shutdown.clone(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// 登记成功后进入 Active；已经开始拆除的会话保持原状态
    pub fn activate(&self) {
        let _ = self.inner.state.compare_exchange(
            SessionState::Connecting as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// 触发拆除：取消另一个泵并通知协调器注销。
    ///
    /// 只有第一次调用生效，返回 `true`；之后的调用立即返回 `false`。
    pub async fn fire(&self, reason: &'static str) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = SessionState::from_u8(
            self.inner
                .state
                .swap(SessionState::Closing as u8, Ordering::AcqRel),
        );
        self.inner.shutdown.cancel();

        tracing::info!(
            user_id = %self.inner.key.user_id,
            device_id = %self.inner.key.device_id,
            reason,
            previous = ?previous,
            "session teardown"
        );

        if let Err(err) = self
            .inner
            .hub
            .unregister(self.inner.key.clone(), self.inner.connection_id)
            .await
        {
            tracing::warn!(error = %err, "failed to unregister session");
        }
        true
    }

    /// 两个泵都结束后调用
    pub fn finish(&self) {
        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.shutdown.cancelled()
    }
}
