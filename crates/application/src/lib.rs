//! 应用层实现。
//!
//! 这里是消息中继的核心：中枢协调器（唯一持有在线状态表的任务）、投递分发、
//! 积压消息重放、确认处理，以及对外部待投递存储的抽象。

pub mod ack;
pub mod backlog;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod outbox;
pub mod presence;
pub mod session;

pub use ack::{AckOutcome, AckProcessor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::Dispatcher;
pub use error::ApplicationError;
pub use hub::{Hub, HubCommand, HubHandle};
pub use outbox::{memory::MemoryOutbox, Outbox};
pub use presence::PresenceRegistry;
pub use session::{OutboundPayload, SessionHandle, SessionKey, SessionState, Teardown};
