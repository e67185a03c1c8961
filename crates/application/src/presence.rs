use std::collections::HashMap;

use domain::{DeviceId, UserId};
use uuid::Uuid;

use crate::session::{SessionHandle, SessionKey};

/// 在线状态表：用户 -> 设备 -> 会话
///
/// 只由中枢协调器持有和修改，本身不做任何同步。
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: HashMap<UserId, HashMap<DeviceId, SessionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记会话。同一 (用户, 设备) 已有会话时替换，并返回被替换的旧会话，由调用方关闭。
    pub fn register(&mut self, session: SessionHandle) -> Option<SessionHandle> {
        let key = session.key().clone();
        self.users
            .entry(key.user_id)
            .or_default()
            .insert(key.device_id, session)
    }

    /// 注销会话。只有连接ID匹配时才移除，避免已被替换的旧会话误删新会话。
    /// 用户的最后一个设备被移除时，用户条目一并移除。
    pub fn unregister(&mut self, key: &SessionKey, connection_id: Uuid) -> Option<SessionHandle> {
        let devices = self.users.get_mut(&key.user_id)?;
        let matches = devices
            .get(&key.device_id)
            .is_some_and(|session| session.connection_id() == connection_id);
        if !matches {
            return None;
        }

        let removed = devices.remove(&key.device_id);
        if devices.is_empty() {
            self.users.remove(&key.user_id);
        }
        removed
    }

    pub fn lookup_sessions(&self, user_id: &UserId) -> impl Iterator<Item = &SessionHandle> {
        self.users
            .get(user_id)
            .into_iter()
            .flat_map(|devices| devices.values())
    }

    /// 所有在线会话
    pub fn sessions(&self) -> impl Iterator<Item = &SessionHandle> {
        self.users.values().flat_map(HashMap::values)
    }

    pub fn device_count(&self, user_id: &UserId) -> usize {
        self.users.get(user_id).map_or(0, HashMap::len)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
