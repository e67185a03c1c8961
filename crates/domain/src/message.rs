//! 线上帧格式与待投递消息记录
//!
//! 客户端与服务端之间交换 JSON 文本帧，通过 `type` 字段区分：
//! - `"message"`：一条点对点消息
//! - `"ack"`：接收方对某条消息的确认
//!
//! 未知的 `type` 会被解析为 [`Frame::Unknown`]，由调用方忽略。

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MessageId, Timestamp, UserId};

/// 在途消息。字段缺失时取零值，与客户端的宽松格式保持一致。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(deserialize_with = "null_as_default")]
    pub from: UserId,
    #[serde(deserialize_with = "null_as_default")]
    pub to: UserId,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    /// Unix 秒；为 0 表示客户端未设置
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
}

/// 消息确认。`from` 是原消息的发送者，`to` 是确认方（即原消息的接收者）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ack {
    #[serde(rename = "messageId", deserialize_with = "null_as_default")]
    pub message_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub from: UserId,
    #[serde(deserialize_with = "null_as_default")]
    pub to: UserId,
}

/// 显式的 `null` 与缺失字段同样取零值
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// 带 `type` 判别字段的帧信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Message(Message),
    Ack(Ack),
    #[serde(other)]
    Unknown,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, DomainError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, DomainError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 持久化的待投递消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: MessageId,
    pub from: UserId,
    pub to: UserId,
    pub payload: String,
    pub created_at: Timestamp,
}

impl PendingMessage {
    /// 还原为线上消息，用于积压消息重放。`id` 即确认时需要回传的 `messageId`。
    pub fn to_message(&self) -> Message {
        Message {
            from: self.from.clone(),
            to: self.to.clone(),
            content: self.payload.clone(),
            timestamp: self.created_at.unix_timestamp(),
            id: self.id.to_string(),
        }
    }
}

/// 写入存储前的待投递消息，`id` 与 `created_at` 由存储分配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingMessage {
    pub from: UserId,
    pub to: UserId,
    pub payload: String,
}

impl From<&Message> for NewPendingMessage {
    fn from(message: &Message) -> Self {
        Self {
            from: message.from.clone(),
            to: message.to.clone(),
            payload: message.content.clone(),
        }
    }
}
