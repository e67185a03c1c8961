//! 实时消息中继的核心领域模型
//!
//! 包含用户/设备标识、线上帧格式（消息与确认）、待投递消息记录，以及相关错误类型。

pub mod errors;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use message::*;
pub use value_objects::*;
