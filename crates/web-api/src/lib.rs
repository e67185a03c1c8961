//! Web API 层。
//!
//! 提供 Axum 路由：健康检查与 WebSocket 接入，连接建立后交给应用层的中枢协调器。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
