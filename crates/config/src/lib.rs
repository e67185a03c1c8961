//! 统一配置中心
//!
//! 提供中继服务的全局配置，包括：
//! - 服务监听地址与运行环境
//! - 待投递消息存储（PostgreSQL）
//! - JWT 校验
//! - 中枢协调器与连接会话的各项时限
//!
//! 加载顺序：默认值 -> 可选配置文件（`RELAY_CONFIG_FILE`）-> 环境变量（`RELAY_*`，`__` 表示嵌套）。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// 开发环境默认 JWT 密钥，生产环境禁止使用
const DEV_JWT_SECRET: &str = "dev-secret-key-not-for-production-use-minimum-32-chars";

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub jwt: JwtConfig,
    #[validate(nested)]
    pub hub: HubConfig,
    #[validate(nested)]
    pub session: SessionConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    /// `development` 或 `production`
    pub environment: String,
}

/// 数据库配置。`url` 为空时使用进程内存储。
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    pub url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JwtConfig {
    #[validate(length(min = 32, message = "JWT secret must be at least 32 characters long"))]
    pub secret: String,
}

/// 中枢协调器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HubConfig {
    /// 每个会话出站队列容量
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// 协调器命令通道容量
    #[validate(range(min = 1))]
    pub command_buffer: usize,
    #[validate(range(min = 1))]
    pub outbox_write_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub backlog_timeout_secs: u64,
    /// 待投递消息保留时长，超过即被存储自动清除
    #[validate(range(min = 1))]
    pub retention_secs: u64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

/// 连接会话配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_keepalive"))]
pub struct SessionConfig {
    #[validate(range(min = 1))]
    pub read_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub ping_interval_secs: u64,
    #[validate(range(min = 1))]
    pub write_timeout_secs: u64,
    #[validate(range(min = 1024))]
    pub max_frame_bytes: usize,
}

/// ping 间隔必须小于读超时，否则对端来不及用 pong 刷新期限
fn validate_keepalive(session: &SessionConfig) -> Result<(), ValidationError> {
    if session.ping_interval_secs >= session.read_timeout_secs {
        let mut err = ValidationError::new("keepalive");
        err.message = Some("ping interval must be shorter than read timeout".into());
        return Err(err);
    }
    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                environment: "development".into(),
            },
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: DEV_JWT_SECRET.into(),
            },
            hub: HubConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            command_buffer: 1024,
            outbox_write_timeout_secs: 5,
            backlog_timeout_secs: 10,
            retention_secs: 7 * 24 * 3600,
            sweep_interval_secs: 3600,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 60,
            ping_interval_secs: 54,
            write_timeout_secs: 10,
            max_frame_bytes: 512 * 1024,
        }
    }
}

impl HubConfig {
    pub fn outbox_write_timeout(&self) -> Duration {
        Duration::from_secs(self.outbox_write_timeout_secs)
    }

    pub fn backlog_timeout(&self) -> Duration {
        Duration::from_secs(self.backlog_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl SessionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl AppConfig {
    /// 按 默认值 -> 配置文件 -> 环境变量 的顺序加载并校验
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("RELAY_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::prefixed("RELAY_").split("__"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let cfg: AppConfig = figment.extract().map_err(Box::new)?;
        cfg.validate_all()?;
        Ok(cfg)
    }

    pub fn is_production(&self) -> bool {
        self.server.environment.eq_ignore_ascii_case("production")
    }

    pub fn uses_memory_outbox(&self) -> bool {
        self.database.url.trim().is_empty()
    }

    /// 字段校验之外，生产环境还要求真实的密钥与数据库
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.is_production() {
            if self.jwt.secret == DEV_JWT_SECRET || self.jwt.secret.contains("not-for-production")
            {
                return Err(ConfigError::InvalidJwtSecret(
                    "Cannot use development JWT secret in production".to_string(),
                ));
            }
            if self.uses_memory_outbox() {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "database url is required in production".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// 日志中使用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut cfg = self.clone();
        cfg.jwt.secret = "[REDACTED]".into();
        if let Some(at) = cfg.database.url.find('@') {
            let scheme_end = cfg.database.url.find("://").map(|i| i + 3).unwrap_or(0);
            cfg.database.url.replace_range(scheme_end..at, "[REDACTED]");
        }
        format!("{:?}", cfg)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
}
