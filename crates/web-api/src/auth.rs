//! JWT 身份校验
//!
//! 令牌由外部认证服务签发，这里只负责校验并取出用户ID。

use axum::http::{header, HeaderMap};
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const TOKEN_COOKIE: &str = "token";

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT 校验服务
#[derive(Clone)]
pub struct JwtService {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
            validation: Validation::default(),
        }
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|token_data| token_data.claims)
            .map_err(|err| ApiError::unauthorized(format!("Invalid token: {}", err)))
    }

    /// 依次从 `Authorization: Bearer`、`token` Cookie、`token` 查询参数中取令牌并校验
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserId, ApiError> {
        let token = bearer_token(headers)
            .or_else(|| cookie_token(headers))
            .or(query_token.filter(|token| !token.is_empty()))
            .ok_or_else(|| ApiError::unauthorized("Missing token"))?;

        let claims = self.verify_token(token)?;
        UserId::parse(claims.user_id)
            .map_err(|_| ApiError::unauthorized("Token carries no user id"))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, token)| token)
        .filter(|token| !token.is_empty())
}
