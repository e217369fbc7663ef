use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Bilingual error payload carried by every user-facing failure.
///
/// `code` is the machine contract: application logic and tests branch on it,
/// never on `message`/`message_en`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(rename = "messageEn")]
    pub message_en: String,
}

impl ErrorBody {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        message_en: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            message_en: message_en.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {}", .0.message_en)]
    BadRequest(ErrorBody),

    #[error("Not found: {}", .0.message_en)]
    NotFound(ErrorBody),

    #[error("Unauthorized: {}", .0.message_en)]
    Unauthorized(ErrorBody),

    #[error("Forbidden: {}", .0.message_en)]
    Forbidden(ErrorBody),

    #[error("Conflict: {}", .0.message_en)]
    Conflict(ErrorBody),

    #[error("Too many requests: {}", .body.message_en)]
    TooManyRequests {
        body: ErrorBody,
        limit: u32,
        window_seconds: u64,
        retry_after_seconds: u64,
    },

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Cache error: {0}")]
    CacheError(#[from] redis::RedisError),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    message: String,
    #[serde(rename = "messageEn")]
    message_en: String,
    code: String,
}

impl ErrorEnvelope {
    fn from_body(body: ErrorBody) -> Self {
        Self {
            success: false,
            message: body.message,
            message_en: body.message_en,
            code: body.code,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, envelope, rate_limit) = match self {
            AppError::ValidationError(err) => {
                let detail = err.to_string();
                (
                    StatusCode::BAD_REQUEST,
                    ErrorEnvelope {
                        success: false,
                        message: "بيانات غير صالحة".to_string(),
                        message_en: format!("Validation error: {detail}"),
                        code: "VALIDATION_ERROR".to_string(),
                    },
                    None,
                )
            }
            AppError::BadRequest(body) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope::from_body(body),
                None,
            ),
            AppError::NotFound(body) => {
                (StatusCode::NOT_FOUND, ErrorEnvelope::from_body(body), None)
            }
            AppError::Unauthorized(body) => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope::from_body(body),
                None,
            ),
            AppError::Forbidden(body) => {
                (StatusCode::FORBIDDEN, ErrorEnvelope::from_body(body), None)
            }
            AppError::Conflict(body) => {
                (StatusCode::CONFLICT, ErrorEnvelope::from_body(body), None)
            }
            AppError::TooManyRequests {
                body,
                limit,
                window_seconds,
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorEnvelope::from_body(body),
                Some((limit, window_seconds, retry_after_seconds)),
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = %err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        success: false,
                        message: "خطأ داخلي في الخادم".to_string(),
                        message_en: "Internal server error".to_string(),
                        code: "INTERNAL_ERROR".to_string(),
                    },
                    None,
                )
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        success: false,
                        message: "خطأ في قاعدة البيانات".to_string(),
                        message_en: "Database error".to_string(),
                        code: "DATABASE_ERROR".to_string(),
                    },
                    None,
                )
            }
            AppError::CacheError(err) => {
                tracing::error!(error = %err, "Cache error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        success: false,
                        message: "خطأ في ذاكرة التخزين المؤقت".to_string(),
                        message_en: "Cache error".to_string(),
                        code: "CACHE_ERROR".to_string(),
                    },
                    None,
                )
            }
            AppError::BadGateway(msg) => (
                StatusCode::BAD_GATEWAY,
                ErrorEnvelope {
                    success: false,
                    message: "الخدمة الخارجية غير متاحة".to_string(),
                    message_en: format!("Bad gateway: {msg}"),
                    code: "BAD_GATEWAY".to_string(),
                },
                None,
            ),
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        success: false,
                        message: "خطأ في الإعدادات".to_string(),
                        message_en: "Configuration error".to_string(),
                        code: "CONFIG_ERROR".to_string(),
                    },
                    None,
                )
            }
        };

        let mut res = (status, Json(envelope)).into_response();

        if let Some((limit, window_seconds, retry_after)) = rate_limit {
            let headers = res.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("RateLimit-Limit", v);
            }
            headers.insert("RateLimit-Remaining", HeaderValue::from_static("0"));
            if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("RateLimit-Reset", v.clone());
                headers.insert(axum::http::header::RETRY_AFTER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&format!("{limit};w={window_seconds}")) {
                headers.insert("RateLimit-Policy", v);
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_response_carries_headers_and_code() {
        let err = AppError::TooManyRequests {
            body: ErrorBody::new(
                "AUTH_RATE_LIMIT_EXCEEDED",
                "عدد كبير من المحاولات",
                "Too many authentication attempts",
            ),
            limit: 15,
            window_seconds: 900,
            retry_after_seconds: 42,
        };

        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get("RateLimit-Limit").unwrap(), "15");
        assert_eq!(res.headers().get("RateLimit-Remaining").unwrap(), "0");
        assert_eq!(res.headers().get("Retry-After").unwrap(), "42");
        assert_eq!(res.headers().get("RateLimit-Policy").unwrap(), "15;w=900");
    }

    #[test]
    fn unauthorized_renders_envelope() {
        let err = AppError::Unauthorized(ErrorBody::new(
            "INVALID_TOKEN",
            "رمز غير صالح",
            "Invalid token",
        ));
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
