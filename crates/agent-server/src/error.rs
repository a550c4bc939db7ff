//! API error type mapping to HTTP status codes and `{error, code}` bodies

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use agent_core::AgentError;
use agent_memory::MemoryError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    Agent(AgentError),
    Memory(MemoryError),
    Validation(String),
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError::Agent(e)
    }
}

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        ApiError::Memory(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Agent(e) => {
                let (status, code) = match e {
                    AgentError::ToolNotFound(_) => (StatusCode::NOT_FOUND, "TOOL_NOT_FOUND"),
                    AgentError::ToolValidation(_) | AgentError::Parse(_) => {
                        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                    }
                    AgentError::Config(_) => (StatusCode::BAD_REQUEST, "CONFIG_ERROR"),
                    AgentError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
                    AgentError::ProviderUnavailable(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE")
                    }
                    AgentError::Provider(_) | AgentError::Auth(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
                };
                (status, code, e.user_message())
            }
            ApiError::Memory(e) => match e {
                MemoryError::InvalidInput(_) | MemoryError::UnsupportedType(_) | MemoryError::Disabled(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
                }
                MemoryError::NotFound(_) => (StatusCode::NOT_FOUND, "MEMORY_NOT_FOUND", e.to_string()),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "MEMORY_ERROR", e.to_string()),
            },
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, error = %error, "Request failed");
        } else {
            tracing::debug!(code, error = %error, "Request rejected");
        }

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.into(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_memory::MemoryKind;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(AgentError::ToolNotFound("x".into())), StatusCode::NOT_FOUND),
            (ApiError::from(AgentError::Config("bad".into())), StatusCode::BAD_REQUEST),
            (ApiError::from(AgentError::RateLimited("slow".into())), StatusCode::TOO_MANY_REQUESTS),
            (
                ApiError::from(AgentError::ProviderUnavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ApiError::from(MemoryError::Disabled(MemoryKind::Perceptual)), StatusCode::BAD_REQUEST),
            (ApiError::from(MemoryError::Backend("x".into())), StatusCode::INTERNAL_SERVER_ERROR),
            (ApiError::Validation("empty".into()), StatusCode::BAD_REQUEST),
        ];
        for (error, status) in cases {
            assert_eq!(error.parts().0, status);
        }
    }

    #[test]
    fn test_agent_errors_use_user_message() {
        let (_, code, message) = ApiError::from(AgentError::ToolNotFound("search".into())).parts();
        assert_eq!(code, "TOOL_NOT_FOUND");
        assert!(message.starts_with("Sorry"));
    }
}
