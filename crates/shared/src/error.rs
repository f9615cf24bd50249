use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Envelope every backing-store call answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Collapses the envelope: a `success=false` answer, or one without a
    /// payload, becomes an `ApiError`.
    pub fn into_result(self) -> Result<T, ApiError> {
        if !self.success {
            return Err(self
                .error
                .unwrap_or_else(|| ApiError::new(ErrorCode::Internal, "request failed")));
        }
        self.data
            .ok_or_else(|| ApiError::new(ErrorCode::Internal, "response missing payload"))
    }

    /// Like `into_result` for calls whose payload carries nothing of interest.
    pub fn into_status(self) -> Result<(), ApiError> {
        if self.success {
            Ok(())
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ApiError::new(ErrorCode::Internal, "request failed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_envelope_surfaces_error_code() {
        let raw = r#"{"success":false,"error":{"code":"rate_limited","message":"slow down"}}"#;
        let response: ApiResponse<String> = serde_json::from_str(raw).expect("json");
        let err = response.into_result().expect_err("must fail");
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn success_without_payload_is_an_error() {
        let response: ApiResponse<String> =
            serde_json::from_str(r#"{"success":true}"#).expect("json");
        assert_eq!(
            response.into_result().expect_err("must fail").code,
            ErrorCode::Internal
        );
    }
}
