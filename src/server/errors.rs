// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// HTTP 错误: 统一返回 {"error": "..."}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::input::CaptureError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 缺少必需的上传字段
    #[error("{0}")]
    MissingField(&'static str),

    #[error("Webcam not accessible")]
    CameraUnavailable(#[from] CaptureError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingField(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::CameraUnavailable(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::CameraUnavailable(e) => warn!("📷 {}", e),
            AppError::Internal(e) => error!("❌ 请求处理失败: {:#}", e),
            _ => {}
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(anyhow::anyhow!("worker task failed: {}", e))
    }
}
