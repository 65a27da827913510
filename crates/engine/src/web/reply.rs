//! Canonical JSON reply shapes
//!
//! Every API reply is one of three shapes: `{success:true}`,
//! `{success:true, result}` or `{success:false, message, errcode}`. All of
//! them go out with HTTP 200; transport-level failures use real status
//! codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, ErrCode};

#[derive(Debug, Clone, Serialize)]
pub struct ApiReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errcode: Option<ErrCode>,
}

impl ApiReply {
    pub fn success() -> Self {
        Self {
            success: true,
            result: None,
            message: None,
            errcode: None,
        }
    }

    pub fn success_with(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            message: None,
            errcode: None,
        }
    }

    pub fn error(errcode: ErrCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            message: Some(message.into()),
            errcode: Some(errcode),
        }
    }

    pub fn is_error(&self, code: ErrCode) -> bool {
        self.errcode == Some(code)
    }
}

impl From<&EngineError> for ApiReply {
    fn from(err: &EngineError) -> Self {
        ApiReply::error(err.errcode(), err.client_message())
    }
}

impl From<EngineError> for ApiReply {
    fn from(err: EngineError) -> Self {
        ApiReply::from(&err)
    }
}

impl IntoResponse for ApiReply {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
