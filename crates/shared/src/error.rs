use serde::{Deserialize, Serialize};

/// Reason attached to session rejections and teardown on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkReason {
    pub code: i64,
    pub message: String,
}

impl SdkReason {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(5000, "User rejected.")
    }

    pub fn user_disconnected() -> Self {
        Self::new(6000, "User disconnected.")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    UserRejected,
    MethodNotSupported,
    Internal,
}

impl RpcErrorCode {
    pub fn code(self) -> i64 {
        match self {
            RpcErrorCode::UserRejected => 5000,
            RpcErrorCode::MethodNotSupported => 5001,
            RpcErrorCode::Internal => 5000,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            RpcErrorCode::UserRejected => "User rejected the request",
            RpcErrorCode::MethodNotSupported => "Method not supported",
            RpcErrorCode::Internal => "Internal error",
        }
    }
}

/// JSON-RPC error object sent back to the relay peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<RpcErrorCode> for RpcError {
    fn from(value: RpcErrorCode) -> Self {
        Self::new(value.code(), value.default_message())
    }
}
