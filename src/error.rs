//! OWTP 错误类型
//!
//! 错误分三类：
//! - 传输错误（连接/发送/接收失败）：直接返回给 `connect`/`call` 的调用方，不做重试
//! - 协议错误（方法不存在、响应方法不一致、重放）：携带错误码 + method/nonce 上下文
//! - 内部不变量错误（pending 表重复 nonce）：说明 nonce 生成器的唯一性被破坏

use std::time::Duration;

use thiserror::Error;

use crate::utils::error_codes::ErrorCode;

#[derive(Error, Debug)]
pub enum OwtpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Protocol error {code:?} (method={method}, nonce={nonce})")]
    Protocol {
        code: ErrorCode,
        method: String,
        nonce: u64,
    },

    #[error("Remote error status={status}: {message} (method={method}, nonce={nonce})")]
    Remote {
        status: u64,
        message: String,
        method: String,
        nonce: u64,
    },

    #[error("Call timed out after {after:?} (method={method}, nonce={nonce})")]
    Timeout {
        method: String,
        nonce: u64,
        after: Duration,
    },

    #[error("Call cancelled by connection reset (method={method}, nonce={nonce})")]
    Cancelled { method: String, nonce: u64 },

    #[error("Nonce {nonce} is already pending")]
    DuplicateNonce { nonce: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OwtpError {
    /// 协议错误码（仅协议类错误有）
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            OwtpError::Protocol { code, .. } => Some(*code),
            OwtpError::Remote { status, .. } => ErrorCode::from_status(*status),
            _ => None,
        }
    }

    /// 关联的 nonce
    pub fn nonce(&self) -> Option<u64> {
        match self {
            OwtpError::Protocol { nonce, .. }
            | OwtpError::Remote { nonce, .. }
            | OwtpError::Timeout { nonce, .. }
            | OwtpError::Cancelled { nonce, .. }
            | OwtpError::DuplicateNonce { nonce } => Some(*nonce),
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            OwtpError::Transport(_) | OwtpError::Connection(_) | OwtpError::ConnectionClosed
        )
    }

    pub(crate) fn protocol(code: ErrorCode, method: impl Into<String>, nonce: u64) -> Self {
        OwtpError::Protocol {
            code,
            method: method.into(),
            nonce,
        }
    }
}

impl From<std::io::Error> for OwtpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => OwtpError::ConnectionClosed,
            _ => OwtpError::Transport(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OwtpError>;
