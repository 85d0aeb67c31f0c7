//! OWTP 协议状态码
//! 响应数据包中的 status 字段取值，调用方可按错误码分支处理

use serde::{Deserialize, Serialize};

/// 协议状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u64", try_from = "u64")]
#[repr(u64)]
pub enum ErrorCode {
    /// 找不到方法
    NotFoundMethod = 100,
    /// 请求与响应的方法不一致
    ResponseMethodDiffer = 101,
    /// 重放攻击
    ReplayAttack = 102,
    /// 处理器执行失败
    HandlerFailed = 103,
    /// 请求参数无法解析
    MalformedRequest = 104,
    /// 成功
    Success = 200,
}

impl ErrorCode {
    pub fn as_status(self) -> u64 {
        self as u64
    }

    /// 由响应中的 status 还原错误码，未知状态返回 None
    pub fn from_status(status: u64) -> Option<Self> {
        match status {
            100 => Some(ErrorCode::NotFoundMethod),
            101 => Some(ErrorCode::ResponseMethodDiffer),
            102 => Some(ErrorCode::ReplayAttack),
            103 => Some(ErrorCode::HandlerFailed),
            104 => Some(ErrorCode::MalformedRequest),
            200 => Some(ErrorCode::Success),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// 获取错误消息（英文）
    pub fn message_en(&self) -> &'static str {
        match self {
            ErrorCode::NotFoundMethod => "Method not found",
            ErrorCode::ResponseMethodDiffer => "Response method differs from request",
            ErrorCode::ReplayAttack => "Replayed request rejected",
            ErrorCode::HandlerFailed => "Handler failed",
            ErrorCode::MalformedRequest => "Malformed request parameters",
            ErrorCode::Success => "Success",
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.as_status()
    }
}

impl TryFrom<u64> for ErrorCode {
    type Error = String;

    fn try_from(status: u64) -> Result<Self, Self::Error> {
        ErrorCode::from_status(status).ok_or_else(|| format!("unknown status code {}", status))
    }
}
