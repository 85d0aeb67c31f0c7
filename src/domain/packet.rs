//! OWTP 数据包
//!
//! 线路格式（JSON）：
//! ```text
//! {"m": "<method>", "r": 1|2, "n": <nonce u64>, "t": <unix secs>, "d": <payload>}
//! ```
//! 响应包的 `d` 为 [`Response`]：`{"status": 200, "msg": "", "result": ...}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, utils::error_codes::ErrorCode, utils::time_utils::current_timestamp};

/// 数据包方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PacketKind {
    Request,
    Response,
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> Self {
        match kind {
            PacketKind::Request => 1,
            PacketKind::Response => 2,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Response),
            other => Err(format!("unknown packet direction {}", other)),
        }
    }
}

/// 数据包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    #[serde(rename = "m")]
    pub method: String,
    #[serde(rename = "r")]
    pub req: PacketKind,
    #[serde(rename = "n")]
    pub nonce: u64,
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl DataPacket {
    /// 构造请求包，时间戳取当前时间
    pub fn request(method: impl Into<String>, nonce: u64, params: Value) -> Self {
        Self {
            method: method.into(),
            req: PacketKind::Request,
            nonce,
            timestamp: current_timestamp(),
            data: params,
        }
    }

    /// 构造响应包，method/nonce 原样取自请求
    pub fn response(request: &DataPacket, response: Response) -> Self {
        Self {
            method: request.method.clone(),
            req: PacketKind::Response,
            nonce: request.nonce,
            timestamp: current_timestamp(),
            data: response.into_value(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// 响应数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            status: ErrorCode::Success.as_status(),
            msg: String::new(),
            result,
        }
    }

    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            status: code.as_status(),
            msg: msg.into(),
            result: Value::Null,
        }
    }

    /// 使用错误码默认文案
    pub fn from_code(code: ErrorCode) -> Self {
        Self::error(code, code.message_en())
    }

    pub fn is_success(&self) -> bool {
        self.status == ErrorCode::Success.as_status()
    }

    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_status(self.status)
    }

    /// 从响应包负载中解析，负载不是标准结构时整体作为 result
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Response>(value.clone()) {
            Ok(resp) => resp,
            Err(_) => Self::success(value),
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({
            "status": self.status,
            "msg": self.msg,
            "result": self.result,
        })
    }
}
