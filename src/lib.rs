//! OpenWallet - OWTP 节点核心
//!
//! 单条长连接上的请求/响应协议：按 method 路由入站请求，按 nonce 匹配出站调用的响应，
//! 入站 nonce 持久化以拒绝重放。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod metrics;
pub mod service;
pub mod utils;

// 重新导出常用类型
pub use error::{OwtpError, Result};
pub use service::{NodeOptions, OwtpNode};
pub use utils::ErrorCode;

pub mod prelude {
    pub use crate::{
        domain::{AssetDriver, AssetRegistry, DataPacket, Response},
        error::{OwtpError, Result},
        service::{register_asset_routes, CallResult, Context, NodeOptions, OwtpNode},
        utils::ErrorCode,
    };
}
