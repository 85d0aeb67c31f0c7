//! 领域模型：OWTP 数据包、资产注册表

pub mod asset;
pub mod packet;

pub use asset::{AssetDriver, AssetInfo, AssetRegistry};
pub use packet::{DataPacket, PacketKind, Response};
