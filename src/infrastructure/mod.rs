pub mod db;
pub mod logging;
pub mod replay_guard; // 入站 nonce 持久化
pub mod transport;
