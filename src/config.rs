//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 雪花算法节点ID上限（10位）
pub const MAX_NODE_ID: u16 = 1023;

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 节点ID，共享同一防重放存储的节点之间必须唯一
    pub node_id: u16,
    /// 对端地址 host:port
    pub endpoint: String,
    /// 监听地址（作为服务端接受对端连接时配置）
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// 同步调用超时（秒），0 表示不超时
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    /// 过期 pending 调用与防重放记录的清理周期（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// 防重放配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// sqlite 缓存文件
    pub cache_file: String,
    /// 记录保留时长（秒），0 表示永久保留
    pub retention_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_call_timeout_secs() -> u64 {
    env_or("OWTP_CALL_TIMEOUT_SECS", 30)
}

fn default_connect_timeout_secs() -> u64 {
    env_or("OWTP_CONNECT_TIMEOUT_SECS", 10)
}

fn default_max_packet_bytes() -> usize {
    env_or("OWTP_MAX_PACKET_BYTES", 16 * 1024 * 1024)
}

fn default_sweep_interval_secs() -> u64 {
    env_or("OWTP_SWEEP_INTERVAL_SECS", 10)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: env_or("OWTP_NODE_ID", 1),
            endpoint: std::env::var("OWTP_ENDPOINT").unwrap_or_else(|_| "127.0.0.1:9432".into()),
            listen_addr: std::env::var("OWTP_LISTEN_ADDR").ok(),
            call_timeout_secs: default_call_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_packet_bytes: default_max_packet_bytes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            cache_file: std::env::var("OWTP_CACHE_FILE")
                .unwrap_or_else(|_| "./data/owtp_cache.db".into()),
            retention_secs: env_or("OWTP_REPLAY_RETENTION_SECS", 86400),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl NodeConfig {
    /// None 表示不超时
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl ReplayConfig {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs))
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            node: NodeConfig::default(),
            replay: ReplayConfig::default(),
            logging: LoggingConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id > MAX_NODE_ID {
            anyhow::bail!("OWTP_NODE_ID must be between 0 and {}", MAX_NODE_ID);
        }

        if self.node.endpoint.trim().is_empty() && self.node.listen_addr.is_none() {
            anyhow::bail!("Either OWTP_ENDPOINT or OWTP_LISTEN_ADDR must be set");
        }

        if self.node.max_packet_bytes < 1024 {
            anyhow::bail!("OWTP_MAX_PACKET_BYTES must be at least 1024");
        }

        if self.replay.cache_file.trim().is_empty() {
            anyhow::bail!("OWTP_CACHE_FILE must not be empty");
        }

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        Ok(())
    }
}
