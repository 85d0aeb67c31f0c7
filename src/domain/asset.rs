//! 资产驱动注册表
//!
//! 由应用显式构造并传递给使用方，不依赖进程级的全局注册。

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

/// 资产驱动（链相关的交易构造、签名等由具体驱动实现）
pub trait AssetDriver: Send + Sync {
    /// 币种符号，如 "BTC"、"TRX"
    fn symbol(&self) -> &str;
    /// 全称
    fn full_name(&self) -> &str;
    /// 精度
    fn decimals(&self) -> u8;
}

/// 资产描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub symbol: String,
    pub full_name: String,
    pub decimals: u8,
}

impl AssetInfo {
    pub fn of(driver: &dyn AssetDriver) -> Self {
        Self {
            symbol: driver.symbol().to_uppercase(),
            full_name: driver.full_name().to_string(),
            decimals: driver.decimals(),
        }
    }
}

/// 资产注册表
#[derive(Default, Clone)]
pub struct AssetRegistry {
    drivers: Arc<RwLock<HashMap<String, Arc<dyn AssetDriver>>>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动，同一符号后注册的覆盖先注册的（符号不区分大小写）
    pub fn register(&self, driver: Arc<dyn AssetDriver>) {
        let symbol = driver.symbol().to_uppercase();
        let mut drivers = match self.drivers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if drivers.insert(symbol.clone(), driver).is_some() {
            tracing::warn!(symbol = %symbol, "Asset driver replaced");
        } else {
            tracing::debug!(symbol = %symbol, "Asset driver registered");
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<dyn AssetDriver>> {
        let drivers = match self.drivers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        drivers.get(&symbol.to_uppercase()).cloned()
    }

    /// 已注册的符号（排序）
    pub fn symbols(&self) -> Vec<String> {
        let drivers = match self.drivers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut symbols: Vec<String> = drivers.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn infos(&self) -> Vec<AssetInfo> {
        let drivers = match self.drivers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut infos: Vec<AssetInfo> = drivers.values().map(|d| AssetInfo::of(d.as_ref())).collect();
        infos.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        infos
    }

    pub fn len(&self) -> usize {
        match self.drivers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
