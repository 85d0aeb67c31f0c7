//! 资产查询路由
//!
//! 把 [`AssetRegistry`] 通过 OWTP 暴露给对端：
//! - `getSupportedAssets`：返回全部已注册资产（按符号排序）
//! - `getAssetInfo`：`{"symbol": "BTC"}` -> 单个资产描述

use serde::Deserialize;

use crate::{
    domain::{
        asset::{AssetInfo, AssetRegistry},
        packet::Response,
    },
    service::{node::OwtpNode, serve_mux::Context},
    utils::error_codes::ErrorCode,
};

pub const METHOD_SUPPORTED_ASSETS: &str = "getSupportedAssets";
pub const METHOD_ASSET_INFO: &str = "getAssetInfo";

#[derive(Debug, Deserialize)]
struct AssetQuery {
    symbol: String,
}

/// 在节点上注册资产查询方法
pub fn register_asset_routes(node: &OwtpNode, registry: AssetRegistry) {
    let assets = registry.clone();
    node.handle_func(METHOD_SUPPORTED_ASSETS, move |_ctx: Context| {
        let assets = assets.clone();
        async move { supported_assets(&assets) }
    });

    node.handle_func(METHOD_ASSET_INFO, move |ctx: Context| {
        let registry = registry.clone();
        async move { asset_info(&registry, &ctx) }
    });

    tracing::debug!("Asset routes registered");
}

fn supported_assets(registry: &AssetRegistry) -> Response {
    match serde_json::to_value(registry.infos()) {
        Ok(list) => Response::success(list),
        Err(e) => Response::error(ErrorCode::HandlerFailed, e.to_string()),
    }
}

fn asset_info(registry: &AssetRegistry, ctx: &Context) -> Response {
    let query: AssetQuery = match ctx.params_as() {
        Ok(query) => query,
        Err(resp) => return resp,
    };

    let Some(driver) = registry.get(&query.symbol) else {
        tracing::debug!(symbol = %query.symbol, nonce = ctx.nonce, "Unknown asset requested");
        return Response::error(ErrorCode::HandlerFailed, format!("unsupported asset: {}", query.symbol));
    };

    let info = AssetInfo::of(driver.as_ref());
    serde_json::to_value(info)
        .map(Response::success)
        .unwrap_or_else(|e| Response::error(ErrorCode::HandlerFailed, e.to_string()))
}
