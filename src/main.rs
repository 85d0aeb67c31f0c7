//! openwallet-node 主入口
//! 启动一个 OWTP 节点：作为服务端监听，或主动连接对端

use std::{sync::Arc, time::Instant};

use anyhow::{Context as _, Result};
use openwallet::{
    config::Config,
    domain::{AssetRegistry, Response},
    infrastructure::{logging::init_logging, transport::Listener},
    service::{register_asset_routes, Context, OwtpNode},
    utils::format_duration,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量
    dotenvy::dotenv().ok();

    // 2. 加载配置（CONFIG_PATH 指定的文件优先）
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate()?;

    // 3. 初始化日志
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    tracing::info!(
        node_id = config.node.node_id,
        cache_file = %config.replay.cache_file,
        "Starting OpenWallet OWTP node"
    );
    let started = Instant::now();

    // 4. 构建节点并注册处理器
    let node = OwtpNode::from_config(&config)
        .await
        .context("Failed to build OWTP node")?;

    register_asset_routes(&node, AssetRegistry::new());
    node.handle_func("echo", |ctx: Context| async move { Response::success(ctx.params) });

    // 5. 监听或拨号
    let acceptor = match config.node.listen_addr.as_deref() {
        Some(addr) => {
            let listener = Listener::bind(addr).await?;
            tracing::info!("OWTP node listening on {}", listener.local_addr()?);
            Some(tokio::spawn(accept_loop(listener, node.clone())))
        }
        None => {
            node.connect()
                .await
                .with_context(|| format!("Failed to connect to {}", config.node.endpoint))?;
            None
        }
    };

    // 6. 等待退出信号
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown signal received");

    if let Some(acceptor) = acceptor {
        acceptor.abort();
    }
    node.close().await;

    tracing::info!(
        uptime = %format_duration(started.elapsed().as_secs()),
        "OWTP node stopped"
    );
    Ok(())
}

async fn accept_loop(listener: Listener, node: Arc<OwtpNode>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!(peer = %peer, "Accepted OWTP peer");
                node.attach(stream).await;
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
