//! OWTP 节点
//!
//! 对外门面：连接管理、处理器注册、出站调用。
//! - 出站调用先登记待响应上下文再发送，发送失败立即撤销
//! - 同步调用在调用方任务上等待结果（受 call_timeout 约束）
//! - 异步调用发送后立即返回，回调在分发任务上执行
//! - 重连/关闭会丢弃旧连接上全部待响应调用
//!
//! 同步调用不能在同一连接的处理器内部等待，否则收包循环会被自身阻塞。

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    config::Config,
    domain::packet::{DataPacket, Response},
    error::{OwtpError, Result},
    infrastructure::{
        replay_guard::{ReplayGuard, SqliteReplayGuard},
        transport::{BoxedStream, Connection, Dialer, TcpDialer, DEFAULT_MAX_PACKET_BYTES},
    },
    metrics,
    service::{
        nonce_generator::NonceGenerator,
        serve_mux::{CallResult, Handler, Reply, ServeMux},
    },
    utils::time_utils::current_timestamp,
};

/// 节点运行参数
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: u16,
    /// None 表示同步调用不超时
    pub call_timeout: Option<Duration>,
    pub max_packet_bytes: usize,
    pub sweep_interval: Duration,
    /// 防重放记录保留时长，同时作为入站请求的时间窗口；None 表示永久保留
    pub replay_retention: Option<Duration>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            node_id: 1,
            call_timeout: Some(Duration::from_secs(30)),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            sweep_interval: Duration::from_secs(10),
            replay_retention: Some(Duration::from_secs(86400)),
        }
    }
}

impl NodeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: config.node.node_id,
            call_timeout: config.node.call_timeout(),
            max_packet_bytes: config.node.max_packet_bytes,
            sweep_interval: config.node.sweep_interval(),
            replay_retention: config.replay.retention(),
        }
    }
}

pub struct OwtpNode {
    options: NodeOptions,
    nonces: NonceGenerator,
    mux: Arc<ServeMux>,
    dialer: Arc<dyn Dialer>,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    next_generation: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl OwtpNode {
    /// 创建节点（需在 Tokio 运行时内调用）
    pub fn new(
        options: NodeOptions,
        dialer: Arc<dyn Dialer>,
        replay_guard: Arc<dyn ReplayGuard>,
    ) -> Result<Arc<Self>> {
        let nonces = NonceGenerator::new(options.node_id)?;
        let mux = Arc::new(ServeMux::new(replay_guard, options.replay_retention));

        Ok(Arc::new(Self {
            options,
            nonces,
            mux,
            dialer,
            connection: tokio::sync::Mutex::new(None),
            next_generation: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }))
    }

    /// 按配置创建：TCP 拨号 + sqlite 防重放存储
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let guard = SqliteReplayGuard::open(&config.replay.cache_file).await?;
        let dialer = TcpDialer::new(config.node.endpoint.clone(), config.node.connect_timeout());

        Self::new(NodeOptions::from_config(config), Arc::new(dialer), Arc::new(guard))
    }

    pub fn node_id(&self) -> u16 {
        self.nonces.node_id()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn replay_guard(&self) -> &Arc<dyn ReplayGuard> {
        self.mux.replay_guard()
    }

    pub fn is_connected(&self) -> bool {
        self.mux.is_connected()
    }

    pub fn pending_len(&self) -> usize {
        self.mux.pending_len()
    }

    pub fn handle_func<H>(&self, method: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        self.mux.handle_func(method, handler);
    }

    /// 连接对端。已连接时直接返回；拨号失败时保持未连接状态
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() && self.mux.is_connected() {
                return Ok(());
            }
        }

        let endpoint = self.dialer.endpoint();
        let stream = self.dialer.dial().await.map_err(|e| {
            tracing::warn!(endpoint = %endpoint, "Dial failed: {}", e);
            e
        })?;

        let conn = self.install(&mut slot, stream).await;
        tracing::info!(endpoint = %endpoint, connection_id = conn.id(), "Connected to OWTP peer");
        Ok(())
    }

    /// 接管一条入站连接（服务端角色），替换现有连接
    pub async fn attach(self: &Arc<Self>, stream: BoxedStream) {
        let mut slot = self.connection.lock().await;
        let conn = self.install(&mut slot, stream).await;
        tracing::info!(connection_id = conn.id(), "Inbound OWTP peer attached");
    }

    async fn install(self: &Arc<Self>, slot: &mut Option<Arc<Connection>>, stream: BoxedStream) -> Arc<Connection> {
        if let Some(old) = slot.take() {
            tracing::info!(connection_id = old.id(), "Replacing existing connection");
            old.close().await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        // 先切换代号并清空待响应表，再启动收包循环，使旧连接的断线通知失效
        self.mux.mark_connected(generation);
        let conn = Connection::open(stream, generation, self.options.max_packet_bytes, self.mux.clone());
        *slot = Some(conn.clone());

        self.ensure_sweeper();
        conn
    }

    /// 关闭连接并丢弃全部待响应调用（幂等）
    pub async fn close(&self) {
        let mut slot = self.connection.lock().await;
        let conn = slot.take();
        self.mux.mark_disconnected();

        if let Some(conn) = conn {
            conn.close().await;
            tracing::info!(connection_id = conn.id(), "OWTP connection closed");
        }

        let sweeper = match self.sweeper.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }

    /// 发起调用
    ///
    /// `sync = true` 时等待结果并在当前任务上执行回调；否则发送后立即返回，
    /// 回调在分发任务上执行。返回错误表示请求未能发出，此时回调不会被执行。
    pub async fn call<P, F>(self: &Arc<Self>, method: &str, params: P, callback: F, sync: bool) -> Result<()>
    where
        P: Serialize,
        F: FnOnce(CallResult) + Send + Sync + 'static,
    {
        let params = serde_json::to_value(params)?;

        if sync {
            let (tx, rx) = oneshot::channel();
            let nonce = self.start(method, params, Reply::Sync(tx)).await?;
            let result = self.wait(method, nonce, rx).await;
            callback(result);
        } else {
            self.start(method, params, Reply::Async(Box::new(callback))).await?;
        }
        Ok(())
    }

    /// 同步调用，直接返回结果
    pub async fn request<P: Serialize>(self: &Arc<Self>, method: &str, params: P) -> Result<Response> {
        let params = serde_json::to_value(params)?;
        let (tx, rx) = oneshot::channel();
        let nonce = self.start(method, params, Reply::Sync(tx)).await?;
        self.wait(method, nonce, rx).await
    }

    async fn current_connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|conn| !conn.is_closed() && self.mux.is_connected())
            .cloned()
    }

    async fn start(self: &Arc<Self>, method: &str, params: Value, reply: Reply) -> Result<u64> {
        let conn = match self.current_connection().await {
            Some(conn) => conn,
            None => {
                self.connect().await?;
                self.current_connection().await.ok_or(OwtpError::ConnectionClosed)?
            }
        };

        let nonce = self.nonces.generate();
        self.mux.add_request(nonce, method, reply, conn.id())?;

        let packet = DataPacket::request(method, nonce, params);
        if let Err(e) = conn.send(&packet).await {
            // 不在表中说明已被重连/关闭以 Cancelled 结束，结果已送达
            if self.mux.remove_request(nonce) {
                tracing::warn!(nonce, method = %method, "Failed to send request: {}", e);
                return Err(e);
            }
        } else {
            metrics::call_issued();
        }
        Ok(nonce)
    }

    async fn wait(&self, method: &str, nonce: u64, mut rx: oneshot::Receiver<CallResult>) -> CallResult {
        let outcome = match self.options.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if self.mux.remove_request(nonce) {
                        tracing::warn!(nonce, method = %method, "Call timed out after {:?}", limit);
                        metrics::call_timed_out();
                        return Err(OwtpError::Timeout {
                            method: method.to_string(),
                            nonce,
                            after: limit,
                        });
                    }
                    // 结果正在投递
                    rx.await
                }
            },
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(OwtpError::Cancelled {
                method: method.to_string(),
                nonce,
            })
        })
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut slot = match self.sweeper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let node = Arc::downgrade(self);
        let interval = self.options.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.sweep().await;
            }
        }));
    }

    /// 一轮维护：结束超时的待响应调用，清理过期防重放记录
    pub async fn sweep(&self) {
        if let Some(limit) = self.options.call_timeout {
            let expired = self.mux.expire_pending(limit);
            if expired > 0 {
                tracing::info!(expired, "Expired pending calls");
            }
        }

        if let Some(retention) = self.options.replay_retention {
            let cutoff = current_timestamp() - retention.as_secs() as i64;
            match self.replay_guard().evict_older_than(cutoff).await {
                Ok(0) => {}
                Ok(evicted) => {
                    metrics::replay_records_evicted(evicted);
                    tracing::debug!(evicted, cutoff, "Evicted replay guard records");
                }
                Err(e) => tracing::warn!("Replay guard eviction failed: {}", e),
            }
        }
    }
}
