//! OWTP 路由器（ServeMux）
//!
//! 两张表在同一把读写锁下维护：
//! - 处理器表：method -> handler，处理入站请求
//! - 待响应表：nonce -> PendingCall，匹配入站响应
//!
//! 连接状态（connected + 连接代号）也放在同一把锁里，保证"已断开"与"待响应表已清空"
//! 对外总是一致的。
//!
//! 异步回调不会在收包循环里直接执行，而是投递到独立的分发任务。

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::{
    domain::packet::{DataPacket, PacketKind, Response},
    error::{OwtpError, Result},
    infrastructure::{
        replay_guard::ReplayGuard,
        transport::{Connection, PacketSink},
    },
    metrics,
    utils::{error_codes::ErrorCode, time_utils::current_timestamp},
};

/// 调用结果：成功响应，或携带错误码/method/nonce 的失败
pub type CallResult = Result<Response>;

/// 异步调用的回调（待响应表位于读写锁内，需满足 Sync）
pub type Callback = Box<dyn FnOnce(CallResult) + Send + Sync + 'static>;

type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// 结果的投递方式
pub enum Reply {
    /// 同步调用：调用方在 oneshot 上等待
    Sync(oneshot::Sender<CallResult>),
    /// 异步调用：回调在分发任务上执行
    Async(Callback),
}

struct PendingCall {
    method: String,
    reply: Reply,
    created_at: Instant,
}

/// 入站请求上下文
#[derive(Debug, Clone)]
pub struct Context {
    pub method: String,
    pub nonce: u64,
    pub timestamp: i64,
    pub params: Value,
}

impl Context {
    /// 按类型解析请求参数，失败时给出可直接返回的错误响应
    pub fn params_as<T: DeserializeOwned>(&self) -> std::result::Result<T, Response> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            Response::error(
                ErrorCode::MalformedRequest,
                format!("invalid params for {}: {}", self.method, e),
            )
        })
    }
}

/// 请求处理器
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, ctx: Context) -> Response;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send,
{
    async fn serve(&self, ctx: Context) -> Response {
        (self)(ctx).await
    }
}

struct MuxState {
    handlers: HashMap<String, Arc<dyn Handler>>,
    pending: HashMap<u64, PendingCall>,
    connected: bool,
    generation: u64,
}

/// 路由器
pub struct ServeMux {
    state: RwLock<MuxState>,
    replay_guard: Arc<dyn ReplayGuard>,
    replay_window: Option<Duration>,
    continuations: mpsc::UnboundedSender<Continuation>,
}

impl ServeMux {
    /// 创建路由器并启动回调分发任务（需在 Tokio 运行时内调用）
    pub fn new(replay_guard: Arc<dyn ReplayGuard>, replay_window: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(rx));

        Self {
            state: RwLock::new(MuxState {
                handlers: HashMap::new(),
                pending: HashMap::new(),
                connected: false,
                generation: 0,
            }),
            replay_guard,
            replay_window,
            continuations: tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MuxState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, MuxState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn replay_guard(&self) -> &Arc<dyn ReplayGuard> {
        &self.replay_guard
    }

    /// 注册处理器，同名方法后注册的生效
    pub fn handle_func<H>(&self, method: impl Into<String>, handler: H)
    where
        H: Handler + 'static,
    {
        let method = method.into();
        let mut state = self.write();
        if state.handlers.insert(method.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(method = %method, "Handler replaced");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.read().connected
    }

    /// 标记新连接已建立，并丢弃旧连接遗留的全部待响应调用
    pub fn mark_connected(&self, generation: u64) {
        let discarded = {
            let mut state = self.write();
            state.connected = true;
            state.generation = generation;
            drain_pending(&mut state)
        };
        self.cancel_all(discarded);
    }

    /// 标记断开，并丢弃全部待响应调用
    pub fn mark_disconnected(&self) {
        let discarded = {
            let mut state = self.write();
            state.connected = false;
            drain_pending(&mut state)
        };
        self.cancel_all(discarded);
    }

    /// 登记一个待响应调用。仅当 `generation` 仍是当前连接时成功
    pub fn add_request(&self, nonce: u64, method: &str, reply: Reply, generation: u64) -> Result<()> {
        let mut state = self.write();

        if !state.connected || state.generation != generation {
            return Err(OwtpError::ConnectionClosed);
        }

        if state.pending.contains_key(&nonce) {
            // nonce 生成器保证唯一，出现即为程序错误
            tracing::error!(nonce, method = %method, "Duplicate nonce in pending table");
            return Err(OwtpError::DuplicateNonce { nonce });
        }

        state.pending.insert(
            nonce,
            PendingCall {
                method: method.to_string(),
                reply,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// 移除待响应调用（发送失败或同步调用超时），返回是否仍在表中
    pub fn remove_request(&self, nonce: u64) -> bool {
        self.write().pending.remove(&nonce).is_some()
    }

    /// 清空待响应表，被丢弃的调用以 Cancelled 结束
    pub fn reset_queue(&self) {
        let discarded = {
            let mut state = self.write();
            drain_pending(&mut state)
        };
        self.cancel_all(discarded);
    }

    /// 结束存活超过 `max_age` 的待响应调用，返回数量
    pub fn expire_pending(&self, max_age: Duration) -> usize {
        let expired: Vec<(u64, PendingCall)> = {
            let mut state = self.write();
            let stale: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, call)| call.created_at.elapsed() >= max_age)
                .map(|(nonce, _)| *nonce)
                .collect();
            stale
                .into_iter()
                .filter_map(|nonce| state.pending.remove(&nonce).map(|call| (nonce, call)))
                .collect()
        };

        let count = expired.len();
        for (nonce, call) in expired {
            tracing::warn!(nonce, method = %call.method, "Pending call expired");
            metrics::call_timed_out();
            let err = OwtpError::Timeout {
                method: call.method.clone(),
                nonce,
                after: max_age,
            };
            self.complete(call, Err(err));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.read().pending.len()
    }

    fn cancel_all(&self, discarded: Vec<(u64, PendingCall)>) {
        if discarded.is_empty() {
            return;
        }
        tracing::info!(count = discarded.len(), "Discarding pending calls");
        for (nonce, call) in discarded {
            metrics::call_cancelled();
            let err = OwtpError::Cancelled {
                method: call.method.clone(),
                nonce,
            };
            self.complete(call, Err(err));
        }
    }

    fn complete(&self, call: PendingCall, result: CallResult) {
        match call.reply {
            Reply::Sync(tx) => {
                // 接收方可能已因超时放弃等待
                let _ = tx.send(result);
            }
            Reply::Async(callback) => {
                let continuation: Continuation = Box::new(move || callback(result));
                if let Err(mpsc::error::SendError(continuation)) = self.continuations.send(continuation) {
                    tracing::warn!("Callback dispatcher stopped, running callback inline");
                    continuation();
                }
            }
        }
    }

    /// 分发一个入站数据包
    pub async fn dispatch(&self, packet: DataPacket, conn: &Arc<Connection>) {
        match packet.req {
            PacketKind::Response => self.dispatch_response(packet),
            PacketKind::Request => self.dispatch_request(packet, conn).await,
        }
    }

    fn dispatch_response(&self, packet: DataPacket) {
        let pending = self.write().pending.remove(&packet.nonce);

        let Some(call) = pending else {
            tracing::warn!(
                nonce = packet.nonce,
                method = %packet.method,
                "Response for unknown nonce dropped"
            );
            metrics::unknown_response();
            return;
        };

        if call.method != packet.method {
            tracing::warn!(
                nonce = packet.nonce,
                expected = %call.method,
                actual = %packet.method,
                "Response method differs from request"
            );
            metrics::method_mismatch();
            let err = OwtpError::protocol(ErrorCode::ResponseMethodDiffer, call.method.clone(), packet.nonce);
            self.complete(call, Err(err));
            return;
        }

        let response = Response::from_value(packet.data);
        let result = if response.is_success() {
            metrics::call_completed();
            Ok(response)
        } else {
            metrics::call_failed();
            Err(OwtpError::Remote {
                status: response.status,
                message: response.msg,
                method: packet.method,
                nonce: packet.nonce,
            })
        };
        self.complete(call, result);
    }

    async fn dispatch_request(&self, packet: DataPacket, conn: &Arc<Connection>) {
        let now = current_timestamp();

        if let Some(window) = self.replay_window {
            // 时间戳来自对端，可为任意值
            if now.abs_diff(packet.timestamp) > window.as_secs() {
                tracing::warn!(
                    nonce = packet.nonce,
                    method = %packet.method,
                    timestamp = packet.timestamp,
                    "Request outside replay window rejected"
                );
                metrics::replay_rejected();
                self.respond(conn, &packet, Response::error(ErrorCode::ReplayAttack, "request timestamp outside replay window"))
                    .await;
                return;
            }
        }

        match self.replay_guard.check_and_insert(packet.nonce, now).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(nonce = packet.nonce, method = %packet.method, "Replayed request rejected");
                metrics::replay_rejected();
                self.respond(conn, &packet, Response::from_code(ErrorCode::ReplayAttack)).await;
                return;
            }
            Err(e) => {
                tracing::error!(nonce = packet.nonce, "Replay guard unavailable: {}", e);
                self.respond(conn, &packet, Response::error(ErrorCode::HandlerFailed, "replay guard unavailable"))
                    .await;
                return;
            }
        }

        let handler = self.read().handlers.get(&packet.method).cloned();
        let Some(handler) = handler else {
            tracing::warn!(nonce = packet.nonce, method = %packet.method, "No handler for method");
            metrics::method_not_found();
            self.respond(conn, &packet, Response::from_code(ErrorCode::NotFoundMethod)).await;
            return;
        };

        let ctx = Context {
            method: packet.method.clone(),
            nonce: packet.nonce,
            timestamp: packet.timestamp,
            params: packet.data.clone(),
        };

        let response = match AssertUnwindSafe(handler.serve(ctx)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                tracing::error!(nonce = packet.nonce, method = %packet.method, "Handler panicked");
                Response::from_code(ErrorCode::HandlerFailed)
            }
        };

        self.respond(conn, &packet, response).await;
    }

    async fn respond(&self, conn: &Arc<Connection>, request: &DataPacket, response: Response) {
        let packet = DataPacket::response(request, response);
        if let Err(e) = conn.send(&packet).await {
            tracing::warn!(nonce = request.nonce, method = %request.method, "Failed to send response: {}", e);
        }
    }
}

fn drain_pending(state: &mut MuxState) -> Vec<(u64, PendingCall)> {
    state.pending.drain().collect()
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Continuation>) {
    while let Some(continuation) = rx.recv().await {
        if std::panic::catch_unwind(AssertUnwindSafe(continuation)).is_err() {
            tracing::error!("Call callback panicked");
        }
    }
}

#[async_trait]
impl PacketSink for ServeMux {
    async fn on_packet(&self, packet: DataPacket, conn: &Arc<Connection>) {
        self.dispatch(packet, conn).await;
    }

    fn on_disconnect(&self, connection_id: u64) {
        let current = {
            let state = self.read();
            state.connected && state.generation == connection_id
        };
        if current {
            tracing::warn!(connection_id, "Transport disconnected");
            self.mark_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::infrastructure::{
        replay_guard::MemoryReplayGuard,
        transport::{read_frame, write_frame, DEFAULT_MAX_PACKET_BYTES},
    };

    /// 路由器 + 一条 duplex 连接，另一端由测试直接读写原始帧
    struct Harness {
        mux: Arc<ServeMux>,
        guard: Arc<MemoryReplayGuard>,
        _conn: Arc<Connection>,
        peer: tokio::io::DuplexStream,
    }

    fn harness(window: Option<Duration>) -> Harness {
        let guard = Arc::new(MemoryReplayGuard::new());
        let mux = Arc::new(ServeMux::new(guard.clone(), window));
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let conn = Connection::open(Box::new(local), 1, DEFAULT_MAX_PACKET_BYTES, mux.clone());
        mux.mark_connected(1);
        Harness {
            mux,
            guard,
            _conn: conn,
            peer,
        }
    }

    impl Harness {
        async fn send(&mut self, packet: &DataPacket) {
            write_frame(&mut self.peer, &packet.encode().unwrap(), DEFAULT_MAX_PACKET_BYTES)
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> DataPacket {
            let frame = read_frame(&mut self.peer, DEFAULT_MAX_PACKET_BYTES)
                .await
                .unwrap()
                .expect("frame");
            DataPacket::decode(&frame).unwrap()
        }
    }

    fn echo(ctx: Context) -> impl Future<Output = Response> + Send {
        async move { Response::success(ctx.params) }
    }

    #[tokio::test]
    async fn test_request_invokes_handler_and_echoes_nonce() {
        let mut h = harness(None);
        h.mux.handle_func("echo", echo);

        h.send(&DataPacket::request("echo", 100, json!("hello"))).await;
        let resp = h.recv().await;

        assert_eq!(resp.req, PacketKind::Response);
        assert_eq!(resp.method, "echo");
        assert_eq!(resp.nonce, 100);
        let body = Response::from_value(resp.data);
        assert!(body.is_success());
        assert_eq!(body.result, json!("hello"));
    }

    #[tokio::test]
    async fn test_unknown_method_still_records_nonce() {
        let mut h = harness(None);

        h.send(&DataPacket::request("nope", 5, json!(null))).await;
        let resp = h.recv().await;

        assert_eq!(Response::from_value(resp.data).code(), Some(ErrorCode::NotFoundMethod));
        assert!(h.guard.contains(5).await.unwrap());
    }

    #[tokio::test]
    async fn test_replayed_request_runs_handler_once() {
        let mut h = harness(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        h.mux.handle_func("transfer", move |_ctx: Context| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Response::success(json!({"txid": "abc"}))
            }
        });

        let packet = DataPacket::request("transfer", 77, json!({"amount": "1"}));
        h.send(&packet).await;
        let first = Response::from_value(h.recv().await.data);
        h.send(&packet).await;
        let second = Response::from_value(h.recv().await.data);

        assert!(first.is_success());
        assert_eq!(second.code(), Some(ErrorCode::ReplayAttack));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_request_rejected_without_recording() {
        let mut h = harness(Some(Duration::from_secs(60)));
        h.mux.handle_func("echo", echo);

        let mut packet = DataPacket::request("echo", 8, json!(1));
        packet.timestamp -= 3_600;
        h.send(&packet).await;

        let resp = Response::from_value(h.recv().await.data);
        assert_eq!(resp.code(), Some(ErrorCode::ReplayAttack));
        assert!(!h.guard.contains(8).await.unwrap());
    }

    #[tokio::test]
    async fn test_extreme_timestamps_rejected_without_breaking_connection() {
        let mut h = harness(Some(Duration::from_secs(60)));
        h.mux.handle_func("echo", echo);
        let (tx, _rx) = oneshot::channel();
        h.mux.add_request(900, "slow", Reply::Sync(tx), 1).unwrap();

        for (nonce, timestamp) in [(11, i64::MIN), (12, i64::MAX)] {
            let mut packet = DataPacket::request("echo", nonce, json!(null));
            packet.timestamp = timestamp;
            h.send(&packet).await;

            let resp = h.recv().await;
            assert_eq!(resp.nonce, nonce);
            assert_eq!(Response::from_value(resp.data).code(), Some(ErrorCode::ReplayAttack));
        }

        // 收包循环仍在工作
        h.send(&DataPacket::request("echo", 13, json!("ok"))).await;
        assert_eq!(Response::from_value(h.recv().await.data).result, json!("ok"));
        assert!(h.mux.is_connected());
        assert_eq!(h.mux.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_yields_error_response() {
        let mut h = harness(None);
        h.mux.handle_func("boom", |_ctx: Context| async move {
            if true {
                panic!("handler bug");
            }
            Response::success(Value::Null)
        });

        h.send(&DataPacket::request("boom", 3, json!(null))).await;
        let resp = Response::from_value(h.recv().await.data);
        assert_eq!(resp.code(), Some(ErrorCode::HandlerFailed));
    }

    #[tokio::test]
    async fn test_response_resolves_sync_pending_call() {
        let mut h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(42, "getBalance", Reply::Sync(tx), 1).unwrap();

        let request = DataPacket::request("getBalance", 42, json!(null));
        h.send(&DataPacket::response(&request, Response::success(json!("9.5")))).await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.result, json!("9.5"));
        assert_eq!(h.mux.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_method_mismatch_fails_caller_and_removes_context() {
        let mut h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(43, "getBalance", Reply::Sync(tx), 1).unwrap();

        let forged = DataPacket::request("sendTransaction", 43, json!(null));
        h.send(&DataPacket::response(&forged, Response::success(json!("ok")))).await;

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ResponseMethodDiffer));
        assert_eq!(err.nonce(), Some(43));
        assert_eq!(h.mux.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_delivered_as_failure() {
        let mut h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(44, "missing", Reply::Sync(tx), 1).unwrap();

        let request = DataPacket::request("missing", 44, json!(null));
        h.send(&DataPacket::response(&request, Response::from_code(ErrorCode::NotFoundMethod)))
            .await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, OwtpError::Remote { status: 100, .. }));
        assert_eq!(err.code(), Some(ErrorCode::NotFoundMethod));
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let mut h = harness(None);
        h.mux.handle_func("echo", echo);

        let stray = DataPacket::request("echo", 999, json!(null));
        h.send(&DataPacket::response(&stray, Response::success(json!(1)))).await;

        // 连接仍然可用
        h.send(&DataPacket::request("echo", 1000, json!("still alive"))).await;
        let resp = h.recv().await;
        assert_eq!(resp.nonce, 1000);
    }

    #[tokio::test]
    async fn test_async_callback_runs_on_dispatcher() {
        let mut h = harness(None);
        let (done_tx, done_rx) = oneshot::channel();
        let callback: Callback = Box::new(move |result| {
            let _ = done_tx.send(result.map(|r| r.result));
        });
        h.mux.add_request(50, "ping", Reply::Async(callback), 1).unwrap();

        let request = DataPacket::request("ping", 50, json!(null));
        h.send(&DataPacket::response(&request, Response::success(json!("pong")))).await;

        assert_eq!(done_rx.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_duplicate_nonce_rejected() {
        let h = harness(None);
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        h.mux.add_request(7, "a", Reply::Sync(tx1), 1).unwrap();

        let err = h.mux.add_request(7, "b", Reply::Sync(tx2), 1).unwrap_err();
        assert!(matches!(err, OwtpError::DuplicateNonce { nonce: 7 }));
    }

    #[tokio::test]
    async fn test_reset_queue_cancels_waiters() {
        let h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(60, "slow", Reply::Sync(tx), 1).unwrap();

        h.mux.reset_queue();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, OwtpError::Cancelled { nonce: 60, .. }));
        assert_eq!(h.mux.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_add_request_refused_for_stale_generation() {
        let h = harness(None);
        let (tx, _rx) = oneshot::channel();
        let err = h.mux.add_request(1, "x", Reply::Sync(tx), 0).unwrap_err();
        assert!(matches!(err, OwtpError::ConnectionClosed));

        h.mux.mark_disconnected();
        let (tx, _rx) = oneshot::channel();
        assert!(h.mux.add_request(2, "x", Reply::Sync(tx), 1).is_err());
    }

    #[tokio::test]
    async fn test_expire_pending() {
        let h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(70, "slow", Reply::Sync(tx), 1).unwrap();

        assert_eq!(h.mux.expire_pending(Duration::from_secs(3600)), 0);
        assert_eq!(h.mux.expire_pending(Duration::ZERO), 1);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, OwtpError::Timeout { nonce: 70, .. }));
    }

    #[tokio::test]
    async fn test_peer_disconnect_clears_state() {
        let h = harness(None);
        let (tx, rx) = oneshot::channel();
        h.mux.add_request(80, "slow", Reply::Sync(tx), 1).unwrap();

        drop(h.peer);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, OwtpError::Cancelled { .. }));
        assert!(!h.mux.is_connected());
    }
}
