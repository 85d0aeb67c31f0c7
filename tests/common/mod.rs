//! 测试辅助模块
//! 提供节点配对、原始对端与 TCP 回环的构造函数

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use openwallet::{
    domain::{DataPacket, Response},
    error::{OwtpError, Result},
    infrastructure::{
        replay_guard::{MemoryReplayGuard, SqliteReplayGuard},
        transport::{read_frame, write_frame, BoxedStream, Dialer, Listener, TcpDialer, DEFAULT_MAX_PACKET_BYTES},
    },
    service::{NodeOptions, OwtpNode},
};
use tokio::io::DuplexStream;

pub fn test_options(node_id: u16) -> NodeOptions {
    NodeOptions {
        node_id,
        call_timeout: Some(Duration::from_secs(5)),
        ..NodeOptions::default()
    }
}

/// 服务端节点不主动拨号
pub struct RefusingDialer;

#[async_trait]
impl Dialer for RefusingDialer {
    async fn dial(&self) -> Result<BoxedStream> {
        Err(OwtpError::Connection("server role does not dial".into()))
    }

    fn endpoint(&self) -> String {
        "none".into()
    }
}

/// 拨号时生成一对 duplex，把另一端交给对端节点接管
pub struct PeerDialer {
    peer: Arc<OwtpNode>,
    pub dials: AtomicUsize,
}

#[async_trait]
impl Dialer for PeerDialer {
    async fn dial(&self) -> Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(256 * 1024);
        self.peer.attach(Box::new(remote)).await;
        Ok(Box::new(local))
    }

    fn endpoint(&self) -> String {
        format!("in-memory node {}", self.peer.node_id())
    }
}

/// 一对内存连接的节点
pub struct NodePair {
    pub client: Arc<OwtpNode>,
    pub server: Arc<OwtpNode>,
    pub server_guard: Arc<MemoryReplayGuard>,
    pub dialer: Arc<PeerDialer>,
}

pub fn node_pair(client_options: NodeOptions) -> NodePair {
    let server_guard = Arc::new(MemoryReplayGuard::new());
    let server = OwtpNode::new(test_options(2), Arc::new(RefusingDialer), server_guard.clone())
        .expect("Failed to create server node");

    let dialer = Arc::new(PeerDialer {
        peer: server.clone(),
        dials: AtomicUsize::new(0),
    });
    let client = OwtpNode::new(client_options, dialer.clone(), Arc::new(MemoryReplayGuard::new()))
        .expect("Failed to create client node");

    NodePair {
        client,
        server,
        server_guard,
        dialer,
    }
}

/// 把预先准备好的流交给节点，测试持有另一端直接读写原始帧
pub struct RawDialer {
    stream: Mutex<Option<DuplexStream>>,
}

#[async_trait]
impl Dialer for RawDialer {
    async fn dial(&self) -> Result<BoxedStream> {
        match self.stream.lock().unwrap().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(OwtpError::Connection("raw peer already used".into())),
        }
    }

    fn endpoint(&self) -> String {
        "raw peer".into()
    }
}

pub struct RawPeer {
    stream: DuplexStream,
}

impl RawPeer {
    pub async fn send(&mut self, packet: &DataPacket) {
        write_frame(&mut self.stream, &packet.encode().unwrap(), DEFAULT_MAX_PACKET_BYTES)
            .await
            .expect("Failed to write frame");
    }

    pub async fn recv(&mut self) -> DataPacket {
        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut self.stream, DEFAULT_MAX_PACKET_BYTES),
        )
        .await
        .expect("Timed out waiting for frame")
        .expect("Failed to read frame")
        .expect("Stream closed");
        DataPacket::decode(&frame).unwrap()
    }

    pub async fn recv_response(&mut self) -> Response {
        Response::from_value(self.recv().await.data)
    }
}

/// 节点作为客户端拨到一个原始对端
pub fn client_with_raw_peer(options: NodeOptions) -> (Arc<OwtpNode>, RawPeer) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let dialer = RawDialer {
        stream: Mutex::new(Some(local)),
    };
    let node = OwtpNode::new(options, Arc::new(dialer), Arc::new(MemoryReplayGuard::new()))
        .expect("Failed to create node");
    (node, RawPeer { stream: remote })
}

/// 原始对端直接连到节点（节点为服务端角色）
pub async fn raw_peer_to(node: &Arc<OwtpNode>) -> RawPeer {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    node.attach(Box::new(local)).await;
    RawPeer { stream: remote }
}

/// TCP 回环：服务端使用 sqlite 防重放存储
pub struct TcpPair {
    pub client: Arc<OwtpNode>,
    pub server: Arc<OwtpNode>,
    pub accept_task: tokio::task::JoinHandle<()>,
    pub _dir: tempfile::TempDir,
}

pub async fn tcp_pair() -> TcpPair {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cache_file = dir.path().join("owtp_cache.db");

    let guard = SqliteReplayGuard::open(cache_file.to_str().unwrap())
        .await
        .expect("Failed to open replay guard");
    let server = OwtpNode::new(test_options(2), Arc::new(RefusingDialer), Arc::new(guard))
        .expect("Failed to create server node");

    let listener = Listener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().unwrap();

    let acceptor = server.clone();
    let accept_task = tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            acceptor.attach(stream).await;
        }
    });

    let dialer = TcpDialer::new(addr.to_string(), Duration::from_secs(2));
    let client = OwtpNode::new(test_options(1), Arc::new(dialer), Arc::new(MemoryReplayGuard::new()))
        .expect("Failed to create client node");

    TcpPair {
        client,
        server,
        accept_task,
        _dir: dir,
    }
}

/// 轮询直到条件成立
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
