//! OWTP 传输层
//!
//! 一条长连接承载双向的数据包。线路格式：
//!
//! ```text
//! [4-byte length, u32 big-endian] [JSON DataPacket]
//! ```
//!
//! 连接只负责收发与断线通知，不解释 method / nonce。
//! 收包循环运行在独立任务中，按顺序把每个数据包交给 [`PacketSink`]。

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use crate::{
    domain::packet::DataPacket,
    error::{OwtpError, Result},
    metrics,
};

/// 默认最大数据包（16 MB）
pub const DEFAULT_MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// 建立到对端的物理连接
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<BoxedStream>;

    /// 对端描述（日志用）
    fn endpoint(&self) -> String;
}

/// 入站数据包与断线事件的接收方（路由器）
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn on_packet(&self, packet: DataPacket, conn: &Arc<Connection>);

    fn on_disconnect(&self, connection_id: u64);
}

/// TCP 拨号器
pub struct TcpDialer {
    addr: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                OwtpError::Connection(format!(
                    "Connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| OwtpError::Connection(format!("Failed to connect to {}: {}", self.addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| OwtpError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}

/// TCP 监听器（节点作为服务端接受对端连接）
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| OwtpError::Connection(format!("Failed to bind to {}: {}", addr, e)))?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|e| OwtpError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|e| OwtpError::Connection(format!("Failed to accept connection: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| OwtpError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
        Ok((Box::new(stream), peer))
    }
}

/// 一条已建立的连接
pub struct Connection {
    id: u64,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    max_packet_bytes: usize,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    /// 接管数据流并启动收包循环
    pub fn open(
        stream: BoxedStream,
        id: u64,
        max_packet_bytes: usize,
        sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            max_packet_bytes,
            receive_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(receive_loop(conn.clone(), reader, sink));
        if let Ok(mut slot) = conn.receive_task.lock() {
            *slot = Some(handle);
        }

        tracing::debug!(connection_id = id, "Connection opened");
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 发送一个数据包；并发发送方的帧不会交错
    pub async fn send(&self, packet: &DataPacket) -> Result<()> {
        if self.is_closed() {
            return Err(OwtpError::ConnectionClosed);
        }

        let encoded = packet.encode()?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &encoded, self.max_packet_bytes).await?;
        drop(writer);

        metrics::packet_sent();
        tracing::debug!(
            connection_id = self.id,
            method = %packet.method,
            nonce = packet.nonce,
            kind = ?packet.req,
            "Packet sent"
        );
        Ok(())
    }

    /// 关闭连接（幂等）。主动关闭不会触发 on_disconnect
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = match self.receive_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(connection_id = self.id, "Writer shutdown failed: {}", e);
        }
        tracing::debug!(connection_id = self.id, "Connection closed");
    }
}

/// 收包循环退出时（含 panic 展开）通知断线，主动关闭的连接除外
struct DisconnectNotice {
    conn: Arc<Connection>,
    sink: Arc<dyn PacketSink>,
}

impl Drop for DisconnectNotice {
    fn drop(&mut self) {
        if !self.conn.closed.swap(true, Ordering::AcqRel) {
            self.sink.on_disconnect(self.conn.id);
        }
    }
}

async fn receive_loop(conn: Arc<Connection>, mut reader: ReadHalf<BoxedStream>, sink: Arc<dyn PacketSink>) {
    let _notice = DisconnectNotice {
        conn: conn.clone(),
        sink: sink.clone(),
    };

    loop {
        match read_frame(&mut reader, conn.max_packet_bytes).await {
            Ok(Some(frame)) => match DataPacket::decode(&frame) {
                Ok(packet) => {
                    metrics::packet_received();
                    tracing::debug!(
                        connection_id = conn.id,
                        method = %packet.method,
                        nonce = packet.nonce,
                        kind = ?packet.req,
                        "Packet received"
                    );
                    sink.on_packet(packet, &conn).await;
                }
                Err(e) => {
                    tracing::warn!(connection_id = conn.id, "Dropping undecodable packet: {}", e);
                }
            },
            Ok(None) => {
                tracing::info!(connection_id = conn.id, "Connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(connection_id = conn.id, "Connection read failed: {}", e);
                break;
            }
        }
    }
}

/// 读取一帧；在帧边界遇到 EOF 返回 None
pub async fn read_frame<R>(reader: &mut R, max_packet_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_packet_bytes {
        return Err(OwtpError::Transport(format!(
            "Packet too large: {} bytes (max {} bytes)",
            len, max_packet_bytes
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W>(writer: &mut W, data: &[u8], max_packet_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > max_packet_bytes {
        return Err(OwtpError::Transport(format!(
            "Packet too large: {} bytes (max {} bytes)",
            data.len(),
            max_packet_bytes
        )));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
