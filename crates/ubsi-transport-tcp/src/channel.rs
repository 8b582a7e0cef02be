use crate::error::{
    CONFIGURE, CONNECT, READ, TransportError, WRITE, closed_error, decode_error, encode_error,
    map_io_error, timeout_error,
};
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use ubsi_core::frame::{self, Frame, FrameDecoder, HEARTBEAT};
use ubsi_core::{Value, codec};

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 `TCP_NODELAY` 与 `SO_LINGER` 显式配置化，避免调用方直接操作 `socket2`；
///   RPC 帧通常很小，默认关闭 Nagle 以降低往返延迟。
///
/// ## 契约（What）
/// - `nodelay`：是否设置 `TCP_NODELAY`，默认 `true`；
/// - `linger`：`Some(dur)` 时设置 `SO_LINGER`，`None` 沿用内核默认；
/// - **前置条件**：`apply` 调用前套接字已创建；失败时返回 IO 错误且不保证部分选项已生效。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }
}

impl TcpSocketConfig {
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_tcp_nodelay(self.nodelay)?;
        sock.set_linger(self.linger)
    }
}

/// 通道级选项：空闲心跳与读空闲超时。
#[derive(Clone, Debug, Default)]
pub struct ChannelOptions {
    /// 写方向空闲该时长后自动发送一个心跳帧。
    pub write_idle: Option<Duration>,
    /// 读方向空闲该时长后 [`FrameReader::next_value`] 返回超时错误。
    pub read_idle: Option<Duration>,
    pub socket: TcpSocketConfig,
}

#[derive(Debug)]
struct TcpChannelInner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

/// 分帧 TCP 通道的写端句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 多路复用连接上会有大量并发请求同时写出；以“单写任务 + 无界队列”串行化写入，
///   调用方 `send` 永不阻塞，也无需持有异步锁。
///
/// ## 逻辑 (How)
/// - 构造时把 `TcpStream` 拆分为读/写两半：写半部交给后台写任务，读半部封装为 [`FrameReader`]
///   交还调用方，由其驱动读循环；
/// - 写任务在 `write_idle` 时长内没有待发数据时写出单字节心跳帧；
/// - `close` 通过 `watch` 广播关闭标志，写任务与读循环都会观察到并退出。
///
/// ## 契约 (What)
/// - `send`：入队一段已加帧的字节；通道关闭后返回错误；
/// - 所有克隆共享同一连接，最后一个克隆被丢弃时写任务自然结束；
/// - **前置条件**：必须在 Tokio 运行时内构造。
///
/// ## 注意事项 (Trade-offs)
/// - 写队列无界，背压依赖上层的过载控制；
/// - 写失败只会关闭通道，错误细节记录在日志中，由读端观察到的 EOF/关闭统一上报。
#[derive(Clone, Debug)]
pub struct TcpChannel {
    inner: Arc<TcpChannelInner>,
}

impl TcpChannel {
    /// 在超时内建立到 `host:port` 的连接。
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        options: ChannelOptions,
    ) -> Result<(Self, FrameReader), TransportError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(map_io_error(CONNECT, err)),
            Err(_) => return Err(timeout_error(CONNECT)),
        };
        Self::from_stream(stream, options)
    }

    /// 将已建立的连接包装为通道。
    pub fn from_stream(
        stream: TcpStream,
        options: ChannelOptions,
    ) -> Result<(Self, FrameReader), TransportError> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        options
            .socket
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let (read, write) = stream.into_split();

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);
        tokio::spawn(write_loop(
            id,
            write,
            rx,
            Arc::clone(&closed),
            options.write_idle,
        ));

        let channel = Self {
            inner: Arc::new(TcpChannelInner {
                id,
                peer_addr,
                local_addr,
                outbound,
                closed,
            }),
        };
        let reader = FrameReader {
            read,
            buf: BytesMut::with_capacity(4096),
            decoder: FrameDecoder::new(),
            closed: closed_rx,
            read_idle: options.read_idle,
        };
        Ok((channel, reader))
    }

    /// 进程内唯一的通道编号。
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 获取对端地址。
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// 获取本地地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// 入队一段已加帧的字节。
    pub fn send(&self, framed: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.inner
            .outbound
            .send(framed)
            .map_err(|_| closed_error())
    }

    /// 编码、加帧并入队一个值。
    pub fn send_value(&self, value: &Value) -> Result<(), TransportError> {
        let payload = codec::encode(value).map_err(encode_error)?;
        self.send(frame::frame(&payload))
    }

    /// 关闭通道；幂等。已入队的帧仍会被写出。
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    /// 等待通道关闭。
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

enum Outbound {
    Data(Bytes),
    Idle,
    Drained,
}

async fn next_outbound(
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    idle: Option<Duration>,
) -> Outbound {
    let recv = async {
        match rx.recv().await {
            Some(bytes) => Outbound::Data(bytes),
            None => Outbound::Drained,
        }
    };
    match idle {
        Some(idle) => tokio::time::timeout(idle, recv)
            .await
            .unwrap_or(Outbound::Idle),
        None => recv.await,
    }
}

async fn write_loop(
    id: u64,
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    closed: Arc<watch::Sender<bool>>,
    idle: Option<Duration>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        let next = tokio::select! {
            biased;
            _ = async { closed_rx.wait_for(|c| *c).await.map(|_| ()) } => {
                // 关闭前写出已入队的帧
                while let Ok(bytes) = rx.try_recv() {
                    if write.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                break;
            }
            next = next_outbound(&mut rx, idle) => next,
        };
        let bytes = match next {
            Outbound::Data(bytes) => bytes,
            Outbound::Idle => Bytes::from_static(&HEARTBEAT),
            Outbound::Drained => break,
        };
        if let Err(err) = write.write_all(&bytes).await {
            let err = map_io_error(WRITE, err);
            tracing::debug!(channel = id, code = err.code(), error = %err, "tcp write failed, closing channel");
            break;
        }
    }
    closed.send_replace(true);
    let _ = write.shutdown().await;
}

/// 分帧 TCP 通道的读端。
///
/// 由连接的拥有者驱动：每次 [`FrameReader::next_value`] 返回一个解码后的值，心跳帧被静默吞掉。
#[derive(Debug)]
pub struct FrameReader {
    read: OwnedReadHalf,
    buf: BytesMut,
    decoder: FrameDecoder,
    closed: watch::Receiver<bool>,
    read_idle: Option<Duration>,
}

impl FrameReader {
    /// 读取下一个值。
    ///
    /// - `Ok(Some(v))`：完整收到一帧并解码成功；
    /// - `Ok(None)`：对端 EOF 或本端已关闭；
    /// - `Err`：读失败、读空闲超时或协议错误。
    pub async fn next_value(&mut self) -> Result<Option<Value>, TransportError> {
        let Self {
            read,
            buf,
            decoder,
            closed,
            read_idle,
        } = self;
        loop {
            match decoder.decode(buf).map_err(decode_error)? {
                Some(Frame::Heartbeat) => continue,
                Some(Frame::Payload(payload)) => {
                    return codec::decode(&payload).map(Some).map_err(decode_error);
                }
                None => {}
            }
            if *closed.borrow() {
                return Ok(None);
            }
            let n = tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => return Ok(None),
                n = read_some(read, buf, *read_idle) => n?,
            };
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

async fn read_some(
    read: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    idle: Option<Duration>,
) -> Result<usize, TransportError> {
    let result = match idle {
        Some(idle) => match tokio::time::timeout(idle, read.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => return Err(timeout_error(READ)),
        },
        None => read.read_buf(buf).await,
    };
    result.map_err(|err| map_io_error(READ, err))
}
