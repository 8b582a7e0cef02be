use crate::channel::{ChannelOptions, FrameReader, TcpChannel};
use crate::error::{ACCEPT, BIND, TransportError, map_io_error};
use std::net::SocketAddr;
use tokio::net::{TcpListener as TokioTcpListener, TcpSocket};

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 容器端需要显式控制监听积压队列长度（backlog），Tokio 的便捷 `bind` 不暴露该参数，
///   因此经由 `TcpSocket` 完成“创建 → 复用地址 → 绑定 → 监听”。
///
/// ## 契约 (What)
/// - `bind`：必须在 Tokio 运行时内调用；失败返回带 `ubsi.transport.tcp.bind_failed` 码的错误；
/// - `accept`：返回已包装为分帧通道的新连接以及对端地址；
/// - `local_addr`：返回实际绑定地址（端口为 0 时即系统分配的端口）。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// 绑定并开始监听。
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, TransportError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|err| map_io_error(BIND, err))?;
        socket
            .set_reuseaddr(true)
            .map_err(|err| map_io_error(BIND, err))?;
        socket.bind(addr).map_err(|err| map_io_error(BIND, err))?;
        let inner = socket
            .listen(backlog)
            .map_err(|err| map_io_error(BIND, err))?;
        let local_addr = inner
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        Ok(Self { inner, local_addr })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受一个入站连接并包装为分帧通道。
    pub async fn accept(
        &self,
        options: ChannelOptions,
    ) -> Result<(TcpChannel, FrameReader, SocketAddr), TransportError> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(ACCEPT, err))?;
        let (channel, reader) = TcpChannel::from_stream(stream, options)?;
        Ok((channel, reader, peer))
    }
}
