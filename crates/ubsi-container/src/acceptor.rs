//! 连接接入与读循环。
//!
//! 每个入站连接由一个任务驱动读循环：解码请求后立即交给准入控制，
//! 不等待处理结果即读取下一帧，同一连接上的请求可以并发执行。

use crate::container::ContainerInner;
use crate::dispatch::{self, ReplySink};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use ubsi_core::RequestEnvelope;
use ubsi_transport_tcp::{ChannelOptions, FrameReader, TcpChannel, TcpListener};

pub(crate) async fn run(inner: Arc<ContainerInner>, listener: TcpListener) {
    let options = ChannelOptions {
        write_idle: Some(Duration::from_millis(inner.config.heartbeat_ms)),
        read_idle: Some(Duration::from_millis(inner.config.reader_idle_ms)),
        ..ChannelOptions::default()
    };
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let accepted = tokio::select! {
            _ = shutdown.changed() => continue,
            accepted = listener.accept(options.clone()) => accepted,
        };
        let (channel, reader, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        if !inner.acl.accepts_peer(&peer.ip()) {
            tracing::warn!(peer = %peer, "connection refused by accept list");
            channel.close();
            continue;
        }
        inner.stats.socket_connected();
        tracing::debug!(peer = %peer, channel = channel.id(), "connection accepted");
        tokio::spawn(serve_connection(
            Arc::clone(&inner),
            channel,
            reader,
            peer,
            inner.shutdown.subscribe(),
        ));
    }
    tracing::debug!(addr = %listener.local_addr(), "acceptor stopped");
}

async fn serve_connection(
    inner: Arc<ContainerInner>,
    channel: TcpChannel,
    mut reader: FrameReader,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let sink: Arc<dyn ReplySink> = Arc::new(channel.clone());
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = reader.next_value() => next,
        };
        let value = match next {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "connection read ended");
                break;
            }
        };
        match RequestEnvelope::from_value(value) {
            Ok(request) => dispatch::admit(&inner, request, peer, Arc::clone(&sink)).await,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "malformed request, closing connection");
                break;
            }
        }
    }
    channel.close();
    inner.stats.socket_closed();
    tracing::debug!(peer = %peer, "connection closed");
}
