#![doc = r#"
# ubsi-transport-tcp

## 设计目标 (Why)
- 为调用端与容器端提供统一的“分帧 TCP 通道”：写入已加帧字节、读取解码后的值，
  并内建写空闲心跳与读空闲超时两种链路保活手段。

## 核心结构 (How)
- [`TcpChannel`]：写端句柄，可克隆；后台写任务串行写出并在空闲时发送心跳帧；
- [`FrameReader`]：读端，由连接拥有者驱动，吞掉心跳帧并返回解码后的 [`ubsi_core::Value`]；
- [`TcpListener`]：带 backlog 的监听器；
- [`TransportError`]：携带稳定错误码（`ubsi.transport.tcp.*`）与错误大类。

## 契约 (What)
- 所有 API 需在 Tokio 运行时内使用；
- 读端返回 `Ok(None)` 表示对端 EOF 或本端已关闭，调用方应随后调用 [`TcpChannel::close`]。
"#]

mod channel;
mod error;
mod listener;

pub use channel::{ChannelOptions, FrameReader, TcpChannel, TcpSocketConfig};
pub use error::{TransportError, TransportErrorKind};
pub use listener::TcpListener;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ubsi_core::Value;

    async fn pair(
        client_opts: ChannelOptions,
        server_opts: ChannelOptions,
    ) -> ((TcpChannel, FrameReader), (TcpChannel, FrameReader)) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap(), 16).expect("bind");
        let port = listener.local_addr().port();
        let accept = tokio::spawn(async move { listener.accept(server_opts).await });
        let client = TcpChannel::connect("127.0.0.1", port, Duration::from_secs(1), client_opts)
            .await
            .expect("connect");
        let (server, reader, _) = accept.await.expect("join").expect("accept");
        (client, (server, reader))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn values_cross_the_wire() {
        let ((client, mut client_reader), (server, mut server_reader)) =
            pair(ChannelOptions::default(), ChannelOptions::default()).await;

        let big = Value::Str("z".repeat(70_000));
        client.send_value(&Value::from("ping")).unwrap();
        client.send_value(&big).unwrap();
        assert_eq!(server_reader.next_value().await.unwrap(), Some(Value::from("ping")));
        assert_eq!(server_reader.next_value().await.unwrap(), Some(big));

        server.send_value(&Value::Int(7)).unwrap();
        assert_eq!(client_reader.next_value().await.unwrap(), Some(Value::Int(7)));

        client.close();
        assert_eq!(server_reader.next_value().await.unwrap(), None);
        assert!(client.send_value(&Value::Null).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_writer_keeps_idle_reader_alive() {
        let client_opts = ChannelOptions {
            write_idle: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let server_opts = ChannelOptions {
            read_idle: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let ((client, _client_reader), (_server, mut server_reader)) =
            pair(client_opts, server_opts).await;

        let reader = tokio::spawn(async move { server_reader.next_value().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        client.send_value(&Value::from("late")).unwrap();
        let got = reader.await.expect("join").expect("heartbeats kept link alive");
        assert_eq!(got, Some(Value::from("late")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_peer_trips_read_idle() {
        let server_opts = ChannelOptions {
            read_idle: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let ((_client, _client_reader), (_server, mut server_reader)) =
            pair(ChannelOptions::default(), server_opts).await;
        let err = server_reader.next_value().await.unwrap_err();
        assert_eq!(err.code(), "ubsi.transport.tcp.timeout");
    }

    #[tokio::test]
    async fn refused_connect_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap(), 1).expect("bind");
        let port = listener.local_addr().port();
        drop(listener);
        let err = TcpChannel::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            ChannelOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Connect);
    }
}
