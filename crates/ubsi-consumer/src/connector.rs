//! 连接管理与待决请求索引。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 同一容器的大量并发请求共享一条长连接，以请求 ID 区分应答，避免为每次调用建连；
//! - 大载荷或管理类调用需要独占连接，用完即拆；
//! - 消息投递模式的应答不经原连接返回，而经通知通道广播，需要按 ID 单独索引。
//!
//! ## 逻辑 (How)
//! - 连接池：`host#port -> OnceCell<PooledConnection>`，并发首次获取只会建一次连；
//!   建连失败或连接失效时移除对应的 `OnceCell`，下次获取重新建连；
//! - 三类索引：连接内按 ID（复用连接）、按通道编号（独占连接，单请求）、仅按 ID（消息投递）；
//! - 每条复用连接一个读任务：按 ID 取出待决请求完成之；读任务退出时以通道错误完成该连接上的全部待决请求；
//! - 超时清扫遍历三类索引，移除并以超时完成已过期的请求。
//!
//! ## 契约 (What)
//! - 索引项恰好被移除一次，由应答、清扫、连接失败三者中的先到者移除；
//! - 完成本身仍经 [`PendingCall::complete`] 的一次性闸门，迟到者被丢弃。

use crate::call::PendingCall;
use bytes::Bytes;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use ubsi_core::registry::container_name;
use ubsi_core::{ResponseEnvelope, ResultCode, ResultError, Value};
use ubsi_transport_tcp::{ChannelOptions, FrameReader, TcpChannel, TransportError, TransportErrorKind};

/// 复用连接。
#[derive(Debug)]
pub(crate) struct PooledConnection {
    name: String,
    channel: TcpChannel,
    pending: DashMap<String, Arc<PendingCall>>,
}

/// 建连结果。
pub(crate) enum Link {
    Pooled(Arc<PooledConnection>),
    Direct(TcpChannel, FrameReader),
}

/// 应答的回收方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// 经原连接返回。
    Reply,
    /// 不需要应答。
    Discard,
    /// 经通知通道返回。
    Message,
}

/// 请求登记在哪个索引中，用于调用方自行移除。
#[derive(Debug)]
pub(crate) enum Slot {
    None,
    Pooled(Arc<PooledConnection>),
    Direct(u64),
    Message,
}

struct DirectEntry {
    call: Arc<PendingCall>,
    channel: TcpChannel,
}

pub(crate) struct Connector {
    connect_timeout: Duration,
    options: ChannelOptions,
    pools: DashMap<String, Arc<OnceCell<Arc<PooledConnection>>>>,
    direct: DashMap<u64, DirectEntry>,
    messages: DashMap<String, Arc<PendingCall>>,
}

impl Connector {
    pub(crate) fn new(connect_timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            connect_timeout,
            options: ChannelOptions {
                write_idle: Some(heartbeat),
                ..Default::default()
            },
            pools: DashMap::new(),
            direct: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    /// 建立或复用到 `host:port` 的连接；`alone` 为真时建立独占连接。
    pub(crate) async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        alone: bool,
    ) -> Result<Link, TransportError> {
        if alone {
            let (channel, reader) =
                TcpChannel::connect(host, port, self.connect_timeout, self.options.clone()).await?;
            return Ok(Link::Direct(channel, reader));
        }
        self.pooled(host, port).await.map(Link::Pooled)
    }

    async fn pooled(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<Arc<PooledConnection>, TransportError> {
        let name = container_name(host, port);
        let mut retried = false;
        loop {
            let cell = Arc::clone(&self.pools.entry(name.clone()).or_default());
            let result = cell
                .get_or_try_init(|| self.open_pooled(host, port, name.clone()))
                .await
                .map(Arc::clone);
            match result {
                // 读任务尚未移除的失效连接：丢弃并重建一次
                Ok(conn) if conn.channel.is_closed() && !retried => {
                    self.pools.remove_if(&name, |_, c| Arc::ptr_eq(c, &cell));
                    retried = true;
                }
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    self.pools.remove_if(&name, |_, c| Arc::ptr_eq(c, &cell));
                    return Err(err);
                }
            }
        }
    }

    async fn open_pooled(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        name: String,
    ) -> Result<Arc<PooledConnection>, TransportError> {
        let (channel, reader) =
            TcpChannel::connect(host, port, self.connect_timeout, self.options.clone()).await?;
        tracing::debug!(addr = %name, channel = channel.id(), "pooled connection established");
        let conn = Arc::new(PooledConnection {
            name,
            channel,
            pending: DashMap::new(),
        });
        tokio::spawn(Arc::clone(self).read_pooled(Arc::clone(&conn), reader));
        Ok(conn)
    }

    /// 登记请求并写出。写失败时撤销登记。
    pub(crate) fn transmit(
        self: &Arc<Self>,
        link: Link,
        call: &Arc<PendingCall>,
        frame: Bytes,
        delivery: Delivery,
    ) -> Result<Slot, TransportError> {
        let id = call.id().to_owned();
        match link {
            Link::Pooled(conn) => {
                let slot = match delivery {
                    Delivery::Reply => {
                        conn.pending.insert(id.clone(), Arc::clone(call));
                        Slot::Pooled(Arc::clone(&conn))
                    }
                    Delivery::Message => {
                        self.messages.insert(id.clone(), Arc::clone(call));
                        Slot::Message
                    }
                    Delivery::Discard => Slot::None,
                };
                if let Err(err) = conn.channel.send(frame) {
                    self.release(&slot, &id);
                    return Err(err);
                }
                Ok(slot)
            }
            Link::Direct(channel, reader) => {
                let channel_id = channel.id();
                let slot = match delivery {
                    Delivery::Reply => {
                        self.direct.insert(
                            channel_id,
                            DirectEntry {
                                call: Arc::clone(call),
                                channel: channel.clone(),
                            },
                        );
                        tokio::spawn(Arc::clone(self).read_direct(channel_id, reader));
                        Slot::Direct(channel_id)
                    }
                    Delivery::Message => {
                        self.messages.insert(id.clone(), Arc::clone(call));
                        Slot::Message
                    }
                    Delivery::Discard => Slot::None,
                };
                let sent = channel.send(frame);
                if delivery != Delivery::Reply {
                    channel.close();
                }
                if let Err(err) = sent {
                    self.release(&slot, &id);
                    channel.close();
                    return Err(err);
                }
                Ok(slot)
            }
        }
    }

    /// 从索引中移除请求；独占连接随之关闭。
    pub(crate) fn release(&self, slot: &Slot, id: &str) {
        match slot {
            Slot::None => {}
            Slot::Pooled(conn) => {
                conn.pending.remove(id);
            }
            Slot::Direct(channel_id) => {
                if let Some((_, entry)) = self.direct.remove(channel_id) {
                    entry.channel.close();
                }
            }
            Slot::Message => {
                self.messages.remove(id);
            }
        }
    }

    async fn read_pooled(self: Arc<Self>, conn: Arc<PooledConnection>, mut reader: FrameReader) {
        let reason = loop {
            match reader.next_value().await {
                Ok(Some(value)) => match ResponseEnvelope::from_value(value) {
                    Ok(resp) => match conn.pending.remove(&resp.id) {
                        Some((_, call)) => {
                            call.complete(resp.code, resp.data);
                        }
                        None => {
                            tracing::trace!(addr = %conn.name, req_id = %resp.id, "response without pending request discarded");
                        }
                    },
                    Err(err) => {
                        tracing::warn!(addr = %conn.name, error = %err, "malformed response discarded");
                    }
                },
                Ok(None) => break "channel closed".to_owned(),
                Err(err) => {
                    tracing::warn!(addr = %conn.name, code = err.code(), error = %err, "pooled connection failed");
                    break err.to_string();
                }
            }
        };

        conn.channel.close();
        self.pools.remove_if(&conn.name, |_, cell| {
            cell.get().is_some_and(|c| Arc::ptr_eq(c, &conn))
        });
        let ids: Vec<String> = conn.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = conn.pending.remove(&id) {
                call.fail(ResultError::new(ResultCode::CHANNEL, reason.clone()));
            }
        }
        tracing::debug!(addr = %conn.name, "pooled connection removed");
    }

    async fn read_direct(self: Arc<Self>, channel_id: u64, mut reader: FrameReader) {
        let outcome = reader.next_value().await;
        let Some((_, entry)) = self.direct.remove(&channel_id) else {
            return;
        };
        entry.channel.close();
        let call = entry.call;
        match outcome {
            Ok(Some(value)) => match ResponseEnvelope::from_value(value) {
                Ok(resp) if resp.id == call.id() => {
                    call.complete(resp.code, resp.data);
                }
                Ok(resp) => {
                    call.fail(ResultError::new(
                        ResultCode::CHANNEL,
                        format!("unexpected response id {}", resp.id),
                    ));
                }
                Err(err) => {
                    call.fail(ResultError::new(ResultCode::CHANNEL, err.to_string()));
                }
            },
            Ok(None) => {
                call.fail(ResultError::new(ResultCode::CHANNEL, "channel closed"));
            }
            Err(err) => {
                call.fail(ResultError::new(ResultCode::CHANNEL, err.to_string()));
            }
        }
    }

    /// 处理通知通道上的应答；返回是否完成了某个请求。
    pub(crate) fn deliver_message(&self, bytes: &[u8]) -> bool {
        let resp = match ResponseEnvelope::decode(bytes) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(error = %err, "undecodable message discarded");
                return false;
            }
        };
        match self.messages.remove(&resp.id) {
            Some((_, call)) => call.complete(resp.code, resp.data),
            None => false,
        }
    }

    /// 以超时完成全部过期请求，返回完成数。
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let mut swept = 0;
        let conns: Vec<Arc<PooledConnection>> = self
            .pools
            .iter()
            .filter_map(|cell| cell.value().get().cloned())
            .collect();
        for conn in conns {
            swept += expire(&conn.pending, now);
        }
        swept += expire(&self.messages, now);

        let expired: Vec<u64> = self
            .direct
            .iter()
            .filter(|e| e.value().call.is_expired(now))
            .map(|e| *e.key())
            .collect();
        for channel_id in expired {
            if let Some((_, entry)) = self.direct.remove(&channel_id) {
                entry.channel.close();
                if entry.call.complete(ResultCode::TIMEOUT, timeout_data()) {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            tracing::debug!(swept, "timed out requests swept");
        }
        swept
    }

    /// 当前登记的待决请求数。
    pub(crate) fn pending_count(&self) -> usize {
        let pooled: usize = self
            .pools
            .iter()
            .filter_map(|cell| cell.value().get().map(|c| c.pending.len()))
            .sum();
        pooled + self.direct.len() + self.messages.len()
    }

    pub(crate) fn close_all(&self) {
        for cell in self.pools.iter() {
            if let Some(conn) = cell.value().get() {
                conn.channel.close();
            }
        }
        for entry in self.direct.iter() {
            entry.value().channel.close();
        }
    }
}

fn timeout_data() -> Value {
    Value::from("request timeout")
}

fn expire<K>(index: &DashMap<K, Arc<PendingCall>>, now: Instant) -> usize
where
    K: Eq + Hash + Clone,
{
    let expired: Vec<K> = index
        .iter()
        .filter(|e| e.value().is_expired(now))
        .map(|e| e.key().clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|key| index.remove(&key))
        .filter(|(_, call)| call.complete(ResultCode::TIMEOUT, timeout_data()))
        .count()
}

/// 传输错误到结果码的映射。
pub(crate) fn transport_failure(err: &TransportError) -> ResultError {
    let code = match err.kind() {
        TransportErrorKind::Connect => ResultCode::CONNECT,
        _ => ResultCode::CHANNEL,
    };
    ResultError::new(code, err.to_string())
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("pools", &self.pools.len())
            .field("direct", &self.direct.len())
            .field("messages", &self.messages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::Statistics;

    fn call(id: &str, timeout_ms: u64) -> Arc<PendingCall> {
        PendingCall::new(
            id.into(),
            "svc".into(),
            "get".into(),
            Some(Duration::from_millis(timeout_ms)),
            Vec::new(),
            Arc::new(Statistics::new()),
        )
    }

    fn connector() -> Arc<Connector> {
        Arc::new(Connector::new(Duration::from_secs(1), Duration::from_secs(3)))
    }

    #[test]
    fn message_index_delivers_once() {
        let connector = connector();
        let pending = call("m1", 10_000);
        connector.messages.insert("m1".into(), Arc::clone(&pending));

        let resp = ResponseEnvelope::new("m1", ResultCode::OK, Value::from("done"));
        let bytes = resp.encode().unwrap();
        assert!(connector.deliver_message(&bytes));
        assert!(!connector.deliver_message(&bytes));
        assert_eq!(pending.into_result(), Ok(Value::from("done")));
        assert!(!connector.deliver_message(b"\xff"));
    }

    #[test]
    fn sweep_times_out_and_discards_late_response() {
        let connector = connector();
        let slow = call("m2", 5);
        let fresh = call("m3", 60_000);
        connector.messages.insert("m2".into(), Arc::clone(&slow));
        connector.messages.insert("m3".into(), Arc::clone(&fresh));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(connector.sweep(later), 1);
        assert_eq!(connector.pending_count(), 1);
        assert_eq!(slow.into_result().unwrap_err().code, ResultCode::TIMEOUT);

        let late = ResponseEnvelope::new("m2", ResultCode::OK, Value::Null)
            .encode()
            .unwrap();
        assert!(!connector.deliver_message(&late));
        assert!(!fresh.is_completed());
    }

    #[tokio::test]
    async fn refused_connect_maps_to_connect_code() {
        let connector = connector();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = match connector.connect("127.0.0.1", port, false).await {
            Err(err) => err,
            Ok(_) => panic!("connect should fail"),
        };
        assert_eq!(transport_failure(&err).code, ResultCode::CONNECT);
        assert!(connector.pools.is_empty());
    }
}
