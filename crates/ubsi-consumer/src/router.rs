//! 路由：本地路由表优先，注册表快照兜底，按权重随机选择节点。
//!
//! # 教案级注释
//!
//! ## 意图 (Why)
//! - 负载较低、心跳较新的容器应获得更多流量，但选择必须是概率性的，
//!   避免大量调用端在同一时刻同时涌向同一个“最优”节点；
//! - 连接失败的节点需要退避一段时间，之后以半权重重新参与选择，逐步恢复流量。
//!
//! ## 逻辑 (How)
//! 1. 本地路由表按具体程度降序（服务名字面前缀长度、是否精确；再比较接口名）稳定排序，
//!    首个名称与版本都匹配的表项生效：
//!    - 模拟路由返回登记的模拟数据；
//!    - 显式节点列表直接进入加权选择；
//!    - 未声明节点的表项回落到注册表。
//! 2. 注册表快照中筛除：未托管该服务、状态非运行、版本不符、记录失效、等待数达到过载阈值的容器；
//!    其余容器权重为 `overload / max(1, waiting)`。
//! 3. 权重调整顺序固定为：心跳超过半个接收窗口先减半；随后若处于失败标记中，
//!    退避窗口内权重归零，窗口外再减半。权重为 0 的节点不参与选择。
//! 4. 在 `[0, total)` 均匀抽样，取首个累积权重不小于抽样值的节点。
//!
//! ## 契约 (What)
//! - 注册表快照写时复制：读者持有 `Arc` 快照，写者整体替换；
//! - 无可用节点时返回 [`ResultCode::ROUTER`]，模拟数据缺失时返回 [`ResultCode::MOCK`]。

use crate::mock::MockRegistry;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ubsi_core::registry::{BEATHEART_RECV_MS, STATUS_RUNNING, container_name, parse_container_name};
use ubsi_core::util::{match_pattern, pattern_specificity};
use ubsi_core::{Clock, ContainerRecord, ResultCode, ResultError, Value, VersionRange};

/// 一个可选节点及其权重。
#[derive(Debug, Clone, PartialEq)]
pub struct RouteNode {
    pub host: String,
    pub port: u16,
    pub weight: f64,
}

impl RouteNode {
    pub fn new(host: impl Into<String>, port: u16, weight: f64) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// 容器名 `host#port`。
    pub fn name(&self) -> String {
        container_name(&self.host, self.port)
    }
}

/// 本地路由表项。
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRoute {
    pub service: Option<String>,
    pub entry: Option<String>,
    pub version: VersionRange,
    pub mock: bool,
    pub nodes: Option<Vec<RouteNode>>,
}

impl LocalRoute {
    fn specificity(&self) -> ((usize, bool), (usize, bool)) {
        (
            pattern_specificity(self.service.as_deref()),
            pattern_specificity(self.entry.as_deref()),
        )
    }

    fn matches(&self, service: &str, entry: &str, version: &VersionRange) -> bool {
        match_pattern(self.service.as_deref(), service)
            && match_pattern(self.entry.as_deref(), entry)
            && version.within(&self.version)
    }
}

/// 路由决议结果。
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// 以模拟数据直接完成。
    Mock(Value),
    /// 权重已调整、均大于 0 的候选节点。
    Nodes(Vec<RouteNode>),
}

/// 选中的目标。
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Mock(Value),
    Node(RouteNode),
}

/// 加权抽样：`draw` 取值 `[0, 1)`。
pub fn pick_weighted(nodes: &[RouteNode], draw: f64) -> Option<&RouteNode> {
    let total: f64 = nodes.iter().map(|n| n.weight).sum();
    if nodes.is_empty() || total <= 0.0 {
        return None;
    }
    let target = draw.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    for node in nodes {
        cumulative += node.weight;
        if cumulative >= target {
            return Some(node);
        }
    }
    nodes.last()
}

pub struct Router {
    clock: Arc<dyn Clock>,
    backoff_ms: i64,
    local: ArcSwap<Vec<LocalRoute>>,
    registry: ArcSwap<BTreeMap<String, ContainerRecord>>,
    disabled: DashMap<String, i64>,
    store_active: AtomicBool,
    mocks: Arc<MockRegistry>,
}

impl Router {
    pub fn new(clock: Arc<dyn Clock>, reconnect_backoff: Duration, mocks: Arc<MockRegistry>) -> Self {
        Self {
            clock,
            backoff_ms: reconnect_backoff.as_millis() as i64,
            local: ArcSwap::from_pointee(Vec::new()),
            registry: ArcSwap::from_pointee(BTreeMap::new()),
            disabled: DashMap::new(),
            store_active: AtomicBool::new(false),
            mocks,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 安装本地路由表；按具体程度降序稳定排序。
    pub fn set_local_routes(&self, mut routes: Vec<LocalRoute>) {
        routes.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        self.local.store(Arc::new(routes));
    }

    pub fn local_routes(&self) -> Arc<Vec<LocalRoute>> {
        self.local.load_full()
    }

    pub fn registry(&self) -> Arc<BTreeMap<String, ContainerRecord>> {
        self.registry.load_full()
    }

    pub fn install_registry(&self, records: BTreeMap<String, ContainerRecord>) {
        self.registry.store(Arc::new(records));
    }

    pub fn store_active(&self) -> bool {
        self.store_active.load(Ordering::Acquire)
    }

    pub(crate) fn set_store_active(&self, active: bool) {
        self.store_active.store(active, Ordering::Release);
    }

    /// 记录一次连接失败。
    pub fn mark_failed(&self, name: &str) {
        let now = self.clock.now_millis();
        tracing::warn!(addr = name, "connect failed, node disabled");
        self.disabled.insert(name.to_owned(), now);
    }

    /// 连接成功后清除失败标记。
    pub fn mark_connected(&self, name: &str) {
        if self.disabled.remove(name).is_some() {
            tracing::info!(addr = name, "node re-enabled");
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.contains_key(name)
    }

    fn disabled_factor(&self, name: &str, now: i64) -> f64 {
        match self.disabled.get(name) {
            None => 1.0,
            Some(failed_at) if now - *failed_at < self.backoff_ms => 0.0,
            Some(_) => 0.5,
        }
    }

    /// 决议候选节点，不做随机选择。
    pub fn resolve(
        &self,
        service: &str,
        entry: &str,
        version: &VersionRange,
    ) -> Result<Resolution, ResultError> {
        self.resolve_with(service, entry, version, true)
    }

    /// 同 [`Router::resolve`]，但跳过只转发不托管的容器（类名为空的服务记录）。
    pub fn resolve_hosting(
        &self,
        service: &str,
        entry: &str,
        version: &VersionRange,
    ) -> Result<Resolution, ResultError> {
        self.resolve_with(service, entry, version, false)
    }

    fn resolve_with(
        &self,
        service: &str,
        entry: &str,
        version: &VersionRange,
        include_doors: bool,
    ) -> Result<Resolution, ResultError> {
        let now = self.clock.now_millis();
        let local = self.local.load();
        if let Some(route) = local.iter().find(|r| r.matches(service, entry, version)) {
            if route.mock {
                return self.mocks.lookup(service, entry).map(Resolution::Mock);
            }
            if let Some(nodes) = &route.nodes {
                let nodes = nodes
                    .iter()
                    .filter_map(|node| {
                        let base = if node.weight > 0.0 { node.weight } else { 1.0 };
                        let weight = base * self.disabled_factor(&node.name(), now);
                        (weight > 0.0).then(|| RouteNode::new(node.host.clone(), node.port, weight))
                    })
                    .collect();
                return non_empty(nodes, service);
            }
        }

        let registry = self.registry.load();
        let store_active = self.store_active();
        let mut nodes = Vec::new();
        for (name, record) in registry.iter() {
            let Some(srv) = record.services.get(service) else {
                continue;
            };
            if srv.status != STATUS_RUNNING
                || (!include_doors && srv.class_name.is_empty())
                || !version.accepts(srv.version, srv.release)
                || record.is_invalid(now, store_active)
                || record.waiting >= record.overload
            {
                continue;
            }
            let Some((host, port)) = parse_container_name(name) else {
                continue;
            };
            let mut weight = f64::from(record.overload) / f64::from(record.waiting.max(1));
            if now - record.timestamp > BEATHEART_RECV_MS / 2 {
                weight /= 2.0;
            }
            weight *= self.disabled_factor(name, now);
            if weight > 0.0 {
                nodes.push(RouteNode::new(host, port, weight));
            }
        }
        non_empty(nodes, service)
    }

    /// 决议并抽样选择目标。
    pub fn get_server(
        &self,
        service: &str,
        entry: &str,
        version: &VersionRange,
    ) -> Result<Route, ResultError> {
        pick(self.resolve(service, entry, version)?, service)
    }

    /// 同 [`Router::get_server`]，只选择真正托管服务的容器。
    pub fn get_hosting_server(
        &self,
        service: &str,
        entry: &str,
        version: &VersionRange,
    ) -> Result<Route, ResultError> {
        pick(self.resolve_hosting(service, entry, version)?, service)
    }
}

fn pick(resolution: Resolution, service: &str) -> Result<Route, ResultError> {
    match resolution {
        Resolution::Mock(data) => Ok(Route::Mock(data)),
        Resolution::Nodes(nodes) => pick_weighted(&nodes, rand::random::<f64>())
            .cloned()
            .map(Route::Node)
            .ok_or_else(|| no_route(service)),
    }
}

fn non_empty(nodes: Vec<RouteNode>, service: &str) -> Result<Resolution, ResultError> {
    if nodes.is_empty() {
        Err(no_route(service))
    } else {
        Ok(Resolution::Nodes(nodes))
    }
}

fn no_route(service: &str) -> ResultError {
    ResultError::new(ResultCode::ROUTER, format!("no available node for service `{service}`"))
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("local_routes", &self.local.load().len())
            .field("containers", &self.registry.load().len())
            .field("disabled", &self.disabled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use ubsi_core::ManualClock;
    use ubsi_core::registry::ServiceRecord;

    const NOW: i64 = 1_700_000_000_000;

    fn record(overload: u32, waiting: u32, timestamp: i64) -> ContainerRecord {
        let mut record = ContainerRecord {
            overload,
            waiting,
            timestamp,
            ..Default::default()
        };
        record.services.insert(
            "svc".into(),
            ServiceRecord {
                status: STATUS_RUNNING,
                version: 1_000_000,
                release: true,
                ..Default::default()
            },
        );
        record
    }

    fn router(clock: Arc<ManualClock>) -> Router {
        Router::new(clock, Duration::from_secs(180), Arc::new(MockRegistry::new()))
    }

    fn nodes_of(resolution: Resolution) -> Vec<RouteNode> {
        match resolution {
            Resolution::Nodes(nodes) => nodes,
            Resolution::Mock(_) => panic!("unexpected mock"),
        }
    }

    #[test]
    fn weights_follow_load_and_converge() {
        let router = router(ManualClock::new(NOW));
        router.install_registry(BTreeMap::from([
            ("a#1".to_owned(), record(100, 10, NOW)),
            ("b#1".to_owned(), record(100, 90, NOW)),
        ]));
        let nodes = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(nodes[0].weight, 10.0);
        assert!((nodes[1].weight - 100.0 / 90.0).abs() < 1e-9);

        let draws = 200_000;
        let mut hits_a = 0usize;
        for _ in 0..draws {
            if let Ok(Route::Node(node)) = router.get_server("svc", "x", &VersionRange::ANY)
                && node.host == "a"
            {
                hits_a += 1;
            }
        }
        let expected = 10.0 / (10.0 + 100.0 / 90.0);
        let observed = hits_a as f64 / draws as f64;
        assert!((observed - expected).abs() < 0.01, "observed {observed}, expected {expected}");
    }

    #[test]
    fn cumulative_pick_is_first_reaching_draw() {
        let nodes = vec![RouteNode::new("a", 1, 1.0), RouteNode::new("b", 1, 3.0)];
        assert_eq!(pick_weighted(&nodes, 0.0).unwrap().host, "a");
        assert_eq!(pick_weighted(&nodes, 0.25).unwrap().host, "a");
        assert_eq!(pick_weighted(&nodes, 0.26).unwrap().host, "b");
        assert_eq!(pick_weighted(&nodes, 0.999).unwrap().host, "b");
        assert!(pick_weighted(&[], 0.5).is_none());
    }

    #[test]
    fn filters_unusable_containers() {
        let router = router(ManualClock::new(NOW));
        router.set_store_active(true);
        let mut paused = record(100, 0, NOW);
        paused.services.get_mut("svc").unwrap().status = -1;
        router.install_registry(BTreeMap::from([
            ("stale#1".to_owned(), record(100, 0, NOW - BEATHEART_RECV_MS - 1)),
            ("full#1".to_owned(), record(100, 100, NOW)),
            ("paused#1".to_owned(), paused),
            ("half#1".to_owned(), record(100, 0, NOW - BEATHEART_RECV_MS / 2 - 1)),
        ]));
        let nodes = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(nodes, vec![RouteNode::new("half", 1, 50.0)]);

        let newer = VersionRange {
            min: 2_000_000,
            ..VersionRange::ANY
        };
        let err = router.resolve("svc", "x", &newer).unwrap_err();
        assert_eq!(err.code, ResultCode::ROUTER);
        assert!(router.resolve("other", "x", &VersionRange::ANY).is_err());
    }

    #[test]
    fn hosting_resolution_skips_forward_doors() {
        let router = router(ManualClock::new(NOW));
        let mut hosting = record(100, 0, NOW);
        hosting.services.get_mut("svc").unwrap().class_name = "demo.Svc".into();
        router.install_registry(BTreeMap::from([
            ("door#1".to_owned(), record(100, 0, NOW)),
            ("real#1".to_owned(), hosting),
        ]));
        let all = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(all.len(), 2);
        let hosting = nodes_of(router.resolve_hosting("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(hosting, vec![RouteNode::new("real", 1, 100.0)]);
    }

    #[test]
    fn exact_route_beats_wildcard_regardless_of_order() {
        let router = router(ManualClock::new(NOW));
        let wildcard = LocalRoute {
            service: Some("user*".into()),
            entry: None,
            version: VersionRange::ANY,
            mock: false,
            nodes: Some(vec![RouteNode::new("wild", 1, 1.0)]),
        };
        let exact = LocalRoute {
            service: Some("users".into()),
            nodes: Some(vec![RouteNode::new("exact", 1, 1.0)]),
            ..wildcard.clone()
        };
        let catch_all = LocalRoute {
            service: None,
            nodes: Some(vec![RouteNode::new("any", 1, 1.0)]),
            ..wildcard.clone()
        };
        router.set_local_routes(vec![catch_all, wildcard, exact]);

        let pick = |service: &str| match router.get_server(service, "list", &VersionRange::ANY) {
            Ok(Route::Node(node)) => node.host,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(pick("users"), "exact");
        assert_eq!(pick("userx"), "wild");
        assert_eq!(pick("orders"), "any");
    }

    #[test]
    fn mock_route_and_registry_fallback() {
        let mocks = Arc::new(MockRegistry::new());
        let router = Router::new(ManualClock::new(NOW), Duration::from_secs(180), Arc::clone(&mocks));
        router.set_local_routes(vec![
            LocalRoute {
                service: Some("pay".into()),
                entry: None,
                version: VersionRange::ANY,
                mock: true,
                nodes: None,
            },
            LocalRoute {
                service: Some("svc".into()),
                entry: None,
                version: VersionRange::ANY,
                mock: false,
                nodes: None,
            },
            LocalRoute {
                service: Some("none".into()),
                entry: None,
                version: VersionRange::ANY,
                mock: false,
                nodes: Some(Vec::new()),
            },
        ]);
        assert_eq!(
            router.get_server("pay", "go", &VersionRange::ANY).unwrap_err().code,
            ResultCode::MOCK
        );
        mocks.set("pay", "go", Value::from("ok"));
        assert_eq!(
            router.get_server("pay", "go", &VersionRange::ANY).unwrap(),
            Route::Mock(Value::from("ok"))
        );

        router.install_registry(BTreeMap::from([("reg#9".to_owned(), record(100, 0, NOW))]));
        assert_eq!(
            router.get_server("svc", "x", &VersionRange::ANY).unwrap(),
            Route::Node(RouteNode::new("reg", 9, 100.0))
        );
        assert_eq!(
            router.get_server("none", "x", &VersionRange::ANY).unwrap_err().code,
            ResultCode::ROUTER
        );
    }

    #[test]
    #[traced_test]
    fn failed_node_backs_off_then_returns_at_half_weight() {
        let clock = ManualClock::new(NOW);
        let router = router(Arc::clone(&clock));
        router.install_registry(BTreeMap::from([
            ("a#1".to_owned(), record(100, 0, NOW)),
            ("b#1".to_owned(), record(100, 0, NOW)),
        ]));
        router.mark_failed("a#1");
        assert!(logs_contain("connect failed, node disabled"));

        let nodes = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(nodes, vec![RouteNode::new("b", 1, 100.0)]);

        clock.advance(Duration::from_secs(181));
        // keep records fresh relative to the advanced clock
        router.install_registry(BTreeMap::from([
            ("a#1".to_owned(), record(100, 0, clock.now_millis())),
            ("b#1".to_owned(), record(100, 0, clock.now_millis())),
        ]));
        let nodes = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(
            nodes,
            vec![RouteNode::new("a", 1, 50.0), RouteNode::new("b", 1, 100.0)]
        );

        router.mark_connected("a#1");
        assert!(logs_contain("node re-enabled"));
        let nodes = nodes_of(router.resolve("svc", "x", &VersionRange::ANY).unwrap());
        assert_eq!(nodes[0].weight, 100.0);
    }

    #[test]
    fn all_explicit_nodes_disabled_is_router_error() {
        let router = router(ManualClock::new(NOW));
        router.set_local_routes(vec![LocalRoute {
            service: None,
            entry: None,
            version: VersionRange::ANY,
            mock: false,
            nodes: Some(vec![RouteNode::new("h", 1, 1.0)]),
        }]);
        router.mark_failed("h#1");
        let err = router.get_server("svc", "x", &VersionRange::ANY).unwrap_err();
        assert_eq!(err.code, ResultCode::ROUTER);
    }
}
