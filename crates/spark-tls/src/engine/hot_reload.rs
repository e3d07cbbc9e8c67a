use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::ServerConfig;

/// TLS 服务端配置的热更新容器。
///
/// # 设计动机（Why）
/// - 证书轮换不应中断监听，也不应影响已经在握手中的连接；
/// - 利用 `ArcSwap` 的“读无锁、写常数时间”特性，实现 RCU 式配置广播。
///
/// # 核心契约（What）
/// - 服务端引擎在收到 ClientHello 的那一刻读取一次快照，之后整个握手都使用该快照；
/// - `replace` 立即对后续握手可见，旧连接继续持有各自的 `Arc<ServerConfig>`。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 高频更新时会暂存多个 `Arc<ServerConfig>`，需结合握手并发度评估内存峰值。
#[derive(Clone)]
pub struct HotReloadingServerConfig {
    inner: Arc<ArcSwap<ServerConfig>>,
}

impl HotReloadingServerConfig {
    pub fn new(initial: Arc<ServerConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(initial)),
        }
    }

    /// 当前配置的共享快照；快照不会随后续热更而失效，也不会感知新配置。
    #[inline]
    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.inner.load_full()
    }

    /// 原子替换配置并返回旧值，便于调用方审计或延迟回收。
    #[inline]
    pub fn replace(&self, next: Arc<ServerConfig>) -> Arc<ServerConfig> {
        self.inner.swap(next)
    }
}

impl std::fmt::Debug for HotReloadingServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadingServerConfig").finish_non_exhaustive()
    }
}
