//! 握手结果的观测面：完成摘要、监听器与限流的失败日志。

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{
    connection::{ConnectionId, Direction},
    error::TlsError,
};

/// 日志字段用的微秒数，超出 `u64` 时饱和。
pub(crate) fn elapsed_micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

/// 握手完成时的连接摘要。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeSummary {
    pub connection: ConnectionId,
    pub direction: Direction,
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub server_name: Option<String>,
    pub alpn: Option<String>,
    pub elapsed: Duration,
    /// 会话建立后再次完成的握手（密钥更新等）。
    pub repeated: bool,
}

/// 握手完成/失败的观察者。
///
/// 回调在驱动握手的线程上同步执行，实现必须快速返回且不得 panic。
pub trait HandshakeListener: Send + Sync + 'static {
    fn on_handshake_complete(&self, summary: &HandshakeSummary);

    fn on_handshake_failed(&self, _connection: ConnectionId, _error: &TlsError) {}
}

/// 限流的握手失败日志。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 扫描器或证书错配会在短时间内制造海量握手失败；逐条 warn 会淹没日志管线，
///   完全静默又会丢失排障线索。
///
/// ## 逻辑（How）
/// - 原子计数器记录累计失败次数：前 `limit` 条以 warn 记录，第 `limit + 1` 条额外输出一次
///   “后续降级”的提示，其后全部以 trace 记录。
///
/// ## 契约（What）
/// - 计数只增不减，降级在端点生命周期内不可逆；
/// - `limit == 0` 时第一条失败即输出降级提示。
#[derive(Debug)]
pub struct HandshakeFailureLog {
    limit: u64,
    seen: AtomicU64,
}

/// 单次记录采用的级别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureLogLevel {
    Warn,
    Suppressed,
    Trace,
}

impl HandshakeFailureLog {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            seen: AtomicU64::new(0),
        }
    }

    pub fn record(
        &self,
        connection: ConnectionId,
        direction: Direction,
        error: &TlsError,
    ) -> FailureLogLevel {
        let ordinal = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let code = error.code();
        let category = error.category();
        if ordinal <= self.limit {
            tracing::warn!(%connection, %direction, code, %category, %error, "tls handshake failed");
            FailureLogLevel::Warn
        } else if ordinal == self.limit + 1 {
            tracing::warn!(
                %connection,
                %direction,
                code,
                %error,
                limit = self.limit,
                "tls handshake failed; further failures are logged at trace level"
            );
            FailureLogLevel::Suppressed
        } else {
            tracing::trace!(%connection, %direction, code, %error, "tls handshake failed");
            FailureLogLevel::Trace
        }
    }

    pub fn failures(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}
