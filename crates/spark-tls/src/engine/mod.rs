//! 记录层引擎抽象。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话编排层（握手驱动、读写适配器、协议探测）只依赖“wrap/unwrap + 握手状态”这组
//!   最小契约，不关心底层密码库；
//! - [`RustlsEngine`] 以 `rustls` 实现该契约，测试可以注入脚本化的引擎覆盖罕见路径
//!   （例如委派任务）。
//!
//! ## 逻辑（How）
//! - `wrap`：把至多一条记录的明文加密到目标段，或产出待发送的握手/告警数据；
//! - `unwrap`：从源缓冲消费至多一条完整记录，把解密出的明文写入目标段；
//! - 每次调用返回 [`EngineResult`]，携带操作状态、握手状态以及消费/产出字节数。
//!
//! ## 契约（What）
//! - `BufferUnderflow`：源缓冲不足一条记录，`consumed == 0`；
//! - `BufferOverflow`：目标段剩余空间不足，`consumed == produced == 0`，调用方扩容后重试；
//! - `Closed`：对应方向已关闭，不会再产出数据；
//! - 握手状态 `Finished` 只在握手完成的那次操作中报告一次，此后为 `NotHandshaking`。

mod context;
mod hot_reload;
pub mod record;
mod rustls_engine;

use std::{borrow::Cow, fmt, sync::Arc};

use spark_tls_buffer::Segment;
use thiserror::Error;

use crate::error::{ErrorCategory, SecurityClass};

pub use context::{RustlsContext, TlsContextFactory};
pub use hot_reload::HotReloadingServerConfig;
pub use rustls_engine::RustlsEngine;

/// 引擎角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineMode {
    Client,
    Server,
}

/// 单次 wrap/unwrap 的操作状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    Ok,
    BufferOverflow,
    BufferUnderflow,
    Closed,
}

/// 引擎报告的握手状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    Finished,
}

impl HandshakeStatus {
    /// 是否仍需驱动握手。
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            HandshakeStatus::NeedWrap | HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedTask
        )
    }
}

/// 一次引擎操作的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    pub fn new(
        status: EngineStatus,
        handshake: HandshakeStatus,
        consumed: usize,
        produced: usize,
    ) -> Self {
        Self {
            status,
            handshake,
            consumed,
            produced,
        }
    }

    /// 不消费、不产出的结果（下溢、溢出、关闭）。
    pub fn idle(status: EngineStatus, handshake: HandshakeStatus) -> Self {
        Self::new(status, handshake, 0, 0)
    }
}

/// 引擎交给调用方执行的委派任务（例如耗时的证书校验）。
pub struct DelegatedTask {
    job: Box<dyn FnOnce() + Send + 'static>,
}

impl DelegatedTask {
    pub fn new(job: impl FnOnce() + Send + 'static) -> Self {
        Self { job: Box::new(job) }
    }

    pub fn run(self) {
        (self.job)();
    }
}

impl fmt::Debug for DelegatedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelegatedTask")
    }
}

/// 服务端 ALPN 选择回调：收到 ClientHello 时调用。
///
/// 返回 `None` 表示不协商应用协议；返回的协议若不在客户端报价中，
/// 引擎同样视为未协商。
pub trait ProtocolSelector: Send + Sync + 'static {
    fn select(&self, offered: &[&[u8]]) -> Option<Vec<u8>>;
}

/// 引擎错误的性质。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    /// 输入无法按 TLS 解码（非法记录头、畸形消息）。
    Decode,
    /// 输入是 TLS，但协商或校验失败。
    Protocol,
    /// 引擎此前已失败，不能继续使用。
    Failed,
}

/// 记录层引擎错误。
#[derive(Debug, Error)]
#[error("{kind:?} error: {reason}")]
pub struct EngineError {
    kind: EngineErrorKind,
    category: ErrorCategory,
    reason: Cow<'static, str>,
}

impl EngineError {
    pub fn new(
        kind: EngineErrorKind,
        category: ErrorCategory,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            kind,
            category,
            reason: reason.into(),
        }
    }

    pub fn decode(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            EngineErrorKind::Decode,
            ErrorCategory::Security(SecurityClass::Integrity),
            reason,
        )
    }

    pub fn failed() -> Self {
        Self::new(
            EngineErrorKind::Failed,
            ErrorCategory::Internal,
            "engine unusable after an earlier failure",
        )
    }

    pub fn kind(&self) -> EngineErrorKind {
        self.kind
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_decode(&self) -> bool {
        self.kind == EngineErrorKind::Decode
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            EngineErrorKind::Decode => "spark.tls.engine.decode_failed",
            EngineErrorKind::Protocol => "spark.tls.engine.protocol_failed",
            EngineErrorKind::Failed => "spark.tls.engine.unusable",
        }
    }
}

/// 记录层引擎契约。
///
/// 实现者只需保证单线程可变访问的正确性（`&mut self`），跨线程移动由 `Send` 保证。
pub trait RecordEngine: Send {
    fn mode(&self) -> EngineMode;

    /// 加密 `src` 中至多一条记录的明文，或产出待发送的握手数据，写入 `dst`。
    fn wrap(&mut self, src: &[u8], dst: &mut Segment) -> Result<EngineResult, EngineError>;

    /// 从 `src` 开头消费至多一条完整记录，明文写入 `dst`。
    fn unwrap(&mut self, src: &[u8], dst: &mut Segment) -> Result<EngineResult, EngineError>;

    /// 当前握手状态（查询不会消耗一次性的 `Finished` 报告）。
    fn handshake_status(&self) -> HandshakeStatus;

    fn is_handshaking(&self) -> bool {
        self.handshake_status().is_handshaking()
    }

    /// 取出下一个委派任务。
    fn pending_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_inbound(&mut self);
    fn close_outbound(&mut self);
    fn is_inbound_done(&self) -> bool;
    fn is_outbound_done(&self) -> bool;

    /// wrap 目标段需要的最小剩余空间。
    fn packet_buffer_size(&self) -> usize {
        record::PACKET_BUFFER_SIZE
    }

    /// 单条记录解密后可能的最大明文长度。
    fn application_buffer_size(&self) -> usize {
        record::APPLICATION_BUFFER_SIZE
    }

    /// 原生 ALPN：设置本端报价（客户端）或偏好列表（服务端）。
    fn set_application_protocols(&mut self, protocols: &[String]);

    /// 服务端 ALPN 选择回调。返回 `false` 表示引擎不支持或已过了可设置的阶段。
    fn set_protocol_selector(&mut self, selector: Arc<dyn ProtocolSelector>) -> bool;

    fn negotiated_protocol(&self) -> Option<String>;
    fn protocol_version(&self) -> Option<String>;
    fn cipher_suite(&self) -> Option<String>;
    fn server_name(&self) -> Option<String>;
}
