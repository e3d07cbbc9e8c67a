use std::{borrow::Cow, fmt, io, time::Duration};

use thiserror::Error;

use crate::engine::EngineError;

/// 安全事件的细分类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecurityClass {
    /// 报文完整性或协议一致性被破坏（解码失败、MAC 错误、非法参数）。
    Integrity,
    /// 身份认证失败（证书缺失、过期、不可信）。
    Authentication,
    /// 对端拒绝授权。
    Authorization,
    /// 无法进一步细分的安全事件。
    Unknown,
}

/// 错误分类：供上层决定重试、熔断或安全告警。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 调用方不应解析错误文案来决定下一步动作；分类把“能否重试、等待多久、是否需要告警”
///   以结构化方式暴露出来。
///
/// ## 契约（What）
/// - `Retryable` 携带建议等待时间，调用方可据此退避；
/// - `Closed` 表示会话已终止，重试必须建立新会话；
/// - `Configuration` 表示部署问题，重试没有意义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Security(SecurityClass),
    Retryable(Duration),
    ResourceExhausted,
    Closed,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Security(class) => write!(f, "security({class:?})"),
            ErrorCategory::Retryable(wait) => write!(f, "retryable(after={}ms)", wait.as_millis()),
            ErrorCategory::ResourceExhausted => f.write_str("resource_exhausted"),
            ErrorCategory::Closed => f.write_str("closed"),
            ErrorCategory::Configuration => f.write_str("configuration"),
            ErrorCategory::Internal => f.write_str("internal"),
        }
    }
}

/// 描述一次 TLS 操作的错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.tls.handshake_failed",
    message: "tls handshake",
};

pub const READ: OperationKind = OperationKind {
    code: "spark.tls.read_failed",
    message: "tls read",
};

pub const WRITE: OperationKind = OperationKind {
    code: "spark.tls.write_failed",
    message: "tls write",
};

pub const FLUSH: OperationKind = OperationKind {
    code: "spark.tls.flush_failed",
    message: "tls flush",
};

pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.tls.shutdown_failed",
    message: "tls shutdown",
};

/// TLS 会话层统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手驱动、读写适配器与配置层共享同一错误枚举，调用方只需匹配一种类型；
/// - 每个变体都有稳定错误码（[`TlsError::code`]）与分类（[`TlsError::category`]），
///   便于日志聚合与自动化决策。
///
/// ## 契约（What）
/// - `ReadNeeded` 与 `BufferTooSmall` 只在会话内部流转，驱动循环会消化它们，
///   正常情况下不会泄漏给调用方；
/// - `SessionClosed` 表示会话已关闭或对端发送了 close_notify，且本次调用没有交付任何数据；
/// - `HandshakeFailed` 在返回前已释放握手期间租借的全部缓冲。
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("tls handshake failed: {reason}")]
    HandshakeFailed {
        reason: Cow<'static, str>,
        category: ErrorCategory,
    },
    #[error("more ciphertext is required ({missing} bytes missing)")]
    ReadNeeded { missing: usize },
    #[error("tls session closed")]
    SessionClosed,
    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("invalid tls configuration: {reason}")]
    ConfigurationInvalid { reason: Cow<'static, str> },
    #[error("{} failed: {source}", .operation.message)]
    Transport {
        operation: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl TlsError {
    pub fn configuration(reason: impl Into<Cow<'static, str>>) -> Self {
        TlsError::ConfigurationInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(operation: OperationKind, source: io::Error) -> Self {
        TlsError::Transport { operation, source }
    }

    /// 以实际发起的操作重新标记传输错误，其余变体原样返回。
    pub(crate) fn during(self, operation: OperationKind) -> Self {
        match self {
            TlsError::Transport { source, .. } => TlsError::Transport { operation, source },
            other => other,
        }
    }

    /// 把任意会话错误收敛为握手失败，保留原始分类。
    pub(crate) fn into_handshake_failure(self) -> Self {
        match self {
            failed @ TlsError::HandshakeFailed { .. } => failed,
            other => {
                let category = other.category();
                TlsError::HandshakeFailed {
                    reason: Cow::Owned(other.to_string()),
                    category,
                }
            }
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TlsError::HandshakeFailed { .. } => HANDSHAKE.code,
            TlsError::ReadNeeded { .. } => "spark.tls.read_needed",
            TlsError::SessionClosed => "spark.tls.session_closed",
            TlsError::BufferTooSmall { .. } => "spark.tls.buffer_too_small",
            TlsError::ConfigurationInvalid { .. } => "spark.tls.configuration_invalid",
            TlsError::Transport { operation, .. } => operation.code,
            TlsError::Engine(error) => error.code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TlsError::HandshakeFailed { category, .. } => *category,
            TlsError::ReadNeeded { .. } => ErrorCategory::Retryable(Duration::ZERO),
            TlsError::SessionClosed => ErrorCategory::Closed,
            TlsError::BufferTooSmall { .. } => ErrorCategory::ResourceExhausted,
            TlsError::ConfigurationInvalid { .. } => ErrorCategory::Configuration,
            TlsError::Transport { source, .. } => categorize_io_error(source),
            TlsError::Engine(error) => error.category(),
        }
    }

    /// 会话是否因关闭而终止（本地关闭、对端 close_notify 或连接中断）。
    pub fn is_closed(&self) -> bool {
        match self {
            TlsError::SessionClosed => true,
            TlsError::Transport { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<TlsError> for io::Error {
    fn from(error: TlsError) -> Self {
        match error {
            TlsError::Transport { source, .. } => source,
            TlsError::SessionClosed => {
                io::Error::new(io::ErrorKind::UnexpectedEof, TlsError::SessionClosed)
            }
            other => io::Error::other(other),
        }
    }
}

pub type Result<T, E = TlsError> = std::result::Result<T, E>;

pub(crate) fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => retryable(Duration::from_millis(5)),
        ErrorKind::TimedOut | ErrorKind::UnexpectedEof => retryable(Duration::from_millis(40)),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionRefused
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => retryable(Duration::from_millis(60)),
        ErrorKind::WriteZero | ErrorKind::OutOfMemory => ErrorCategory::ResourceExhausted,
        _ => retryable(Duration::from_millis(25)),
    }
}

pub(crate) fn retryable(wait: Duration) -> ErrorCategory {
    ErrorCategory::Retryable(wait)
}
