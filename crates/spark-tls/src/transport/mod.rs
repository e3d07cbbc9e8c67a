//! 底层字节传输抽象。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 会话层只需要“带最小字节数与超时的读”“带超时的写”两种原语；
//!   把它们收敛为 [`Transport`]，握手驱动与读写适配器即可同时服务于 tokio 套接字与内存管道。
//!
//! ## 逻辑（How）
//! - 所有原语都是 `poll_*` 形式：异步调用方直接 `.await`，阻塞调用方通过
//!   `futures::executor::block_on` 等待同一个状态机，两种模式共享一套驱动代码；
//! - 每次请求携带 [`ReadRequest`]/[`WriteRequest`]，其中的超时与排队选项来自会话配置。
//!
//! ## 契约（What）
//! - `poll_read` 向 `dst` 的可写区间追加数据并 `commit`，返回追加的字节数；
//!   返回 `0` 表示对端已关闭写方向；调用方保证 `dst.spare_capacity() >= min_bytes`；
//! - `poll_write` 返回本次接受的字节数，可能小于 `src.len()`；
//! - `IoTimeout::Immediate` 在数据不可用时立即以 `TimedOut` 失败，
//!   `IoTimeout::Abort` 直接以 `ConnectionAborted` 失败。

mod memory;
#[cfg(feature = "runtime-tokio")]
mod tokio_io;

use std::{
    io,
    task::{Context, Poll},
    time::Duration,
};

use spark_tls_buffer::Segment;

pub use memory::{MemoryTransport, TransportStats};
#[cfg(feature = "runtime-tokio")]
pub use tokio_io::TokioTransport;

/// 单次 I/O 请求的超时语义。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IoTimeout {
    /// 使用传输自身的默认行为（通常为无限等待）。
    #[default]
    Default,
    /// 数据不可用时立即失败。
    Immediate,
    /// 不执行 I/O，直接中止。
    Abort,
    /// 超过给定时长仍未完成则失败。
    After(Duration),
}

/// 读请求。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadRequest {
    /// 至少读到多少字节才返回（EOF 除外）。
    pub min_bytes: usize,
    /// 即使数据已就绪也先让出一次调度，把完成通知排入队列。
    pub force_queue: bool,
    pub timeout: IoTimeout,
}

/// 写请求。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteRequest {
    pub force_queue: bool,
    pub timeout: IoTimeout,
}

/// 会话层使用的双向字节传输。
pub trait Transport: Send {
    fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        dst: &mut Segment,
        request: &ReadRequest,
    ) -> Poll<io::Result<usize>>;

    fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        src: &[u8],
        request: &WriteRequest,
    ) -> Poll<io::Result<usize>>;

    /// 关闭写方向并释放底层资源；重复调用无副作用。
    fn shutdown(&mut self);
}

/// 把 `Abort`/`Immediate` 超时翻译为立即完成的错误。
pub(crate) fn immediate_outcome(timeout: IoTimeout, ready: bool) -> Option<io::Error> {
    match timeout {
        IoTimeout::Abort => Some(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "i/o aborted by request",
        )),
        IoTimeout::Immediate if !ready => Some(io::Error::new(
            io::ErrorKind::TimedOut,
            "i/o not immediately ready",
        )),
        _ => None,
    }
}
