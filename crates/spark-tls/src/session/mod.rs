//! TLS 会话：握手生命周期、读写适配器与幂等关闭。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 上层协议栈只想要“一条加密的字节流”：会话把握手驱动、明文 backlog、密文缓冲与
//!   ALPN 结果收拢在一个 `&mut self` 对象里，由借用检查器保证同一会话同时只有一个
//!   握手或读写在进行；
//! - 关闭可能来自另一个线程（[`SessionCloser`]），与进行中的读写互相竞争；
//!   只有拆除路径需要锁，且恰好执行一次。
//!
//! ## 逻辑（How）
//! - 会话创建时处于握手阶段；`poll_establish` 驱动 [`HandshakeDriver`]，完成后执行
//!   完成钩子：取回 ALPN 结果（只写一次）、撤销 ALPN 注册、通知监听器并记录摘要；
//! - 读路径先交付 backlog，再解密已缓冲的密文，最后才发起网络读（见 `read.rs`）；
//! - 写路径按引擎最大分片切块加密，每产出一条记录即刷出（见 `write.rs`）；
//! - 任何致命错误都会先拆除会话（释放全部段、关闭传输）再返回。
//!
//! ## 契约（What）
//! - `close` 之后：读返回 `Ok(0)`，写返回已接受的字节数，不会记录错误日志；
//! - 对端 close_notify 视为 EOF：读返回 `Ok(0)`；
//! - 握手失败经 [`HandshakeFailureLog`] 限流记录，并通知所有监听器；
//! - `TlsSession` 是 `Send`，挂起后可以在其他工作线程上恢复。

mod backlog;
#[cfg(feature = "runtime-tokio")]
mod io;
mod read;
mod write;

use std::{
    fmt,
    future::poll_fn,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::{
    alpn::{AlpnRegistration, HTTP_1_1},
    connection::{ConnectionId, Direction},
    discriminator::Discriminator,
    endpoint::TlsEndpoint,
    engine::EngineError,
    error::{Result, TlsError},
    handshake::{HandshakeDriver, HandshakeOutcome, HandshakeStep, TaskExecutor},
    record_io::RecordIo,
    telemetry::{HandshakeFailureLog, HandshakeListener, HandshakeSummary, elapsed_micros},
    transport::Transport,
};

use backlog::DecryptedBacklog;

/// 会话关闭的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// 调用方主动关闭。
    Requested,
    /// 发送 close_notify 后的优雅关闭。
    Shutdown,
    HandshakeFailed,
    /// 读写过程中出现不可恢复的错误。
    Failed,
    /// 会话被丢弃时仍未关闭。
    Dropped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Requested => "requested",
            CloseReason::Shutdown => "shutdown",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::Failed => "failed",
            CloseReason::Dropped => "dropped",
        })
    }
}

#[derive(Debug, Default)]
struct CloseState {
    reason: Option<CloseReason>,
    released: bool,
}

/// 会话与其关闭句柄共享的状态。
struct SessionShared {
    connection: ConnectionId,
    closed: AtomicBool,
    state: Mutex<CloseState>,
    waker: AtomicWaker,
}

impl SessionShared {
    fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            closed: AtomicBool::new(false),
            state: Mutex::new(CloseState::default()),
            waker: AtomicWaker::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 记录关闭原因；只有第一次调用返回 `true`。
    fn mark_closed(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        self.closed.store(true, Ordering::Release);
        true
    }
}

/// 跨线程关闭会话的句柄。
///
/// 关闭只标记状态并唤醒挂起中的操作；缓冲释放由会话在下一次轮询或被丢弃时完成。
#[derive(Clone)]
pub struct SessionCloser {
    shared: Arc<SessionShared>,
}

impl SessionCloser {
    /// 返回本次调用是否首次关闭了会话。
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.shared.mark_closed(reason);
        if first {
            tracing::debug!(connection_id = %self.shared.connection, %reason, "tls session close requested");
        }
        self.shared.waker.wake();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl fmt::Debug for SessionCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCloser")
            .field("connection", &self.shared.connection)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 端点注入会话的协作者。
#[derive(Clone)]
pub(crate) struct SessionHooks {
    pub(crate) listeners: Arc<[Arc<dyn HandshakeListener>]>,
    pub(crate) failure_log: Arc<HandshakeFailureLog>,
    pub(crate) executor: Option<Arc<dyn TaskExecutor>>,
    pub(crate) discriminator: Option<Arc<Discriminator>>,
}

enum SessionPhase {
    Handshaking(Box<HandshakeDriver>),
    Established,
    Closed,
}

/// 一条 TLS 会话。
pub struct TlsSession<T: Transport> {
    io: RecordIo<T>,
    phase: SessionPhase,
    backlog: DecryptedBacklog,
    negotiated: Option<String>,
    alpn: Option<AlpnRegistration>,
    shared: Arc<SessionShared>,
    hooks: SessionHooks,
    summary: Option<HandshakeSummary>,
    pending_failure: Option<EngineError>,
    established_once: bool,
    peer_closed: bool,
    close_sent: bool,
}

impl<T: Transport> TlsSession<T> {
    pub(crate) fn new(io: RecordIo<T>, hooks: SessionHooks, alpn: Option<AlpnRegistration>) -> Self {
        let shared = Arc::new(SessionShared::new(io.connection()));
        let driver = HandshakeDriver::new(hooks.executor.clone());
        tracing::debug!(
            connection_id = %io.connection(),
            direction = %io.direction(),
            alpn_strategy = ?alpn.as_ref().map(AlpnRegistration::kind),
            "tls session created"
        );
        Self {
            io,
            phase: SessionPhase::Handshaking(Box::new(driver)),
            backlog: DecryptedBacklog::default(),
            negotiated: None,
            alpn,
            shared,
            hooks,
            summary: None,
            pending_failure: None,
            established_once: false,
            peer_closed: false,
            close_sent: false,
        }
    }

    /// 接手协议探测留下的状态：已解出的明文进入 backlog，引擎此前的失败在握手时报告。
    pub(crate) fn resume(
        mut self,
        plaintext: spark_tls_buffer::SegmentArray,
        failure: Option<EngineError>,
    ) -> Self {
        let pool = self.io.pool().clone();
        self.backlog.append(plaintext, &pool);
        self.pending_failure = failure;
        self
    }

    /// 预置已从传输读出的密文。
    pub(crate) fn seed_inbound(&mut self, data: &[u8]) {
        self.io.seed_inbound(data);
    }

    /// 经由 `endpoint` 接入一条入站连接，等价于 [`TlsEndpoint::accept`]。
    pub fn accept(endpoint: &TlsEndpoint, transport: T) -> Result<Self> {
        endpoint.accept(transport)
    }

    /// 经由 `endpoint` 发起一条出站连接，等价于 [`TlsEndpoint::connect`]。
    pub fn connect(endpoint: &TlsEndpoint, transport: T, server_name: &str) -> Result<Self> {
        endpoint.connect(transport, server_name)
    }

    /// 接手协议探测结果，等价于 [`TlsEndpoint::accept_discriminated`]。
    pub fn accept_discriminated(
        endpoint: &TlsEndpoint,
        key: ConnectionId,
        initial: &[u8],
        transport: T,
    ) -> Result<Self> {
        endpoint.accept_discriminated(key, initial, transport)
    }

    pub fn connection(&self) -> ConnectionId {
        self.io.connection()
    }

    pub fn direction(&self) -> Direction {
        self.io.direction()
    }

    /// 协商出的应用协议；ALPN 未启用或握手尚未完成时为 `None`。
    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.negotiated.as_deref()
    }

    pub fn summary(&self) -> Option<&HandshakeSummary> {
        self.summary.as_ref()
    }

    /// 握手状态机当前所处的步骤。
    pub fn handshake_step(&self) -> HandshakeStep {
        match &self.phase {
            SessionPhase::Handshaking(driver) => driver.step(),
            SessionPhase::Established => HandshakeStep::Finished,
            SessionPhase::Closed => HandshakeStep::Closed,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, SessionPhase::Established)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || matches!(self.phase, SessionPhase::Closed)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().reason
    }

    /// backlog 中已解密、尚未交付的明文字节数。
    pub fn buffered_plaintext(&self) -> usize {
        self.backlog.len()
    }

    /// 对端已发送 close_notify。
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            shared: self.shared.clone(),
        }
    }

    /// 推进握手；已建立时立即返回。
    pub fn poll_establish(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.shared.waker.register(cx.waker());
        if self.shared.is_closed() {
            self.teardown();
            return Poll::Ready(Err(TlsError::SessionClosed));
        }
        if let Some(failure) = self.pending_failure.take() {
            let error = TlsError::Engine(failure).into_handshake_failure();
            self.fail_handshake(&error);
            return Poll::Ready(Err(error));
        }
        let polled = match &mut self.phase {
            SessionPhase::Established => return Poll::Ready(Ok(())),
            SessionPhase::Closed => return Poll::Ready(Err(TlsError::SessionClosed)),
            SessionPhase::Handshaking(driver) => driver.poll_handshake(cx, &mut self.io),
        };
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => {
                self.complete_handshake(outcome);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                if self.shared.is_closed() {
                    self.teardown();
                    return Poll::Ready(Err(TlsError::SessionClosed));
                }
                self.fail_handshake(&error);
                Poll::Ready(Err(error))
            }
        }
    }

    /// 完成握手（幂等）。
    pub async fn establish(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_establish(cx)).await
    }

    /// 在当前线程上阻塞直到握手完成，供专用线程上的出站连接使用。
    pub fn establish_blocking(&mut self) -> Result<()> {
        futures::executor::block_on(self.establish())
    }

    /// 立即关闭会话并释放全部缓冲；返回本次调用是否首次关闭。
    ///
    /// 不发送 close_notify，优雅关闭请使用 [`TlsSession::shutdown`]。
    pub fn close(&mut self, reason: CloseReason) -> bool {
        let first = self.shared.mark_closed(reason);
        self.teardown();
        first
    }

    /// 会话内部在读写前调用：关闭已被请求时完成拆除。
    fn closed_by_request(&mut self) -> bool {
        if self.shared.is_closed() {
            self.teardown();
            return true;
        }
        false
    }

    /// 重新进入握手（密钥更新、重新协商等握手后消息）。
    fn restart_handshake(&mut self) {
        if matches!(self.phase, SessionPhase::Established) {
            let driver = HandshakeDriver::new(self.hooks.executor.clone());
            self.phase = SessionPhase::Handshaking(Box::new(driver));
        }
    }

    fn complete_handshake(&mut self, outcome: HandshakeOutcome) {
        let HandshakeOutcome { plaintext, elapsed } = outcome;
        let pool = self.io.pool().clone();
        self.backlog.append(plaintext, &pool);
        self.phase = SessionPhase::Established;
        let repeated = self.established_once;
        self.established_once = true;

        if self.negotiated.is_none()
            && let Some(registration) = self.alpn.as_mut()
        {
            self.negotiated = registration
                .negotiated(self.io.engine())
                .or_else(|| Some(HTTP_1_1.to_owned()));
            registration.release();
        }

        let engine = self.io.engine();
        let summary = HandshakeSummary {
            connection: self.io.connection(),
            direction: self.io.direction(),
            protocol_version: engine.protocol_version(),
            cipher_suite: engine.cipher_suite(),
            server_name: engine.server_name(),
            alpn: self.negotiated.clone(),
            elapsed,
            repeated,
        };
        tracing::debug!(
            connection_id = %summary.connection,
            direction = %summary.direction,
            state = "established",
            protocol_version = summary.protocol_version.as_deref().unwrap_or("unknown"),
            alpn = summary.alpn.as_deref().unwrap_or("none"),
            elapsed_us = elapsed_micros(elapsed),
            repeated,
            "tls handshake completed"
        );
        for listener in self.hooks.listeners.iter() {
            listener.on_handshake_complete(&summary);
        }
        self.summary = Some(summary);
    }

    fn fail_handshake(&mut self, error: &TlsError) {
        let connection = self.io.connection();
        self.hooks
            .failure_log
            .record(connection, self.io.direction(), error);
        for listener in self.hooks.listeners.iter() {
            listener.on_handshake_failed(connection, error);
        }
        self.shared.mark_closed(CloseReason::HandshakeFailed);
        self.teardown();
    }

    /// 读写中出现致命错误：拆除会话后原样返回错误。
    fn fail(&mut self, error: TlsError) -> TlsError {
        tracing::debug!(
            connection_id = %self.io.connection(),
            code = error.code(),
            %error,
            "tls session failed"
        );
        self.shared.mark_closed(CloseReason::Failed);
        self.teardown();
        error
    }

    /// 恰好一次地释放会话持有的全部资源。
    fn teardown(&mut self) {
        let shared = self.shared.clone();
        let mut state = shared.state.lock();
        if state.released {
            return;
        }
        state.released = true;
        let reason = *state.reason.get_or_insert(CloseReason::Requested);
        shared.closed.store(true, Ordering::Release);

        let pool = self.io.pool().clone();
        let mut segments = self.backlog.release_all(&pool);
        if let SessionPhase::Handshaking(driver) = &mut self.phase {
            segments += driver.release_buffers(&pool);
        }
        segments += self.io.release_all();
        self.phase = SessionPhase::Closed;
        if let Some(mut registration) = self.alpn.take() {
            registration.release();
        }
        if let Some(discriminator) = &self.hooks.discriminator {
            discriminator.release(self.io.connection());
        }
        self.io.engine_mut().close_inbound();
        self.io.shutdown_transport();
        tracing::debug!(
            connection_id = %self.io.connection(),
            direction = %self.io.direction(),
            %reason,
            segments,
            "tls session closed"
        );
    }
}

impl<T: Transport> Drop for TlsSession<T> {
    fn drop(&mut self) {
        self.shared.mark_closed(CloseReason::Dropped);
        self.teardown();
    }
}

impl<T: Transport> fmt::Debug for TlsSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("connection", &self.io.connection())
            .field("direction", &self.io.direction())
            .field("step", &self.handshake_step())
            .field("negotiated", &self.negotiated)
            .field("buffered_plaintext", &self.backlog.len())
            .finish()
    }
}
