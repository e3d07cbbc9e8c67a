//! 写适配器与优雅关闭。
//!
//! # 契约（What）
//! - 明文按引擎最大分片切块加密，每产出一批密文立即刷出，再继续下一块；
//! - 输出段溢出时由 `RecordIo::wrap` 扩容，而不是拆成更多更小的写；
//! - `close` 之后的写返回此前已接受的字节数，不报告错误。

use std::{
    future::poll_fn,
    task::{Context, Poll, ready},
};

use super::{CloseReason, SessionPhase, TlsSession};
use crate::{
    engine::{EngineError, EngineErrorKind, EngineStatus},
    error::{ErrorCategory, Result, SHUTDOWN, TlsError, WRITE},
    transport::Transport,
};

/// 连续无进展的 wrap 次数上限。
const MAX_STALLED_WRAPS: usize = 4;

impl<T: Transport> TlsSession<T> {
    /// 加密并写出全部明文，返回接受的字节数。
    ///
    /// 正常情况下返回 `src.len()`；会话在写入途中被关闭时返回此前已接受的字节数。
    pub async fn write_all(&mut self, src: &[u8]) -> Result<usize> {
        let mut accepted = 0;
        poll_fn(|cx| self.poll_write_step(cx, src, &mut accepted, true)).await
    }

    /// 把已加密但尚未写出的密文刷到传输。
    pub async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_flush_ciphertext(cx)).await
    }

    /// 发送 close_notify 并等待其写出，然后关闭会话。
    pub async fn shutdown(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_graceful_shutdown(cx)).await
    }

    /// 单次轮询写入；`accepted` 记录跨挂起点已被引擎接受的明文字节数。
    ///
    /// `drain_all == false` 时（`AsyncWrite` 路径）接受一块明文后即返回，
    /// 产出的密文留到下一次轮询或 `flush` 时写出。
    pub(crate) fn poll_write_step(
        &mut self,
        cx: &mut Context<'_>,
        src: &[u8],
        accepted: &mut usize,
        drain_all: bool,
    ) -> Poll<Result<usize>> {
        if self.closed_by_request() {
            return Poll::Ready(Ok(*accepted));
        }
        match &self.phase {
            SessionPhase::Closed => return Poll::Ready(Ok(*accepted)),
            SessionPhase::Handshaking(_) => {
                if let Err(error) = ready!(self.poll_establish(cx)) {
                    return Poll::Ready(self.write_failed(error, *accepted));
                }
            }
            SessionPhase::Established => {}
        }
        self.shared.waker.register(cx.waker());
        if self.closed_by_request() {
            return Poll::Ready(Ok(*accepted));
        }

        let mut stalled = 0;
        loop {
            if self.io.has_pending_output() {
                match ready!(self.io.poll_flush(cx)) {
                    Ok(()) => {}
                    Err(error) => {
                        return Poll::Ready(self.write_failed(error.during(WRITE), *accepted));
                    }
                }
            }
            if *accepted == src.len() {
                return Poll::Ready(Ok(*accepted));
            }

            let end = src.len().min(*accepted + self.io.max_fragment());
            let result = match self.io.wrap(&src[*accepted..end]) {
                Ok(result) => result,
                Err(error) => return Poll::Ready(self.write_failed(error, *accepted)),
            };
            if result.status == EngineStatus::Closed {
                return Poll::Ready(if *accepted > 0 {
                    Ok(*accepted)
                } else {
                    Err(TlsError::SessionClosed)
                });
            }
            *accepted += result.consumed;
            tracing::trace!(
                connection_id = %self.io.connection(),
                bytes = result.consumed,
                produced = result.produced,
                "plaintext encrypted"
            );

            if result.consumed == 0 && result.produced == 0 {
                stalled += 1;
                if result.handshake.is_handshaking() && stalled == 1 {
                    self.restart_handshake();
                    if let Err(error) = ready!(self.poll_establish(cx)) {
                        return Poll::Ready(self.write_failed(error, *accepted));
                    }
                    continue;
                }
                if stalled >= MAX_STALLED_WRAPS {
                    let error = TlsError::Engine(EngineError::new(
                        EngineErrorKind::Protocol,
                        ErrorCategory::Internal,
                        "engine accepted no plaintext",
                    ));
                    return Poll::Ready(self.write_failed(error, *accepted));
                }
            } else {
                stalled = 0;
            }

            if !drain_all && result.consumed > 0 {
                // 尽力写出一次；未完成的密文保留到下一次轮询。
                if let Poll::Ready(Err(error)) = self.io.poll_flush(cx) {
                    return Poll::Ready(self.write_failed(error.during(WRITE), *accepted));
                }
                return Poll::Ready(Ok(*accepted));
            }
        }
    }

    pub(crate) fn poll_flush_ciphertext(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.shared.waker.register(cx.waker());
        if self.closed_by_request() || matches!(self.phase, SessionPhase::Closed) {
            return Poll::Ready(Ok(()));
        }
        match ready!(self.io.poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(error) => Poll::Ready(self.write_failed(error, 0).map(|_| ())),
        }
    }

    pub(crate) fn poll_graceful_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.shared.waker.register(cx.waker());
        if self.closed_by_request() || matches!(self.phase, SessionPhase::Closed) {
            return Poll::Ready(Ok(()));
        }
        if matches!(self.phase, SessionPhase::Handshaking(_)) {
            self.close(CloseReason::Shutdown);
            return Poll::Ready(Ok(()));
        }
        if !self.close_sent {
            self.close_sent = true;
            self.io.engine_mut().close_outbound();
            loop {
                match self.io.wrap(&[]) {
                    Ok(result) if result.produced > 0 && !self.io.engine().is_outbound_done() => {}
                    Ok(_) => break,
                    Err(error) => {
                        tracing::debug!(connection_id = %self.io.connection(), %error, "close_notify could not be encoded");
                        break;
                    }
                }
            }
        }
        if let Err(error) = ready!(self.io.poll_flush(cx)) {
            let error = error.during(SHUTDOWN);
            tracing::debug!(
                connection_id = %self.io.connection(),
                code = error.code(),
                %error,
                "close_notify was not delivered"
            );
        }
        self.close(CloseReason::Shutdown);
        Poll::Ready(Ok(()))
    }

    /// 关闭竞争中的失败返回已接受的字节数；其余错误拆除会话后返回。
    fn write_failed(&mut self, error: TlsError, accepted: usize) -> Result<usize> {
        if self.shared.is_closed() {
            self.teardown();
            return Ok(accepted);
        }
        Err(self.fail(error))
    }
}
