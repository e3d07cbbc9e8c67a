//! 读适配器。
//!
//! # 契约（What）
//! - `min_bytes == 0`：只交付 backlog 与已缓冲密文能解出的明文，不发起任何网络读；
//! - 否则恰好交付 `min(min_bytes, dst.len())` 字节，EOF 或对端 close_notify 除外；多出的明文
//!   即使调用方缓冲还有空间也留在 backlog；
//! - 调用方缓冲装不下的明文留在 backlog，下一次读取优先交付。

use std::{
    future::poll_fn,
    task::{Context, Poll, ready},
};

use spark_tls_buffer::{AllocationMode, Segment, SegmentOwner, SegmentPool};

use super::{SessionPhase, TlsSession};
use crate::{
    engine::{EngineStatus, HandshakeStatus},
    error::{Result, TlsError},
    transport::Transport,
};

/// 解密量不足分配量的这一比例时，改为复制到恰好大小的段。
const RIGHT_SIZE_RATIO: usize = 4;

impl<T: Transport> TlsSession<T> {
    /// 读取明文到调用方缓冲，返回交付的字节数；`0` 表示 EOF（或 `min_bytes == 0` 时暂无数据）。
    pub async fn read_into(&mut self, dst: &mut [u8], min_bytes: usize) -> Result<usize> {
        let window = read_window(dst.len(), min_bytes);
        let dst = &mut dst[..window];
        let mut delivered = 0;
        poll_fn(|cx| self.poll_read_step(cx, dst, &mut delivered, min_bytes)).await
    }

    /// 由会话自行分配缓冲（JIT）读取明文。
    ///
    /// 分配大小取 `max(jit_allocation_size, min_bytes)`；实际解出的数据远小于分配量时，
    /// 复制到恰好大小的段再交给调用方，大段立即归还池。返回空段表示 EOF。
    pub async fn read_segment(&mut self, min_bytes: usize) -> Result<Segment> {
        let size = self.io.jit_size().max(min_bytes).max(1);
        let mut segment = self.io.pool().acquire(size, AllocationMode::Transient);
        let mut delivered = 0;
        let outcome = {
            let spare = segment.spare_mut();
            let window = read_window(spare.len(), min_bytes);
            let spare = &mut spare[..window];
            poll_fn(|cx| self.poll_read_step(cx, spare, &mut delivered, min_bytes)).await
        };
        match outcome {
            Ok(read) => {
                segment.commit(read);
                Ok(copy_data_to_caller_buffers(self.io.pool(), segment))
            }
            Err(error) => {
                self.io.pool().release(segment);
                Err(error)
            }
        }
    }

    /// 单次轮询读取；`delivered` 记录跨挂起点已交付的字节数。
    pub(crate) fn poll_read_step(
        &mut self,
        cx: &mut Context<'_>,
        dst: &mut [u8],
        delivered: &mut usize,
        min_bytes: usize,
    ) -> Poll<Result<usize>> {
        if self.closed_by_request() {
            return Poll::Ready(Ok(*delivered));
        }
        match &self.phase {
            SessionPhase::Closed => return Poll::Ready(Ok(*delivered)),
            SessionPhase::Handshaking(_) if min_bytes == 0 => return Poll::Ready(Ok(*delivered)),
            SessionPhase::Handshaking(_) => {
                if let Err(error) = ready!(self.poll_establish(cx)) {
                    return Poll::Ready(if self.shared.is_closed() && error.is_closed() {
                        Ok(*delivered)
                    } else {
                        Err(error)
                    });
                }
            }
            SessionPhase::Established => {}
        }
        self.shared.waker.register(cx.waker());
        if self.closed_by_request() {
            return Poll::Ready(Ok(*delivered));
        }

        let target = min_bytes.min(dst.len());
        loop {
            let pool = self.io.pool().clone();
            *delivered += self.backlog.drain_into(&pool, &mut dst[*delivered..]);
            if *delivered == dst.len() || (target > 0 && *delivered >= target) {
                return Poll::Ready(Ok(*delivered));
            }

            if self.io.inbound_len() > 0 && !self.peer_closed {
                let result = match self.io.unwrap_into(self.backlog.segments_mut()) {
                    Ok(result) => result,
                    Err(error) => return Poll::Ready(self.read_failed(error, *delivered)),
                };
                match result.status {
                    EngineStatus::Closed => {
                        self.peer_closed = true;
                        tracing::debug!(connection_id = %self.io.connection(), "peer sent close_notify");
                    }
                    EngineStatus::BufferUnderflow => {}
                    EngineStatus::Ok | EngineStatus::BufferOverflow => {
                        if matches!(
                            result.handshake,
                            HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask
                        ) {
                            self.restart_handshake();
                            if let Err(error) = ready!(self.poll_establish(cx)) {
                                return Poll::Ready(self.read_failed(error, *delivered));
                            }
                        }
                        if result.consumed > 0 || result.produced > 0 {
                            continue;
                        }
                    }
                }
            }

            if *delivered >= target || self.peer_closed || self.io.is_eof() {
                return Poll::Ready(Ok(*delivered));
            }

            let missing = self.io.missing_record_bytes();
            match ready!(self.io.poll_fill(cx, missing)) {
                Ok(0) => {
                    tracing::debug!(connection_id = %self.io.connection(), "transport reached eof");
                }
                Ok(_) => {}
                Err(error) => return Poll::Ready(self.read_failed(error, *delivered)),
            }
        }
    }

    /// 关闭竞争中的失败按正常结束处理；其余错误拆除会话后返回。
    fn read_failed(&mut self, error: TlsError, delivered: usize) -> Result<usize> {
        if self.shared.is_closed() {
            self.teardown();
            return Ok(delivered);
        }
        Err(self.fail(error))
    }
}

/// `read(n)` 的交付窗口：`n == 0` 时为整个缓冲，否则不超过 `n`。
fn read_window(len: usize, min_bytes: usize) -> usize {
    if min_bytes == 0 { len } else { min_bytes.min(len) }
}

/// 解密量远小于分配量时，把数据复制到恰好大小的段并归还原段。
pub(crate) fn copy_data_to_caller_buffers(pool: &SegmentPool, mut segment: Segment) -> Segment {
    let len = segment.readable_len();
    if len.saturating_mul(RIGHT_SIZE_RATIO) >= segment.capacity() {
        segment.transfer(SegmentOwner::Caller);
        return segment;
    }
    let mut fitted = pool.acquire(len, AllocationMode::Transient);
    fitted.put_slice(segment.readable());
    fitted.transfer(SegmentOwner::Caller);
    pool.release(segment);
    fitted
}
