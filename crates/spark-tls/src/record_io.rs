//! 引擎与传输之间的记录层 I/O：持有网络段，负责密文的读入、写出与缓冲扩容。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手驱动与读写适配器都在做同样的事：把网络段交给引擎、按结果扩容或刷出；
//!   集中到 [`RecordIo`] 后，两者只剩状态机本身；
//! - 段的所有权流转（引擎 → 适配器 → 池）在这里显式完成，释放路径只有一处。
//!
//! ## 逻辑（How）
//! - `net_in` 保存尚未解密的密文，读入前先压缩，写满后按网络段大小扩容；
//! - `net_out` 保存待发送的密文，`wrap` 溢出时扩容一个数据包大小而非拆成更小的写；
//! - `unwrap_into` 在应用输出不足时追加一段完整大小的应用段（多段 scatter 输出）。
//!
//! ## 契约（What）
//! - `BufferTooSmall` 只在扩容后仍然溢出时返回，正常的溢出在内部消化；
//! - `release_all` 之后本结构不再持有任何段，重复调用无副作用。

use std::task::{Context, Poll};

use spark_tls_buffer::{AllocationMode, Segment, SegmentArray, SegmentOwner, SegmentPool};

use crate::{
    config::TlsChannelConfig,
    connection::{ConnectionId, Direction},
    engine::{EngineStatus, EngineResult, RecordEngine, record},
    error::{FLUSH, READ, Result, TlsError},
    transport::{ReadRequest, Transport, WriteRequest},
};

/// 溢出后扩容重试的次数上限。
const GROWTH_ATTEMPTS: usize = 2;

pub(crate) struct RecordIo<T> {
    connection: ConnectionId,
    direction: Direction,
    engine: Box<dyn RecordEngine>,
    transport: T,
    pool: SegmentPool,
    net_in: Option<Segment>,
    net_out: Option<Segment>,
    read_request: ReadRequest,
    write_request: WriteRequest,
    network_size: usize,
    application_size: usize,
    jit_size: usize,
    network_mode: AllocationMode,
    eof: bool,
}

impl<T: Transport> RecordIo<T> {
    pub(crate) fn new(
        connection: ConnectionId,
        direction: Direction,
        engine: Box<dyn RecordEngine>,
        transport: T,
        pool: SegmentPool,
        config: &TlsChannelConfig,
    ) -> Self {
        let network_size = config
            .buffers
            .network_segment_size
            .unwrap_or_else(|| engine.packet_buffer_size());
        let application_size = engine.application_buffer_size();
        let network_mode = if config.buffers.reuse_network_segments {
            AllocationMode::Reusable
        } else {
            AllocationMode::Transient
        };
        Self {
            connection,
            direction,
            engine,
            transport,
            pool,
            net_in: None,
            net_out: None,
            read_request: ReadRequest {
                min_bytes: 1,
                force_queue: config.io.force_queue,
                timeout: config.io.read_timeout(),
            },
            write_request: WriteRequest {
                force_queue: config.io.force_queue,
                timeout: config.io.write_timeout(),
            },
            network_size,
            application_size,
            jit_size: config.buffers.jit_allocation_size,
            network_mode,
            eof: false,
        }
    }

    pub(crate) fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn engine(&self) -> &dyn RecordEngine {
        self.engine.as_ref()
    }

    pub(crate) fn engine_mut(&mut self) -> &mut dyn RecordEngine {
        self.engine.as_mut()
    }

    pub(crate) fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub(crate) fn jit_size(&self) -> usize {
        self.jit_size
    }

    /// 单次 wrap 可接受的最大明文长度。
    pub(crate) fn max_fragment(&self) -> usize {
        self.application_size.min(record::MAX_PLAINTEXT_LEN)
    }

    /// 传输已报告 EOF。
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    /// 预置已从网络读到的密文（协议探测交接或宿主预读）。
    pub(crate) fn seed_inbound(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let required = data.len().max(self.network_size);
        let segment = self.inbound_segment(required);
        if segment.spare_capacity() < data.len() {
            segment.compact();
        }
        if segment.spare_capacity() < data.len() {
            let extra = data.len() - segment.spare_capacity();
            if let Some(current) = self.net_in.take() {
                self.net_in = Some(self.pool.grow(current, extra));
            }
        }
        if let Some(segment) = self.net_in.as_mut() {
            segment.put_slice(data);
        }
    }

    /// 缓冲中尚未解密的密文字节数。
    pub(crate) fn inbound_len(&self) -> usize {
        self.net_in.as_ref().map_or(0, Segment::readable_len)
    }

    /// 凑齐下一条完整记录还缺的字节数（至少 1）。
    pub(crate) fn missing_record_bytes(&self) -> usize {
        let buffered = self.net_in.as_ref().map_or(&[][..], Segment::readable);
        record::missing_bytes(buffered)
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        self.net_out
            .as_ref()
            .is_some_and(|segment| !segment.is_drained())
    }

    fn inbound_segment(&mut self, required: usize) -> &mut Segment {
        let pool = &self.pool;
        let mode = self.network_mode;
        self.net_in.get_or_insert_with(|| {
            let mut segment = pool.acquire(required, mode);
            segment.transfer(SegmentOwner::Adapter);
            segment
        })
    }

    /// 把 `net_out` 中的密文全部写入传输。
    pub(crate) fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        loop {
            let Some(segment) = self.net_out.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            if segment.is_drained() {
                segment.clear();
                return Poll::Ready(Ok(()));
            }
            match self
                .transport
                .poll_write(cx, segment.readable(), &self.write_request)
            {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(TlsError::transport(
                        FLUSH,
                        std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "transport accepted no ciphertext",
                        ),
                    )));
                }
                Poll::Ready(Ok(written)) => {
                    segment.consume(written);
                    tracing::trace!(
                        connection_id = %self.connection,
                        bytes = written,
                        "ciphertext flushed"
                    );
                }
                Poll::Ready(Err(error)) => {
                    return Poll::Ready(Err(TlsError::transport(FLUSH, error)));
                }
            }
        }
    }

    /// 至少再读入 `min_bytes` 字节密文；返回 `0` 表示 EOF。
    ///
    /// 段已满时按网络段大小扩容，保证传输总能满足最小字节数。
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>, min_bytes: usize) -> Poll<Result<usize>> {
        let min_bytes = min_bytes.max(1);
        let network_size = self.network_size;
        let segment = self.inbound_segment(network_size);
        if segment.spare_capacity() < min_bytes {
            segment.compact();
        }
        if segment.spare_capacity() < min_bytes
            && let Some(current) = self.net_in.take()
        {
            let extra = network_size.max(min_bytes - current.spare_capacity());
            self.net_in = Some(self.pool.grow(current, extra));
        }
        let Some(segment) = self.net_in.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let request = ReadRequest {
            min_bytes,
            ..self.read_request
        };
        match self.transport.poll_read(cx, segment, &request) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(read)) => {
                if read == 0 {
                    self.eof = true;
                }
                tracing::trace!(connection_id = %self.connection, bytes = read, "ciphertext received");
                Poll::Ready(Ok(read))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(TlsError::transport(READ, error))),
        }
    }

    /// 加密（或产出握手数据）到 `net_out`；溢出时扩容一个数据包大小后重试。
    pub(crate) fn wrap(&mut self, src: &[u8]) -> Result<EngineResult> {
        let packet = self.engine.packet_buffer_size();
        let required = self.network_size.max(packet);
        if self.net_out.is_none() {
            let mut segment = self.pool.acquire(required, self.network_mode);
            segment.transfer(SegmentOwner::Adapter);
            self.net_out = Some(segment);
        }
        for _ in 0..GROWTH_ATTEMPTS {
            let Some(segment) = self.net_out.as_mut() else {
                break;
            };
            segment.transfer(SegmentOwner::Engine);
            let outcome = self.engine.wrap(src, segment);
            segment.transfer(SegmentOwner::Adapter);
            let result = outcome?;
            tracing::trace!(
                connection_id = %self.connection,
                status = ?result.status,
                handshake = ?result.handshake,
                consumed = result.consumed,
                produced = result.produced,
                "wrap"
            );
            if result.status != EngineStatus::BufferOverflow {
                return Ok(result);
            }
            if let Some(current) = self.net_out.take() {
                self.net_out = Some(self.pool.grow(current, packet));
            }
        }
        Err(TlsError::BufferTooSmall { required: packet })
    }

    /// 从 `net_in` 解密至多一条记录，明文追加到 `out`。
    pub(crate) fn unwrap_into(&mut self, out: &mut SegmentArray) -> Result<EngineResult> {
        if out.tail_spare() == 0 {
            out.push_full_size(&self.pool, self.application_size, AllocationMode::Reusable);
        }
        for _ in 0..GROWTH_ATTEMPTS {
            let src = self.net_in.as_ref().map_or(&[][..], Segment::readable);
            let Some(target) = out.last_mut() else {
                break;
            };
            target.transfer(SegmentOwner::Engine);
            let outcome = self.engine.unwrap(src, target);
            target.transfer(SegmentOwner::Adapter);
            let result = outcome?;
            tracing::trace!(
                connection_id = %self.connection,
                status = ?result.status,
                handshake = ?result.handshake,
                consumed = result.consumed,
                produced = result.produced,
                "unwrap"
            );
            if result.consumed > 0
                && let Some(segment) = self.net_in.as_mut()
            {
                segment.consume(result.consumed);
            }
            if result.status != EngineStatus::BufferOverflow {
                return Ok(result);
            }
            out.push_full_size(&self.pool, self.application_size, AllocationMode::Reusable);
        }
        Err(TlsError::BufferTooSmall {
            required: self.application_size,
        })
    }

    /// 归还已读空的网络段；仍有数据的段保留。
    pub(crate) fn release_idle_buffers(&mut self) {
        if self.net_in.as_ref().is_some_and(Segment::is_drained)
            && let Some(segment) = self.net_in.take()
        {
            self.pool.release(segment);
        }
        if self.net_out.as_ref().is_some_and(Segment::is_drained)
            && let Some(segment) = self.net_out.take()
        {
            self.pool.release(segment);
        }
    }

    /// 释放全部网络段，返回释放数量。
    pub(crate) fn release_all(&mut self) -> usize {
        let mut released = 0;
        for segment in [self.net_in.take(), self.net_out.take()].into_iter().flatten() {
            self.pool.release(segment);
            released += 1;
        }
        released
    }

    pub(crate) fn shutdown_transport(&mut self) {
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use futures::{executor::block_on, future::poll_fn};

    use super::*;
    use crate::{engine::RustlsEngine, test_support, transport::MemoryTransport};

    fn client_io(transport: MemoryTransport, pool: &SegmentPool) -> RecordIo<MemoryTransport> {
        let engine =
            RustlsEngine::client(test_support::client_config(), "localhost").expect("合法的 SNI");
        RecordIo::new(
            ConnectionId::next(),
            Direction::Outbound,
            Box::new(engine),
            transport,
            pool.clone(),
            &TlsChannelConfig::default(),
        )
    }

    #[test]
    fn wrapped_handshake_bytes_reach_the_peer() {
        let pool = SegmentPool::new();
        let (local, peer) = MemoryTransport::pair();
        let mut io = client_io(local, &pool);

        let result = io.wrap(&[]).expect("ClientHello 应能生成");
        assert!(result.produced > 0);
        assert!(io.has_pending_output());
        block_on(poll_fn(|cx| io.poll_flush(cx))).expect("内存传输写入不会失败");
        assert!(!io.has_pending_output());
        assert_eq!(peer.pending_inbound(), result.produced);

        assert_eq!(io.release_all(), 1);
        assert_eq!(io.release_all(), 0);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn fill_grows_a_full_segment() {
        let pool = SegmentPool::new();
        let (local, peer) = MemoryTransport::pair();
        let mut config = TlsChannelConfig::default();
        config.buffers.network_segment_size = Some(512);
        let engine =
            RustlsEngine::client(test_support::client_config(), "localhost").expect("合法的 SNI");
        let mut io = RecordIo::new(
            ConnectionId::next(),
            Direction::Outbound,
            Box::new(engine),
            local,
            pool.clone(),
            &config,
        );

        io.seed_inbound(&[22, 3, 3, 0x02, 0x00]);
        assert_eq!(io.missing_record_bytes(), 0x200);
        drop(peer);
        // 入站段容量 512，已有 5 字节，补齐 512 字节需要扩容。
        let read = block_on(poll_fn(|cx| io.poll_fill(cx, 512))).expect("EOF 不是错误");
        assert_eq!(read, 0);
        assert!(io.is_eof());
        assert_eq!(io.inbound_len(), 5);
        io.release_all();
        assert_eq!(pool.statistics().active_leases, 0);
    }
}
