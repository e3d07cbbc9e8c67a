//! 协议探测：在不消费输入的前提下判断早期字节流是否为 TLS。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同一端口上 TLS 与明文协议共存时，接入层需要先“看一眼”首批字节；
//!   用真实引擎尝试解密比手写特征匹配更可靠，且判定为 TLS 后引擎的工作不必重做。
//!
//! ## 逻辑（How）
//! - 首次调用为连接创建全新的服务端引擎，并在处理 ClientHello 之前完成 ALPN 注册；
//! - 以只读方式把段的可读区间交给引擎 unwrap 一次：
//!   - 解码失败 → [`Discrimination::No`]，推测引擎与输出段立即释放；
//!   - 下溢 → [`Discrimination::Maybe`]，引擎与输出段按连接保存，下次调用继续；
//!   - 其他结果 → [`Discrimination::Yes`]，引擎、输出段与已消费字节数组成
//!     [`DiscriminationHandoff`]，由会话通过 `TlsEndpoint::accept_discriminated` 接手。
//!
//! ## 契约（What）
//! - 入参为 `&Segment`，位置与界限在任何判定下都保持不变；
//! - 会话销毁时调用 [`Discriminator::release`]，被丢弃的推测引擎单独计入
//!   [`DiscriminatorStats::engines_discarded`]。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use spark_tls_buffer::{AllocationMode, Segment, SegmentArray, SegmentPool};

use crate::{
    alpn::{AlpnCapability, AlpnRegistration},
    connection::ConnectionId,
    engine::{EngineError, EngineMode, EngineStatus, RecordEngine, TlsContextFactory},
    error::Result,
};

/// 探测结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Discrimination {
    Yes,
    No,
    Maybe,
}

/// 判定为 TLS 后交给会话的推测状态。
pub struct DiscriminationHandoff {
    pub(crate) engine: Box<dyn RecordEngine>,
    pub(crate) plaintext: SegmentArray,
    pub(crate) consumed: usize,
    pub(crate) failure: Option<EngineError>,
    pub(crate) alpn: Option<AlpnRegistration>,
}

impl DiscriminationHandoff {
    /// 引擎已消费的输入字节数；会话从该偏移处继续读取首批字节。
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// 输入是 TLS 但引擎已报告协议错误（例如不支持的版本）。
    pub fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }
}

impl fmt::Debug for DiscriminationHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscriminationHandoff")
            .field("consumed", &self.consumed)
            .field("plaintext", &self.plaintext.readable_len())
            .field("failure", &self.failure)
            .finish()
    }
}

/// 尚未得出结论的推测状态。
struct Speculation {
    engine: Box<dyn RecordEngine>,
    output: SegmentArray,
    alpn: Option<AlpnRegistration>,
}

/// 探测统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscriminatorStats {
    pub engines_created: u64,
    /// 判定为非 TLS 或被会话释放而丢弃的推测引擎。
    pub engines_discarded: u64,
    pub handed_off: u64,
    /// 当前保存的 `Maybe` 快照与未领取的交接。
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    discarded: AtomicU64,
    handed_off: AtomicU64,
}

pub struct Discriminator {
    context: Arc<dyn TlsContextFactory>,
    pool: SegmentPool,
    alpn: Arc<AlpnCapability>,
    protocols: Option<Vec<String>>,
    // 引擎只要求 `Send`；逐条加锁让探测器可以在线程间共享。
    speculations: DashMap<ConnectionId, Mutex<Speculation>>,
    handoffs: DashMap<ConnectionId, Mutex<DiscriminationHandoff>>,
    counters: Counters,
}

impl Discriminator {
    /// `protocols` 为 `None` 时推测引擎不注册 ALPN。
    pub fn new(
        context: Arc<dyn TlsContextFactory>,
        pool: SegmentPool,
        alpn: Arc<AlpnCapability>,
        protocols: Option<Vec<String>>,
    ) -> Self {
        Self {
            context,
            pool,
            alpn,
            protocols,
            speculations: DashMap::new(),
            handoffs: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// 判断 `segment` 的可读区间是否为 TLS。
    pub fn discriminate(&self, key: ConnectionId, segment: &Segment) -> Result<Discrimination> {
        if self.handoffs.contains_key(&key) {
            return Ok(Discrimination::Yes);
        }
        let bytes = segment.readable();
        if bytes.is_empty() {
            return Ok(Discrimination::Maybe);
        }

        let mut speculation = match self.speculations.remove(&key) {
            Some((_, saved)) => saved.into_inner(),
            None => self.speculate(key)?,
        };
        if speculation.output.tail_spare() == 0 {
            let size = speculation.engine.application_buffer_size();
            speculation
                .output
                .push_full_size(&self.pool, size, AllocationMode::Transient);
        }
        let outcome = match speculation.output.last_mut() {
            Some(target) => speculation.engine.unwrap(bytes, target),
            None => Err(EngineError::failed()),
        };

        let verdict = match outcome {
            Err(error) if error.is_decode() => {
                tracing::debug!(connection_id = %key, reason = error.reason(), "not tls");
                self.discard(speculation);
                Discrimination::No
            }
            Ok(result) if result.status == EngineStatus::BufferUnderflow => {
                self.speculations.insert(key, Mutex::new(speculation));
                Discrimination::Maybe
            }
            Ok(result) => {
                self.hand_off(key, speculation, result.consumed, None);
                Discrimination::Yes
            }
            Err(error) => {
                self.hand_off(key, speculation, 0, Some(error));
                Discrimination::Yes
            }
        };
        tracing::trace!(connection_id = %key, bytes = bytes.len(), ?verdict, "discrimination");
        Ok(verdict)
    }

    /// 领取 `Yes` 判定留下的交接状态。
    pub fn take_handoff(&self, key: ConnectionId) -> Option<DiscriminationHandoff> {
        self.handoffs
            .remove(&key)
            .map(|(_, handoff)| handoff.into_inner())
    }

    /// 会话销毁：丢弃该连接的推测引擎与输出段；返回是否确有状态被释放。
    pub fn release(&self, key: ConnectionId) -> bool {
        let mut released = false;
        if let Some((_, speculation)) = self.speculations.remove(&key) {
            self.discard(speculation.into_inner());
            released = true;
        }
        if let Some((_, handoff)) = self.handoffs.remove(&key) {
            let mut handoff = handoff.into_inner();
            handoff.plaintext.release_all(&self.pool);
            if let Some(mut registration) = handoff.alpn.take() {
                registration.release();
            }
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            released = true;
        }
        released
    }

    pub fn stats(&self) -> DiscriminatorStats {
        DiscriminatorStats {
            engines_created: self.counters.created.load(Ordering::Relaxed),
            engines_discarded: self.counters.discarded.load(Ordering::Relaxed),
            handed_off: self.counters.handed_off.load(Ordering::Relaxed),
            pending: self.speculations.len() + self.handoffs.len(),
        }
    }

    fn speculate(&self, key: ConnectionId) -> Result<Speculation> {
        let mut engine = self.context.create_engine(EngineMode::Server, None)?;
        let alpn = match &self.protocols {
            Some(protocols) => self.alpn.register(key, engine.as_mut(), protocols)?,
            None => None,
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(Speculation {
            engine,
            output: SegmentArray::new(),
            alpn,
        })
    }

    fn discard(&self, mut speculation: Speculation) {
        speculation.output.release_all(&self.pool);
        if let Some(mut registration) = speculation.alpn.take() {
            registration.release();
        }
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn hand_off(
        &self,
        key: ConnectionId,
        mut speculation: Speculation,
        consumed: usize,
        failure: Option<EngineError>,
    ) {
        speculation.output.release_drained(&self.pool);
        self.counters.handed_off.fetch_add(1, Ordering::Relaxed);
        self.handoffs.insert(
            key,
            Mutex::new(DiscriminationHandoff {
                engine: speculation.engine,
                plaintext: speculation.output,
                consumed,
                failure,
                alpn: speculation.alpn,
            }),
        );
    }
}

impl fmt::Debug for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discriminator")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alpn::{H2, HTTP_1_1},
        engine::{RustlsContext, RustlsEngine, record},
        test_support,
    };

    fn discriminator(pool: &SegmentPool) -> Discriminator {
        let context = RustlsContext::server(test_support::server_config(&[])).expect("服务端配置");
        Discriminator::new(
            Arc::new(context),
            pool.clone(),
            AlpnCapability::global(),
            Some(vec![H2.to_owned(), HTTP_1_1.to_owned()]),
        )
    }

    fn client_hello() -> Vec<u8> {
        let mut client =
            RustlsEngine::client(test_support::client_config(), "localhost").expect("合法的 SNI");
        let mut out = Segment::detached(record::PACKET_BUFFER_SIZE);
        client.wrap(&[], &mut out).expect("ClientHello 应能生成");
        out.to_vec()
    }

    #[test]
    fn empty_input_is_maybe_and_untouched() {
        let pool = SegmentPool::new();
        let discriminator = discriminator(&pool);
        let segment = Segment::detached(16);
        let key = ConnectionId::next();
        assert_eq!(
            discriminator.discriminate(key, &segment).expect("探测"),
            Discrimination::Maybe
        );
        assert_eq!((segment.position(), segment.limit()), (0, 0));
    }

    #[test]
    fn partial_hello_is_maybe_then_yes_with_handoff() {
        let pool = SegmentPool::new();
        let discriminator = discriminator(&pool);
        let hello = client_hello();
        let key = ConnectionId::next();

        let partial = Segment::from_slice(&hello[..7]);
        assert_eq!(
            discriminator.discriminate(key, &partial).expect("探测"),
            Discrimination::Maybe
        );
        assert_eq!((partial.position(), partial.limit()), (0, 7));
        assert_eq!(discriminator.stats().pending, 1);

        let full = Segment::from_slice(&hello);
        assert_eq!(
            discriminator.discriminate(key, &full).expect("探测"),
            Discrimination::Yes
        );
        assert_eq!(full.readable_len(), hello.len());
        let stats = discriminator.stats();
        assert_eq!(stats.engines_created, 1, "Maybe 之后应沿用同一引擎");
        assert_eq!(stats.handed_off, 1);

        let handoff = discriminator.take_handoff(key).expect("交接状态");
        assert_eq!(handoff.consumed(), hello.len());
        assert!(handoff.failure().is_none());
        assert_eq!(discriminator.stats().pending, 0);
    }

    #[test]
    fn plaintext_is_no_and_engine_is_released() {
        let pool = SegmentPool::new();
        let discriminator = discriminator(&pool);
        let request = Segment::from_slice(b"GET / HTTP/1.1\r\n\r\n");
        let key = ConnectionId::next();
        assert_eq!(
            discriminator.discriminate(key, &request).expect("探测"),
            Discrimination::No
        );
        assert_eq!(request.readable(), b"GET / HTTP/1.1\r\n\r\n");
        let stats = discriminator.stats();
        assert_eq!(stats.engines_discarded, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn release_discards_a_pending_snapshot() {
        let pool = SegmentPool::new();
        let discriminator = discriminator(&pool);
        let hello = client_hello();
        let key = ConnectionId::next();
        discriminator
            .discriminate(key, &Segment::from_slice(&hello[..3]))
            .expect("探测");
        assert!(discriminator.release(key));
        assert!(!discriminator.release(key));
        assert_eq!(discriminator.stats().engines_discarded, 1);
        assert_eq!(pool.statistics().active_leases, 0);
    }
}
