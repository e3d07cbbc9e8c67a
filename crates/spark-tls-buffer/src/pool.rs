use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::segment::{AllocationMode, BufferRecycler, ReclaimedBuffer, Segment, SegmentOwner};

/// `SegmentPool` 基于自由链表复用 `BytesMut`，为 TLS 会话提供网络段与应用段。
///
/// # 模块角色（Why）
/// - 每条 TLS 连接都要在握手与读写之间反复申请“一个完整记录大小”的缓冲，
///   自由链表让这些块在连接之间循环使用，减少分配抖动；
/// - 借助 [`Segment`] 的 `Drop` 钩子自动回收，调用方无需在每个错误分支上手动归还。
///
/// # 核心机制（How）
/// - `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用容量足够的块；
/// - `PoolMetrics` 以原子计数跟踪分配、复用、未命中与活跃租约，`statistics` 生成快照；
/// - `Transient` 段回收时不进入自由链表，只更新统计。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态均受 `spin::Mutex` 或原子计数保护，`Clone` 后共享同一内部状态；
/// - **后置条件**：`acquire(min, _)` 返回的段满足 `capacity() >= min`，且 `position == limit == 0`；
/// - **释放**：每个段恰好回收一次，`active_leases` 在全部段释放后归零。
///
/// # 设计权衡（Trade-offs）
/// - 采用首次适配（first fit）而非最佳适配，换取常数级的锁持有时间；
/// - 自由链表默认不设上限：突发流量留下的峰值容量会一直保留到 `shrink` 被调用；
///   需要限制常驻内存时用 [`SegmentPool::with_retained_limit`] 设定上限，超出部分回收时直接释放；
/// - `shrink` 直接清空自由链表，便于压测后快速归还峰值内存。
#[derive(Clone)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::with_retained_limit(usize::MAX)
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("stats", &self.statistics())
            .finish()
    }
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自由链表最多保留 `max_retained_bytes` 字节可复用容量的池。
    pub fn with_retained_limit(max_retained_bytes: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(max_retained_bytes)),
        }
    }

    /// 自由链表保留容量的上限。
    pub fn retained_limit(&self) -> usize {
        self.inner.retained_limit
    }

    /// 租借至少 `min_size` 字节的段。
    pub fn acquire(&self, min_size: usize, mode: AllocationMode) -> Segment {
        let buf = self.inner.acquire_buffer(min_size, mode);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        let segment = Segment::leased(id, buf, mode, recycler);
        tracing::trace!(segment = id, capacity = segment.capacity(), ?mode, "segment acquired");
        segment
    }

    /// 扩容：分配容量为 `capacity + extra` 的新段，复制未消费内容后释放旧段。
    ///
    /// # 契约（What）
    /// - 返回段的可读内容与旧段完全一致，`position` 归零；
    /// - 所有者与分配模式沿用旧段；
    /// - 旧段在返回前已回收，调用方不可能再读取它。
    pub fn grow(&self, segment: Segment, extra: usize) -> Segment {
        let mut grown = self.acquire(segment.capacity() + extra, segment.mode());
        grown.put_slice(segment.readable());
        grown.transfer(segment.owner());
        tracing::trace!(
            from = segment.id(),
            to = grown.id(),
            capacity = grown.capacity(),
            "segment grown"
        );
        self.release(segment);
        grown
    }

    /// 显式释放段。
    pub fn release(&self, mut segment: Segment) {
        segment.transfer(SegmentOwner::Pool);
        drop(segment);
    }

    /// 复用策略：段已读空且容量满足需求时清空并原地复用，否则释放并重新租借。
    pub fn reuse_or_replace(
        &self,
        mut segment: Segment,
        required: usize,
        mode: AllocationMode,
    ) -> Segment {
        if segment.is_drained() && segment.capacity() >= required {
            segment.clear();
            self.inner.metrics.reuses.fetch_add(1, Ordering::Relaxed);
            segment
        } else {
            let owner = segment.owner();
            self.release(segment);
            let mut replacement = self.acquire(required, mode);
            replacement.transfer(owner);
            replacement
        }
    }

    /// 清空自由链表，返回归还的字节数。
    pub fn shrink(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 当前由池持有或借出的总容量。
    pub allocated_bytes: usize,
    /// 自由链表中可立即复用的容量。
    pub available_bytes: usize,
    /// 尚未回收的段数量。
    pub active_leases: usize,
    /// 自由链表中的块数量。
    pub free_segments: usize,
    /// 累计租借次数。
    pub acquisitions: u64,
    /// 累计回收次数。
    pub releases: u64,
    /// 原地复用（`reuse_or_replace` 命中）与自由链表命中的次数。
    pub reuses: u64,
    /// 自由链表未命中、需要新分配的次数。
    pub misses: u64,
}

struct PoolInner {
    free_list: Mutex<Vec<BytesMut>>,
    retained_limit: usize,
    metrics: PoolMetrics,
    next_id: AtomicU64,
}

impl PoolInner {
    fn new(retained_limit: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::new()),
            retained_limit,
            metrics: PoolMetrics::default(),
            next_id: AtomicU64::new(1),
        }
    }

    fn acquire_buffer(&self, min_size: usize, mode: AllocationMode) -> BytesMut {
        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.metrics.active_leases.fetch_add(1, Ordering::Relaxed);

        let reused = if mode == AllocationMode::Reusable {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.len() >= min_size)
                .map(|index| list.swap_remove(index))
        } else {
            None
        };

        match reused {
            Some(buf) => {
                saturating_sub(&self.metrics.available_bytes, buf.len());
                self.metrics.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .allocated_bytes
                    .fetch_add(min_size, Ordering::Relaxed);
                BytesMut::zeroed(min_size)
            }
        }
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::len).sum();
        list.clear();
        saturating_sub(&self.metrics.available_bytes, reclaimed);
        saturating_sub(&self.metrics.allocated_bytes, reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_segments = self.free_list.lock().len();
        let metrics = &self.metrics;
        PoolStats {
            allocated_bytes: metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: metrics.active_leases.load(Ordering::Relaxed),
            free_segments,
            acquisitions: metrics.acquisitions.load(Ordering::Relaxed),
            releases: metrics.releases.load(Ordering::Relaxed),
            reuses: metrics.reuses.load(Ordering::Relaxed),
            misses: metrics.misses.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        saturating_sub(&self.metrics.active_leases, 1);
        self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        let capacity = reclaimed.capacity();
        let mode = reclaimed.mode();
        match reclaimed.into_buffer() {
            Some(buf) if mode == AllocationMode::Reusable => {
                let mut list = self.free_list.lock();
                let available = self.metrics.available_bytes.load(Ordering::Relaxed);
                if available.saturating_add(capacity) <= self.retained_limit {
                    self.metrics
                        .available_bytes
                        .fetch_add(capacity, Ordering::Relaxed);
                    list.push(buf);
                } else {
                    drop(list);
                    saturating_sub(&self.metrics.allocated_bytes, capacity);
                    tracing::trace!(capacity, "free list full, segment dropped");
                }
            }
            _ => saturating_sub(&self.metrics.allocated_bytes, capacity),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    reuses: AtomicU64,
    misses: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusable_capacity_returns_to_pool() {
        let pool = SegmentPool::new();
        {
            let mut segment = pool.acquire(64, AllocationMode::Reusable);
            assert!(segment.capacity() >= 64);
            segment.put_slice(&[1, 2, 3, 4]);
        }
        let snapshot = pool.statistics();
        assert!(snapshot.available_bytes >= 64);
        assert_eq!(snapshot.active_leases, 0);

        let second = pool.acquire(16, AllocationMode::Reusable);
        assert!(second.capacity() >= 64, "free list block should be reused");
        assert!(second.is_drained());
    }

    #[test]
    fn transient_segments_never_enter_free_list() {
        let pool = SegmentPool::new();
        pool.release(pool.acquire(128, AllocationMode::Transient));
        let stats = pool.statistics();
        assert_eq!(stats.free_segments, 0);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.releases, 1);
    }
}
