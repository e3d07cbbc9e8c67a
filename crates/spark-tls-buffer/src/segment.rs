use std::{fmt, mem, sync::Arc};

use bytes::BytesMut;

/// `BufferRecycler` 描述段在生命周期结束时的回收入口。
///
/// # 设计初衷（Why）
/// - [`Segment`] 需要在 `Drop` 阶段把底层 `BytesMut` 还给所属池，
///   通过 trait 对象注入回收逻辑，段本身无需知道池的具体实现。
///
/// # 契约定义（What）
/// - 实现必须线程安全且不得 panic：`reclaim` 运行在 `Drop` 路径上；
/// - 每个段恰好触发一次 `reclaim`，实现者可据此维护租约统计。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 回收一次租约。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 一次回收动作所携带的上下文。
///
/// - `capacity`：段的最终容量（可能因扩容而大于租借时的值）；
/// - `mode`：分配模式，短生命周期段不会回到自由链表；
/// - `buffer`：底层内存块，池据此决定复用还是丢弃。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    mode: AllocationMode,
    buffer: Option<BytesMut>,
}

impl ReclaimedBuffer {
    /// 创建携带完整上下文的回收结果。
    pub fn new(capacity: usize, mode: AllocationMode, buffer: Option<BytesMut>) -> Self {
        Self {
            capacity,
            mode,
            buffer,
        }
    }

    /// 本次回收的容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 分配模式。
    pub fn mode(&self) -> AllocationMode {
        self.mode
    }

    /// 消耗结构并返回可复用的 `BytesMut`。
    pub fn into_buffer(self) -> Option<BytesMut> {
        self.buffer
    }
}

/// 段的分配模式。
///
/// - `Transient`：短生命周期（一次握手、一次探测），释放后直接交还分配器；
/// - `Reusable`：长生命周期（会话的网络段），释放后进入自由链表等待复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationMode {
    Transient,
    Reusable,
}

/// 段当前的所有者。
///
/// 所有权转移必须通过 [`Segment::transfer`] 显式完成，便于在 trace 日志中审计
/// “引擎 → 适配器 → 调用方/池”的单向流转。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentOwner {
    /// 记录层引擎正在向段写入输出。
    Engine,
    /// 读/写适配器或握手驱动持有段。
    Adapter,
    /// 段已交付给上层调用方。
    Caller,
    /// 段已归还池，仅在释放路径上短暂出现。
    Pool,
}

impl fmt::Display for SegmentOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SegmentOwner::Engine => "engine",
            SegmentOwner::Adapter => "adapter",
            SegmentOwner::Caller => "caller",
            SegmentOwner::Pool => "pool",
        };
        f.write_str(label)
    }
}

/// 网络/应用字节段。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 记录层引擎以“位置/界限/容量”描述缓冲：写入方在 `limit` 之后追加，读取方从 `position`
///   开始消费。TLS 读路径需要同时容纳“已消费一半的旧密文”和“新到达的密文”，
///   三元组让这两种数据共存于同一块内存而无需额外拷贝。
///
/// ## 逻辑（How）
/// - 底层 `BytesMut` 在分配时即填满到容量（`len == capacity`），`position` 与 `limit`
///   是显式维护的索引：可读区间为 `[position, limit)`，可写区间为 `[limit, capacity)`；
/// - `Drop` 时把内存块交给 [`BufferRecycler`]，因此无论正常释放还是错误路径提前返回，
///   回收都只会发生一次。
///
/// ## 契约（What）
/// - 不变式：`position <= limit <= capacity`；
/// - 同一时刻只有一个 [`SegmentOwner`]；
/// - 释放（`SegmentPool::release` 或直接 drop）以值语义消费段。
pub struct Segment {
    id: u64,
    buf: BytesMut,
    position: usize,
    limit: usize,
    mode: AllocationMode,
    owner: SegmentOwner,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl Segment {
    pub(crate) fn leased(
        id: u64,
        buf: BytesMut,
        mode: AllocationMode,
        recycler: Arc<dyn BufferRecycler>,
    ) -> Self {
        Self {
            id,
            buf,
            position: 0,
            limit: 0,
            mode,
            owner: SegmentOwner::Adapter,
            recycler: Some(recycler),
        }
    }

    /// 创建不归属任何池的段，主要用于上游持有的入站缓冲与测试。
    pub fn detached(capacity: usize) -> Self {
        Self {
            id: 0,
            buf: BytesMut::zeroed(capacity),
            position: 0,
            limit: 0,
            mode: AllocationMode::Transient,
            owner: SegmentOwner::Caller,
            recycler: None,
        }
    }

    /// 以给定内容创建独立段，`limit` 等于内容长度。
    pub fn from_slice(data: &[u8]) -> Self {
        let mut segment = Self::detached(data.len());
        segment.put_slice(data);
        segment
    }

    /// 池内唯一编号，独立段恒为 0。
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn mode(&self) -> AllocationMode {
        self.mode
    }

    pub fn owner(&self) -> SegmentOwner {
        self.owner
    }

    /// 恢复读取位置。
    ///
    /// # Panics
    /// `position > limit` 违反段的不变式。
    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.limit, "position beyond limit");
        self.position = position;
    }

    /// 恢复写入界限。
    ///
    /// # Panics
    /// `limit` 超出容量或小于当前位置。
    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= self.capacity(), "limit beyond capacity");
        assert!(self.position <= limit, "limit below position");
        self.limit = limit;
    }

    /// 未消费的字节。
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.position..self.limit]
    }

    pub fn readable_len(&self) -> usize {
        self.limit - self.position
    }

    /// 可读区间为空。
    pub fn is_drained(&self) -> bool {
        self.position == self.limit
    }

    /// `limit` 之后仍可写入的字节数。
    pub fn spare_capacity(&self) -> usize {
        self.capacity() - self.limit
    }

    /// 可写区间，写入后需调用 [`Segment::commit`]。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let limit = self.limit;
        &mut self.buf[limit..]
    }

    /// 确认已写入 `spare_mut` 前 `len` 字节。
    ///
    /// # Panics
    /// `len` 超出可写区间。
    pub fn commit(&mut self, len: usize) {
        assert!(len <= self.spare_capacity(), "commit beyond capacity");
        self.limit += len;
    }

    /// 标记前 `len` 个可读字节已消费。
    ///
    /// # Panics
    /// `len` 超出可读区间。
    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.readable_len(), "consume beyond limit");
        self.position += len;
    }

    /// 在 `limit` 之后追加数据，返回实际写入的字节数（受剩余容量约束）。
    pub fn put_slice(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.spare_capacity());
        let limit = self.limit;
        self.buf[limit..limit + len].copy_from_slice(&data[..len]);
        self.limit += len;
        len
    }

    /// 从可读区间复制到 `dst`，返回复制的字节数并推进位置。
    pub fn copy_into(&mut self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(self.readable_len());
        dst[..len].copy_from_slice(&self.buf[self.position..self.position + len]);
        self.position += len;
        len
    }

    /// 把未消费数据移动到段首，释放前部已消费空间。
    pub fn compact(&mut self) {
        if self.position == 0 {
            return;
        }
        let remaining = self.readable_len();
        self.buf.copy_within(self.position..self.limit, 0);
        self.position = 0;
        self.limit = remaining;
    }

    /// 清空位置与界限，容量保持不变。
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = 0;
    }

    /// 复制可读区间为 `Vec<u8>`，不改变位置。
    pub fn to_vec(&self) -> Vec<u8> {
        self.readable().to_vec()
    }

    /// 显式转移所有权。
    pub fn transfer(&mut self, to: SegmentOwner) {
        if self.owner != to {
            tracing::trace!(segment = self.id, from = %self.owner, to = %to, "segment ownership transferred");
            self.owner = to;
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("capacity", &self.capacity())
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Some(recycler) = self.recycler.take() {
            let capacity = self.buf.len();
            let buffer = mem::take(&mut self.buf);
            self.owner = SegmentOwner::Pool;
            recycler.reclaim(ReclaimedBuffer::new(capacity, self.mode, Some(buffer)));
        }
    }
}
