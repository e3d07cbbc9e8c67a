use std::collections::VecDeque;

use crate::{
    pool::SegmentPool,
    segment::{AllocationMode, Segment, SegmentOwner},
};

/// 引擎输出的多段数组。
///
/// # 意图（Why）
/// - 引擎报告“输出空间不足”时，追加一段完整大小的新段，而不是原地扩容并搬移已有数据，
///   拷贝成本被限制在单段之内；
/// - 读路径可以一次向调用方交付多段（scatter），写路径按段逐一刷出。
///
/// # 契约（What）
/// - 只有最后一段接受新的写入；
/// - `drain_into` 按顺序交付数据，读空的段立即归还池；
/// - 数组被丢弃时其中所有段随之回收。
#[derive(Debug, Default)]
pub struct SegmentArray {
    segments: VecDeque<Segment>,
}

impl SegmentArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一段完整大小的新段，返回其可写引用。
    pub fn push_full_size(
        &mut self,
        pool: &SegmentPool,
        size: usize,
        mode: AllocationMode,
    ) -> &mut Segment {
        let mut segment = pool.acquire(size, mode);
        segment.transfer(SegmentOwner::Engine);
        let index = self.segments.len();
        self.segments.push_back(segment);
        &mut self.segments[index]
    }

    /// 追加一个已有段。
    pub fn push(&mut self, segment: Segment) {
        self.segments.push_back(segment);
    }

    /// 可接受写入的最后一段。
    pub fn last_mut(&mut self) -> Option<&mut Segment> {
        self.segments.back_mut()
    }

    /// 最后一段的剩余可写容量，数组为空时为 0。
    pub fn tail_spare(&self) -> usize {
        self.segments.back().map_or(0, Segment::spare_capacity)
    }

    /// 所有段的可读字节总数。
    pub fn readable_len(&self) -> usize {
        self.segments.iter().map(Segment::readable_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 按顺序复制到 `dst`，读空的段归还池。
    pub fn drain_into(&mut self, pool: &SegmentPool, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            copied += front.copy_into(&mut dst[copied..]);
            if front.is_drained() {
                if let Some(done) = self.segments.pop_front() {
                    pool.release(done);
                }
            }
        }
        copied
    }

    /// 弹出首段（无论是否读空），用于整段交付。
    pub fn pop_front(&mut self) -> Option<Segment> {
        self.segments.pop_front()
    }

    /// 丢弃所有已读空的段。
    pub fn release_drained(&mut self, pool: &SegmentPool) {
        let mut kept = VecDeque::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if segment.is_drained() {
                pool.release(segment);
            } else {
                kept.push_back(segment);
            }
        }
        self.segments = kept;
    }

    /// 释放全部段，返回释放数量。
    pub fn release_all(&mut self, pool: &SegmentPool) -> usize {
        let count = self.segments.len();
        for segment in self.segments.drain(..) {
            pool.release(segment);
        }
        count
    }
}
