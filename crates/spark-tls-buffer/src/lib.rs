//! `spark-tls-buffer` 为 TLS 会话提供网络段与应用段的池化缓冲。
//!
//! # 模块定位（Why）
//! - 记录层引擎的每次 wrap/unwrap 都需要一块“足够大”的输出空间，读路径还会留下
//!   部分消费的密文与尚未交付的明文；这些段在多次读写之间流转，必须有单一、可审计的所有者。
//! - 基于 `bytes::BytesMut` 的自由链表复用容量，避免每条连接、每个记录都向分配器申请内存。
//!
//! # 设计概要（How）
//! - [`Segment`]：`position/limit/capacity` 三元组 + 分配模式 + 显式所有者，`Drop` 时通过
//!   [`BufferRecycler`] 归还容量，保证“释放恰好一次”；
//! - [`SegmentPool`]：自由链表 + 原子统计，提供 `acquire`/`grow`/`release`/`reuse_or_replace`；
//! - [`SegmentArray`]：引擎报告输出不足时追加整段，支撑多段 scatter 输出。
//!
//! # 契约（What）
//! - 所有公开类型满足 `Send + 'static`；`SegmentPool` 额外满足 `Sync + Clone`，可跨会话共享，
//!   但单个 `Segment` 永远只属于一个会话。
//! - 释放以值语义消费段，释放后的段在类型层面不可再被读取。

mod array;
mod pool;
mod segment;

pub use array::SegmentArray;
pub use pool::{PoolStats, SegmentPool};
pub use segment::{AllocationMode, BufferRecycler, ReclaimedBuffer, Segment, SegmentOwner};
