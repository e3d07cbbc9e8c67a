//! 握手驱动：在单个 `poll_*` 函数内推进 wrap/unwrap/委派任务三种步骤。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手需要交替执行“产出握手数据并写出”“读入密文并解密”“执行委派任务”，
//!   其中网络读写与任务执行都可能挂起；以 `Poll` 表达挂起点后，异步调用方直接
//!   `.await`，阻塞调用方用 `futures::executor::block_on` 驱动同一份状态机；
//! - 驱动只依赖 [`RecordEngine`] 契约，任何引擎（含测试脚本引擎）都走同一路径。
//!
//! ## 逻辑（How）
//! - 每次迭代依据引擎当前握手状态恰好执行一种操作：
//!   - `NeedWrap`：以空输入 wrap，产出的字节进入写出阶段，写完后回到判定；
//!   - `NeedUnwrap`：有缓冲密文先解密，不足一条记录时按缺失字节数发起网络读；
//!   - `NeedTask`：取出全部委派任务，内联执行或交给 [`TaskExecutor`]（挂起点）；
//!     引擎请求任务却没有任务可取时退回 `NeedWrap`；
//! - 操作结果报告 `Finished` 时先写出剩余数据，再释放空闲网络段并返回。
//!
//! ## 契约（What）
//! - 握手期间解出的应用数据随 [`HandshakeOutcome::plaintext`] 交给调用方，不会丢失；
//! - 任何失败都以 `HandshakeFailed` 返回，返回前已释放驱动持有的明文段与网络段；
//! - 握手期间对端关闭连接视为失败，分类为 `Closed`。
//!
//! ## 风险与权衡（Trade-offs）
//! - 连续多次既不消费也不产出的迭代视为引擎卡死并终止握手，避免脚本化或异常引擎导致自旋。

use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    thread,
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use spark_tls_buffer::{SegmentArray, SegmentPool};

use crate::{
    engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus},
    error::{ErrorCategory, Result, TlsError},
    record_io::RecordIo,
    telemetry::elapsed_micros,
    transport::Transport,
};

/// 连续无进展迭代的上限。
const MAX_IDLE_STEPS: usize = 32;

/// 委派任务执行器。
///
/// 实现者负责在别处执行 `job`；驱动在任务批次完成前挂起当前握手。
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// 为每批委派任务启动一个后台线程。
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadExecutor;

impl TaskExecutor for ThreadExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        let spawned = thread::Builder::new()
            .name("spark-tls-task".to_owned())
            .spawn(job);
        if let Err(error) = spawned {
            // 任务随闭包一起被丢弃，驱动会观察到发送端关闭并以握手失败结束。
            tracing::warn!(%error, "failed to spawn delegated task thread");
        }
    }
}

/// 握手状态机的步骤，对外暴露以便观察会话所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    Finished,
    Closed,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeStep::NeedWrap => "need_wrap",
            HandshakeStep::NeedUnwrap => "need_unwrap",
            HandshakeStep::NeedTask => "need_task",
            HandshakeStep::Finished => "finished",
            HandshakeStep::Closed => "closed",
        })
    }
}

/// 握手成功的产出。
pub(crate) struct HandshakeOutcome {
    /// 与握手消息同批到达的应用数据。
    pub(crate) plaintext: SegmentArray,
    pub(crate) elapsed: Duration,
}

enum Phase {
    Step,
    Flush,
    Fill { min_bytes: usize },
    Tasks(oneshot::Receiver<()>),
}

pub(crate) struct HandshakeDriver {
    phase: Phase,
    step: HandshakeStep,
    finished: bool,
    plaintext: SegmentArray,
    executor: Option<Arc<dyn TaskExecutor>>,
    started: Instant,
    idle_steps: usize,
}

impl HandshakeDriver {
    /// `executor` 为 `None` 时委派任务在驱动线程内联执行。
    pub(crate) fn new(executor: Option<Arc<dyn TaskExecutor>>) -> Self {
        Self {
            phase: Phase::Step,
            step: HandshakeStep::NeedWrap,
            finished: false,
            plaintext: SegmentArray::new(),
            executor,
            started: Instant::now(),
            idle_steps: 0,
        }
    }

    pub(crate) fn step(&self) -> HandshakeStep {
        self.step
    }

    /// 会话在握手中途被关闭时释放驱动持有的明文段。
    pub(crate) fn release_buffers(&mut self, pool: &SegmentPool) -> usize {
        self.phase = Phase::Step;
        self.step = HandshakeStep::Closed;
        self.plaintext.release_all(pool)
    }

    /// 推进握手直到完成、失败或需要等待 I/O。
    pub(crate) fn poll_handshake<T: Transport>(
        &mut self,
        cx: &mut Context<'_>,
        io: &mut RecordIo<T>,
    ) -> Poll<Result<HandshakeOutcome>> {
        match self.poll_inner(cx, io) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                io.release_idle_buffers();
                self.plaintext.release_drained(io.pool());
                tracing::trace!(
                    connection_id = %io.connection(),
                    state = %self.step,
                    carried = self.plaintext.readable_len(),
                    "handshake driver finished"
                );
                Poll::Ready(Ok(HandshakeOutcome {
                    plaintext: std::mem::take(&mut self.plaintext),
                    elapsed: self.started.elapsed(),
                }))
            }
            Poll::Ready(Err(error)) => {
                self.step = HandshakeStep::Closed;
                self.phase = Phase::Step;
                self.plaintext.release_all(io.pool());
                io.release_all();
                Poll::Ready(Err(error.into_handshake_failure()))
            }
        }
    }

    fn poll_inner<T: Transport>(
        &mut self,
        cx: &mut Context<'_>,
        io: &mut RecordIo<T>,
    ) -> Poll<Result<()>> {
        loop {
            match &mut self.phase {
                Phase::Flush => {
                    ready!(io.poll_flush(cx))?;
                    self.phase = Phase::Step;
                    if self.finished {
                        return Poll::Ready(Ok(()));
                    }
                }
                Phase::Fill { min_bytes } => {
                    let read = ready!(io.poll_fill(cx, *min_bytes))?;
                    self.phase = Phase::Step;
                    if read == 0 {
                        return Poll::Ready(Err(TlsError::HandshakeFailed {
                            reason: Cow::Borrowed("peer closed the connection during the handshake"),
                            category: ErrorCategory::Closed,
                        }));
                    }
                }
                Phase::Tasks(receiver) => {
                    let completed = ready!(Pin::new(receiver).poll(cx));
                    self.phase = Phase::Step;
                    if completed.is_err() {
                        return Poll::Ready(Err(TlsError::HandshakeFailed {
                            reason: Cow::Borrowed("delegated task was dropped before completion"),
                            category: ErrorCategory::Internal,
                        }));
                    }
                }
                Phase::Step => {
                    if self.finished {
                        return Poll::Ready(Ok(()));
                    }
                    self.advance(io)?;
                }
            }
        }
    }

    /// 依据引擎当前握手状态执行恰好一种操作。
    fn advance<T: Transport>(&mut self, io: &mut RecordIo<T>) -> Result<()> {
        let status = io.engine().handshake_status();
        match status {
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                self.step = HandshakeStep::Finished;
                self.finish(io);
                Ok(())
            }
            HandshakeStatus::NeedWrap => self.wrap_step(io),
            HandshakeStatus::NeedUnwrap => self.unwrap_step(io),
            HandshakeStatus::NeedTask => self.task_step(io),
        }
    }

    fn wrap_step<T: Transport>(&mut self, io: &mut RecordIo<T>) -> Result<()> {
        self.step = HandshakeStep::NeedWrap;
        let result = io.wrap(&[])?;
        self.observe(io, &result)?;
        if result.produced > 0 || io.has_pending_output() {
            self.phase = Phase::Flush;
        }
        Ok(())
    }

    fn unwrap_step<T: Transport>(&mut self, io: &mut RecordIo<T>) -> Result<()> {
        self.step = HandshakeStep::NeedUnwrap;
        if io.has_pending_output() {
            self.phase = Phase::Flush;
            return Ok(());
        }
        if io.inbound_len() == 0 {
            self.phase = Phase::Fill {
                min_bytes: io.missing_record_bytes(),
            };
            return Ok(());
        }
        let result = io.unwrap_into(&mut self.plaintext)?;
        self.observe(io, &result)?;
        if result.status == EngineStatus::BufferUnderflow {
            self.phase = Phase::Fill {
                min_bytes: io.missing_record_bytes(),
            };
        }
        Ok(())
    }

    fn task_step<T: Transport>(&mut self, io: &mut RecordIo<T>) -> Result<()> {
        self.step = HandshakeStep::NeedTask;
        let mut tasks: Vec<DelegatedTask> = Vec::new();
        while let Some(task) = io.engine_mut().pending_task() {
            tasks.push(task);
        }
        if tasks.is_empty() {
            tracing::trace!(connection_id = %io.connection(), "engine requested a task but none is queued");
            return self.wrap_step(io);
        }
        self.idle_steps = 0;
        tracing::trace!(connection_id = %io.connection(), tasks = tasks.len(), "running delegated tasks");
        match &self.executor {
            None => tasks.into_iter().for_each(DelegatedTask::run),
            Some(executor) => {
                let (done, receiver) = oneshot::channel();
                executor.execute(Box::new(move || {
                    tasks.into_iter().for_each(DelegatedTask::run);
                    let _ = done.send(());
                }));
                self.phase = Phase::Tasks(receiver);
            }
        }
        Ok(())
    }

    fn observe<T: Transport>(&mut self, io: &mut RecordIo<T>, result: &EngineResult) -> Result<()> {
        if result.status == EngineStatus::Closed {
            return Err(TlsError::HandshakeFailed {
                reason: Cow::Borrowed("engine closed during the handshake"),
                category: ErrorCategory::Closed,
            });
        }
        if result.consumed == 0 && result.produced == 0 {
            self.idle_steps += 1;
            if self.idle_steps > MAX_IDLE_STEPS {
                return Err(TlsError::HandshakeFailed {
                    reason: Cow::Borrowed("engine made no progress"),
                    category: ErrorCategory::Internal,
                });
            }
        } else {
            self.idle_steps = 0;
        }
        if result.handshake == HandshakeStatus::Finished {
            self.step = HandshakeStep::Finished;
            self.finish(io);
        }
        Ok(())
    }

    fn finish<T: Transport>(&mut self, io: &RecordIo<T>) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::trace!(
            connection_id = %io.connection(),
            direction = %io.direction(),
            elapsed_us = elapsed_micros(self.started.elapsed()),
            "handshake status finished"
        );
    }
}
