use std::{
    cmp::{self, Reverse},
    collections::{BinaryHeap, VecDeque},
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    task::{Context, Poll, Waker},
    thread,
    time::Instant,
};

use parking_lot::Mutex;
use spark_tls_buffer::Segment;

use super::{IoTimeout, ReadRequest, Transport, WriteRequest, immediate_outcome};

/// 单向内存管道。
#[derive(Default)]
struct Pipe {
    buf: VecDeque<u8>,
    /// 写端已关闭，读端读空后得到 EOF。
    closed: bool,
    /// 读端已丢弃，写端再写入得到 `BrokenPipe`。
    reader_gone: bool,
    reader: Option<Waker>,
}

impl Pipe {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }
}

#[derive(Default)]
struct StatsInner {
    reads: AtomicU64,
    bytes_read: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
}

/// 内存传输的 I/O 统计，可在传输移交给会话后继续观察。
#[derive(Clone, Default)]
pub struct TransportStats {
    inner: Arc<StatsInner>,
}

impl TransportStats {
    /// 完成的写操作次数（每次 `poll_write` 返回 `Ready(Ok)` 计一次）。
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStats")
            .field("reads", &self.reads())
            .field("bytes_read", &self.bytes_read())
            .field("writes", &self.writes())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// 进程内双向传输，用于测试与同进程的会话对接。
///
/// # 契约（What）
/// - [`MemoryTransport::pair`] 返回两端，一端写入的字节按序出现在另一端；
/// - 遵守 [`ReadRequest`] 的全部语义：最小字节数、`force_queue`、四种超时；
/// - 丢弃一端等价于关闭其写方向，另一端读空后得到 EOF，继续写入得到 `BrokenPipe`。
pub struct MemoryTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    stats: TransportStats,
    read_queued: bool,
    write_queued: bool,
    read_deadline: Option<Instant>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        (
            Self::new(b_to_a.clone(), a_to_b.clone()),
            Self::new(a_to_b, b_to_a),
        )
    }

    fn new(inbound: Arc<Mutex<Pipe>>, outbound: Arc<Mutex<Pipe>>) -> Self {
        Self {
            inbound,
            outbound,
            stats: TransportStats::default(),
            read_queued: false,
            write_queued: false,
            read_deadline: None,
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// 模拟对端写入：把字节直接追加到本端的入站管道。
    pub fn inject(&self, data: &[u8]) {
        let mut pipe = self.inbound.lock();
        pipe.buf.extend(data);
        pipe.wake_reader();
    }

    /// 本端入站管道中尚未读取的字节数。
    pub fn pending_inbound(&self) -> usize {
        self.inbound.lock().buf.len()
    }

    fn arm_timer(deadline: Instant, waker: Waker) {
        match timer() {
            Some(timer) => {
                if let Err(mpsc::SendError(entry)) = timer.send(TimerEntry { deadline, waker }) {
                    entry.waker.wake();
                }
            }
            // 定时线程不可用时立即唤醒，读方在下一次轮询中重新检查截止时间。
            None => waker.wake(),
        }
    }
}

/// 所有内存传输共享的一条定时线程，按截止时间唤醒挂起的读。
struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

fn timer() -> Option<&'static mpsc::Sender<TimerEntry>> {
    static TIMER: OnceLock<Option<mpsc::Sender<TimerEntry>>> = OnceLock::new();
    TIMER
        .get_or_init(|| {
            let (sender, receiver) = mpsc::channel();
            match thread::Builder::new()
                .name("spark-tls-memory-timer".to_owned())
                .spawn(move || run_timer(receiver))
            {
                Ok(_) => Some(sender),
                Err(error) => {
                    tracing::warn!(%error, "memory transport timer thread unavailable");
                    None
                }
            }
        })
        .as_ref()
}

fn run_timer(receiver: mpsc::Receiver<TimerEntry>) {
    let mut due: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while due.peek().is_some_and(|Reverse(entry)| entry.deadline <= now) {
            if let Some(Reverse(entry)) = due.pop() {
                entry.waker.wake();
            }
        }
        let next = match due.peek() {
            Some(Reverse(entry)) => receiver.recv_timeout(entry.deadline - now),
            None => receiver
                .recv()
                .map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(entry) => due.push(Reverse(entry)),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl Transport for MemoryTransport {
    fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        dst: &mut Segment,
        request: &ReadRequest,
    ) -> Poll<io::Result<usize>> {
        let spare = dst.spare_capacity();
        if spare == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read target has no spare capacity",
            )));
        }
        let mut pipe = self.inbound.lock();
        let want = request.min_bytes.clamp(1, spare);
        let ready = pipe.buf.len() >= want || pipe.closed;
        if let Some(error) = immediate_outcome(request.timeout, ready) {
            return Poll::Ready(Err(error));
        }

        if !ready {
            if let IoTimeout::After(limit) = request.timeout {
                let now = Instant::now();
                match self.read_deadline {
                    Some(deadline) if now >= deadline => {
                        self.read_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                    Some(_) => {}
                    None => {
                        let deadline = now + limit;
                        self.read_deadline = Some(deadline);
                        Self::arm_timer(deadline, cx.waker().clone());
                    }
                }
            }
            pipe.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if request.force_queue && !self.read_queued {
            self.read_queued = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.read_queued = false;
        self.read_deadline = None;

        let count = pipe.buf.len().min(spare);
        for (slot, byte) in dst.spare_mut()[..count]
            .iter_mut()
            .zip(pipe.buf.drain(..count))
        {
            *slot = byte;
        }
        dst.commit(count);
        self.stats.inner.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inner
            .bytes_read
            .fetch_add(count as u64, Ordering::Relaxed);
        Poll::Ready(Ok(count))
    }

    fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        src: &[u8],
        request: &WriteRequest,
    ) -> Poll<io::Result<usize>> {
        if let Some(error) = immediate_outcome(request.timeout, true) {
            return Poll::Ready(Err(error));
        }
        if request.force_queue && !self.write_queued {
            self.write_queued = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.write_queued = false;

        let mut pipe = self.outbound.lock();
        if pipe.closed || pipe.reader_gone {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory transport peer is closed",
            )));
        }
        pipe.buf.extend(src);
        pipe.wake_reader();
        self.stats.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inner
            .bytes_written
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        Poll::Ready(Ok(src.len()))
    }

    fn shutdown(&mut self) {
        let mut pipe = self.outbound.lock();
        pipe.closed = true;
        pipe.wake_reader();
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
        self.inbound.lock().reader_gone = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{executor::block_on, future::poll_fn};

    use super::*;

    fn read(transport: &mut MemoryTransport, request: ReadRequest) -> io::Result<Vec<u8>> {
        let mut dst = Segment::detached(64);
        block_on(poll_fn(|cx| transport.poll_read(cx, &mut dst, &request)))?;
        Ok(dst.to_vec())
    }

    #[test]
    fn min_bytes_waits_for_enough_data() {
        let (mut a, mut b) = MemoryTransport::pair();
        let writer = thread::spawn(move || {
            for chunk in [&b"ab"[..], b"cd"] {
                block_on(poll_fn(|cx| a.poll_write(cx, chunk, &WriteRequest::default())))
                    .expect("写入内存管道");
                thread::sleep(Duration::from_millis(5));
            }
            a
        });
        let request = ReadRequest {
            min_bytes: 4,
            ..ReadRequest::default()
        };
        assert_eq!(read(&mut b, request).expect("读取"), b"abcd");
        let a = writer.join().expect("写线程");
        assert_eq!(a.stats().writes(), 2);
    }

    #[test]
    fn immediate_and_abort_timeouts_fail_fast() {
        let (_a, mut b) = MemoryTransport::pair();
        let immediate = ReadRequest {
            min_bytes: 1,
            timeout: IoTimeout::Immediate,
            ..ReadRequest::default()
        };
        let error = read(&mut b, immediate).expect_err("无数据时立即失败");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);

        let abort = ReadRequest {
            timeout: IoTimeout::Abort,
            ..ReadRequest::default()
        };
        let error = read(&mut b, abort).expect_err("中止请求");
        assert_eq!(error.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn bounded_timeout_expires() {
        let (_a, mut b) = MemoryTransport::pair();
        let request = ReadRequest {
            min_bytes: 1,
            timeout: IoTimeout::After(Duration::from_millis(20)),
            ..ReadRequest::default()
        };
        let error = read(&mut b, request).expect_err("超时");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }

    /// 共享定时线程按截止时间而非登记顺序唤醒。
    #[test]
    fn shared_timer_wakes_earlier_deadlines_first() {
        let timed_read = |limit: u64| {
            thread::spawn(move || {
                let (_a, mut b) = MemoryTransport::pair();
                let request = ReadRequest {
                    min_bytes: 1,
                    timeout: IoTimeout::After(Duration::from_millis(limit)),
                    ..ReadRequest::default()
                };
                let started = Instant::now();
                let error = read(&mut b, request).expect_err("超时");
                (error.kind(), started.elapsed())
            })
        };
        let slow = timed_read(400);
        thread::sleep(Duration::from_millis(20));
        let fast = timed_read(10);

        let (kind, elapsed) = fast.join().expect("短超时线程");
        assert_eq!(kind, io::ErrorKind::TimedOut);
        assert!(elapsed < Duration::from_millis(300), "短截止时间不应排在长截止时间之后");
        let (kind, elapsed) = slow.join().expect("长超时线程");
        assert_eq!(kind, io::ErrorKind::TimedOut);
        assert!(elapsed >= Duration::from_millis(400));
    }

    #[test]
    fn force_queue_yields_once_before_completing() {
        let (a, mut b) = MemoryTransport::pair();
        b.inject(b"x");
        drop(a);
        let request = ReadRequest {
            min_bytes: 1,
            force_queue: true,
            ..ReadRequest::default()
        };
        let mut dst = Segment::detached(8);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(b.poll_read(&mut cx, &mut dst, &request).is_pending());
        match b.poll_read(&mut cx, &mut dst, &request) {
            Poll::Ready(Ok(1)) => {}
            other => panic!("第二次轮询应完成，实际为 {other:?}"),
        }
        assert_eq!(dst.readable(), b"x");
    }

    #[test]
    fn dropped_peer_reads_as_eof_and_breaks_writes() {
        let (a, mut b) = MemoryTransport::pair();
        drop(a);
        assert!(read(&mut b, ReadRequest::default()).expect("EOF").is_empty());
        let error = block_on(poll_fn(|cx| b.poll_write(cx, b"x", &WriteRequest::default())))
            .expect_err("对端已关闭");
        assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
    }
}
