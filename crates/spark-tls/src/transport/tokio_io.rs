use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use spark_tls_buffer::Segment;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Sleep, sleep},
};

use super::{IoTimeout, ReadRequest, Transport, WriteRequest, immediate_outcome};

/// 把任意 tokio 字节流（`TcpStream`、`DuplexStream` 等）适配为 [`Transport`]。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 生产环境的会话跑在 tokio 套接字上，本适配器负责把“最小字节数 + 超时”的读语义
///   翻译为 `AsyncRead` 的多次轮询。
///
/// ## 逻辑（How）
/// - 已读到但尚不足 `min_bytes` 的字节立即 `commit` 到目标段，并记录在 `read_progress`；
///   再次轮询时从剩余空间继续读取，直到满足最小字节数或遇到 EOF；
/// - `IoTimeout::After` 懒创建 `tokio::time::Sleep`，请求完成或失败时清除。
///
/// ## 契约（What）
/// - 使用 `IoTimeout::After` 时必须运行在启用了 time 驱动的 tokio 运行时中；
/// - 超时返回 `TimedOut` 时，已提交到目标段的字节保留在段中，不会丢失。
pub struct TokioTransport<IO> {
    io: IO,
    read_progress: usize,
    read_sleep: Option<Pin<Box<Sleep>>>,
    write_sleep: Option<Pin<Box<Sleep>>>,
    read_queued: bool,
    write_queued: bool,
    shut: bool,
}

impl<IO> TokioTransport<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io,
            read_progress: 0,
            read_sleep: None,
            write_sleep: None,
            read_queued: false,
            write_queued: false,
            shut: false,
        }
    }

    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    pub fn into_inner(self) -> IO {
        self.io
    }

    fn finish_read(&mut self) -> usize {
        self.read_sleep = None;
        self.read_queued = false;
        std::mem::take(&mut self.read_progress)
    }
}

/// 处理一次未就绪的轮询：`true` 表示已超时。
fn expired(slot: &mut Option<Pin<Box<Sleep>>>, timeout: IoTimeout, cx: &mut Context<'_>) -> bool {
    match timeout {
        IoTimeout::After(limit) => slot
            .get_or_insert_with(|| Box::pin(sleep(limit)))
            .as_mut()
            .poll(cx)
            .is_ready(),
        _ => false,
    }
}

impl<IO> Transport for TokioTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn poll_read(
        &mut self,
        cx: &mut Context<'_>,
        dst: &mut Segment,
        request: &ReadRequest,
    ) -> Poll<io::Result<usize>> {
        if let Some(error) = immediate_outcome(request.timeout, true) {
            self.finish_read();
            return Poll::Ready(Err(error));
        }
        if request.force_queue && !self.read_queued {
            self.read_queued = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        let want = request.min_bytes.max(1);
        loop {
            if self.read_progress >= want || dst.spare_capacity() == 0 {
                return Poll::Ready(Ok(self.finish_read()));
            }
            let mut buf = ReadBuf::new(dst.spare_mut());
            match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {
                    let read = buf.filled().len();
                    dst.commit(read);
                    if read == 0 {
                        return Poll::Ready(Ok(self.finish_read()));
                    }
                    self.read_progress += read;
                }
                Poll::Ready(Err(error)) => {
                    self.finish_read();
                    return Poll::Ready(Err(error));
                }
                Poll::Pending => {
                    if request.timeout == IoTimeout::Immediate && self.read_progress == 0 {
                        self.finish_read();
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read not immediately ready",
                        )));
                    }
                    if request.timeout == IoTimeout::Immediate {
                        return Poll::Ready(Ok(self.finish_read()));
                    }
                    if expired(&mut self.read_sleep, request.timeout, cx) {
                        self.finish_read();
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
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
        match Pin::new(&mut self.io).poll_write(cx, src) {
            Poll::Ready(outcome) => {
                self.write_queued = false;
                self.write_sleep = None;
                Poll::Ready(outcome)
            }
            Poll::Pending => {
                let timed_out = request.timeout == IoTimeout::Immediate
                    || expired(&mut self.write_sleep, request.timeout, cx);
                if timed_out {
                    self.write_queued = false;
                    self.write_sleep = None;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write timed out",
                    )));
                }
                Poll::Pending
            }
        }
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        // 同步接口只能尽力而为：套接字类流的 poll_shutdown 通常立即完成。
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(Err(error)) = Pin::new(&mut self.io).poll_shutdown(&mut cx) {
            tracing::debug!(%error, "transport shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::poll_fn;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn partial_reads_accumulate_until_min_bytes() {
        let (mut peer, local) = tokio::io::duplex(64);
        let mut transport = TokioTransport::new(local);
        let writer = tokio::spawn(async move {
            peer.write_all(b"hel").await.expect("写入 duplex");
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.write_all(b"lo").await.expect("写入 duplex");
            peer
        });

        let mut dst = Segment::detached(32);
        let request = ReadRequest {
            min_bytes: 5,
            ..ReadRequest::default()
        };
        let read = poll_fn(|cx| transport.poll_read(cx, &mut dst, &request))
            .await
            .expect("读取应成功");
        assert_eq!(read, 5);
        assert_eq!(dst.readable(), b"hello");
        drop(writer.await.expect("写任务"));
    }

    #[tokio::test]
    async fn bounded_read_times_out() {
        let (_peer, local) = tokio::io::duplex(64);
        let mut transport = TokioTransport::new(local);
        let mut dst = Segment::detached(32);
        let request = ReadRequest {
            min_bytes: 1,
            timeout: IoTimeout::After(Duration::from_millis(20)),
            ..ReadRequest::default()
        };
        let error = poll_fn(|cx| transport.poll_read(cx, &mut dst, &request))
            .await
            .expect_err("无数据应超时");
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
    }
}
