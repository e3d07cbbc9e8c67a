use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::TlsSession;
use crate::transport::Transport;

/// 让会话直接嵌入 tokio 协议栈（`tokio::io::copy`、编解码器等）。
///
/// 每次 `poll_read` 至少交付 1 字节；`poll_write` 每次只加密一个分片，
/// 密文在下一次写或 `poll_flush` 时写出，不会出现“已消费却返回 Pending”。
impl<T: Transport + Unpin> AsyncRead for TlsSession<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let dst = buf.initialize_unfilled();
        let mut delivered = 0;
        let read = ready!(this.poll_read_step(cx, dst, &mut delivered, 1))?;
        buf.advance(read);
        Poll::Ready(Ok(()))
    }
}

impl<T: Transport + Unpin> AsyncWrite for TlsSession<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut accepted = 0;
        let written = ready!(this.poll_write_step(cx, buf, &mut accepted, false))?;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_ciphertext(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_graceful_shutdown(cx))?;
        Poll::Ready(Ok(()))
    }
}
