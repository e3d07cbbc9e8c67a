use spark_tls_buffer::{SegmentArray, SegmentPool};

/// 已解密但尚未交付给调用方的明文。
///
/// 解密目标直接是 backlog 的段数组：调用方缓冲装不下的部分原地留存，
/// 下一次读取先从这里交付。
#[derive(Debug, Default)]
pub(crate) struct DecryptedBacklog {
    segments: SegmentArray,
}

impl DecryptedBacklog {
    pub(crate) fn len(&self) -> usize {
        self.segments.readable_len()
    }

    /// 解密输出目标。
    pub(crate) fn segments_mut(&mut self) -> &mut SegmentArray {
        &mut self.segments
    }

    /// 接管握手期间或协议探测期间解出的明文。
    pub(crate) fn append(&mut self, mut plaintext: SegmentArray, pool: &SegmentPool) {
        plaintext.release_drained(pool);
        while let Some(segment) = plaintext.pop_front() {
            self.segments.push(segment);
        }
    }

    pub(crate) fn drain_into(&mut self, pool: &SegmentPool, dst: &mut [u8]) -> usize {
        let copied = self.segments.drain_into(pool, dst);
        if copied > 0 {
            self.segments.release_drained(pool);
        }
        copied
    }

    pub(crate) fn release_all(&mut self, pool: &SegmentPool) -> usize {
        self.segments.release_all(pool)
    }
}

#[cfg(test)]
mod tests {
    use spark_tls_buffer::AllocationMode;

    use super::*;

    #[test]
    fn undelivered_plaintext_stays_queued() {
        let pool = SegmentPool::new();
        let mut handshake_output = SegmentArray::new();
        handshake_output
            .push_full_size(&pool, 8, AllocationMode::Reusable)
            .put_slice(b"abcdef");

        let mut backlog = DecryptedBacklog::default();
        backlog.append(handshake_output, &pool);
        assert_eq!(backlog.len(), 6);

        let mut first = [0u8; 4];
        assert_eq!(backlog.drain_into(&pool, &mut first), 4);
        assert_eq!(&first, b"abcd");
        assert_eq!(backlog.len(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(backlog.drain_into(&pool, &mut rest), 2);
        assert_eq!(backlog.len(), 0);
        assert_eq!(pool.statistics().active_leases, 0);
    }
}
