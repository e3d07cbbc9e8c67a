//! TLS 记录头预检。
//!
//! 记录层引擎一次只消费一条完整记录：预检负责回答“缓冲里是不是 TLS、
//! 第一条记录还差多少字节”，让引擎在真正解密之前就能给出 `BufferUnderflow`
//! 或解码失败的结论。协议探测器依赖同一结论区分 TLS 与明文协议。

use thiserror::Error;

/// 记录头长度：content type(1) + version(2) + length(2)。
pub const RECORD_HEADER_LEN: usize = 5;

/// 单条记录可承载的最大明文长度（2^14）。
pub const MAX_PLAINTEXT_LEN: usize = 16_384;

/// 密文负载上限：明文上限加上压缩与 MAC/填充的扩展空间。
pub const MAX_CIPHERTEXT_PAYLOAD: usize = MAX_PLAINTEXT_LEN + 2_048;

/// 容纳任意一条入站记录所需的网络缓冲大小。
pub const PACKET_BUFFER_SIZE: usize = RECORD_HEADER_LEN + MAX_CIPHERTEXT_PAYLOAD;

/// 单条记录解密后的最大应用数据长度。
pub const APPLICATION_BUFFER_SIZE: usize = MAX_PLAINTEXT_LEN;

const CONTENT_TYPES: std::ops::RangeInclusive<u8> = 20..=24;

/// 预检结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordCheck {
    /// 缓冲以一条完整记录开头，`len` 为含记录头的总长度。
    Complete { len: usize, payload: usize },
    /// 目前为止的字节合法，但还缺少 `missing` 字节才能构成完整记录。
    Incomplete { missing: usize },
}

/// 记录头不合法：缓冲内容不是 TLS。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("unknown record content type {0}")]
    ContentType(u8),
    #[error("unsupported record major version {0}")]
    Version(u8),
    #[error("record payload of {0} bytes exceeds limit")]
    Oversized(usize),
}

/// 检查缓冲开头的记录头。
///
/// - 已到达的每个头部字节都会被校验，因此只到达 1 字节的明文协议也能被立即识别；
/// - 不读取也不修改记录负载。
pub fn inspect(buf: &[u8]) -> Result<RecordCheck, RecordError> {
    if let Some(&content_type) = buf.first()
        && !CONTENT_TYPES.contains(&content_type)
    {
        return Err(RecordError::ContentType(content_type));
    }
    if let Some(&major) = buf.get(1)
        && major != 3
    {
        return Err(RecordError::Version(major));
    }
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(RecordCheck::Incomplete {
            missing: RECORD_HEADER_LEN - buf.len(),
        });
    }

    let payload = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if payload > MAX_CIPHERTEXT_PAYLOAD {
        return Err(RecordError::Oversized(payload));
    }
    let len = RECORD_HEADER_LEN + payload;
    if buf.len() < len {
        Ok(RecordCheck::Incomplete {
            missing: len - buf.len(),
        })
    } else {
        Ok(RecordCheck::Complete { len, payload })
    }
}

/// 读取下一条记录仍需的字节数，至少为 1。
///
/// 非法记录头返回 1：上层会再读一次并在 unwrap 时得到解码错误。
pub fn missing_bytes(buf: &[u8]) -> usize {
    match inspect(buf) {
        Ok(RecordCheck::Incomplete { missing }) => missing.max(1),
        Ok(RecordCheck::Complete { .. }) | Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plaintext_protocols_are_rejected_from_first_byte() {
        assert_eq!(inspect(b"G"), Err(RecordError::ContentType(b'G')));
        assert_eq!(
            inspect(b"GET / HTTP/1.1\r\n"),
            Err(RecordError::ContentType(b'G'))
        );
        assert_eq!(inspect(&[22, 2]), Err(RecordError::Version(2)));
    }

    #[test]
    fn partial_header_reports_missing_header_bytes() {
        assert_eq!(inspect(&[]), Ok(RecordCheck::Incomplete { missing: 5 }));
        assert_eq!(inspect(&[22, 3, 1]), Ok(RecordCheck::Incomplete { missing: 2 }));
    }

    #[test]
    fn complete_record_reports_total_length() {
        let mut record = vec![23, 3, 3, 0, 4];
        record.extend_from_slice(b"abcd");
        record.extend_from_slice(b"next");
        assert_eq!(
            inspect(&record),
            Ok(RecordCheck::Complete { len: 9, payload: 4 })
        );
        assert_eq!(missing_bytes(&record[..7]), 2);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let [hi, lo] = u16::try_from(MAX_CIPHERTEXT_PAYLOAD + 1)
            .expect("上限应可用 u16 表示")
            .to_be_bytes();
        assert!(matches!(
            inspect(&[23, 3, 3, hi, lo]),
            Err(RecordError::Oversized(_))
        ));
    }

    proptest! {
        /// 任意输入都只会得到三种结论之一，且缺失字节数与输入长度一致。
        #[test]
        fn inspect_is_total(input in proptest::collection::vec(any::<u8>(), 0..64)) {
            match inspect(&input) {
                Ok(RecordCheck::Complete { len, payload }) => {
                    prop_assert!(len <= input.len());
                    prop_assert_eq!(len, payload + RECORD_HEADER_LEN);
                }
                Ok(RecordCheck::Incomplete { missing }) => prop_assert!(missing >= 1),
                Err(_) => prop_assert!(!input.is_empty()),
            }
        }
    }
}
