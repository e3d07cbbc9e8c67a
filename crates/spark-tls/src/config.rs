//! 会话层配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 宿主以 TOML 片段声明 ALPN、缓冲、I/O 与握手策略，会话层在构造端点时一次性校验，
//!   避免把部署错误拖到首个握手才暴露。
//!
//! ## 契约（What）
//! - 所有字段都有默认值，空文档即得到 [`TlsChannelConfig::default`]；
//! - 未知字段直接拒绝，拼写错误不会被静默忽略；
//! - [`TlsChannelConfig::validate`] 通过后，会话层不再对配置做防御性检查。

use std::time::Duration;

use serde::Deserialize;

use crate::{
    alpn::{H2, HTTP_1_1},
    error::{Result, TlsError},
    transport::IoTimeout,
};

/// 会话层配置根。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsChannelConfig {
    pub alpn: AlpnConfig,
    pub buffers: BufferConfig,
    pub io: IoConfig,
    pub handshake: HandshakeConfig,
}

/// ALPN 协商配置。`protocols` 按偏好从高到低排列。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AlpnConfig {
    pub enabled: bool,
    pub protocols: Vec<String>,
}

impl Default for AlpnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocols: vec![H2.to_owned(), HTTP_1_1.to_owned()],
        }
    }
}

/// 缓冲策略。
///
/// - `network_segment_size`：网络段大小，缺省时取引擎的 packet buffer size；
/// - `jit_allocation_size`：按需读取（JIT）模式下单次分配的段大小；
/// - `reuse_network_segments`：网络段是否进入池的自由链表复用；
/// - `max_retained_bytes`：端点自建段池时自由链表的保留上限，缺省不设限。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    pub network_segment_size: Option<usize>,
    pub jit_allocation_size: usize,
    pub reuse_network_segments: bool,
    pub max_retained_bytes: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            network_segment_size: None,
            jit_allocation_size: 16 * 1024,
            reuse_network_segments: true,
            max_retained_bytes: None,
        }
    }
}

/// I/O 策略，映射到每次传输读写请求上的超时与排队选项。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IoConfig {
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub force_queue: bool,
}

impl IoConfig {
    pub fn read_timeout(&self) -> IoTimeout {
        self.read_timeout_ms
            .map_or(IoTimeout::Default, |ms| IoTimeout::After(Duration::from_millis(ms)))
    }

    pub fn write_timeout(&self) -> IoTimeout {
        self.write_timeout_ms
            .map_or(IoTimeout::Default, |ms| IoTimeout::After(Duration::from_millis(ms)))
    }
}

/// 握手策略。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    /// 以 warn 级别记录的握手失败条数上限，超出后降级为 trace。
    pub failure_log_limit: u64,
    /// 委派任务是否交给后台线程执行；关闭时在驱动线程内联执行。
    pub delegate_tasks: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            failure_log_limit: 100,
            delegate_tasks: false,
        }
    }
}

/// 一条 ALPN 协议标识的最大长度（协议线格式以单字节表示长度）。
const MAX_PROTOCOL_LEN: usize = 255;

/// 网络段的下限：至少能容纳记录头与一个最小握手消息。
const MIN_NETWORK_SEGMENT: usize = 512;

impl TlsChannelConfig {
    /// 解析并校验 TOML 配置片段。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|error| TlsError::configuration(format!("malformed tls config: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alpn.enabled {
            if self.alpn.protocols.is_empty() {
                return Err(TlsError::configuration(
                    "alpn is enabled but no protocols are configured",
                ));
            }
            if let Some(bad) = self
                .alpn
                .protocols
                .iter()
                .find(|p| p.is_empty() || p.len() > MAX_PROTOCOL_LEN)
            {
                return Err(TlsError::configuration(format!(
                    "alpn protocol `{bad}` must be 1..=255 bytes"
                )));
            }
        }
        if self.buffers.jit_allocation_size == 0 {
            return Err(TlsError::configuration(
                "buffers.jit_allocation_size must be positive",
            ));
        }
        if let Some(size) = self.buffers.network_segment_size
            && size < MIN_NETWORK_SEGMENT
        {
            return Err(TlsError::configuration(format!(
                "buffers.network_segment_size must be at least {MIN_NETWORK_SEGMENT} bytes"
            )));
        }
        Ok(())
    }
}
