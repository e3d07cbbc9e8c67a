#![doc = r#"
# spark-tls

## 设计动机（Why）
- **不阻塞工作线程**：在回调驱动的非阻塞字节传输之上终结/发起 TLS，每个握手步骤与每次加解密
  要么就地完成，要么挂起在一次异步 I/O 完成之后；
- **引擎无关**：会话编排只依赖记录层引擎的 wrap/unwrap/委派任务契约，`rustls` 是默认实现；
- **可运维性**：错误携带稳定错误码与分类（Security / Retryable / ResourceExhausted / Closed），
  握手摘要（协议版本、密码套件、SNI、ALPN）通过监听器暴露给审计与会话缓存。

## 核心契约（What）
- [`TlsEndpoint`]：持有引擎工厂、段池、ALPN 能力与协议探测器，`accept`/`connect`/
  `accept_discriminated` 创建 [`TlsSession`]；
- [`TlsSession`]：握手（`establish`/`establish_blocking`）、读（`read_into`/`read_segment`）、
  写（`write_all`）、优雅关闭（`shutdown`）与幂等关闭（`close`）；启用 `runtime-tokio` 时
  同时实现 `AsyncRead`/`AsyncWrite`；
- [`Discriminator`]：不消费输入地判断首批字节是否为 TLS；
- [`AlpnCapability`]：进程级 ALPN 能力探测，按固定顺序选出唯一策略。

## 实现策略（How）
- 每个操作是一个 `poll_*` 状态机，异步调用方 `.await`，阻塞调用方经
  `futures::executor::block_on` 驱动同一个状态机；
- 缓冲来自 `spark-tls-buffer` 的段池，所有权在引擎、适配器、调用方与池之间显式转移；
- 服务端配置放在 `ArcSwap` 中，证书轮换对后续握手立即生效。

## 风险与考量（Trade-offs）
- 会话操作均为 `&mut self`，同一会话同时只有一个握手或读写；跨线程关闭通过
  [`SessionCloser`] 完成，拆除路径由一把窄锁保证恰好一次；
- 取消依赖传输超时（[`IoTimeout`]），不会在一次加解密调用中途取消。
"#]

pub mod alpn;
pub mod config;
mod connection;
pub mod discriminator;
mod endpoint;
pub mod engine;
mod error;
mod handshake;
mod record_io;
mod session;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use alpn::{AlpnCapability, AlpnEnvironment, AlpnStrategyKind, H2, HTTP_1_1, select_protocol};
pub use config::TlsChannelConfig;
pub use connection::{ConnectionId, Direction};
pub use discriminator::{Discrimination, DiscriminationHandoff, Discriminator, DiscriminatorStats};
pub use endpoint::{TlsEndpoint, TlsEndpointBuilder};
pub use engine::{RecordEngine, RustlsContext, RustlsEngine, TlsContextFactory};
pub use error::{ErrorCategory, OperationKind, Result, SecurityClass, TlsError};
pub use handshake::{HandshakeStep, TaskExecutor, ThreadExecutor};
pub use session::{CloseReason, SessionCloser, TlsSession};
pub use telemetry::{HandshakeFailureLog, HandshakeListener, HandshakeSummary};
pub use transport::{IoTimeout, MemoryTransport, ReadRequest, Transport, WriteRequest};

pub use spark_tls_buffer as buffer;
