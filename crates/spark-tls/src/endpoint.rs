use std::{fmt, sync::Arc};

use spark_tls_buffer::SegmentPool;

use crate::{
    alpn::{AlpnCapability, AlpnRegistration},
    config::TlsChannelConfig,
    connection::{ConnectionId, Direction},
    discriminator::Discriminator,
    engine::{EngineMode, RecordEngine, TlsContextFactory},
    error::Result,
    handshake::{TaskExecutor, ThreadExecutor},
    record_io::RecordIo,
    session::{SessionHooks, TlsSession},
    telemetry::{HandshakeFailureLog, HandshakeListener},
    transport::Transport,
};

/// TLS 会话的创建入口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎工厂、段池、ALPN 能力、监听器与协议探测器在一个监听端口上是共享的；
///   端点持有这些协作者，每条连接只需提供传输即可得到会话；
/// - 证书热更新发生在 [`TlsContextFactory`] 内部，端点本身不可变，可在线程间自由克隆。
///
/// ## 逻辑（How）
/// - `accept`/`connect`：创建对应角色的新引擎，按配置注册 ALPN，包装为处于握手阶段的会话；
/// - `accept_discriminated`：领取探测器留下的引擎与明文，把首批字节中未被消费的部分
///   预置为密文后继续握手；没有交接时退化为普通 `accept` 并预置全部首批字节。
///
/// ## 契约（What）
/// - [`TlsEndpointBuilder::build`] 校验配置，失败返回 `ConfigurationInvalid`；
/// - 会话不会在创建时执行任何 I/O，首次 `establish`/读/写时才开始握手。
#[derive(Clone)]
pub struct TlsEndpoint {
    context: Arc<dyn TlsContextFactory>,
    config: Arc<TlsChannelConfig>,
    pool: SegmentPool,
    alpn: Arc<AlpnCapability>,
    hooks: SessionHooks,
    discriminator: Arc<Discriminator>,
}

impl TlsEndpoint {
    pub fn builder(context: Arc<dyn TlsContextFactory>) -> TlsEndpointBuilder {
        TlsEndpointBuilder::new(context)
    }

    pub fn config(&self) -> &TlsChannelConfig {
        &self.config
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn alpn(&self) -> &AlpnCapability {
        &self.alpn
    }

    pub fn discriminator(&self) -> &Arc<Discriminator> {
        &self.discriminator
    }

    /// 失败日志累计记录的握手失败次数。
    pub fn handshake_failures(&self) -> u64 {
        self.hooks.failure_log.failures()
    }

    /// 以服务端角色接入一条入站连接。
    pub fn accept<T: Transport>(&self, transport: T) -> Result<TlsSession<T>> {
        self.accept_with_id(ConnectionId::next(), transport)
    }

    /// 使用宿主分配的连接标识接入入站连接。
    pub fn accept_with_id<T: Transport>(
        &self,
        connection: ConnectionId,
        transport: T,
    ) -> Result<TlsSession<T>> {
        let mut engine = self.context.create_engine(EngineMode::Server, None)?;
        let alpn = self.register_alpn(connection, engine.as_mut())?;
        Ok(self.session(connection, Direction::Inbound, engine, transport, alpn))
    }

    /// 以客户端角色发起一条出站连接；`server_name` 用于 SNI 与证书校验。
    pub fn connect<T: Transport>(&self, transport: T, server_name: &str) -> Result<TlsSession<T>> {
        let connection = ConnectionId::next();
        let mut engine = self
            .context
            .create_engine(EngineMode::Client, Some(server_name))?;
        let alpn = self.register_alpn(connection, engine.as_mut())?;
        Ok(self.session(connection, Direction::Outbound, engine, transport, alpn))
    }

    /// 接手协议探测的结果继续握手。
    ///
    /// `initial` 是探测时交给 [`Discriminator::discriminate`] 的同一批字节，
    /// 且这些字节已经从 `transport` 中读出。
    pub fn accept_discriminated<T: Transport>(
        &self,
        key: ConnectionId,
        initial: &[u8],
        transport: T,
    ) -> Result<TlsSession<T>> {
        let Some(handoff) = self.discriminator.take_handoff(key) else {
            self.discriminator.release(key);
            let mut session = self.accept_with_id(key, transport)?;
            session.seed_inbound(initial);
            return Ok(session);
        };
        let consumed = handoff.consumed.min(initial.len());
        tracing::debug!(
            connection_id = %key,
            consumed,
            remaining = initial.len() - consumed,
            "tls session resumes discriminated connection"
        );
        let mut session = self.session(
            key,
            Direction::Inbound,
            handoff.engine,
            transport,
            handoff.alpn,
        );
        session.seed_inbound(&initial[consumed..]);
        Ok(session.resume(handoff.plaintext, handoff.failure))
    }

    fn register_alpn(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
    ) -> Result<Option<AlpnRegistration>> {
        if !self.config.alpn.enabled {
            return Ok(None);
        }
        self.alpn
            .register(connection, engine, &self.config.alpn.protocols)
    }

    fn session<T: Transport>(
        &self,
        connection: ConnectionId,
        direction: Direction,
        engine: Box<dyn RecordEngine>,
        transport: T,
        alpn: Option<AlpnRegistration>,
    ) -> TlsSession<T> {
        let io = RecordIo::new(
            connection,
            direction,
            engine,
            transport,
            self.pool.clone(),
            &self.config,
        );
        let mut hooks = self.hooks.clone();
        if direction == Direction::Outbound {
            hooks.discriminator = None;
        }
        TlsSession::new(io, hooks, alpn)
    }
}

impl fmt::Debug for TlsEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEndpoint")
            .field("config", &self.config)
            .field("alpn", &self.alpn.kind())
            .field("listeners", &self.hooks.listeners.len())
            .finish_non_exhaustive()
    }
}

/// [`TlsEndpoint`] 的建造器。
pub struct TlsEndpointBuilder {
    context: Arc<dyn TlsContextFactory>,
    config: TlsChannelConfig,
    pool: Option<SegmentPool>,
    alpn: Option<Arc<AlpnCapability>>,
    listeners: Vec<Arc<dyn HandshakeListener>>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl TlsEndpointBuilder {
    pub fn new(context: Arc<dyn TlsContextFactory>) -> Self {
        Self {
            context,
            config: TlsChannelConfig::default(),
            pool: None,
            alpn: None,
            listeners: Vec::new(),
            executor: None,
        }
    }

    pub fn config(mut self, config: TlsChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// 共享段池；缺省时端点创建自己的池。
    pub fn pool(mut self, pool: SegmentPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// ALPN 能力；缺省时使用进程级探测结果 [`AlpnCapability::global`]。
    pub fn alpn(mut self, alpn: Arc<AlpnCapability>) -> Self {
        self.alpn = Some(alpn);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn HandshakeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 委派任务执行器，优先于 `handshake.delegate_tasks` 配置。
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<TlsEndpoint> {
        self.config.validate()?;
        let pool = self.pool.unwrap_or_else(|| match self.config.buffers.max_retained_bytes {
            Some(limit) => SegmentPool::with_retained_limit(limit),
            None => SegmentPool::new(),
        });
        let alpn = self.alpn.unwrap_or_else(AlpnCapability::global);
        let executor = self.executor.or_else(|| {
            self.config
                .handshake
                .delegate_tasks
                .then(|| Arc::new(ThreadExecutor) as Arc<dyn TaskExecutor>)
        });
        let protocols = self
            .config
            .alpn
            .enabled
            .then(|| self.config.alpn.protocols.clone());
        let discriminator = Arc::new(Discriminator::new(
            self.context.clone(),
            pool.clone(),
            alpn.clone(),
            protocols,
        ));
        let hooks = SessionHooks {
            listeners: self.listeners.into(),
            failure_log: Arc::new(HandshakeFailureLog::new(
                self.config.handshake.failure_log_limit,
            )),
            executor,
            discriminator: Some(discriminator.clone()),
        };
        tracing::debug!(
            alpn_enabled = self.config.alpn.enabled,
            alpn_strategy = ?alpn.kind(),
            delegate_tasks = hooks.executor.is_some(),
            "tls endpoint built"
        );
        Ok(TlsEndpoint {
            context: self.context,
            config: Arc::new(self.config),
            pool,
            alpn,
            hooks,
            discriminator,
        })
    }
}

impl fmt::Debug for TlsEndpointBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEndpointBuilder")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
