use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{AlpnEnvironment, AlpnStrategyKind, BootstrapProvider, select_protocol};
use crate::{
    connection::ConnectionId,
    engine::{EngineMode, ProtocolSelector, RecordEngine},
    error::Result,
};

/// 一种 ALPN 接入方式。
///
/// - `probe`：在当前进程环境中是否可用，只在能力探测时调用一次；
/// - `register`：为一条连接的引擎配置 ALPN，返回的凭据负责取回结果与撤销注册。
pub trait AlpnStrategy: Send + Sync + 'static {
    fn kind(&self) -> AlpnStrategyKind;

    fn probe(&self, env: &AlpnEnvironment) -> bool;

    fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<AlpnRegistration>;
}

/// 按偏好列表选择协议并记住选择结果的服务端回调。
pub struct PreferenceSelector {
    preference: Vec<String>,
    chosen: Mutex<Option<String>>,
}

impl PreferenceSelector {
    pub fn new(preference: Vec<String>) -> Self {
        Self {
            preference,
            chosen: Mutex::new(None),
        }
    }

    /// 最近一次选择的协议；回调尚未被调用时为 `None`。
    pub fn chosen(&self) -> Option<String> {
        self.chosen.lock().clone()
    }
}

impl ProtocolSelector for PreferenceSelector {
    fn select(&self, offered: &[&[u8]]) -> Option<Vec<u8>> {
        let chosen = select_protocol(&self.preference, offered);
        tracing::debug!(protocol = %chosen, offered = offered.len(), "alpn protocol selected");
        *self.chosen.lock() = Some(chosen.clone());
        Some(chosen.into_bytes())
    }
}

/// 引导注册表：以连接为键保存偏好列表与选择结果。
#[derive(Default)]
pub struct ConnectionAlpnRegistry {
    entries: DashMap<ConnectionId, RegistryEntry>,
}

struct RegistryEntry {
    preference: Vec<String>,
    chosen: Option<String>,
}

impl ConnectionAlpnRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.entries.contains_key(&connection)
    }

    fn insert(&self, connection: ConnectionId, preference: Vec<String>) {
        self.entries.insert(
            connection,
            RegistryEntry {
                preference,
                chosen: None,
            },
        );
    }

    fn select(&self, connection: ConnectionId, offered: &[&[u8]]) -> Option<Vec<u8>> {
        let mut entry = self.entries.get_mut(&connection)?;
        let chosen = select_protocol(&entry.preference, offered);
        entry.chosen = Some(chosen.clone());
        Some(chosen.into_bytes())
    }

    fn chosen(&self, connection: ConnectionId) -> Option<String> {
        self.entries
            .get(&connection)
            .and_then(|entry| entry.chosen.clone())
    }

    fn remove(&self, connection: ConnectionId) -> bool {
        self.entries.remove(&connection).is_some()
    }
}

struct RegistrySelector {
    registry: Arc<ConnectionAlpnRegistry>,
    connection: ConnectionId,
}

impl ProtocolSelector for RegistrySelector {
    fn select(&self, offered: &[&[u8]]) -> Option<Vec<u8>> {
        self.registry.select(self.connection, offered)
    }
}

type CallbackTable = DashMap<ConnectionId, Arc<PreferenceSelector>>;

/// 引擎侧只持有路由器，真正的回调在连接注册时才登记到表中。
struct CallbackRouter {
    table: Arc<CallbackTable>,
    connection: ConnectionId,
}

impl ProtocolSelector for CallbackRouter {
    fn select(&self, offered: &[&[u8]]) -> Option<Vec<u8>> {
        let callback = self.table.get(&self.connection)?.value().clone();
        callback.select(offered)
    }
}

enum Outcome {
    Engine,
    Selector(Arc<PreferenceSelector>),
    Registry(Arc<ConnectionAlpnRegistry>),
    Callback {
        table: Arc<CallbackTable>,
        selector: Arc<PreferenceSelector>,
    },
}

/// 单条连接的 ALPN 注册凭据。
///
/// # 契约（What）
/// - [`AlpnRegistration::negotiated`] 优先读取引擎原生结果，其次读取选择回调记录的结果；
/// - [`AlpnRegistration::release`] 恰好一次地撤销注册表条目，之后的调用与 `Drop` 均为空操作。
pub struct AlpnRegistration {
    connection: ConnectionId,
    kind: AlpnStrategyKind,
    outcome: Outcome,
    released: bool,
}

impl AlpnRegistration {
    fn new(connection: ConnectionId, kind: AlpnStrategyKind, outcome: Outcome) -> Self {
        Self {
            connection,
            kind,
            outcome,
            released: false,
        }
    }

    pub fn kind(&self) -> AlpnStrategyKind {
        self.kind
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn negotiated(&self, engine: &dyn RecordEngine) -> Option<String> {
        let native = engine.negotiated_protocol();
        match &self.outcome {
            Outcome::Engine => native,
            Outcome::Selector(selector) | Outcome::Callback { selector, .. } => {
                native.or_else(|| selector.chosen())
            }
            Outcome::Registry(registry) => native.or_else(|| registry.chosen(self.connection)),
        }
    }

    /// 撤销注册；返回本次调用是否真正执行了撤销。
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        match &self.outcome {
            Outcome::Registry(registry) => {
                registry.remove(self.connection);
            }
            Outcome::Callback { table, .. } => {
                table.remove(&self.connection);
            }
            Outcome::Engine | Outcome::Selector(_) => {}
        }
        tracing::trace!(connection = %self.connection, strategy = %self.kind, "alpn registration released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for AlpnRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

/// 客户端引擎在所有策略下都只需要报价列表。
fn client_registration(
    kind: AlpnStrategyKind,
    connection: ConnectionId,
    engine: &mut dyn RecordEngine,
    protocols: &[String],
) -> Option<AlpnRegistration> {
    if engine.mode() != EngineMode::Client {
        return None;
    }
    engine.set_application_protocols(protocols);
    Some(AlpnRegistration::new(connection, kind, Outcome::Engine))
}

/// 安装服务端选择回调；引擎不接受回调时退回原生偏好列表。
fn install_selector(
    engine: &mut dyn RecordEngine,
    selector: Arc<dyn ProtocolSelector>,
    protocols: &[String],
) {
    if !engine.set_protocol_selector(selector) {
        tracing::debug!("engine rejected alpn selector; using native protocol list");
        engine.set_application_protocols(protocols);
    }
}

/// 引擎原生 ALPN：直接设置协议列表，由引擎完成选择。
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineNativeAlpn;

impl AlpnStrategy for EngineNativeAlpn {
    fn kind(&self) -> AlpnStrategyKind {
        AlpnStrategyKind::EngineNative
    }

    fn probe(&self, env: &AlpnEnvironment) -> bool {
        env.engine_native
    }

    fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<AlpnRegistration> {
        engine.set_application_protocols(protocols);
        Ok(AlpnRegistration::new(
            connection,
            self.kind(),
            Outcome::Engine,
        ))
    }
}

/// 内嵌选择回调：服务端引擎在收到 ClientHello 时调用 [`PreferenceSelector`]。
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbeddedSelectorAlpn;

impl AlpnStrategy for EmbeddedSelectorAlpn {
    fn kind(&self) -> AlpnStrategyKind {
        AlpnStrategyKind::EmbeddedSelector
    }

    fn probe(&self, env: &AlpnEnvironment) -> bool {
        env.embedded_selector
    }

    fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<AlpnRegistration> {
        if let Some(registration) = client_registration(self.kind(), connection, engine, protocols)
        {
            return Ok(registration);
        }
        let selector = Arc::new(PreferenceSelector::new(protocols.to_vec()));
        install_selector(engine, selector.clone(), protocols);
        Ok(AlpnRegistration::new(
            connection,
            self.kind(),
            Outcome::Selector(selector),
        ))
    }
}

/// 引导注册表：偏好与结果保存在进程级注册表中，释放时撤销条目。
#[derive(Default)]
pub struct BootstrapRegistryAlpn {
    registry: Arc<ConnectionAlpnRegistry>,
}

impl BootstrapRegistryAlpn {
    pub fn registry(&self) -> &Arc<ConnectionAlpnRegistry> {
        &self.registry
    }
}

impl AlpnStrategy for BootstrapRegistryAlpn {
    fn kind(&self) -> AlpnStrategyKind {
        AlpnStrategyKind::BootstrapRegistry
    }

    fn probe(&self, env: &AlpnEnvironment) -> bool {
        env.bootstrap == Some(BootstrapProvider::Registry)
    }

    fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<AlpnRegistration> {
        if let Some(registration) = client_registration(self.kind(), connection, engine, protocols)
        {
            return Ok(registration);
        }
        self.registry.insert(connection, protocols.to_vec());
        let selector = Arc::new(RegistrySelector {
            registry: self.registry.clone(),
            connection,
        });
        install_selector(engine, selector, protocols);
        Ok(AlpnRegistration::new(
            connection,
            self.kind(),
            Outcome::Registry(self.registry.clone()),
        ))
    }
}

/// 引导回调：每条连接登记一个独立回调，引擎只持有按连接路由的转发器。
#[derive(Default)]
pub struct BootstrapCallbackAlpn {
    table: Arc<CallbackTable>,
}

impl BootstrapCallbackAlpn {
    /// 仍处于登记状态的回调数量。
    pub fn registered(&self) -> usize {
        self.table.len()
    }
}

impl AlpnStrategy for BootstrapCallbackAlpn {
    fn kind(&self) -> AlpnStrategyKind {
        AlpnStrategyKind::BootstrapCallback
    }

    fn probe(&self, env: &AlpnEnvironment) -> bool {
        env.bootstrap == Some(BootstrapProvider::Callback)
    }

    fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<AlpnRegistration> {
        if let Some(registration) = client_registration(self.kind(), connection, engine, protocols)
        {
            return Ok(registration);
        }
        let selector = Arc::new(PreferenceSelector::new(protocols.to_vec()));
        self.table.insert(connection, selector.clone());
        let router = Arc::new(CallbackRouter {
            table: self.table.clone(),
            connection,
        });
        install_selector(engine, router, protocols);
        Ok(AlpnRegistration::new(
            connection,
            self.kind(),
            Outcome::Callback {
                table: self.table.clone(),
                selector,
            },
        ))
    }
}
