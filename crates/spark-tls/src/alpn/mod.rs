//! ALPN 协商能力探测与按连接注册。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 不同记录层引擎暴露 ALPN 的方式不同：有的原生支持协议列表，有的只接受服务端选择回调，
//!   还有的需要宿主在引导阶段把回调登记到进程级注册表；
//! - 会话层在进程启动时按固定顺序探测一次，选出首个可用策略，此后每条连接都沿用它。
//!
//! ## 逻辑（How）
//! - 探测顺序：[`AlpnStrategyKind::EngineNative`] → [`AlpnStrategyKind::EmbeddedSelector`]
//!   → [`AlpnStrategyKind::BootstrapRegistry`] → [`AlpnStrategyKind::BootstrapCallback`]；
//!   两种引导策略互斥，由环境变量 `SPARK_TLS_ALPN_BOOTSTRAP` 二选一；
//! - 服务端的选择规则由 [`select_protocol`] 定义：按本端偏好找出首个被客户端报价的协议，
//!   都不匹配时退回 `http/1.1`；
//! - [`AlpnRegistration`] 是每条连接的注册凭据，负责在握手结束后取回协商结果，
//!   并在释放时恰好一次地撤销注册。
//!
//! ## 契约（What）
//! - 没有任何策略可用时会话照常握手，只是不协商应用协议；
//! - 探测结果在进程内只计算一次（[`AlpnCapability::global`]），测试可用
//!   [`AlpnCapability::detect`] 构造独立实例。

mod strategy;

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use crate::{connection::ConnectionId, engine::RecordEngine, error::Result};

pub use strategy::{
    AlpnRegistration, AlpnStrategy, BootstrapCallbackAlpn, BootstrapRegistryAlpn,
    ConnectionAlpnRegistry, EmbeddedSelectorAlpn, EngineNativeAlpn, PreferenceSelector,
};

pub const H2: &str = "h2";
pub const HTTP_1_1: &str = "http/1.1";

/// 以逗号分隔列出需要禁用的策略：`native`、`selector`。
pub const ALPN_DISABLE_ENV: &str = "SPARK_TLS_ALPN_DISABLE";
/// 启用的引导策略：`registry` 或 `callback`。
pub const ALPN_BOOTSTRAP_ENV: &str = "SPARK_TLS_ALPN_BOOTSTRAP";

/// 服务端协议选择：偏好列表中首个被报价的协议，否则为 `http/1.1`。
pub fn select_protocol(preference: &[String], offered: &[&[u8]]) -> String {
    preference
        .iter()
        .find(|candidate| offered.contains(&candidate.as_bytes()))
        .cloned()
        .unwrap_or_else(|| HTTP_1_1.to_owned())
}

/// ALPN 策略种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlpnStrategyKind {
    EngineNative,
    EmbeddedSelector,
    BootstrapRegistry,
    BootstrapCallback,
}

impl fmt::Display for AlpnStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlpnStrategyKind::EngineNative => "engine-native",
            AlpnStrategyKind::EmbeddedSelector => "embedded-selector",
            AlpnStrategyKind::BootstrapRegistry => "bootstrap-registry",
            AlpnStrategyKind::BootstrapCallback => "bootstrap-callback",
        })
    }
}

/// 宿主提供的引导式 ALPN 机制。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapProvider {
    Registry,
    Callback,
}

/// 探测输入：哪些 ALPN 机制在当前进程中可用。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlpnEnvironment {
    pub engine_native: bool,
    pub embedded_selector: bool,
    pub bootstrap: Option<BootstrapProvider>,
}

impl Default for AlpnEnvironment {
    fn default() -> Self {
        Self {
            engine_native: true,
            embedded_selector: true,
            bootstrap: None,
        }
    }
}

impl AlpnEnvironment {
    /// 读取进程环境变量。
    pub fn from_env() -> Self {
        let disable = std::env::var(ALPN_DISABLE_ENV).ok();
        let bootstrap = std::env::var(ALPN_BOOTSTRAP_ENV).ok();
        Self::parse(disable.as_deref(), bootstrap.as_deref())
    }

    /// 解析环境变量取值；无法识别的条目被忽略并记录 warn 日志。
    pub fn parse(disable: Option<&str>, bootstrap: Option<&str>) -> Self {
        let mut env = Self::default();
        for entry in disable
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
        {
            match entry {
                "native" => env.engine_native = false,
                "selector" => env.embedded_selector = false,
                other => tracing::warn!(entry = other, "unknown alpn strategy in {ALPN_DISABLE_ENV}"),
            }
        }
        env.bootstrap = match bootstrap.map(str::trim) {
            None | Some("") => None,
            Some("registry") => Some(BootstrapProvider::Registry),
            Some("callback") => Some(BootstrapProvider::Callback),
            Some(other) => {
                tracing::warn!(value = other, "unknown bootstrap provider in {ALPN_BOOTSTRAP_ENV}");
                None
            }
        };
        env
    }
}

/// 一次探测的结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlpnProbe {
    pub kind: AlpnStrategyKind,
    pub available: bool,
}

/// 进程级 ALPN 能力：按顺序探测后选中的策略。
pub struct AlpnCapability {
    selected: Option<Arc<dyn AlpnStrategy>>,
    probes: Vec<AlpnProbe>,
}

impl AlpnCapability {
    /// 按顺序探测，首个可用的策略胜出；其后的策略不再探测。
    pub fn detect(strategies: Vec<Arc<dyn AlpnStrategy>>, env: &AlpnEnvironment) -> Self {
        let mut probes = Vec::with_capacity(strategies.len());
        let mut selected = None;
        for strategy in strategies {
            let available = strategy.probe(env);
            probes.push(AlpnProbe {
                kind: strategy.kind(),
                available,
            });
            if available {
                selected = Some(strategy);
                break;
            }
        }
        match &selected {
            Some(strategy) => tracing::info!(strategy = %strategy.kind(), "alpn strategy selected"),
            None => tracing::info!("no alpn strategy available; sessions proceed without alpn"),
        }
        Self { selected, probes }
    }

    /// 标准探测顺序。
    pub fn standard(env: &AlpnEnvironment) -> Self {
        let strategies: Vec<Arc<dyn AlpnStrategy>> = vec![
            Arc::new(EngineNativeAlpn),
            Arc::new(EmbeddedSelectorAlpn),
            Arc::new(BootstrapRegistryAlpn::default()),
            Arc::new(BootstrapCallbackAlpn::default()),
        ];
        Self::detect(strategies, env)
    }

    /// 禁用 ALPN。
    pub fn disabled() -> Self {
        Self {
            selected: None,
            probes: Vec::new(),
        }
    }

    /// 进程级单例：首次调用时读取环境变量并探测，结果此后不变。
    pub fn global() -> Arc<AlpnCapability> {
        static GLOBAL: OnceLock<Arc<AlpnCapability>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Self::standard(&AlpnEnvironment::from_env())))
            .clone()
    }

    pub fn kind(&self) -> Option<AlpnStrategyKind> {
        self.selected.as_ref().map(|strategy| strategy.kind())
    }

    pub fn probes(&self) -> &[AlpnProbe] {
        &self.probes
    }

    /// 为一条连接注册 ALPN；没有可用策略时返回 `None`。
    pub fn register(
        &self,
        connection: ConnectionId,
        engine: &mut dyn RecordEngine,
        protocols: &[String],
    ) -> Result<Option<AlpnRegistration>> {
        match &self.selected {
            Some(strategy) => strategy.register(connection, engine, protocols).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for AlpnCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlpnCapability")
            .field("selected", &self.kind())
            .field("probes", &self.probes)
            .finish()
    }
}
