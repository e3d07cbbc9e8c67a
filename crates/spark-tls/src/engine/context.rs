use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};

use super::{EngineMode, RecordEngine, RustlsEngine, hot_reload::HotReloadingServerConfig};
use crate::error::{Result, TlsError};

/// 记录层引擎工厂：每条连接、每次协议探测都通过它创建全新的引擎。
///
/// `server_name` 只对客户端引擎有意义（SNI 与证书校验），服务端忽略它。
pub trait TlsContextFactory: Send + Sync + 'static {
    fn create_engine(
        &self,
        mode: EngineMode,
        server_name: Option<&str>,
    ) -> Result<Box<dyn RecordEngine>>;
}

/// 基于 `rustls` 配置的引擎工厂。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一进程常常既是服务端又是客户端（例如网关回源），一个上下文同时持有两侧配置；
/// - 服务端配置放进 [`HotReloadingServerConfig`]，证书轮换对新握手立即生效。
///
/// ## 契约（What）
/// - 构造与替换时都会校验密码套件非空，空套件的配置直接以
///   [`TlsError::ConfigurationInvalid`] 拒绝，而不是等到握手时才失败；
/// - 缺少对应角色的配置时，`create_engine` 返回 `ConfigurationInvalid`。
#[derive(Clone, Debug, Default)]
pub struct RustlsContext {
    server: Option<HotReloadingServerConfig>,
    client: Option<Arc<ClientConfig>>,
}

impl RustlsContext {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        Self::default().with_server(config)
    }

    pub fn client(config: Arc<ClientConfig>) -> Result<Self> {
        Self::default().with_client(config)
    }

    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Result<Self> {
        validate_suites(config.crypto_provider().cipher_suites.is_empty())?;
        self.server = Some(HotReloadingServerConfig::new(config));
        Ok(self)
    }

    pub fn with_client(mut self, config: Arc<ClientConfig>) -> Result<Self> {
        validate_suites(config.crypto_provider().cipher_suites.is_empty())?;
        self.client = Some(config);
        Ok(self)
    }

    /// 替换服务端配置，返回旧配置；只影响此后开始的握手。
    pub fn replace_server_config(&self, next: Arc<ServerConfig>) -> Result<Arc<ServerConfig>> {
        validate_suites(next.crypto_provider().cipher_suites.is_empty())?;
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| TlsError::configuration("context has no server configuration"))?;
        tracing::info!("tls server configuration replaced");
        Ok(server.replace(next))
    }

    /// 当前服务端配置快照。
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.as_ref().map(HotReloadingServerConfig::snapshot)
    }
}

impl TlsContextFactory for RustlsContext {
    fn create_engine(
        &self,
        mode: EngineMode,
        server_name: Option<&str>,
    ) -> Result<Box<dyn RecordEngine>> {
        match mode {
            EngineMode::Server => {
                let config = self.server.clone().ok_or_else(|| {
                    TlsError::configuration("context has no server configuration")
                })?;
                Ok(Box::new(RustlsEngine::server(config)))
            }
            EngineMode::Client => {
                let config = self.client.clone().ok_or_else(|| {
                    TlsError::configuration("context has no client configuration")
                })?;
                let server_name = server_name.ok_or_else(|| {
                    TlsError::configuration("client engines require a server name")
                })?;
                let engine = RustlsEngine::client(config, server_name).map_err(|error| {
                    TlsError::configuration(error.reason().to_owned())
                })?;
                Ok(Box::new(engine))
            }
        }
    }
}

fn validate_suites(empty: bool) -> Result<()> {
    if empty {
        return Err(TlsError::configuration(
            "no cipher suites are enabled for the tls context",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::HandshakeStatus, test_support};

    #[test]
    fn missing_roles_are_configuration_errors() {
        let server_only = RustlsContext::server(test_support::server_config(&[]))
            .expect("服务端配置合法");
        let error = server_only
            .create_engine(EngineMode::Client, Some("localhost"))
            .err()
            .expect("缺少客户端配置");
        assert!(matches!(error, TlsError::ConfigurationInvalid { .. }));

        let client_only =
            RustlsContext::client(test_support::client_config()).expect("客户端配置合法");
        let error = client_only
            .create_engine(EngineMode::Client, None)
            .err()
            .expect("客户端必须提供 server name");
        assert!(matches!(error, TlsError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn replacement_only_affects_new_engines() {
        let context = RustlsContext::server(test_support::server_config(&[]))
            .expect("服务端配置合法");
        let before = context.server_config().expect("已配置服务端");
        let engine = context
            .create_engine(EngineMode::Server, None)
            .expect("服务端引擎");
        assert_eq!(engine.handshake_status(), HandshakeStatus::NeedUnwrap);

        let previous = context
            .replace_server_config(test_support::server_config(&["h2"]))
            .expect("替换应成功");
        assert!(Arc::ptr_eq(&before, &previous));
        let after = context.server_config().expect("已配置服务端");
        assert_eq!(after.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
