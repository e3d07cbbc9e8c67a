//! 集成测试共享夹具：自签名身份、端点构造与基于内存传输的会话对。
#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use rustls::{ClientConfig, RootCertStore, ServerConfig, crypto::CryptoProvider};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_tls::{
    AlpnCapability, AlpnEnvironment, MemoryTransport, RecordEngine, RustlsContext, RustlsEngine,
    TlsChannelConfig, TlsEndpoint, TlsSession, buffer::Segment, engine::record,
};

pub type MemorySession = TlsSession<MemoryTransport>;

struct Identity {
    cert: CertificateDer<'static>,
    key: Vec<u8>,
}

fn identity() -> &'static Identity {
    static IDENTITY: OnceLock<Identity> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
                .expect("自签名证书生成不应失败");
        Identity {
            cert: cert.der().clone(),
            key: key_pair.serialize_der(),
        }
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_config() -> Arc<ServerConfig> {
    let identity = identity();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key.clone()));
    Arc::new(
        ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .expect("默认协议版本可用")
            .with_no_client_auth()
            .with_single_cert(vec![identity.cert.clone()], key)
            .expect("证书与私钥匹配"),
    )
}

pub fn client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(identity().cert.clone())
        .expect("自签名证书可作为信任根");
    Arc::new(
        ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .expect("默认协议版本可用")
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

pub fn context() -> Arc<RustlsContext> {
    Arc::new(
        RustlsContext::server(server_config())
            .and_then(|context| context.with_client(client_config()))
            .expect("双角色上下文"),
    )
}

/// 固定使用默认探测环境，避免受进程环境变量影响。
pub fn native_alpn() -> Arc<AlpnCapability> {
    Arc::new(AlpnCapability::standard(&AlpnEnvironment::default()))
}

pub fn endpoint(config: TlsChannelConfig) -> TlsEndpoint {
    TlsEndpoint::builder(context())
        .config(config)
        .alpn(native_alpn())
        .build()
        .expect("端点配置合法")
}

pub fn alpn_config(protocols: &[&str]) -> TlsChannelConfig {
    let mut config = TlsChannelConfig::default();
    config.alpn.enabled = !protocols.is_empty();
    config.alpn.protocols = protocols.iter().map(|p| (*p).to_owned()).collect();
    config
}

/// 以两个独立端点（各自的段池）建立已完成握手的会话对：`(client, server)`。
pub fn established_pair(
    client_endpoint: &TlsEndpoint,
    server_endpoint: &TlsEndpoint,
) -> (MemorySession, MemorySession) {
    let (client_io, server_io) = MemoryTransport::pair();
    let mut client = client_endpoint
        .connect(client_io, "localhost")
        .expect("创建客户端会话");
    let mut server = server_endpoint.accept(server_io).expect("创建服务端会话");
    let (client_result, server_result) =
        futures::executor::block_on(async { futures::join!(client.establish(), server.establish()) });
    client_result.expect("客户端握手");
    server_result.expect("服务端握手");
    (client, server)
}

/// 一条真实客户端引擎产出的 ClientHello 记录。
pub fn client_hello() -> Vec<u8> {
    let mut client = RustlsEngine::client(client_config(), "localhost").expect("合法的 SNI");
    let mut out = Segment::detached(record::PACKET_BUFFER_SIZE);
    client.wrap(&[], &mut out).expect("ClientHello 应能生成");
    out.to_vec()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
