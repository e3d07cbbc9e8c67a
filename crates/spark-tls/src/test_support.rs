//! 单元测试共享夹具：自签名证书、rustls 配置与握手完成的引擎对。

use std::sync::{Arc, OnceLock};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use spark_tls_buffer::Segment;

use crate::engine::{
    EngineStatus, HandshakeStatus, HotReloadingServerConfig, RecordEngine, RustlsEngine, record,
};

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

pub(crate) fn server_config(alpn: &[&str]) -> Arc<ServerConfig> {
    let identity = identity();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(identity.key.clone()));
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .expect("默认协议版本可用")
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert.clone()], key)
        .expect("证书与私钥匹配");
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Arc::new(config)
}

pub(crate) fn hot_server_config() -> HotReloadingServerConfig {
    HotReloadingServerConfig::new(server_config(&[]))
}

pub(crate) fn client_config() -> Arc<ClientConfig> {
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

/// 把 `from` 的全部待发数据交给 `to`，返回是否没有任何数据流动。
fn pump(from: &mut dyn RecordEngine, to: &mut dyn RecordEngine) -> bool {
    let mut wire = Vec::new();
    loop {
        let mut out = Segment::detached(record::PACKET_BUFFER_SIZE);
        let result = from.wrap(&[], &mut out).expect("握手 wrap 不应失败");
        if result.produced == 0 {
            break;
        }
        wire.extend_from_slice(out.readable());
    }
    let mut offset = 0;
    while offset < wire.len() {
        let mut plain = Segment::detached(record::APPLICATION_BUFFER_SIZE);
        let result = to
            .unwrap(&wire[offset..], &mut plain)
            .expect("握手 unwrap 不应失败");
        assert_ne!(result.status, EngineStatus::BufferUnderflow, "记录应完整");
        if result.consumed == 0 {
            break;
        }
        offset += result.consumed;
    }
    wire.is_empty()
}

/// 在内存中直接驱动两个引擎完成握手。
pub(crate) fn handshaken_engine_pair() -> (RustlsEngine, RustlsEngine) {
    let mut client = RustlsEngine::client(client_config(), "localhost").expect("合法的 SNI");
    let mut server = RustlsEngine::server(hot_server_config());
    for _ in 0..16 {
        let client_idle = pump(&mut client, &mut server);
        let server_idle = pump(&mut server, &mut client);
        if client_idle
            && server_idle
            && client.handshake_status() == HandshakeStatus::NotHandshaking
            && server.handshake_status() == HandshakeStatus::NotHandshaking
        {
            return (client, server);
        }
    }
    panic!("握手未能在 16 轮内完成");
}
