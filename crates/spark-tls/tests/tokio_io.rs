//! `tokio_io` 集成测试：会话经 `TokioTransport` 运行在 tokio 字节流上，
//! 并以 `AsyncRead`/`AsyncWrite` 的身份接入 tokio 生态。
#![cfg(feature = "runtime-tokio")]

mod support;

use std::{io, time::Duration};

use spark_tls::{IoTimeout, TlsChannelConfig, TlsError, transport::TokioTransport};
use support::{endpoint, pattern};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

#[tokio::test]
async fn sessions_implement_tokio_io_traits() -> anyhow::Result<()> {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (client_stream, server_stream) = duplex(64 * 1024);
    let mut client = client_endpoint.connect(TokioTransport::new(client_stream), "localhost")?;
    let mut server = server_endpoint.accept(TokioTransport::new(server_stream))?;

    let (client_result, server_result) = tokio::join!(client.establish(), server.establish());
    client_result?;
    server_result?;
    assert_eq!(client.negotiated_protocol(), Some("h2"));

    let payload = pattern(40_000);
    let writer = async {
        AsyncWriteExt::write_all(&mut client, &payload).await?;
        AsyncWriteExt::flush(&mut client).await?;
        AsyncWriteExt::shutdown(&mut client).await?;
        Ok::<_, io::Error>(())
    };
    let reader = async {
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.map(|_| received)
    };
    let (written, received) = tokio::join!(writer, reader);
    written?;
    assert_eq!(received?, payload);
    assert!(server.is_peer_closed());
    Ok(())
}

/// 读超时原样透传到传输：对端沉默时读以超时失败，会话随之拆除。
#[tokio::test]
async fn read_timeouts_surface_as_transport_errors() {
    let mut config = TlsChannelConfig::default();
    config.io.read_timeout_ms = Some(20);
    let server_endpoint = endpoint(config);
    let (_silent_client, server_stream) = duplex(1024);
    let mut server = server_endpoint
        .accept(TokioTransport::new(server_stream))
        .expect("创建服务端会话");

    let outcome = tokio::time::timeout(Duration::from_secs(5), server.establish())
        .await
        .expect("读超时应先于测试超时触发");
    let error = outcome.expect_err("对端沉默时握手失败");
    assert!(matches!(error, TlsError::HandshakeFailed { .. }));
    assert!(server.is_closed());
    assert_eq!(server_endpoint.pool().statistics().active_leases, 0);
    assert_eq!(
        server_endpoint.config().io.read_timeout(),
        IoTimeout::After(Duration::from_millis(20))
    );
}
