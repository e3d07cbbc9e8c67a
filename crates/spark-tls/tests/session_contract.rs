//! `session_contract` 集成测试：从 crate 外部验证会话的握手、读写、关闭与 ALPN 契约。
//!
//! # 测试目标（Why）
//! - 读路径的 backlog 语义（`read(n)` 精确交付、`read(0)` 不等待网络）决定了上层协议栈
//!   能否按帧读取；
//! - 关闭可能来自其他线程，必须只释放一次缓冲且不把竞争报告为错误；
//! - 客户端与服务端对协商出的应用协议必须达成一致。

mod support;

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use futures::executor::block_on;
use spark_tls::{
    AlpnCapability, AlpnEnvironment, CloseReason, ConnectionId, HandshakeListener,
    HandshakeSummary, MemoryTransport, TlsChannelConfig, TlsEndpoint, TlsError, engine::record,
};
use support::{alpn_config, endpoint, established_pair, pattern};

/// `read(n)` 恰好交付 `n` 字节，其余明文留在 backlog，`read(0)` 取走 backlog。
#[test]
fn partial_reads_leave_the_rest_in_the_backlog() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (mut client, mut server) = established_pair(&client_endpoint, &server_endpoint);
    let payload = pattern(100);

    block_on(async {
        assert_eq!(server.write_all(&payload).await.expect("写入明文"), 100);

        let mut head = [0u8; 10];
        assert_eq!(client.read_into(&mut head, 10).await.expect("读取前 10 字节"), 10);
        assert_eq!(&head[..], &payload[..10]);
        assert_eq!(client.buffered_plaintext(), 90);

        let mut rest = vec![0u8; 200];
        let read = client.read_into(&mut rest, 0).await.expect("读取 backlog");
        assert_eq!(read, 90);
        assert_eq!(&rest[..read], &payload[10..]);
        assert_eq!(client.buffered_plaintext(), 0);
    });
}

/// 缓冲大于 `n` 时 `read(n)` 仍只交付 `n` 字节，自分配读取同样如此。
#[test]
fn reads_stop_at_the_requested_count_even_with_spare_room() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (mut client, mut server) = established_pair(&client_endpoint, &server_endpoint);
    let payload = pattern(100);

    block_on(async {
        server.write_all(&payload).await.expect("写入明文");

        let mut buf = [0u8; 200];
        assert_eq!(client.read_into(&mut buf, 10).await.expect("读取 10 字节"), 10);
        assert_eq!(&buf[..10], &payload[..10]);
        assert_eq!(client.buffered_plaintext(), 90);

        let segment = client.read_segment(20).await.expect("JIT 读取 20 字节");
        assert_eq!(segment.readable(), &payload[10..30]);
        assert_eq!(client.buffered_plaintext(), 70);
    });
}

/// `read(0)` 不发起网络读：无数据时立即返回 0，握手中的会话也不会被推进。
#[test]
fn zero_byte_reads_never_wait_for_the_network() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());

    let (client_io, _server_io) = MemoryTransport::pair();
    let mut fresh = client_endpoint
        .connect(client_io, "localhost")
        .expect("创建客户端会话");
    let mut buf = [0u8; 32];
    assert_eq!(block_on(fresh.read_into(&mut buf, 0)).expect("read(0)"), 0);
    assert!(!fresh.is_established(), "read(0) 不应驱动握手");

    let (mut client, _server) = established_pair(&client_endpoint, &server_endpoint);
    assert_eq!(block_on(client.read_into(&mut buf, 0)).expect("read(0)"), 0);
}

/// 重复关闭只释放一次缓冲；关闭后的读写按竞争处理，不报告错误。
#[test]
fn closing_twice_releases_buffers_once() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (_client, mut server) = established_pair(&client_endpoint, &server_endpoint);

    assert!(server.close(CloseReason::Requested));
    assert!(!server.close(CloseReason::Requested), "第二次关闭不应再生效");
    assert!(server.is_closed());
    assert_eq!(server.close_reason(), Some(CloseReason::Requested));
    assert_eq!(server_endpoint.pool().statistics().active_leases, 0);

    let mut buf = [0u8; 8];
    assert_eq!(block_on(server.read_into(&mut buf, 1)).expect("关闭后的读"), 0);
    assert_eq!(block_on(server.write_all(b"late")).expect("关闭后的写"), 0);
    assert!(matches!(
        block_on(server.establish()),
        Err(TlsError::SessionClosed)
    ));
}

fn negotiate(
    client: TlsChannelConfig,
    server: TlsChannelConfig,
    alpn: Arc<AlpnCapability>,
) -> (Option<String>, Option<String>) {
    let client_endpoint = TlsEndpoint::builder(support::context())
        .config(client)
        .alpn(alpn.clone())
        .build()
        .expect("客户端端点");
    let server_endpoint = TlsEndpoint::builder(support::context())
        .config(server)
        .alpn(alpn)
        .build()
        .expect("服务端端点");
    let (client, server) = established_pair(&client_endpoint, &server_endpoint);
    (
        client.negotiated_protocol().map(str::to_owned),
        server.negotiated_protocol().map(str::to_owned),
    )
}

#[test]
fn alpn_prefers_h2_then_http11() {
    let server = TlsChannelConfig::default;
    let native = support::native_alpn;

    let (client, server_side) = negotiate(alpn_config(&["h2", "http/1.1"]), server(), native());
    assert_eq!(client.as_deref(), Some("h2"));
    assert_eq!(server_side.as_deref(), Some("h2"));

    let (client, server_side) = negotiate(alpn_config(&["http/1.1"]), server(), native());
    assert_eq!(client.as_deref(), Some("http/1.1"));
    assert_eq!(server_side.as_deref(), Some("http/1.1"));
}

/// 客户端不报价或报价无交集时，服务端退回 `http/1.1` 而不是中止握手。
#[test]
fn alpn_without_a_match_defaults_to_http11() {
    let (client, server) = negotiate(
        alpn_config(&[]),
        TlsChannelConfig::default(),
        support::native_alpn(),
    );
    assert_eq!(client, None, "未启用 ALPN 的客户端不记录协议");
    assert_eq!(server.as_deref(), Some("http/1.1"));

    let (client, server) = negotiate(
        alpn_config(&["spdy/3"]),
        TlsChannelConfig::default(),
        support::native_alpn(),
    );
    assert_eq!(client.as_deref(), Some("http/1.1"));
    assert_eq!(server.as_deref(), Some("http/1.1"));
}

/// 内嵌选择回调策略与原生策略给出相同答案。
#[test]
fn embedded_selector_agrees_with_native_alpn() {
    let selector = Arc::new(AlpnCapability::standard(&AlpnEnvironment::parse(
        Some("native"),
        None,
    )));
    let (client, server) = negotiate(
        alpn_config(&["http/1.1", "h2"]),
        TlsChannelConfig::default(),
        selector.clone(),
    );
    assert_eq!(client.as_deref(), Some("h2"));
    assert_eq!(server.as_deref(), Some("h2"));

    let (_, server) = negotiate(alpn_config(&[]), TlsChannelConfig::default(), selector);
    assert_eq!(server.as_deref(), Some("http/1.1"));
}

#[test]
fn disabled_alpn_negotiates_nothing() {
    let (client, server) = negotiate(
        TlsChannelConfig::default(),
        alpn_config(&[]),
        support::native_alpn(),
    );
    assert_eq!(server, None);
    assert_eq!(client.as_deref(), Some("http/1.1"));
}

/// 写入三个数据包大小的明文需要多次加密/刷出，对端还原出原始数据。
#[test]
fn large_writes_take_multiple_flushes() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (client_io, server_io) = MemoryTransport::pair();
    let stats = client_io.stats();
    let mut client = client_endpoint
        .connect(client_io, "localhost")
        .expect("创建客户端会话");
    let mut server = server_endpoint.accept(server_io).expect("创建服务端会话");

    let payload = pattern(3 * record::PACKET_BUFFER_SIZE);
    let mut received = vec![0u8; payload.len()];
    block_on(async {
        let (client_result, server_result) = futures::join!(client.establish(), server.establish());
        client_result.expect("客户端握手");
        server_result.expect("服务端握手");

        let writes_before = stats.writes();
        let (written, read) = futures::join!(
            client.write_all(&payload),
            server.read_into(&mut received, payload.len())
        );
        assert_eq!(written.expect("写入"), payload.len());
        assert_eq!(read.expect("读取"), payload.len());
        assert!(
            stats.writes() - writes_before >= 3,
            "每条记录产出后都应刷出一次"
        );
    });
    assert_eq!(received, payload);
}

/// 对端消失后的写失败带写操作的错误码，会话随之拆除。
#[test]
fn write_failures_carry_the_write_code() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (client, mut server) = established_pair(&client_endpoint, &server_endpoint);
    drop(client);

    let error = block_on(server.write_all(b"nobody listens")).expect_err("对端已丢弃");
    assert_eq!(error.code(), "spark.tls.write_failed");
    assert!(server.is_closed());
    assert_eq!(server_endpoint.pool().statistics().active_leases, 0);
}

/// 阻塞式握手：两端各自在专用线程上以 `block_on` 驱动同一个状态机。
#[test]
fn blocking_establish_completes_across_threads() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (client_io, server_io) = MemoryTransport::pair();

    let server = thread::spawn(move || {
        let mut session = server_endpoint.accept(server_io).expect("创建服务端会话");
        session.establish_blocking().expect("服务端握手");
        let mut buf = [0u8; 5];
        block_on(session.read_into(&mut buf, 5)).expect("读取");
        (session.negotiated_protocol().map(str::to_owned), buf)
    });

    let mut client = client_endpoint
        .connect(client_io, "localhost")
        .expect("创建客户端会话");
    client.establish_blocking().expect("客户端握手");
    assert!(client.is_established());
    client.establish_blocking().expect("重复握手是空操作");
    block_on(client.write_all(b"hello")).expect("写入");

    let (negotiated, received) = server.join().expect("服务端线程");
    assert_eq!(negotiated.as_deref(), Some("h2"));
    assert_eq!(&received, b"hello");
}

/// 其他线程上的关闭唤醒挂起中的读，读以 `Ok(0)` 结束。
#[test]
fn closer_from_another_thread_ends_a_pending_read() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (client, mut server) = established_pair(&client_endpoint, &server_endpoint);
    let closer = server.closer();

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let read = block_on(server.read_into(&mut buf, 1));
        (read, server)
    });
    thread::sleep(Duration::from_millis(50));
    assert!(closer.close(CloseReason::Requested));
    assert!(!closer.close(CloseReason::Requested));

    let (read, server) = reader.join().expect("读线程");
    assert_eq!(read.expect("关闭竞争不应报告错误"), 0);
    assert!(server.is_closed());
    assert_eq!(server.close_reason(), Some(CloseReason::Requested));
    assert_eq!(server_endpoint.pool().statistics().active_leases, 0);
    drop(client);
}

/// 优雅关闭发送 close_notify，对端读到 EOF。
#[test]
fn graceful_shutdown_is_seen_as_eof() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (mut client, mut server) = established_pair(&client_endpoint, &server_endpoint);

    block_on(async {
        client.write_all(b"bye").await.expect("写入");
        client.shutdown().await.expect("优雅关闭");
        assert_eq!(client.close_reason(), Some(CloseReason::Shutdown));

        let mut buf = [0u8; 16];
        assert_eq!(server.read_into(&mut buf, 3).await.expect("读取"), 3);
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(server.read_into(&mut buf, 1).await.expect("EOF"), 0);
        assert!(server.is_peer_closed());
    });
}

/// JIT 读取：小数据被复制到恰好大小的段，交给调用方。
#[test]
fn self_allocated_reads_are_right_sized() {
    let client_endpoint = endpoint(TlsChannelConfig::default());
    let server_endpoint = endpoint(TlsChannelConfig::default());
    let (mut client, mut server) = established_pair(&client_endpoint, &server_endpoint);

    block_on(async {
        server.write_all(b"ping").await.expect("写入");
        let segment = client.read_segment(4).await.expect("JIT 读取");
        assert_eq!(segment.readable(), b"ping");
        assert!(segment.capacity() < client_endpoint.config().buffers.jit_allocation_size);
    });
}

#[derive(Default)]
struct Recorder {
    completed: Mutex<Vec<HandshakeSummary>>,
    failed: Mutex<Vec<ConnectionId>>,
}

impl HandshakeListener for Recorder {
    fn on_handshake_complete(&self, summary: &HandshakeSummary) {
        self.completed
            .lock()
            .expect("监听器锁")
            .push(summary.clone());
    }

    fn on_handshake_failed(&self, connection: ConnectionId, _error: &TlsError) {
        self.failed.lock().expect("监听器锁").push(connection);
    }
}

/// 监听器收到握手摘要（SNI、ALPN、协议版本）；握手失败同样通知。
#[test]
fn listeners_observe_summaries_and_failures() {
    let recorder = Arc::new(Recorder::default());
    let server_endpoint = TlsEndpoint::builder(support::context())
        .alpn(support::native_alpn())
        .listener(recorder.clone())
        .build()
        .expect("服务端端点");
    let client_endpoint = endpoint(TlsChannelConfig::default());

    let (_client, server) = established_pair(&client_endpoint, &server_endpoint);
    {
        let completed = recorder.completed.lock().expect("监听器锁");
        assert_eq!(completed.len(), 1);
        let summary = &completed[0];
        assert_eq!(summary.connection, server.connection());
        assert_eq!(summary.server_name.as_deref(), Some("localhost"));
        assert_eq!(summary.alpn.as_deref(), Some("h2"));
        assert!(summary.protocol_version.is_some());
        assert!(!summary.repeated);
    }
    assert_eq!(server.summary().map(|s| s.connection), Some(server.connection()));

    let (plain_io, server_io) = MemoryTransport::pair();
    let mut failing = server_endpoint.accept(server_io).expect("创建服务端会话");
    plain_io.inject(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let error = block_on(failing.establish()).expect_err("明文请求不能完成握手");
    assert!(matches!(error, TlsError::HandshakeFailed { .. }));
    assert_eq!(error.code(), "spark.tls.handshake_failed");
    assert!(failing.is_closed());
    assert_eq!(
        recorder.failed.lock().expect("监听器锁").as_slice(),
        &[failing.connection()]
    );
    assert_eq!(server_endpoint.handshake_failures(), 1);
    drop(plain_io);
}

/// 服务端配置热更新只影响此后的握手，已建立的会话继续可用。
#[test]
fn hot_reload_applies_to_new_handshakes() {
    let context = support::context();
    let server_endpoint = TlsEndpoint::builder(context.clone())
        .alpn(support::native_alpn())
        .build()
        .expect("服务端端点");
    let client_endpoint = endpoint(TlsChannelConfig::default());

    let (mut before_client, mut before_server) =
        established_pair(&client_endpoint, &server_endpoint);
    let tls13 = before_server
        .summary()
        .and_then(|summary| summary.protocol_version.clone());
    assert_eq!(tls13.as_deref(), Some("TLSv1_3"));

    let base = support::server_config();
    let tls12_only = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS12])
    .expect("TLS1.2 可用")
    .with_no_client_auth()
    .with_cert_resolver(base.cert_resolver.clone());
    context
        .replace_server_config(Arc::new(tls12_only))
        .expect("替换服务端配置");

    let (_after_client, after_server) = established_pair(&client_endpoint, &server_endpoint);
    assert_eq!(
        after_server
            .summary()
            .and_then(|summary| summary.protocol_version.as_deref()),
        Some("TLSv1_2")
    );

    block_on(async {
        before_client.write_all(b"still").await.expect("旧会话写入");
        let mut buf = [0u8; 5];
        before_server.read_into(&mut buf, 5).await.expect("旧会话读取");
        assert_eq!(&buf, b"still");
    });
}

/// 挂起点可能在另一个工作线程上恢复，会话与关闭句柄必须能跨线程移动。
#[test]
fn sessions_and_closers_cross_threads() {
    fn assert_send<T: Send>() {}
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send::<support::MemorySession>();
    assert_send_sync::<spark_tls::SessionCloser>();
    assert_send_sync::<TlsEndpoint>();
}

/// 端点自建的段池遵循配置的保留上限。
#[test]
fn endpoint_pools_honour_the_retained_limit() {
    let mut config = TlsChannelConfig::default();
    config.buffers.max_retained_bytes = Some(64 * 1024);
    assert_eq!(endpoint(config).pool().retained_limit(), 64 * 1024);
    assert_eq!(
        endpoint(TlsChannelConfig::default()).pool().retained_limit(),
        usize::MAX
    );
}
