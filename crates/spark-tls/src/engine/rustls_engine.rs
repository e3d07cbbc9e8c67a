use std::{
    io::{self, Read, Write},
    mem,
    sync::Arc,
    time::Duration,
};

use rustls::{
    AlertDescription, ClientConfig, ClientConnection, Connection, Error as RustlsError,
    pki_types::ServerName,
    server::{Accepted, Acceptor},
};
use spark_tls_buffer::Segment;

use super::{
    EngineError, EngineErrorKind, EngineMode, EngineResult, EngineStatus, HandshakeStatus,
    ProtocolSelector, RecordEngine, hot_reload::HotReloadingServerConfig,
    record::{self, MAX_PLAINTEXT_LEN, RecordCheck},
};
use crate::error::{ErrorCategory, SecurityClass, retryable};

/// 基于 `rustls` 的记录层引擎。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls` 提供的是“喂密文、取明文、取待发数据”的连接模型，会话编排层需要的却是
///   “每次 wrap/unwrap 一条记录并报告握手状态”的引擎模型；本类型负责二者之间的换算。
///
/// ## 逻辑（How）
/// - **客户端**：连接在第一次 `wrap` 时才创建，使 ALPN 报价可以在握手开始前设置；
/// - **服务端**：先用 [`Acceptor`] 读取 ClientHello，此刻读取热更配置快照并执行 ALPN
///   选择回调，再转换为 `ServerConnection`；
/// - `unwrap` 先做记录头预检：非法记录头即解码失败，不完整记录即下溢，
///   完整记录则恰好喂给 `rustls` 一条；
/// - 握手状态换算：有待发数据为 `NeedWrap`，仍在握手为 `NeedUnwrap`，
///   首次观察到握手结束时报告一次 `Finished`。
///
/// ## 契约（What）
/// - `wrap` 要求目标段至少有 [`record::PACKET_BUFFER_SIZE`] 剩余空间，否则报告溢出；
/// - `unwrap` 要求目标段至少能容纳该记录可能解出的明文，否则报告溢出且不消费任何字节；
/// - 任何协议错误之后引擎进入失败状态，后续调用返回 [`EngineErrorKind::Failed`]。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls` 不暴露委派任务，证书校验在 `unwrap` 内同步完成，
///   因此本引擎从不报告 `NeedTask`。
pub struct RustlsEngine {
    state: EngineState,
    mode: EngineMode,
    protocols: Option<Vec<Vec<u8>>>,
    selector: Option<Arc<dyn ProtocolSelector>>,
    server_name: Option<String>,
    finished_reported: bool,
    inbound_closed: bool,
    outbound_closed: bool,
    peer_closed: bool,
}

enum EngineState {
    ClientIdle {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    ServerAccepting {
        config: HotReloadingServerConfig,
        acceptor: Box<Acceptor>,
    },
    Active(Box<Connection>),
    Failed,
}

impl RustlsEngine {
    /// 客户端引擎。`server_name` 同时用于 SNI 与证书校验。
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, EngineError> {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|error| {
            EngineError::new(
                EngineErrorKind::Protocol,
                ErrorCategory::Configuration,
                format!("invalid server name `{server_name}`: {error}"),
            )
        })?;
        Ok(Self::with_state(
            EngineMode::Client,
            EngineState::ClientIdle {
                config,
                server_name: name,
            },
            Some(server_name.to_owned()),
        ))
    }

    /// 服务端引擎。配置在收到 ClientHello 时才从热更容器读取。
    pub fn server(config: HotReloadingServerConfig) -> Self {
        Self::with_state(
            EngineMode::Server,
            EngineState::ServerAccepting {
                config,
                acceptor: Box::default(),
            },
            None,
        )
    }

    fn with_state(mode: EngineMode, state: EngineState, server_name: Option<String>) -> Self {
        Self {
            state,
            mode,
            protocols: None,
            selector: None,
            server_name,
            finished_reported: false,
            inbound_closed: false,
            outbound_closed: false,
            peer_closed: false,
        }
    }

    fn activate_client(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::ClientIdle { .. }) {
            return Ok(());
        }
        let EngineState::ClientIdle {
            config,
            server_name,
        } = mem::replace(&mut self.state, EngineState::Failed)
        else {
            return Ok(());
        };
        let config = match &self.protocols {
            Some(protocols) => {
                let mut with_alpn = (*config).clone();
                with_alpn.alpn_protocols = protocols.clone();
                Arc::new(with_alpn)
            }
            None => config,
        };
        let connection = ClientConnection::new(config, server_name).map_err(map_rustls_error)?;
        self.state = EngineState::Active(Box::new(Connection::Client(connection)));
        Ok(())
    }

    fn accept_record(&mut self, record: &[u8]) -> Result<EngineResult, EngineError> {
        let EngineState::ServerAccepting { config, acceptor } = &mut self.state else {
            return Err(EngineError::failed());
        };
        let mut reader = record;
        if let Err(error) = acceptor.read_tls(&mut reader) {
            self.state = EngineState::Failed;
            return Err(EngineError::decode(error.to_string()));
        }
        let accepted = match acceptor.accept() {
            Ok(None) => {
                return Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::NeedUnwrap,
                    record.len(),
                    0,
                ));
            }
            Ok(Some(accepted)) => accepted,
            Err((error, _alert)) => {
                self.state = EngineState::Failed;
                return Err(map_rustls_error(error));
            }
        };
        let snapshot = config.snapshot();
        match self.start_server(accepted, snapshot) {
            Ok(connection) => {
                self.state = EngineState::Active(Box::new(Connection::Server(connection)));
                let handshake = self.observe_handshake();
                Ok(EngineResult::new(EngineStatus::Ok, handshake, record.len(), 0))
            }
            Err(error) => {
                self.state = EngineState::Failed;
                Err(error)
            }
        }
    }

    fn start_server(
        &mut self,
        accepted: Accepted,
        snapshot: Arc<rustls::ServerConfig>,
    ) -> Result<rustls::ServerConnection, EngineError> {
        let hello = accepted.client_hello();
        self.server_name = hello.server_name().map(str::to_owned);
        let offered: Vec<Vec<u8>> = hello
            .alpn()
            .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
            .unwrap_or_default();

        let alpn = if let Some(selector) = &self.selector {
            let offered_refs: Vec<&[u8]> = offered.iter().map(Vec::as_slice).collect();
            Some(match selector.select(&offered_refs) {
                Some(chosen) if offered.contains(&chosen) => vec![chosen],
                _ => Vec::new(),
            })
        } else {
            // 只保留客户端报价过的协议：无交集时不协商，而不是以 no_application_protocol 中止。
            self.protocols.as_ref().map(|preference| {
                preference
                    .iter()
                    .filter(|protocol| offered.contains(protocol))
                    .cloned()
                    .collect()
            })
        };

        let config = match alpn {
            Some(protocols) => {
                let mut adjusted = (*snapshot).clone();
                adjusted.alpn_protocols = protocols;
                Arc::new(adjusted)
            }
            None => snapshot,
        };
        accepted
            .into_connection(config)
            .map_err(|(error, _alert)| map_rustls_error(error))
    }

    /// 把下一批待发送的 TLS 数据写入 `dst`，返回写入字节数。
    fn write_tls_into(connection: &mut Connection, dst: &mut Segment) -> Result<usize, EngineError> {
        let mut produced = 0;
        while connection.wants_write() && dst.spare_capacity() > 0 {
            let written = {
                let mut out = dst.spare_mut();
                connection
                    .write_tls(&mut out)
                    .map_err(|error| io_failure("write_tls", &error))?
            };
            if written == 0 {
                break;
            }
            dst.commit(written);
            produced += written;
        }
        Ok(produced)
    }

    /// 把已解密但尚未取走的明文写入 `dst`。
    fn drain_plaintext(connection: &mut Connection, dst: &mut Segment) -> Result<usize, EngineError> {
        let mut produced = 0;
        while dst.spare_capacity() > 0 {
            let read = {
                let out = dst.spare_mut();
                match connection.reader().read(out) {
                    Ok(read) => read,
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(error) => return Err(io_failure("read plaintext", &error)),
                }
            };
            if read == 0 {
                break;
            }
            dst.commit(read);
            produced += read;
        }
        Ok(produced)
    }

    /// 换算握手状态；首次观察到握手结束时报告 `Finished` 并记下已报告。
    fn observe_handshake(&mut self) -> HandshakeStatus {
        let status = self.handshake_status();
        if status == HandshakeStatus::NotHandshaking
            && matches!(self.state, EngineState::Active(_))
            && !self.finished_reported
        {
            self.finished_reported = true;
            return HandshakeStatus::Finished;
        }
        status
    }

    fn connection(&self) -> Option<&Connection> {
        match &self.state {
            EngineState::Active(connection) => Some(connection),
            _ => None,
        }
    }
}

impl RecordEngine for RustlsEngine {
    fn mode(&self) -> EngineMode {
        self.mode
    }

    fn wrap(&mut self, src: &[u8], dst: &mut Segment) -> Result<EngineResult, EngineError> {
        if dst.spare_capacity() < self.packet_buffer_size() {
            return Ok(EngineResult::idle(
                EngineStatus::BufferOverflow,
                self.handshake_status(),
            ));
        }
        self.activate_client()?;

        let outbound_closed = self.outbound_closed;
        let connection = match &mut self.state {
            EngineState::Active(connection) => connection,
            EngineState::ServerAccepting { .. } => {
                let status = if outbound_closed {
                    EngineStatus::Closed
                } else {
                    EngineStatus::Ok
                };
                return Ok(EngineResult::idle(status, HandshakeStatus::NeedUnwrap));
            }
            EngineState::ClientIdle { .. } | EngineState::Failed => {
                return Err(EngineError::failed());
            }
        };

        let mut consumed = 0;
        if !outbound_closed
            && !src.is_empty()
            && !connection.wants_write()
            && !connection.is_handshaking()
        {
            let take = src.len().min(MAX_PLAINTEXT_LEN);
            consumed = connection
                .writer()
                .write(&src[..take])
                .map_err(|error| io_failure("encrypt", &error))?;
        }
        let produced = Self::write_tls_into(connection, dst)?;

        let status = if outbound_closed && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        let handshake = self.observe_handshake();
        Ok(EngineResult::new(status, handshake, consumed, produced))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut Segment) -> Result<EngineResult, EngineError> {
        if let EngineState::Active(connection) = &mut self.state {
            let pending = Self::drain_plaintext(connection, dst)?;
            if pending > 0 {
                let handshake = self.observe_handshake();
                return Ok(EngineResult::new(EngineStatus::Ok, handshake, 0, pending));
            }
        }
        if self.inbound_closed || self.peer_closed {
            return Ok(EngineResult::idle(
                EngineStatus::Closed,
                self.handshake_status(),
            ));
        }

        let (len, payload) = match record::inspect(src) {
            Err(error) => {
                self.state = EngineState::Failed;
                return Err(EngineError::decode(error.to_string()));
            }
            Ok(RecordCheck::Incomplete { .. }) => {
                return Ok(EngineResult::idle(
                    EngineStatus::BufferUnderflow,
                    self.handshake_status(),
                ));
            }
            Ok(RecordCheck::Complete { len, payload }) => (len, payload),
        };
        if dst.spare_capacity() < payload.min(MAX_PLAINTEXT_LEN) {
            return Ok(EngineResult::idle(
                EngineStatus::BufferOverflow,
                self.handshake_status(),
            ));
        }

        let record = &src[..len];
        if matches!(self.state, EngineState::ServerAccepting { .. }) {
            return self.accept_record(record);
        }
        self.activate_client()?;
        let EngineState::Active(connection) = &mut self.state else {
            return Err(EngineError::failed());
        };

        let mut reader = record;
        connection
            .read_tls(&mut reader)
            .map_err(|error| io_failure("read_tls", &error))?;
        let io_state = match connection.process_new_packets() {
            Ok(io_state) => io_state,
            Err(error) => {
                self.state = EngineState::Failed;
                return Err(map_rustls_error(error));
            }
        };
        let produced = Self::drain_plaintext(connection, dst)?;
        if io_state.peer_has_closed() {
            self.peer_closed = true;
        }

        let status = if self.peer_closed && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        let handshake = self.observe_handshake();
        Ok(EngineResult::new(status, handshake, len, produced))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match &self.state {
            EngineState::ClientIdle { .. } => HandshakeStatus::NeedWrap,
            EngineState::ServerAccepting { .. } => HandshakeStatus::NeedUnwrap,
            EngineState::Failed => HandshakeStatus::NotHandshaking,
            EngineState::Active(connection) => {
                if connection.wants_write() {
                    HandshakeStatus::NeedWrap
                } else if connection.is_handshaking() {
                    HandshakeStatus::NeedUnwrap
                } else {
                    HandshakeStatus::NotHandshaking
                }
            }
        }
    }

    fn close_inbound(&mut self) {
        self.inbound_closed = true;
    }

    fn close_outbound(&mut self) {
        if self.outbound_closed {
            return;
        }
        self.outbound_closed = true;
        if let EngineState::Active(connection) = &mut self.state {
            connection.send_close_notify();
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_closed || self.peer_closed || matches!(self.state, EngineState::Failed)
    }

    fn is_outbound_done(&self) -> bool {
        match &self.state {
            EngineState::Active(connection) => self.outbound_closed && !connection.wants_write(),
            EngineState::Failed => true,
            _ => self.outbound_closed,
        }
    }

    fn set_application_protocols(&mut self, protocols: &[String]) {
        self.protocols = Some(protocols.iter().map(|p| p.as_bytes().to_vec()).collect());
    }

    fn set_protocol_selector(&mut self, selector: Arc<dyn ProtocolSelector>) -> bool {
        if self.mode != EngineMode::Server
            || !matches!(self.state, EngineState::ServerAccepting { .. })
        {
            return false;
        }
        self.selector = Some(selector);
        true
    }

    fn negotiated_protocol(&self) -> Option<String> {
        self.connection()
            .and_then(|connection| connection.alpn_protocol())
            .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
    }

    fn protocol_version(&self) -> Option<String> {
        self.connection()
            .and_then(|connection| connection.protocol_version())
            .map(|version| format!("{version:?}"))
    }

    fn cipher_suite(&self) -> Option<String> {
        self.connection()
            .and_then(|connection| connection.negotiated_cipher_suite())
            .map(|suite| format!("{:?}", suite.suite()))
    }

    fn server_name(&self) -> Option<String> {
        self.server_name.clone()
    }
}

fn io_failure(operation: &'static str, error: &io::Error) -> EngineError {
    EngineError::new(
        EngineErrorKind::Protocol,
        retryable(Duration::from_millis(25)),
        format!("{operation}: {error}"),
    )
}

fn map_rustls_error(error: RustlsError) -> EngineError {
    use RustlsError::*;
    let kind = match &error {
        InvalidMessage(_)
        | InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | PeerSentOversizedRecord => EngineErrorKind::Decode,
        _ => EngineErrorKind::Protocol,
    };
    EngineError::new(kind, categorize_rustls_error(&error), error.to_string())
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => ErrorCategory::Security(SecurityClass::Authentication),
        PeerIncompatible(_) | HandshakeNotComplete | General(_) | Other(_) => {
            retryable(Duration::from_millis(80))
        }
        FailedToGetCurrentTime
        | FailedToGetRandomBytes
        | BadMaxFragmentSize
        | InconsistentKeys(_) => ErrorCategory::ResourceExhausted,
        AlertReceived(alert) => alert_to_category(alert),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        _ => retryable(Duration::from_millis(60)),
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        CloseNotify | UserCanceled | NoRenegotiation => retryable(Duration::from_millis(30)),
        DecodeError
        | DecryptError
        | DecryptionFailed
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | InternalError
        | InappropriateFallback
        | MissingExtension
        | UnsupportedExtension
        | UnrecognisedName
        | NoApplicationProtocol
        | ProtocolVersion => ErrorCategory::Security(SecurityClass::Integrity),
        DecompressionFailure => ErrorCategory::ResourceExhausted,
        _ => retryable(Duration::from_millis(40)),
    }
}
