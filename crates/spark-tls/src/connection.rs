use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 宿主编号的标记位；自增计数器永远不会到达这一位，两类标识因此互不相等。
const HOST_TAG: u64 = 1 << 63;

/// 连接标识：协议探测快照、ALPN 注册表与日志都以它为键。
///
/// [`ConnectionId::next`] 与 [`ConnectionId::from_raw`] 处在不同的命名空间，
/// 宿主编号与自动分配的编号数值相同也不会指向同一条连接。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// 分配进程内唯一的新标识。
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) & !HOST_TAG)
    }

    /// 使用宿主自己的连接编号（例如监听器分配的序号），只保留低 63 位。
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw | HOST_TAG)
    }

    /// 是否由宿主编号构造。
    pub const fn is_host_assigned(self) -> bool {
        self.0 & HOST_TAG != 0
    }

    /// 去掉命名空间标记后的编号。
    pub const fn as_u64(self) -> u64 {
        self.0 & !HOST_TAG
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host_assigned() {
            write!(f, "host-{}", self.as_u64())
        } else {
            write!(f, "conn-{}", self.as_u64())
        }
    }
}

/// 会话方向：入站会话由本端扮演服务端，出站会话扮演客户端。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        })
    }
}
