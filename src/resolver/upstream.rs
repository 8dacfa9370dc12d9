//! Per-server state: address, open connections, TCP buffers

use std::collections::VecDeque;
use std::net::IpAddr;

use super::buffer::StreamBuffer;
use super::conn::ConnId;

/// One configured upstream name server.
///
/// UDP connections sit at the front of `connections` so the send path can
/// reuse the most recently opened one; the TCP connection, when open, sits
/// at the back and is also reachable directly through `tcp_conn`.
pub(crate) struct Upstream {
    pub addr: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub connections: VecDeque<ConnId>,
    pub tcp_conn: Option<ConnId>,
    /// Unconsumed bytes of the inbound TCP stream, framed lazily.
    pub tcp_parser: StreamBuffer,
    /// Bytes queued for the TCP socket but not yet accepted by it.
    pub tcp_send: StreamBuffer,
    /// Generation stamped when the current TCP connection was opened;
    /// bumped again when it closes.
    pub tcp_generation: u64,
}

impl Upstream {
    pub fn new(addr: IpAddr, udp_port: u16, tcp_port: u16, generation: u64) -> Upstream {
        Upstream {
            addr,
            udp_port,
            tcp_port,
            connections: VecDeque::new(),
            tcp_conn: None,
            tcp_parser: StreamBuffer::new(),
            tcp_send: StreamBuffer::new(),
            tcp_generation: generation,
        }
    }
}
