//! One socket bound to one upstream server

use super::io::SocketHandle;
use super::query::QueryId;

/// Channel-scoped key identifying one connection in the connection arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ConnId(pub u64);

/// A single open UDP or TCP socket to one upstream, carrying the queries
/// whose latest attempt went out on it.
pub(crate) struct Connection {
    /// Index of the owning upstream in the channel's server list.
    pub server: usize,
    pub handle: SocketHandle,
    pub is_tcp: bool,
    /// Queries ever assigned to this connection, reused or not. Caps UDP
    /// socket reuse when `udp_max_queries` is configured.
    pub total_queries: usize,
    /// Queries with an unanswered attempt in flight on this socket.
    pub queries: Vec<QueryId>,
}

impl Connection {
    pub fn new(server: usize, handle: SocketHandle, is_tcp: bool) -> Connection {
        Connection {
            server,
            handle,
            is_tcp,
            total_queries: 0,
            queries: Vec::new(),
        }
    }

    /// Drop `id` from the in-flight list if present.
    pub fn detach(&mut self, id: QueryId) {
        if let Some(pos) = self.queries.iter().position(|&q| q == id) {
            self.queries.swap_remove(pos);
        }
    }
}
