//! The resolver channel: configuration, servers, and the query indexes

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use derive_more::{Display, Error, From};

use super::clock;
use super::conn::{ConnId, Connection};
use super::io::{IoProvider, SocketHandle};
use super::qid::QidGenerator;
use super::query::{Query, QueryId};
use super::upstream::Upstream;
use super::wire::{HEADER_SIZE, MAX_EDNS_PAYLOAD, MAX_UDP_SIZE};

#[derive(Debug, Display, From, Error)]
pub enum ChannelError {
    Io(std::io::Error),
    BadOptions,
    ShortQuery,
    QueryTooLong,
}

type Result<T> = std::result::Result<T, ChannelError>;

/// Terminal and per-attempt status codes delivered to query callbacks.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Status {
    Success,
    /// Allocation failed while servicing the query.
    NoMemory,
    /// Every attempt deadline-expired.
    Timeout,
    ServFail,
    NotImp,
    Refused,
    ConnRefused,
    BadFamily,
    BadResponse,
    /// The query was cancelled before completion.
    Cancelled,
    /// The channel was torn down with the query still pending.
    Destruction,
    /// Configuration-collaborator codes, carried for API completeness;
    /// the engine itself never produces them.
    File,
    Eof,
    BadString,
}

bitflags! {
    /// Channel behavior flags.
    pub struct ChannelFlags: u32 {
        /// Always use TCP, starting with the first attempt.
        const USEVC = 0x01;
        /// Only consult the first configured server.
        const PRIMARY = 0x02;
        /// Deliver truncated responses instead of retrying over TCP.
        const IGNTC = 0x04;
        /// Clear the recursion-desired expectation (advisory; the engine
        /// sends caller-provided bytes verbatim).
        const NORECURSE = 0x08;
        /// Keep idle connections open between queries.
        const STAYOPEN = 0x10;
        /// Accept SERVFAIL/NOTIMP/REFUSED responses as answers instead of
        /// skipping to the next server.
        const NOCHECKRESP = 0x20;
        /// The caller's queries carry an EDNS OPT record; enables the
        /// larger UDP payload limit and the FORMERR downgrade path.
        const EDNS = 0x40;
    }
}

impl Default for ChannelFlags {
    fn default() -> ChannelFlags {
        ChannelFlags::empty()
    }
}

/// One upstream server address, with optional per-server port overrides.
#[derive(Clone, Copy, Debug)]
pub struct ServerSpec {
    pub addr: IpAddr,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
}

impl ServerSpec {
    pub fn new(addr: IpAddr) -> ServerSpec {
        ServerSpec {
            addr,
            udp_port: None,
            tcp_port: None,
        }
    }

    pub fn with_ports(addr: IpAddr, udp_port: u16, tcp_port: u16) -> ServerSpec {
        ServerSpec {
            addr,
            udp_port: Some(udp_port),
            tcp_port: Some(tcp_port),
        }
    }
}

impl From<IpAddr> for ServerSpec {
    fn from(addr: IpAddr) -> ServerSpec {
        ServerSpec::new(addr)
    }
}

/// Callback receiving the final outcome of one query: the channel (for
/// re-entrant submission or cancellation), the status, the number of
/// expired attempts, and the raw response bytes on success.
pub type ResponseCallback = Box<dyn FnOnce(&mut Channel, Status, u32, Option<&[u8]>)>;

/// Invoked whenever the channel's interest in a socket changes.
pub type SocketStateCallback = Box<dyn FnMut(SocketHandle, bool, bool)>;

/// Channel construction options.
pub struct ChannelOptions {
    pub flags: ChannelFlags,
    /// Base per-attempt timeout; doubles after each full pass through the
    /// server list.
    pub timeout: Duration,
    /// Attempts per server; total attempts are bounded by
    /// `servers * tries`.
    pub tries: usize,
    /// Search-list threshold, carried for configuration completeness.
    pub ndots: usize,
    /// Round-robin the first server across queries.
    pub rotate: bool,
    /// Default ports for servers without an override.
    pub udp_port: u16,
    pub tcp_port: u16,
    /// Advertised maximum UDP payload when `EDNS` is set. Clamped to
    /// [512, 4096].
    pub edns_payload_size: u16,
    /// Queries a single UDP socket may carry before being retired.
    /// 0 means unlimited.
    pub udp_max_queries: usize,
    pub servers: Vec<ServerSpec>,
    pub socket_state: Option<SocketStateCallback>,
}

impl Default for ChannelOptions {
    fn default() -> ChannelOptions {
        ChannelOptions {
            flags: ChannelFlags::empty(),
            timeout: Duration::from_secs(5),
            tries: 3,
            ndots: 1,
            rotate: false,
            udp_port: 53,
            tcp_port: 53,
            edns_payload_size: super::wire::DEFAULT_EDNS_PAYLOAD,
            udp_max_queries: 0,
            servers: Vec::new(),
            socket_state: None,
        }
    }
}

/// Current multiplexing interest for one socket.
#[derive(Clone, Copy, Debug)]
pub struct SocketInterest {
    pub handle: SocketHandle,
    pub readable: bool,
    pub writable: bool,
}

/// The stub resolver context: configuration, upstream servers, and every
/// query in flight.
///
/// Queries live in an arena keyed by `QueryId`; the transaction-id map,
/// the deadline set, and each connection's in-flight list all refer to
/// queries by that key, so removal on any trigger is a handful of keyed
/// deletes. The channel is single-threaded; the caller drives it with
/// `process`/`process_fd` and readiness it collects elsewhere.
pub struct Channel {
    pub(crate) flags: ChannelFlags,
    pub(crate) timeout: Duration,
    pub(crate) tries: usize,
    ndots: usize,
    pub(crate) rotate: bool,
    pub(crate) udp_max_queries: usize,
    pub(crate) edns_payload: u16,
    pub(crate) servers: Vec<Upstream>,
    pub(crate) queries: HashMap<QueryId, Query>,
    pub(crate) by_qid: HashMap<u16, QueryId>,
    pub(crate) by_deadline: BTreeSet<(Instant, QueryId)>,
    pub(crate) conns: HashMap<ConnId, Connection>,
    pub(crate) by_socket: HashMap<SocketHandle, ConnId>,
    pub(crate) tcp_generation: u64,
    pub(crate) last_server: usize,
    pub(crate) qids: QidGenerator,
    pub(crate) io: Box<dyn IoProvider>,
    pub(crate) socket_state: Option<SocketStateCallback>,
    next_query_id: u64,
    next_conn_id: u64,
}

impl Channel {
    pub fn new(options: ChannelOptions, io: Box<dyn IoProvider>) -> Result<Channel> {
        if options.tries == 0 {
            return Err(ChannelError::BadOptions);
        }

        let default_udp_port = options.udp_port;
        let default_tcp_port = options.tcp_port;
        let mut specs = options.servers;
        if specs.is_empty() {
            specs.push(ServerSpec::new(IpAddr::from([127, 0, 0, 1])));
        }
        if options.flags.contains(ChannelFlags::PRIMARY) {
            specs.truncate(1);
        }

        let edns_payload = options
            .edns_payload_size
            .max(MAX_UDP_SIZE as u16)
            .min(MAX_EDNS_PAYLOAD);

        let mut tcp_generation = 0u64;
        let servers = specs
            .into_iter()
            .map(|spec| {
                tcp_generation += 1;
                Upstream::new(
                    spec.addr,
                    spec.udp_port.unwrap_or(default_udp_port),
                    spec.tcp_port.unwrap_or(default_tcp_port),
                    tcp_generation,
                )
            })
            .collect();

        Ok(Channel {
            flags: options.flags,
            timeout: options.timeout,
            tries: options.tries,
            ndots: options.ndots,
            rotate: options.rotate,
            udp_max_queries: options.udp_max_queries,
            edns_payload,
            servers,
            queries: HashMap::new(),
            by_qid: HashMap::new(),
            by_deadline: BTreeSet::new(),
            conns: HashMap::new(),
            by_socket: HashMap::new(),
            tcp_generation,
            last_server: 0,
            qids: QidGenerator::new(),
            io,
            socket_state: options.socket_state,
            next_query_id: 1,
            next_conn_id: 1,
        })
    }

    /// Submit pre-serialized query bytes.
    ///
    /// The engine copies the buffer, draws a fresh transaction id and
    /// patches it into the copy, then transmits to the first chosen
    /// server. Returns the id drawn. The callback fires exactly once,
    /// possibly from within this call if the query fails immediately.
    pub fn send(&mut self, wire: &[u8], callback: ResponseCallback) -> Result<u16> {
        self.send_at(wire, callback, clock::now())
    }

    /// `send` with an explicit submission instant, for callers that drive
    /// the clock themselves.
    pub fn send_at(&mut self, wire: &[u8], callback: ResponseCallback, now: Instant) -> Result<u16> {
        if wire.len() < HEADER_SIZE {
            return Err(ChannelError::ShortQuery);
        }
        if wire.len() > u16::MAX as usize {
            return Err(ChannelError::QueryTooLong);
        }

        let qid = {
            let by_qid = &self.by_qid;
            self.qids.generate(|id| !by_qid.contains_key(&id))
        };

        let mut image = Vec::with_capacity(wire.len() + 2);
        image.extend_from_slice(&(wire.len() as u16).to_be_bytes());
        image.extend_from_slice(wire);
        image[2] = (qid >> 8) as u8;
        image[3] = (qid & 0xFF) as u8;

        let nservers = self.servers.len();
        let server = if self.rotate {
            let server = self.last_server;
            self.last_server = (self.last_server + 1) % nservers;
            server
        } else {
            0
        };
        let using_tcp = self.flags.contains(ChannelFlags::USEVC);

        let id = QueryId(self.next_query_id);
        self.next_query_id += 1;
        self.queries
            .insert(id, Query::new(qid, image, callback, server, nservers, using_tcp));
        self.by_qid.insert(qid, id);

        log::debug!(
            "submitted query id {:#06x} to server {} ({})",
            qid,
            server,
            if using_tcp { "tcp" } else { "udp" }
        );

        self.send_query(id, now);
        Ok(qid)
    }

    /// End every pending query with `Status::Cancelled`.
    pub fn cancel_all(&mut self) {
        let ids: Vec<QueryId> = self.queries.keys().copied().collect();
        for id in ids {
            if let Some(query) = self.queries.get_mut(&id) {
                query.no_retries = true;
            } else {
                continue;
            }
            self.end_query(id, Status::Cancelled, None);
        }
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in conns {
            self.check_cleanup_connection(conn);
        }
    }

    /// Number of queries still in flight.
    pub fn pending(&self) -> usize {
        self.queries.len()
    }

    pub fn flags(&self) -> ChannelFlags {
        self.flags
    }

    pub fn ndots(&self) -> usize {
        self.ndots
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// The current interest set, for callers multiplexing externally.
    pub fn sockets(&self) -> Vec<SocketInterest> {
        self.conns
            .values()
            .map(|conn| SocketInterest {
                handle: conn.handle,
                readable: true,
                writable: conn.is_tcp && !self.servers[conn.server].tcp_send.is_empty(),
            })
            .collect()
    }

    /// Time until the earliest pending deadline, clamped to `max`.
    /// With no queries pending, `max` is returned unchanged.
    pub fn timeout_hint(&self, now: Instant, max: Option<Duration>) -> Option<Duration> {
        let first = self.by_deadline.iter().next().map(|&(deadline, _)| {
            if deadline <= now {
                Duration::from_millis(0)
            } else {
                deadline - now
            }
        });
        match (first, max) {
            (Some(first), Some(max)) => Some(first.min(max)),
            (Some(first), None) => Some(first),
            (None, max) => max,
        }
    }

    pub(crate) fn alloc_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    pub(crate) fn notify_socket_state(
        &mut self,
        handle: SocketHandle,
        readable: bool,
        writable: bool,
    ) {
        if let Some(callback) = self.socket_state.as_mut() {
            callback(handle, readable, writable);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Callbacks may submit again during teardown; drain until empty.
        while let Some(id) = self.queries.keys().next().copied() {
            if let Some(query) = self.queries.get_mut(&id) {
                query.no_retries = true;
            }
            self.end_query(id, Status::Destruction, None);
        }
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in conns {
            self.close_connection(conn);
        }
    }
}

#[cfg(test)]
impl Channel {
    /// Asserts the cross-index membership rules for every live query and
    /// connection.
    pub(crate) fn check_index_invariants(&self) {
        assert_eq!(self.queries.len(), self.by_qid.len());
        assert_eq!(self.queries.len(), self.by_deadline.len());

        for (&id, query) in &self.queries {
            assert_eq!(self.by_qid.get(&query.qid), Some(&id));
            let key = query.deadline_key.expect("live query without deadline");
            assert!(self.by_deadline.contains(&key));
            if let Some(conn_id) = query.conn {
                let conn = self.conns.get(&conn_id).expect("dangling conn reference");
                assert_eq!(conn.queries.iter().filter(|&&q| q == id).count(), 1);
            }
        }
        for &(_, id) in &self.by_deadline {
            assert!(self.queries.contains_key(&id));
        }
        for (&conn_id, conn) in &self.conns {
            assert_eq!(self.by_socket.get(&conn.handle), Some(&conn_id));
            for id in &conn.queries {
                let query = self.queries.get(id).expect("stale query on connection");
                assert_eq!(query.conn, Some(conn_id));
            }
        }
        assert_eq!(self.by_socket.len(), self.conns.len());
    }
}
