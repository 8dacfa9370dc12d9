//! The in-flight query record

use std::time::Instant;

use super::channel::{ResponseCallback, Status};
use super::conn::ConnId;
use super::wire::{EDNS_FIXED_SIZE, HEADER_SIZE};

/// Channel-scoped key identifying one query in the query arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub(crate) struct QueryId(pub u64);

/// What a query remembers about one upstream server.
#[derive(Clone, Copy, Default)]
pub(crate) struct ServerAttempt {
    /// The server refused or failed this query; don't retry it here.
    pub skipped: bool,
    /// TCP generation of the server at the time the query was last sent
    /// to it over TCP. Matching the server's current generation means a
    /// resend would hit the very same connection incarnation.
    pub tcp_generation: u64,
}

/// One submitted query, tracked until its callback fires.
///
/// The wire bytes are kept in TCP form (2-byte length prefix + message);
/// the UDP view is the same allocation minus the prefix. The record holds
/// its own key into the deadline index so removal is a direct keyed
/// delete.
pub(crate) struct Query {
    /// Transaction id, host byte order. Fixed for the query's lifetime.
    pub qid: u16,
    pub tcp_image: Vec<u8>,
    pub callback: Option<ResponseCallback>,
    /// Attempts so far, bounded by `nservers * tries`.
    pub try_count: usize,
    /// Index of the server the latest attempt targets.
    pub server: usize,
    pub server_info: Vec<ServerAttempt>,
    pub using_tcp: bool,
    /// Last non-success condition observed; reported if all servers fail.
    pub error_status: Status,
    /// Expired attempts, reported to the callback.
    pub timeouts: u32,
    /// Declines further attempts in the retry loop.
    pub no_retries: bool,
    /// Connection of the pending attempt, for validation and cleanup only.
    pub conn: Option<ConnId>,
    pub deadline_key: Option<(Instant, QueryId)>,
}

impl Query {
    pub fn new(
        qid: u16,
        tcp_image: Vec<u8>,
        callback: ResponseCallback,
        server: usize,
        nservers: usize,
        using_tcp: bool,
    ) -> Query {
        Query {
            qid,
            tcp_image,
            callback: Some(callback),
            try_count: 0,
            server,
            server_info: vec![ServerAttempt::default(); nservers],
            using_tcp,
            error_status: Status::ConnRefused,
            timeouts: 0,
            no_retries: false,
            conn: None,
            deadline_key: None,
        }
    }

    /// The message without the TCP length prefix, as sent over UDP.
    pub fn udp_bytes(&self) -> &[u8] {
        &self.tcp_image[2..]
    }

    /// Remove the trailing OPT pseudo-record from the wire image: shrink
    /// by the fixed OPT size, rewrite the length prefix, zero ARCOUNT.
    /// No-op unless the message actually advertises an additional record.
    pub fn strip_edns(&mut self) {
        let min = 2 + HEADER_SIZE + EDNS_FIXED_SIZE;
        if self.tcp_image.len() < min {
            return;
        }
        if self.tcp_image[12] == 0 && self.tcp_image[13] == 0 {
            return;
        }
        let new_len = self.tcp_image.len() - EDNS_FIXED_SIZE;
        self.tcp_image.truncate(new_len);
        let wire_len = (new_len - 2) as u16;
        self.tcp_image[0..2].copy_from_slice(&wire_len.to_be_bytes());
        self.tcp_image[12] = 0;
        self.tcp_image[13] = 0;
    }
}
