//! The query lifecycle engine: send, receive, timeout, and retry paths
//!
//! Everything here runs to completion inside one of the two step entry
//! points. Within a step the order is fixed: queued TCP writes first, then
//! reads (framed TCP answers and queued UDP datagrams), then expired
//! deadlines. Query callbacks fire synchronously and may submit or cancel
//! queries; the arena-keyed indexes make those re-entrant mutations safe.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::channel::{Channel, ChannelFlags, Status};
use super::clock;
use super::conn::{ConnId, Connection};
use super::io::{Family, SocketHandle, Transport};
use super::query::QueryId;
use super::wire::{self, MessageView, Rcode, MAX_EDNS_PAYLOAD, MAX_UDP_SIZE};

fn open_status(err: &std::io::Error) -> Status {
    match err.kind() {
        ErrorKind::OutOfMemory => Status::NoMemory,
        ErrorKind::Unsupported | ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
            Status::BadFamily
        }
        _ => Status::ConnRefused,
    }
}

impl Channel {
    /// Drive the channel with readiness collected externally.
    ///
    /// Drains every queued TCP write whose socket is writable, every
    /// complete TCP frame and queued UDP datagram on readable sockets,
    /// then every deadline at or before `now`.
    pub fn process(
        &mut self,
        read_ready: &[SocketHandle],
        write_ready: &[SocketHandle],
        now: Instant,
    ) {
        self.write_tcp_data(write_ready, now);
        for &handle in read_ready {
            let conn_id = match self.by_socket.get(&handle) {
                Some(&conn_id) => conn_id,
                None => continue,
            };
            let is_tcp = match self.conns.get(&conn_id) {
                Some(conn) => conn.is_tcp,
                None => continue,
            };
            if is_tcp {
                self.read_tcp_data(handle, now);
            } else {
                self.read_udp_packets(handle, now);
            }
        }
        self.process_timeouts(now);
    }

    /// Single-socket variant of [`process`](Channel::process) for callers
    /// without a readiness set.
    pub fn process_fd(
        &mut self,
        read_fd: Option<SocketHandle>,
        write_fd: Option<SocketHandle>,
        now: Instant,
    ) {
        let read: Vec<SocketHandle> = read_fd.into_iter().collect();
        let write: Vec<SocketHandle> = write_fd.into_iter().collect();
        self.process(&read, &write, now);
    }

    /// Transmit one attempt of a query to its current server.
    ///
    /// The query's serialized bytes and `server` index are already set;
    /// this picks or opens the connection, hands the bytes to the socket
    /// (or the TCP send queue), computes the attempt deadline, and rebinds
    /// the query's index memberships. A query that cannot make any
    /// further progress is ended here.
    pub(crate) fn send_query(&mut self, id: QueryId, now: Instant) {
        let (server_idx, using_tcp, try_count) = match self.queries.get(&id) {
            Some(query) => (query.server, query.using_tcp, query.try_count),
            None => return,
        };

        let conn_id = if using_tcp {
            let conn_id = match self.servers[server_idx].tcp_conn {
                Some(conn_id) => conn_id,
                None => match self.open_tcp_connection(server_idx) {
                    Ok(conn_id) => conn_id,
                    Err(status) => return self.handle_open_failure(id, server_idx, status, now),
                },
            };

            let was_empty = self.servers[server_idx].tcp_send.is_empty();
            {
                let query = match self.queries.get(&id) {
                    Some(query) => query,
                    None => return,
                };
                self.servers[server_idx].tcp_send.append(&query.tcp_image);
            }
            let generation = self.servers[server_idx].tcp_generation;
            if let Some(query) = self.queries.get_mut(&id) {
                query.server_info[server_idx].tcp_generation = generation;
            }
            if was_empty {
                let handle = match self.conns.get(&conn_id) {
                    Some(conn) => conn.handle,
                    None => return,
                };
                self.notify_socket_state(handle, true, true);
            }
            conn_id
        } else {
            let mut reuse = None;
            if let Some(&front) = self.servers[server_idx].connections.front() {
                if let Some(conn) = self.conns.get(&front) {
                    let capped =
                        self.udp_max_queries > 0 && conn.total_queries >= self.udp_max_queries;
                    if !conn.is_tcp && !capped {
                        reuse = Some(front);
                    }
                }
            }
            let conn_id = match reuse {
                Some(conn_id) => conn_id,
                None => match self.open_udp_connection(server_idx) {
                    Ok(conn_id) => conn_id,
                    Err(status) => return self.handle_open_failure(id, server_idx, status, now),
                },
            };

            let handle = match self.conns.get(&conn_id) {
                Some(conn) => conn.handle,
                None => return,
            };
            let result = {
                let query = match self.queries.get(&id) {
                    Some(query) => query,
                    None => return,
                };
                self.io.send(handle, query.udp_bytes())
            };
            if let Err(err) = result {
                log::warn!("udp send to server {} failed: {}", server_idx, err);
                self.skip_server(id, server_idx);
                return self.next_server(id, now);
            }
            conn_id
        };

        let timeplus = clock::backoff_timeout(self.timeout, try_count, self.servers.len());
        let deadline = now
            .checked_add(timeplus)
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
        if let Some(query) = self.queries.get_mut(&id) {
            if let Some(old) = query.deadline_key.take() {
                self.by_deadline.remove(&old);
            }
            let key = (deadline, id);
            self.by_deadline.insert(key);
            query.deadline_key = Some(key);
        }

        self.detach_connection(id);
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.queries.push(id);
            conn.total_queries += 1;
        }
        if let Some(query) = self.queries.get_mut(&id) {
            query.conn = Some(conn_id);
        }
    }

    /// Flush pending TCP send queues for writable sockets.
    fn write_tcp_data(&mut self, write_ready: &[SocketHandle], now: Instant) {
        for &handle in write_ready {
            let conn_id = match self.by_socket.get(&handle) {
                Some(&conn_id) => conn_id,
                None => continue,
            };
            let server_idx = match self.conns.get(&conn_id) {
                Some(conn) if conn.is_tcp => conn.server,
                _ => continue,
            };
            if self.servers[server_idx].tcp_send.is_empty() {
                continue;
            }

            let result = {
                let upstream = &self.servers[server_idx];
                self.io.send(handle, upstream.tcp_send.pending())
            };
            match result {
                Ok(n) => {
                    let upstream = &mut self.servers[server_idx];
                    upstream.tcp_send.consume(n);
                    let drained = upstream.tcp_send.is_empty();
                    if drained {
                        self.notify_socket_state(handle, true, false);
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    log::debug!("tcp write to server {} failed: {}", server_idx, err);
                    self.handle_error(conn_id, now);
                }
            }
        }
    }

    /// Pull bytes off a readable TCP socket and dispatch every complete
    /// length-prefixed frame.
    fn read_tcp_data(&mut self, handle: SocketHandle, now: Instant) {
        let conn_id = match self.by_socket.get(&handle) {
            Some(&conn_id) => conn_id,
            None => return,
        };
        let server_idx = match self.conns.get(&conn_id) {
            Some(conn) => conn.server,
            None => return,
        };

        let mut chunk = vec![0u8; 65535];
        loop {
            match self.io.recv(handle, &mut chunk) {
                Ok(0) => {
                    log::debug!("server {} closed the tcp connection", server_idx);
                    self.handle_error(conn_id, now);
                    return;
                }
                Ok(n) => self.servers[server_idx].tcp_parser.append(&chunk[..n]),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("tcp read from server {} failed: {}", server_idx, err);
                    self.handle_error(conn_id, now);
                    return;
                }
            }
        }

        loop {
            // An answer may have closed this connection; stop framing then.
            if self.by_socket.get(&handle) != Some(&conn_id) {
                return;
            }
            let frame = {
                let parser = &mut self.servers[server_idx].tcp_parser;
                parser.tag();
                let len = match parser.read_u16() {
                    Some(len) => len as usize,
                    None => {
                        parser.rollback();
                        break;
                    }
                };
                match parser.read_bytes(len) {
                    Some(bytes) => {
                        let frame = bytes.to_vec();
                        parser.commit();
                        frame
                    }
                    None => {
                        parser.rollback();
                        break;
                    }
                }
            };
            self.process_answer(&frame, conn_id, true, now);
        }
    }

    /// Drain queued datagrams from a readable UDP socket.
    fn read_udp_packets(&mut self, handle: SocketHandle, now: Instant) {
        let conn_id = match self.by_socket.get(&handle) {
            Some(&conn_id) => conn_id,
            None => return,
        };
        let server_idx = match self.conns.get(&conn_id) {
            Some(conn) => conn.server,
            None => return,
        };

        let mut datagram = [0u8; MAX_EDNS_PAYLOAD as usize + 1];
        loop {
            // An answer may have closed this connection mid-loop.
            if self.by_socket.get(&handle) != Some(&conn_id) {
                return;
            }
            match self.io.recv_from(handle, &mut datagram) {
                Ok((0, _)) => continue,
                Ok((n, from)) => {
                    let upstream = &self.servers[server_idx];
                    if from.ip() != upstream.addr || from.port() != upstream.udp_port {
                        log::debug!("dropping datagram from unexpected source {}", from);
                        continue;
                    }
                    self.process_answer(&datagram[..n], conn_id, false, now);
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("udp read from server {} failed: {}", server_idx, err);
                    self.handle_error(conn_id, now);
                    return;
                }
            }
        }
    }

    /// Match a candidate response to its query and dispatch it.
    fn process_answer(&mut self, abuf: &[u8], conn_id: ConnId, from_tcp: bool, now: Instant) {
        let view = match MessageView::parse(abuf) {
            Some(view) => view,
            None => {
                log::debug!("dropping unparseable {}-byte response", abuf.len());
                self.check_cleanup_connection(conn_id);
                return;
            }
        };
        let qid = view.id();
        let id = match self.by_qid.get(&qid) {
            Some(&id) => id,
            None => {
                log::debug!("dropping response with unknown id {:#06x}", qid);
                self.check_cleanup_connection(conn_id);
                return;
            }
        };

        let questions_match = match self.queries.get(&id) {
            Some(query) => wire::same_questions(query.udp_bytes(), abuf),
            None => return,
        };
        if !questions_match {
            log::debug!(
                "dropping response {:#06x} with mismatched question section",
                qid
            );
            self.check_cleanup_connection(conn_id);
            return;
        }

        // The pending attempt is answered either way from here on.
        self.detach_connection(id);

        if self.flags.contains(ChannelFlags::EDNS)
            && view.rcode() == Rcode::FORMERR
            && !view.has_opt_additional()
        {
            log::info!(
                "response {:#06x} is FORMERR without OPT; disabling extended dns",
                qid
            );
            if let Some(query) = self.queries.get_mut(&id) {
                query.strip_edns();
            }
            self.flags.remove(ChannelFlags::EDNS);
            self.send_query(id, now);
            self.check_cleanup_connection(conn_id);
            return;
        }

        let max_udp = if self.flags.contains(ChannelFlags::EDNS) {
            self.edns_payload as usize
        } else {
            MAX_UDP_SIZE
        };
        if (view.truncated() || abuf.len() > max_udp)
            && !from_tcp
            && !self.flags.contains(ChannelFlags::IGNTC)
        {
            let promote = match self.queries.get(&id) {
                Some(query) => !query.using_tcp,
                None => return,
            };
            if promote {
                log::debug!("response {:#06x} truncated; retrying over tcp", qid);
                if let Some(query) = self.queries.get_mut(&id) {
                    query.using_tcp = true;
                }
                self.send_query(id, now);
            }
            // Already on TCP: drop the attempt and let the deadline fire.
            self.check_cleanup_connection(conn_id);
            return;
        }

        if !self.flags.contains(ChannelFlags::NOCHECKRESP) {
            let refusal = match view.rcode() {
                Rcode::SERVFAIL => Some(Status::ServFail),
                Rcode::NOTIMP => Some(Status::NotImp),
                Rcode::REFUSED => Some(Status::Refused),
                _ => None,
            };
            if let Some(status) = refusal {
                let server_idx = self.conns.get(&conn_id).map(|conn| conn.server);
                log::debug!("query {:#06x} refused with {:?}", qid, status);
                if let Some(query) = self.queries.get_mut(&id) {
                    query.error_status = status;
                }
                if let Some(server_idx) = server_idx {
                    self.skip_server(id, server_idx);
                }
                self.next_server(id, now);
                self.check_cleanup_connection(conn_id);
                return;
            }
        }

        self.end_query(id, Status::Success, Some(abuf));
        self.check_cleanup_connection(conn_id);
    }

    /// Expire every deadline at or before `now`, retrying each expired
    /// query on its next server.
    fn process_timeouts(&mut self, now: Instant) {
        loop {
            let (deadline, id) = match self.by_deadline.iter().next() {
                Some(&key) => key,
                None => break,
            };
            if deadline > now {
                break;
            }
            let conn = match self.queries.get_mut(&id) {
                Some(query) => {
                    query.error_status = Status::Timeout;
                    query.timeouts += 1;
                    query.conn
                }
                None => {
                    self.by_deadline.remove(&(deadline, id));
                    continue;
                }
            };
            self.next_server(id, now);
            if let Some(conn_id) = conn {
                self.check_cleanup_connection(conn_id);
            }
        }
    }

    /// Tear down a failed connection and requeue everything that was in
    /// flight on it.
    fn handle_error(&mut self, conn_id: ConnId, now: Instant) {
        let (stolen, server_idx) = match self.conns.get_mut(&conn_id) {
            Some(conn) => (std::mem::replace(&mut conn.queries, Vec::new()), conn.server),
            None => return,
        };
        self.close_connection(conn_id);
        log::debug!(
            "connection to server {} failed; requeueing {} queries",
            server_idx,
            stolen.len()
        );
        for id in stolen {
            if let Some(query) = self.queries.get_mut(&id) {
                query.conn = None;
            } else {
                continue;
            }
            self.skip_server(id, server_idx);
            self.next_server(id, now);
        }
    }

    /// Advance a query to the next usable server, or end it when the
    /// attempt budget is spent.
    fn next_server(&mut self, id: QueryId, now: Instant) {
        let nservers = self.servers.len();
        let max_attempts = nservers * self.tries;
        loop {
            let (try_count, no_retries) = match self.queries.get_mut(&id) {
                Some(query) => {
                    query.try_count += 1;
                    (query.try_count, query.no_retries)
                }
                None => return,
            };
            if try_count >= max_attempts || no_retries {
                break;
            }
            let usable = {
                let query = match self.queries.get_mut(&id) {
                    Some(query) => query,
                    None => return,
                };
                query.server = (query.server + 1) % nservers;
                let info = query.server_info[query.server];
                let upstream = &self.servers[query.server];
                !(info.skipped
                    || (query.using_tcp && info.tcp_generation == upstream.tcp_generation))
            };
            if usable {
                self.send_query(id, now);
                return;
            }
        }
        let status = self
            .queries
            .get(&id)
            .map(|query| query.error_status)
            .unwrap_or(Status::ConnRefused);
        self.end_query(id, status, None);
    }

    /// Mark one server as unusable for this query for the rest of its
    /// life. A single-server channel keeps retrying its one server.
    fn skip_server(&mut self, id: QueryId, server_idx: usize) {
        if self.servers.len() <= 1 {
            return;
        }
        if let Some(query) = self.queries.get_mut(&id) {
            query.server_info[server_idx].skipped = true;
        }
    }

    fn handle_open_failure(
        &mut self,
        id: QueryId,
        server_idx: usize,
        status: Status,
        now: Instant,
    ) {
        if status == Status::NoMemory {
            self.end_query(id, status, None);
            return;
        }
        if let Some(query) = self.queries.get_mut(&id) {
            query.error_status = status;
        }
        self.skip_server(id, server_idx);
        self.next_server(id, now);
    }

    /// Remove the query from every index, then fire its callback with the
    /// terminal status. The callback sees a channel the query is already
    /// gone from, so re-entrant submission and cancellation are safe.
    pub(crate) fn end_query(&mut self, id: QueryId, status: Status, abuf: Option<&[u8]>) {
        self.detach_connection(id);
        let query = match self.queries.remove(&id) {
            Some(query) => query,
            None => return,
        };
        self.by_qid.remove(&query.qid);
        if let Some(key) = query.deadline_key {
            self.by_deadline.remove(&key);
        }
        log::debug!("query {:#06x} finished with {:?}", query.qid, status);
        if let Some(callback) = query.callback {
            callback(self, status, query.timeouts, abuf);
        }
    }

    /// Unlink a query from the connection its pending attempt went out on.
    fn detach_connection(&mut self, id: QueryId) {
        let conn = match self.queries.get_mut(&id) {
            Some(query) => query.conn.take(),
            None => return,
        };
        if let Some(conn_id) = conn {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.detach(id);
            }
        }
    }

    fn open_udp_connection(&mut self, server_idx: usize) -> Result<ConnId, Status> {
        let (addr, port) = {
            let upstream = &self.servers[server_idx];
            (upstream.addr, upstream.udp_port)
        };
        let handle = self
            .io
            .open_socket(Transport::Udp, Family::of(&addr))
            .map_err(|err| open_status(&err))?;
        if let Err(err) = self.io.connect(handle, SocketAddr::new(addr, port)) {
            self.io.close(handle);
            return Err(open_status(&err));
        }

        let conn_id = self.alloc_conn_id();
        self.conns
            .insert(conn_id, Connection::new(server_idx, handle, false));
        self.by_socket.insert(handle, conn_id);
        self.servers[server_idx].connections.push_front(conn_id);
        log::debug!("opened udp connection to {}:{}", addr, port);
        self.notify_socket_state(handle, true, false);
        Ok(conn_id)
    }

    fn open_tcp_connection(&mut self, server_idx: usize) -> Result<ConnId, Status> {
        let (addr, port) = {
            let upstream = &self.servers[server_idx];
            (upstream.addr, upstream.tcp_port)
        };
        let handle = self
            .io
            .open_socket(Transport::Tcp, Family::of(&addr))
            .map_err(|err| open_status(&err))?;
        if let Err(err) = self.io.connect(handle, SocketAddr::new(addr, port)) {
            self.io.close(handle);
            return Err(open_status(&err));
        }

        let conn_id = self.alloc_conn_id();
        self.conns
            .insert(conn_id, Connection::new(server_idx, handle, true));
        self.by_socket.insert(handle, conn_id);
        self.tcp_generation += 1;
        {
            let generation = self.tcp_generation;
            let upstream = &mut self.servers[server_idx];
            upstream.tcp_generation = generation;
            upstream.connections.push_back(conn_id);
            upstream.tcp_conn = Some(conn_id);
        }
        log::debug!("opened tcp connection to {}:{}", addr, port);
        self.notify_socket_state(handle, true, false);
        Ok(conn_id)
    }

    /// Close a connection, unmapping its socket first. A TCP close bumps
    /// the server's generation so in-flight queries become eligible for a
    /// fresh connection.
    pub(crate) fn close_connection(&mut self, conn_id: ConnId) {
        let conn = match self.conns.remove(&conn_id) {
            Some(conn) => conn,
            None => return,
        };
        self.by_socket.remove(&conn.handle);
        {
            let upstream = &mut self.servers[conn.server];
            upstream.connections.retain(|&c| c != conn_id);
            if upstream.tcp_conn == Some(conn_id) {
                upstream.tcp_conn = None;
                upstream.tcp_parser.clear();
                upstream.tcp_send.clear();
            }
        }
        if conn.is_tcp {
            self.tcp_generation += 1;
            let generation = self.tcp_generation;
            self.servers[conn.server].tcp_generation = generation;
        }
        log::debug!(
            "closed {} connection to server {}",
            if conn.is_tcp { "tcp" } else { "udp" },
            conn.server
        );
        self.notify_socket_state(conn.handle, false, false);
        self.io.close(conn.handle);
    }

    /// Retire a connection that has nothing left to do: no in-flight
    /// queries and either the channel is idle (without STAYOPEN) or a UDP
    /// socket has hit its reuse cap.
    pub(crate) fn check_cleanup_connection(&mut self, conn_id: ConnId) {
        let close = match self.conns.get(&conn_id) {
            Some(conn) if conn.queries.is_empty() => {
                let stayopen = self.flags.contains(ChannelFlags::STAYOPEN);
                (!stayopen && self.queries.is_empty())
                    || (!conn.is_tcp
                        && self.udp_max_queries > 0
                        && conn.total_queries >= self.udp_max_queries)
            }
            _ => false,
        };
        if close {
            self.close_connection(conn_id);
        }
    }
}
