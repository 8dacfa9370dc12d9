//! Shared harness for engine integration tests: a scripted socket
//! provider and raw wire-format builders.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use quiver::resolver::io::{Family, IoProvider, SocketHandle, Transport};

#[derive(Default)]
pub struct ScriptState {
    next_handle: u64,
    pub opened: Vec<(SocketHandle, Transport)>,
    pub connected: HashMap<SocketHandle, SocketAddr>,
    pub sent: Vec<(SocketHandle, Vec<u8>)>,
    pub closed: Vec<SocketHandle>,
    pub udp_rx: HashMap<SocketHandle, VecDeque<(Vec<u8>, SocketAddr)>>,
    pub tcp_rx: HashMap<SocketHandle, VecDeque<Vec<u8>>>,
    pub eof: HashSet<SocketHandle>,
    pub connect_error: Option<io::ErrorKind>,
}

impl ScriptState {
    pub fn handles(&self, transport: Transport) -> Vec<SocketHandle> {
        self.opened
            .iter()
            .filter(|(_, t)| *t == transport)
            .map(|(h, _)| *h)
            .collect()
    }

    pub fn open_handles(&self) -> Vec<SocketHandle> {
        self.opened
            .iter()
            .map(|(h, _)| *h)
            .filter(|h| !self.closed.contains(h))
            .collect()
    }

    pub fn push_udp(&mut self, handle: SocketHandle, data: Vec<u8>, from: SocketAddr) {
        self.udp_rx
            .entry(handle)
            .or_insert_with(VecDeque::new)
            .push_back((data, from));
    }

    pub fn push_tcp(&mut self, handle: SocketHandle, data: Vec<u8>) {
        self.tcp_rx
            .entry(handle)
            .or_insert_with(VecDeque::new)
            .push_back(data);
    }
}

/// Scripted `IoProvider`: records everything the engine does and replays
/// whatever inbound traffic the test queued between steps.
pub struct ScriptedIo {
    pub state: Rc<RefCell<ScriptState>>,
}

impl ScriptedIo {
    pub fn new() -> (ScriptedIo, Rc<RefCell<ScriptState>>) {
        let state = Rc::new(RefCell::new(ScriptState {
            next_handle: 1,
            ..ScriptState::default()
        }));
        (
            ScriptedIo {
                state: state.clone(),
            },
            state,
        )
    }
}

fn would_block() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "would block")
}

impl IoProvider for ScriptedIo {
    fn open_socket(&mut self, transport: Transport, _family: Family) -> io::Result<SocketHandle> {
        let mut state = self.state.borrow_mut();
        let handle = SocketHandle(state.next_handle);
        state.next_handle += 1;
        state.opened.push((handle, transport));
        Ok(handle)
    }

    fn connect(&mut self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.connect_error {
            return Err(io::Error::new(kind, "scripted connect failure"));
        }
        state.connected.insert(handle, addr);
        Ok(())
    }

    fn send(&mut self, handle: SocketHandle, data: &[u8]) -> io::Result<usize> {
        self.state.borrow_mut().sent.push((handle, data.to_vec()));
        Ok(data.len())
    }

    fn recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(queue) = state.tcp_rx.get_mut(&handle) {
            if let Some(chunk) = queue.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                return Ok(n);
            }
        }
        if state.eof.contains(&handle) {
            return Ok(0);
        }
        Err(would_block())
    }

    fn recv_from(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        let mut state = self.state.borrow_mut();
        if let Some(queue) = state.udp_rx.get_mut(&handle) {
            if let Some((chunk, from)) = queue.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                return Ok((n, from));
            }
        }
        Err(would_block())
    }

    fn close(&mut self, handle: SocketHandle) {
        self.state.borrow_mut().closed.push(handle);
    }
}

fn name_bytes(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// A recursion-desired query for `name A IN`; the engine overwrites the id.
pub fn query_wire(name: &str) -> Vec<u8> {
    let mut out = vec![0, 0, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    out.extend(name_bytes(name));
    out.extend_from_slice(&[0, 1, 0, 1]);
    out
}

/// The same query with an empty OPT record in the additional section.
pub fn query_wire_edns(name: &str) -> Vec<u8> {
    let mut out = query_wire(name);
    out[11] = 1;
    out.push(0);
    out.extend_from_slice(&41u16.to_be_bytes());
    out.extend_from_slice(&1280u16.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&[0, 0]);
    out
}

/// A response echoing the question for `name`, with the given rcode,
/// optionally truncated, optionally carrying one A answer record.
pub fn response_wire(id: u16, name: &str, rcode: u8, tc: bool, answer: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0x80 | if tc { 0x02 } else { 0 });
    out.push(rcode);
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&(answer.is_some() as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend(name_bytes(name));
    out.extend_from_slice(&[0, 1, 0, 1]);
    if let Some(addr) = answer {
        out.extend_from_slice(&[0xC0, 0x0C]);
        out.extend_from_slice(&[0, 1, 0, 1]);
        out.extend_from_slice(&[0, 0, 0, 60]);
        out.extend_from_slice(&[0, 4]);
        out.extend_from_slice(&addr);
    }
    out
}

/// Frame a message for the TCP stream.
pub fn tcp_framed(message: &[u8]) -> Vec<u8> {
    let mut out = (message.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(message);
    out
}
