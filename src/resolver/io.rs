//! Socket I/O behind an injected provider
//!
//! The engine never talks to the OS directly; every socket operation goes
//! through the `IoProvider` the channel was built with. All operations are
//! non-blocking: a call that cannot make progress returns
//! `io::ErrorKind::WouldBlock` and the engine retries it on the next
//! readiness notification. `SystemIo` is the production provider over
//! `std::net` sockets; tests script their own.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Opaque handle the engine uses to refer to one open socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SocketHandle(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// The socket operations the engine needs, non-blocking throughout.
///
/// `connect` on a TCP socket must treat connect-in-progress as success;
/// the eventual outcome surfaces through the first write or read on the
/// handle.
pub trait IoProvider {
    fn open_socket(&mut self, transport: Transport, family: Family) -> io::Result<SocketHandle>;
    fn connect(&mut self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()>;
    fn send(&mut self, handle: SocketHandle, data: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> io::Result<usize>;
    fn recv_from(&mut self, handle: SocketHandle, buf: &mut [u8])
        -> io::Result<(usize, SocketAddr)>;
    fn close(&mut self, handle: SocketHandle);
}

enum SysSocket {
    Udp(UdpSocket),
    TcpPending(Socket),
    Tcp(TcpStream),
}

/// Production provider over non-blocking `std::net` sockets.
///
/// TCP sockets are created through `socket2` so non-blocking mode can be
/// set before the connect is issued.
pub struct SystemIo {
    sockets: HashMap<SocketHandle, SysSocket>,
    next_handle: u64,
}

impl SystemIo {
    pub fn new() -> SystemIo {
        SystemIo {
            sockets: HashMap::new(),
            next_handle: 1,
        }
    }

    fn alloc_handle(&mut self) -> SocketHandle {
        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn socket_mut(&mut self, handle: SocketHandle) -> io::Result<&mut SysSocket> {
        self.sockets
            .get_mut(&handle)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown socket handle"))
    }
}

impl Default for SystemIo {
    fn default() -> SystemIo {
        SystemIo::new()
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return true;
        }
    }
    false
}

impl IoProvider for SystemIo {
    fn open_socket(&mut self, transport: Transport, family: Family) -> io::Result<SocketHandle> {
        let sock = match transport {
            Transport::Udp => {
                let bind_addr: SocketAddr = match family {
                    Family::V4 => "0.0.0.0:0".parse().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "bad bind address")
                    })?,
                    Family::V6 => "[::]:0".parse().map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "bad bind address")
                    })?,
                };
                let sock = UdpSocket::bind(bind_addr)?;
                sock.set_nonblocking(true)?;
                SysSocket::Udp(sock)
            }
            Transport::Tcp => {
                let domain = match family {
                    Family::V4 => Domain::IPV4,
                    Family::V6 => Domain::IPV6,
                };
                let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                sock.set_nonblocking(true)?;
                SysSocket::TcpPending(sock)
            }
        };
        let handle = self.alloc_handle();
        self.sockets.insert(handle, sock);
        Ok(handle)
    }

    fn connect(&mut self, handle: SocketHandle, addr: SocketAddr) -> io::Result<()> {
        let promote = {
            let slot = self.socket_mut(handle)?;
            match slot {
                SysSocket::Udp(sock) => {
                    sock.connect(addr)?;
                    false
                }
                SysSocket::Tcp(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "socket already connected",
                    ));
                }
                SysSocket::TcpPending(sock) => {
                    match sock.connect(&addr.into()) {
                        Ok(()) => {}
                        Err(ref err) if connect_in_progress(err) => {
                            log::debug!("tcp connect to {} in progress", addr);
                        }
                        Err(err) => return Err(err),
                    }
                    true
                }
            }
        };
        if promote {
            if let Some(SysSocket::TcpPending(sock)) = self.sockets.remove(&handle) {
                self.sockets.insert(handle, SysSocket::Tcp(sock.into()));
            }
        }
        Ok(())
    }

    fn send(&mut self, handle: SocketHandle, data: &[u8]) -> io::Result<usize> {
        match self.socket_mut(handle)? {
            SysSocket::Udp(sock) => sock.send(data),
            SysSocket::Tcp(stream) => stream.write(data),
            SysSocket::TcpPending(_) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
            }
        }
    }

    fn recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket_mut(handle)? {
            SysSocket::Udp(sock) => sock.recv(buf),
            SysSocket::Tcp(stream) => stream.read(buf),
            SysSocket::TcpPending(_) => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
            }
        }
    }

    fn recv_from(
        &mut self,
        handle: SocketHandle,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr)> {
        match self.socket_mut(handle)? {
            SysSocket::Udp(sock) => sock.recv_from(buf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from on stream socket",
            )),
        }
    }

    fn close(&mut self, handle: SocketHandle) {
        self.sockets.remove(&handle);
    }
}
