//! The connection multiplexer: one listening socket, a fixed table of
//! client slots, and a merged byte stream toward the serial line.
//!
//! Everything is non-blocking and runs on the emulation loop thread. All
//! connected clients share the single console line: input is merged in
//! arrival order, output is broadcast to everyone.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Number of client slots.
pub const MAX_CLIENTS: usize = 10;

/// Sent to every client on connect.
pub const GREETING: &[u8] = b"pdp11 console attached\r\n";

/// Sent (followed by a close) when the slot table is full.
pub const SERVER_FULL: &[u8] = b"server full, try again later\r\n";

/// Telnet "interpret as command": this byte and the two after it are
/// consumed as a unit and otherwise ignored.
const IAC: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

struct Client {
    stream: TcpStream,
    /// Data bytes received and not yet consumed by the serial line.
    pending: VecDeque<u8>,
    /// Escape parameter bytes still to swallow.
    skip: u8,
}

impl Client {
    /// Buffer freshly received bytes, stripping IAC escape sequences.
    fn buffer(&mut self, data: &[u8]) {
        for &byte in data {
            if self.skip > 0 {
                self.skip -= 1;
            } else if byte == IAC {
                self.skip = 2;
            } else {
                self.pending.push_back(byte);
            }
        }
    }
}

pub struct Mux {
    listener: TcpListener,
    clients: [Option<Client>; MAX_CLIENTS],
}

impl Mux {
    /// Bind the listening socket. Failure here is fatal at startup.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub fn bind(addr: SocketAddr) -> Result<Self, MuxError> {
        let listener = TcpListener::bind(addr)
            .and_then(|l| l.set_nonblocking(true).map(|()| l))
            .map_err(|source| MuxError::Bind { addr, source })?;
        info!(addr = %addr, "listening for console connections");
        Ok(Self {
            listener,
            clients: std::array::from_fn(|_| None),
        })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// Accept any pending connections. New clients get a greeting; when the
    /// table is full the connection is told so and closed.
    pub fn accept_connections(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            };
            let Some(slot) = self.clients.iter_mut().find(|s| s.is_none()) else {
                debug!(peer = %peer, "turning away connection, all slots busy");
                let _ = stream.write_all(SERVER_FULL);
                continue;
            };
            if let Err(e) = stream.set_nonblocking(true) {
                warn!(peer = %peer, "cannot make client socket non-blocking: {e}");
                continue;
            }
            let _ = stream.write_all(GREETING);
            info!(peer = %peer, "console client connected");
            *slot = Some(Client {
                stream,
                pending: VecDeque::new(),
                skip: 0,
            });
        }
    }

    /// Poll every client for newly arrived bytes, buffering data and
    /// reaping clients that disconnected or errored.
    pub fn poll_input(&mut self) {
        for slot in &mut self.clients {
            let Some(client) = slot else { continue };
            let mut buf = [0u8; 512];
            loop {
                match client.stream.read(&mut buf) {
                    Ok(0) => {
                        debug!("console client disconnected");
                        *slot = None;
                        break;
                    }
                    Ok(n) => client.buffer(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("dropping console client: {e}");
                        *slot = None;
                        break;
                    }
                }
            }
        }
    }

    /// True if any client has buffered input.
    #[must_use]
    pub fn has_input(&self) -> bool {
        self.clients
            .iter()
            .flatten()
            .any(|c| !c.pending.is_empty())
    }

    /// Take one byte from the first slot holding any. No fairness is
    /// guaranteed across clients.
    pub fn read_byte(&mut self) -> Option<u8> {
        self.clients
            .iter_mut()
            .flatten()
            .find_map(|c| c.pending.pop_front())
    }

    /// Broadcast a buffer to every connected client, reaping those whose
    /// sockets fail. A transport fault never propagates to the caller.
    pub fn broadcast(&mut self, data: &[u8]) {
        for slot in &mut self.clients {
            let Some(client) = slot else { continue };
            if let Err(e) = client.stream.write_all(data) {
                if e.kind() != ErrorKind::WouldBlock {
                    debug!("dropping console client on write: {e}");
                    *slot = None;
                }
            }
        }
    }

    /// Broadcast a single byte.
    pub fn write_byte(&mut self, byte: u8) {
        self.broadcast(&[byte]);
    }
}
