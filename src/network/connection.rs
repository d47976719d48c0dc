//! TCP connection with buffered non-blocking I/O
//!
//! The receive buffer is allocated once per connection and sized to hold the
//! largest frame; consumed bytes are compacted away before the next read.

use std::cell::{Cell, Ref, RefCell};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Weak;

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace};

use super::transport::{Connection, ConnectionId};
use crate::config::EngineConfig;
use crate::reactor::{EventHandler, Reactor};

struct ReadBuffer {
    data: Box<[u8]>,
    pos: usize,
    len: usize,
}

pub struct TcpConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: RefCell<TcpStream>,
    read: RefCell<ReadBuffer>,
    write: RefCell<Vec<u8>>,
    write_limit: usize,
    token: Cell<Option<Token>>,
    sequence: Cell<u64>,
    closed: Cell<bool>,
}

impl TcpConnection {
    /// Wrap an established stream and apply the configured socket options.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, config: &EngineConfig) -> io::Result<Self> {
        stream.set_nodelay(config.no_delay)?;

        #[cfg(unix)]
        if let Some(size) = config.socket_buffer_size {
            set_socket_buffers(&stream, size)?;
        }

        Ok(Self {
            id: ConnectionId::next(),
            peer_addr,
            stream: RefCell::new(stream),
            read: RefCell::new(ReadBuffer {
                data: vec![0u8; config.read_buffer_size].into_boxed_slice(),
                pos: 0,
                len: 0,
            }),
            write: RefCell::new(Vec::with_capacity(config.write_buffer_size)),
            write_limit: config.write_buffer_size,
            token: Cell::new(None),
            sequence: Cell::new(0),
            closed: Cell::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.borrow().local_addr()
    }

    pub fn token(&self) -> Option<Token> {
        self.token.get()
    }

    fn write_buffered(&self, stream: &mut TcpStream, buffer: &mut Vec<u8>) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == buffer.len() {
                break Ok(());
            }
            match stream.write(&buffer[written..]) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        buffer.drain(..written);
        trace!(id = %self.id, written, pending = buffer.len(), "flushed");
        result
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn register(&self, reactor: &Reactor, handler: Weak<dyn EventHandler>) -> io::Result<Token> {
        let token = reactor.register(
            &mut *self.stream.borrow_mut(),
            Interest::READABLE | Interest::WRITABLE,
            handler,
        )?;
        self.token.set(Some(token));
        Ok(token)
    }

    fn deregister(&self, reactor: &Reactor) -> io::Result<()> {
        match self.token.take() {
            Some(token) => reactor.deregister(&mut *self.stream.borrow_mut(), token),
            None => Ok(()),
        }
    }

    fn fill_read_buffer(&self) -> io::Result<usize> {
        let mut buffer = self.read.borrow_mut();
        let ReadBuffer { data, pos, len } = &mut *buffer;

        if *pos > 0 {
            data.copy_within(*pos..*len, 0);
            *len -= *pos;
            *pos = 0;
        }
        if *len == data.len() {
            return Ok(0);
        }

        loop {
            match self.stream.borrow_mut().read(&mut data[*len..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(n) => {
                    *len += n;
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn readable(&self) -> Ref<'_, [u8]> {
        Ref::map(self.read.borrow(), |buffer| &buffer.data[buffer.pos..buffer.len])
    }

    fn read_capacity(&self) -> usize {
        self.read.borrow().data.len()
    }

    fn consume(&self, n: usize) {
        let mut buffer = self.read.borrow_mut();
        buffer.pos += n.min(buffer.len - buffer.pos);
    }

    fn queue_write(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.get() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }

        let mut buffer = self.write.borrow_mut();
        // Flush first if the frame would push past the soft limit
        if !buffer.is_empty() && buffer.len() + data.len() > self.write_limit {
            self.write_buffered(&mut self.stream.borrow_mut(), &mut buffer)?;
        }
        buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush_write_buffer(&self) -> io::Result<()> {
        let mut buffer = self.write.borrow_mut();
        if buffer.is_empty() {
            return Ok(());
        }
        self.write_buffered(&mut self.stream.borrow_mut(), &mut buffer)
    }

    fn write_pending(&self) -> usize {
        self.write.borrow().len()
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.borrow().take_error()
    }

    fn next_sequence(&self) -> u64 {
        let next = self.sequence.get() + 1;
        self.sequence.set(next);
        next
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Err(err) = self.flush_write_buffer() {
            debug!(id = %self.id, ?err, "dropping unflushed bytes on close");
        }
        if let Err(err) = self.stream.borrow().shutdown(Shutdown::Both) {
            trace!(id = %self.id, ?err, "shutdown failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

#[cfg(unix)]
fn set_socket_buffers(stream: &TcpStream, size: usize) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let optval = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
    for option in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        // SAFETY: fd is a live socket owned by `stream`, optval outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
