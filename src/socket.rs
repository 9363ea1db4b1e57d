//! Socket endpoints: address parsing, listener/connection setup, and
//! the outgoing-connection ("Client" role) reader thread and senders.
//!
//! INET sockets ride on `std::net`; UNIX sockets ride on
//! `std::os::unix::net`. The one piece neither gives us is control over
//! socket options *before* `bind` (`SO_REUSEADDR`) and abstract-namespace
//! UNIX addressing, so those two steps are done with raw `libc` calls
//! and the resulting file descriptor is handed straight back to the
//! standard types via `FromRawFd`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, warn};

use crate::error::{Result, SlError};
use crate::ringbuf::RingBuffer;

/// How a server endpoint binds: a UNIX domain path, or an INET socket
/// restricted to loopback, or one open on all interfaces.
#[derive(Debug, Clone)]
pub enum SockKind {
    UnixPath(String),
    InetLocalOnly,
    InetAny,
}

const UNIX_PATH_MAX: usize = 105;

/// Converts a UNIX socket path: a path starting with a literal NUL
/// byte, or with the two characters `\0`, is treated as an
/// abstract-namespace name (the remainder becomes the name, prefixed
/// with a NUL); anything else is a literal filesystem path.
fn convert_unix_path(path: &str) -> Vec<u8> {
    let bytes = path.as_bytes();
    let mut out = if bytes.first() == Some(&0u8) {
        let mut v = vec![0u8];
        v.extend_from_slice(&bytes[1..]);
        v
    } else if path.starts_with("\\0") {
        let mut v = vec![0u8];
        v.extend_from_slice(&bytes[2..]);
        v
    } else {
        bytes.to_vec()
    };
    out.truncate(UNIX_PATH_MAX);
    out
}

fn is_abstract(converted: &[u8]) -> bool {
    converted.first() == Some(&0u8)
}

unsafe fn fill_sockaddr_un(converted: &[u8]) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = mem::zeroed();
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_field = addr.sun_path.as_mut_ptr() as *mut u8;
    let n = converted.len().min(addr.sun_path.len());
    std::ptr::copy_nonoverlapping(converted.as_ptr(), path_field, n);
    let base = mem::size_of::<libc::sa_family_t>();
    let len = if is_abstract(converted) {
        (base + n) as libc::socklen_t
    } else {
        // include the implicit trailing NUL terminator for filesystem paths
        (base + n + 1).min(mem::size_of::<libc::sockaddr_un>()) as libc::socklen_t
    };
    (addr, len)
}

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Binds and listens a UNIX domain socket, supporting abstract-namespace
/// addresses that `std::os::unix::net::UnixListener` cannot express.
pub fn bind_unix_listener(path: &str, backlog: i32) -> Result<UnixListener> {
    let converted = convert_unix_path(path);
    if !is_abstract(&converted) {
        // Filesystem path: let std do the ordinary work, after clearing
        // a stale socket file from a previous run.
        let _ = std::fs::remove_file(path);
    }
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(SlError::Listen(io::Error::last_os_error()));
        }
        let (addr, len) = fill_sockaddr_un(&converted);
        let ret = libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len);
        if ret < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(SlError::Listen(e));
        }
        if libc::listen(fd, backlog) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(SlError::Listen(e));
        }
        Ok(UnixListener::from_raw_fd(fd))
    }
}

fn sockaddr_in(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Binds and listens an INET stream socket with `SO_REUSEADDR` set
/// before `bind`, on all interfaces (`InetAny`) or loopback only
/// (`InetLocalOnly`).
pub fn bind_inet_listener(kind: &SockKind, port: u16, backlog: i32) -> Result<TcpListener> {
    let ip = match kind {
        SockKind::InetAny => Ipv4Addr::UNSPECIFIED,
        SockKind::InetLocalOnly => Ipv4Addr::LOCALHOST,
        SockKind::UnixPath(_) => unreachable!("bind_inet_listener called with a UNIX kind"),
    };
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(SlError::Listen(io::Error::last_os_error()));
        }
        if let Err(e) = set_reuseaddr(fd) {
            libc::close(fd);
            return Err(SlError::Listen(e));
        }
        let addr = sockaddr_in(ip, port);
        let ret = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if ret < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(SlError::Listen(e));
        }
        if libc::listen(fd, backlog) < 0 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(SlError::Listen(e));
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// Parses an INET address argument: `":port"` (server, any interface),
/// `"host:port"` (client or server), or `"port"` (server).
pub fn parse_inet_spec(spec: &str) -> Result<(Option<String>, u16)> {
    if let Some(rest) = spec.strip_prefix(':') {
        let port = rest
            .parse::<u16>()
            .map_err(|_| SlError::BadAddress(spec.to_string()))?;
        return Ok((None, port));
    }
    if let Some(idx) = spec.rfind(':') {
        let host = &spec[..idx];
        let port = spec[idx + 1..]
            .parse::<u16>()
            .map_err(|_| SlError::BadAddress(spec.to_string()))?;
        return Ok((Some(host.to_string()), port));
    }
    let port = spec
        .parse::<u16>()
        .map_err(|_| SlError::BadAddress(spec.to_string()))?;
    Ok((None, port))
}

/// A connection-mode ("Client" role) endpoint: one connected stream,
/// its receive ring buffer, and a send mutex. A single reader thread
/// pumps inbound bytes into the ring buffer for as long as the
/// endpoint stays connected.
pub enum Stream {
    Unix(UnixStream),
    Inet(TcpStream),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
            Stream::Inet(s) => s.try_clone().map(Stream::Inet),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Inet(s) => s.as_raw_fd(),
        }
    }

    pub fn peer_ip(&self) -> Option<String> {
        match self {
            Stream::Unix(_) => None,
            Stream::Inet(s) => s.peer_addr().ok().map(|a| a.ip().to_string()),
        }
    }

    pub fn set_nonblocking(&self, val: bool) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_nonblocking(val),
            Stream::Inet(s) => s.set_nonblocking(val),
        }
    }

    pub(crate) fn read_raw(&self, buf: &mut [u8]) -> isize {
        let fd = self.as_raw_fd();
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
    }
}

pub fn connect_client(kind: &SockKind, path: &str) -> Result<Stream> {
    match kind {
        SockKind::UnixPath(_) => {
            let stream = UnixStream::connect(path).map_err(SlError::Io)?;
            Ok(Stream::Unix(stream))
        }
        SockKind::InetAny | SockKind::InetLocalOnly => {
            let (host, port) = parse_inet_spec(path)?;
            let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
            let stream = TcpStream::connect((host.as_str(), port)).map_err(SlError::Io)?;
            Ok(Stream::Inet(stream))
        }
    }
}

/// Sends a buffer with the equivalent of `send(..., MSG_NOSIGNAL)`,
/// spin-waiting (1ms sleeps) on writability first. Any negative return
/// marks the caller's responsibility to treat the connection as failed.
pub(crate) fn send_nosignal(fd: RawFd, data: &[u8]) -> isize {
    unsafe {
        libc::send(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    }
}

pub(crate) fn poll_writable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let r = unsafe { libc::poll(&mut pfd, 1, 0) };
    r > 0 && (pfd.revents & libc::POLLOUT) != 0
}

/// An outgoing ("Client" role) socket endpoint: a connected stream plus
/// the ring buffer its reader thread fills and the mutex that
/// serialises sends to it.
pub struct ClientEndpoint {
    stream: Mutex<Stream>,
    fd: RawFd,
    pub buffer: Arc<RingBuffer>,
    connected: std::sync::atomic::AtomicBool,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ClientEndpoint {
    pub fn connect(kind: &SockKind, path: &str, bufsiz: usize) -> Result<Arc<ClientEndpoint>> {
        let stream = connect_client(kind, path)?;
        let fd = stream.as_raw_fd();
        let endpoint = Arc::new(ClientEndpoint {
            stream: Mutex::new(stream),
            fd,
            buffer: Arc::new(RingBuffer::new(bufsiz)),
            connected: std::sync::atomic::AtomicBool::new(true),
            reader: Mutex::new(None),
        });
        let reader_handle = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || reader_loop(endpoint))
        };
        *endpoint.reader.lock().unwrap() = Some(reader_handle);
        Ok(endpoint)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Reads one framed line out of the receive ring buffer, if a
    /// complete one is buffered yet.
    pub fn read_line(
        &self,
        dst: &mut [u8],
    ) -> std::result::Result<Option<usize>, crate::ringbuf::RbError> {
        self.buffer.read_line(dst)
    }

    pub fn send_bin(&self, data: &[u8]) -> isize {
        if data.is_empty() {
            return -1;
        }
        let mut spins = 0;
        while self.is_connected() && !poll_writable(self.fd) {
            thread::sleep(Duration::from_millis(1));
            spins += 1;
            if spins > 5000 {
                break; // ~5s without becoming writable: give up rather than spin forever
            }
        }
        if !self.is_connected() {
            return -1;
        }
        let _guard = self.stream.lock().unwrap();
        let r = send_nosignal(self.fd, data);
        if r < 0 {
            self.mark_disconnected();
        }
        r
    }

    pub fn send_str(&self, s: &str) -> isize {
        self.send_bin(s.as_bytes())
    }

    pub fn send_byte(&self, byte: u8) -> isize {
        self.send_bin(&[byte])
    }
}

fn reader_loop(endpoint: Arc<ClientEndpoint>) {
    let mut buf = [0u8; 512];
    while endpoint.is_connected() {
        let n = {
            let stream = endpoint.stream.lock().unwrap();
            if !poll_readable(stream.as_raw_fd()) {
                drop(stream);
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            stream.read_raw(&mut buf)
        };
        if n <= 0 {
            warn!("client reader: server disconnected (read returned {})", n);
            break;
        }
        let n = n as usize;
        let mut got = 0;
        while got < n {
            let wrote = endpoint.buffer.write(&buf[got..n]);
            if wrote == 0 {
                error!("client reader: receive ring buffer full, dropping connection");
                endpoint.mark_disconnected();
                return;
            }
            got += wrote;
        }
    }
    endpoint.mark_disconnected();
}

pub(crate) fn poll_readable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let r = unsafe { libc::poll(&mut pfd, 1, 1) };
    r > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_unix_path_is_unchanged() {
        let v = convert_unix_path("/tmp/foo.sock");
        assert_eq!(v, b"/tmp/foo.sock".to_vec());
        assert!(!is_abstract(&v));
    }

    #[test]
    fn backslash_zero_prefix_becomes_abstract() {
        let v = convert_unix_path("\\0myapp");
        assert!(is_abstract(&v));
        assert_eq!(&v[1..], b"myapp");
    }

    #[test]
    fn parses_colon_port_as_server_any_host() {
        assert_eq!(parse_inet_spec(":9000").unwrap(), (None, 9000));
    }

    #[test]
    fn parses_host_colon_port() {
        assert_eq!(
            parse_inet_spec("example.com:9000").unwrap(),
            (Some("example.com".to_string()), 9000)
        );
    }

    #[test]
    fn parses_bare_port() {
        assert_eq!(parse_inet_spec("9000").unwrap(), (None, 9000));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_inet_spec("host:notaport").is_err());
    }
}
