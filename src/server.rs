//! The poll-based server dispatcher: one thread owns a listening socket
//! and a packed array of connected clients, cycling accept / read /
//! parse phases and compacting the array on disconnect.

use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::Result;
use crate::handler::{parse_key_value, DefaultHandlerFn, HandlerTable, ParseOutcome, Responder};
use crate::protocol::{self, ProtocolMode, StagingBuffer};
use crate::ringbuf::{RbError, RingBuffer};
use crate::socket::{
    self, bind_inet_listener, bind_unix_listener, poll_readable, poll_writable, send_nosignal,
    SockKind, Stream,
};

/// Scratch size for one read() and one parsed line; matches the key +
/// value + delimiter budget of the command parser with headroom for
/// an HTTP header line.
const SCRATCH_SIZE: usize = 512;
const POLL_TIMEOUT_MS: i32 = 200;
const TOO_MANY_CLIENTS_DRAIN_SECS: u64 = 11;

/// Hooks a caller can supply to observe dispatcher lifecycle events.
/// Every method has a no-op default so only the ones that matter need
/// overriding; `on_new_client` may veto the connection by returning
/// `false`.
pub trait DispatcherCallbacks: Send + Sync {
    fn on_new_client(&self, _ip: Option<&str>) -> bool {
        true
    }
    fn on_disconnect(&self, _ip: Option<&str>) {}
    fn on_too_many_clients(&self, _fd: RawFd) {}
}

#[derive(Default)]
pub struct NoopCallbacks;
impl DispatcherCallbacks for NoopCallbacks {}

enum BoundListener {
    Unix(UnixListener),
    Inet(TcpListener),
}

impl BoundListener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            BoundListener::Unix(l) => l.as_raw_fd(),
            BoundListener::Inet(l) => l.as_raw_fd(),
        }
    }

    fn accept(&self) -> std::io::Result<Stream> {
        match self {
            BoundListener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
            BoundListener::Inet(l) => l.accept().map(|(s, _)| Stream::Inet(s)),
        }
    }

    fn set_nonblocking(&self, val: bool) -> std::io::Result<()> {
        match self {
            BoundListener::Unix(l) => l.set_nonblocking(val),
            BoundListener::Inet(l) => l.set_nonblocking(val),
        }
    }
}

/// Per-connection HTTP parsing progress, threaded through the parse
/// phase alongside the plain line counter.
struct ConnState {
    mode: ProtocolMode,
    line_counter: u64,
    content_length: Option<usize>,
    blank_line_seen: bool,
    staging: StagingBuffer,
}

impl ConnState {
    fn new() -> ConnState {
        ConnState {
            mode: ProtocolMode::Raw,
            line_counter: 0,
            content_length: None,
            blank_line_seen: false,
            staging: StagingBuffer::new(),
        }
    }
}

/// One connected client: its stream, receive ring buffer, and protocol
/// state. Implements `Responder` so handler functions can reply
/// without knowing whether the connection is Raw or staging into an
/// HTTP response.
pub struct ClientSlot {
    fd: RawFd,
    stream: Mutex<Stream>,
    buffer: RingBuffer,
    ip: Option<String>,
    connected: AtomicBool,
    state: Mutex<ConnState>,
}

impl ClientSlot {
    fn new(stream: Stream, bufsiz: usize) -> ClientSlot {
        let fd = stream.as_raw_fd();
        let ip = stream.peer_ip();
        ClientSlot {
            fd,
            stream: Mutex::new(stream),
            buffer: RingBuffer::new(bufsiz),
            ip,
            connected: AtomicBool::new(true),
            state: Mutex::new(ConnState::new()),
        }
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_raw(&self) -> bool {
        self.state.lock().unwrap().mode.is_raw()
    }

    fn send_raw(&self, data: &[u8]) -> isize {
        if !self.is_connected() {
            return -1;
        }
        let mut spins = 0;
        while self.is_connected() && !poll_writable(self.fd) {
            std::thread::sleep(Duration::from_millis(1));
            spins += 1;
            if spins > 5000 {
                break;
            }
        }
        let _guard = self.stream.lock().unwrap();
        let r = send_nosignal(self.fd, data);
        if r < 0 {
            self.mark_disconnected();
        }
        r
    }

    fn emit(&self, data: &[u8]) {
        let raw = self.is_raw();
        if raw {
            self.send_raw(data);
        } else {
            self.state.lock().unwrap().staging.append(data);
        }
    }

    /// Builds and sends the synthetic HTTP response from whatever was
    /// staged, then forces Raw mode so the bytes go straight out.
    fn flush_http_response(&self) {
        let body = {
            let mut state = self.state.lock().unwrap();
            state.mode = ProtocolMode::Raw;
            std::mem::take(&mut state.staging).as_bytes().to_vec()
        };
        let response = protocol::build_http_response(&body);
        self.send_raw(&response);
    }
}

impl Responder for ClientSlot {
    fn send_str(&self, s: &str) {
        self.emit(s.as_bytes());
    }

    fn send_bin(&self, data: &[u8]) {
        self.emit(data);
    }
}

/// A short-lived handle onto the dispatcher's client table, handed to
/// handlers that need to reach every connected client rather than just
/// the one that sent the current command (the `SendAll` capability of
/// §5). Cloning is cheap (an `Arc` clone); the handle stays valid for
/// the lifetime of the server run it was issued by.
///
/// The table itself is read as a snapshot -- a clone of the `Arc`
/// pointers, not a lock held across the sends -- so a slow or
/// non-writable client can't stall the dispatcher loop or other
/// broadcasters. Each target still receives its bytes atomically with
/// respect to other senders addressing that same client, because
/// `ClientSlot::send_raw` serialises through that client's own stream
/// mutex; no ordering is promised across distinct clients.
#[derive(Clone)]
pub struct Broadcaster {
    clients: Arc<Mutex<Vec<Arc<ClientSlot>>>>,
}

impl Broadcaster {
    /// Sends `data` to every currently connected client, in slot order.
    /// Returns the number of clients the full buffer was accepted by;
    /// a client that isn't currently writable or has disconnected is
    /// skipped rather than retried.
    pub fn send_all(&self, data: &[u8]) -> usize {
        let snapshot: Vec<Arc<ClientSlot>> = self.clients.lock().unwrap().clone();
        let mut sent = 0;
        for client in &snapshot {
            if !client.is_connected() {
                continue;
            }
            if client.send_raw(data) == data.len() as isize {
                sent += 1;
            }
        }
        sent
    }
}

/// Static configuration for one dispatcher run.
pub struct ServerConfig {
    pub kind: SockKind,
    /// UNIX path, or INET `host:port`/`:port`/`port` spec.
    pub address: String,
    pub bufsiz: usize,
    pub max_clients: usize,
    /// Endpoint-wide fallback invoked when no handler's key matches.
    pub default_handler: Option<Box<DefaultHandlerFn>>,
    /// Filled in with a [`Broadcaster`] once `run` starts, so that
    /// handlers registered before the listener exists (the ordinary
    /// case -- the handler table is built before `run` is called) can
    /// still capture a working `SendAll` handle: a caller clones this
    /// cell into its handler closures, and `run` populates it before
    /// entering the accept loop.
    pub broadcaster_cell: Option<Arc<Mutex<Option<Broadcaster>>>>,
}

fn bind(config: &ServerConfig) -> Result<BoundListener> {
    match &config.kind {
        SockKind::UnixPath(path) => Ok(BoundListener::Unix(bind_unix_listener(
            path,
            config.max_clients as i32,
        )?)),
        SockKind::InetAny | SockKind::InetLocalOnly => {
            let (_, port) = socket::parse_inet_spec(&config.address)?;
            Ok(BoundListener::Inet(bind_inet_listener(
                &config.kind,
                port,
                config.max_clients as i32,
            )?))
        }
    }
}

/// The default "too many clients" handler: a short text message, then
/// a half-close and a bounded drain, matching a client that expects an
/// orderly server-initiated close rather than a bare RST.
fn reject_with_message(stream: Stream) {
    let fd = stream.as_raw_fd();
    send_nosignal(fd, b"FAIL: too many clients\n");
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
    let deadline = Instant::now() + Duration::from_secs(TOO_MANY_CLIENTS_DRAIN_SECS);
    let mut scratch = [0u8; 64];
    while Instant::now() < deadline {
        if !poll_readable(fd) {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        let n = unsafe {
            libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
        };
        if n <= 0 {
            break;
        }
    }
}

/// Runs the dispatcher loop until `shutdown` is set. Blocks the
/// calling thread; spawn it on its own thread to run a server
/// alongside other work.
pub fn run(
    config: ServerConfig,
    table: Arc<HandlerTable>,
    callbacks: Arc<dyn DispatcherCallbacks>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let listener = bind(&config)?;
    listener
        .set_nonblocking(true)
        .map_err(crate::error::SlError::Listen)?;
    info!(
        "server dispatcher listening (max_clients={})",
        config.max_clients
    );
    let clients_table: Arc<Mutex<Vec<Arc<ClientSlot>>>> =
        Arc::new(Mutex::new(Vec::with_capacity(config.max_clients)));
    if let Some(cell) = &config.broadcaster_cell {
        *cell.lock().unwrap() = Some(Broadcaster {
            clients: Arc::clone(&clients_table),
        });
    }
    let lines_processed = AtomicU64::new(0);

    while !shutdown.load(Ordering::SeqCst) {
        // Build the poll set from a snapshot taken without holding the
        // table lock across poll() itself, which may block up to
        // `POLL_TIMEOUT_MS` -- a broadcaster on another thread would
        // otherwise stall for the whole timeout waiting on the lock.
        let mut pollfds: Vec<libc::pollfd> = {
            let guard = clients_table.lock().unwrap();
            let mut v = Vec::with_capacity(guard.len() + 1);
            v.push(libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            for c in guard.iter() {
                v.push(libc::pollfd {
                    fd: c.fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            v
        };
        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!("poll() failed: {}", err);
            continue;
        }

        // Accept phase. The table lock is held only long enough to push
        // the new slot (or not at all, if nothing is pending); it is
        // never held across a handler invocation.
        if pollfds[0].revents & libc::POLLIN != 0 {
            match listener.accept() {
                Ok(stream) => {
                    let mut clients = clients_table.lock().unwrap();
                    if clients.len() >= config.max_clients {
                        warn!("limit of connections reached, rejecting new client");
                        callbacks.on_too_many_clients(stream.as_raw_fd());
                        drop(clients);
                        reject_with_message(stream);
                    } else {
                        let _ = stream.set_nonblocking(true);
                        let slot = Arc::new(ClientSlot::new(stream, config.bufsiz));
                        drop(clients);
                        if callbacks.on_new_client(slot.ip()) {
                            info!("new client connected, ip={:?}", slot.ip());
                            clients_table.lock().unwrap().push(slot);
                        } else {
                            slot.mark_disconnected();
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("accept() failed: {}", e),
            }
        }

        // Snapshot the client table (a clone of the `Arc<ClientSlot>`
        // pointers, not a held guard) so the read/parse phases below can
        // invoke handlers -- which may call `Broadcaster::send_all` and
        // so re-lock this same mutex from inside `dispatch` -- without
        // the dispatcher thread deadlocking against itself. Only this
        // thread mutates the table, and it does not mutate it again
        // until the disconnect phase re-locks it below, so the indices
        // captured in `pollfds` (against the pre-accept length) and
        // `to_disconnect` (against this snapshot) both stay valid.
        let clients: Vec<Arc<ClientSlot>> = clients_table.lock().unwrap().clone();

        // Read phase.
        let mut to_disconnect: Vec<usize> = Vec::new();
        for (idx, pfd) in pollfds.iter().enumerate().skip(1) {
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            let client = &clients[idx - 1];
            let free = client.buffer.free_size();
            if free == 0 {
                if !client.buffer.has_byte(b'\n') {
                    warn!("client {:?} sent an overlong line, disconnecting", client.ip());
                    to_disconnect.push(idx - 1);
                }
                continue;
            }
            let want = free.min(SCRATCH_SIZE);
            let mut scratch = [0u8; SCRATCH_SIZE];
            let got = unsafe {
                libc::read(
                    client.fd,
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    want,
                )
            };
            if got <= 0 {
                to_disconnect.push(idx - 1);
                continue;
            }
            let got = got as usize;
            let wrote = client.buffer.write(&scratch[..got]);
            if wrote < got {
                error!("ring buffer short write for client {:?}", client.ip());
                to_disconnect.push(idx - 1);
            }
        }

        // Parse phase: one ReadLine per connected client per pass.
        for (i, client) in clients.iter().enumerate() {
            if to_disconnect.contains(&i) || !client.is_connected() {
                continue;
            }
            let mut scratch = [0u8; SCRATCH_SIZE];
            match client.buffer.read_line(&mut scratch) {
                Err(RbError::Truncated) => {
                    warn!("client {:?} line too long, disconnecting", client.ip());
                    to_disconnect.push(i);
                }
                Ok(None) => {
                    let is_raw = client.is_raw();
                    if is_raw {
                        continue;
                    }
                    let (is_post, body_ready) = {
                        let state = client.state.lock().unwrap();
                        let ready = state.mode == ProtocolMode::Post
                            && state.blank_line_seen
                            && state
                                .content_length
                                .map(|len| client.buffer.data_len() >= len)
                                .unwrap_or(false);
                        (state.mode == ProtocolMode::Post, ready)
                    };
                    if is_post && body_ready {
                        let len = client.state.lock().unwrap().content_length.unwrap();
                        let mut body = vec![0u8; len];
                        client.buffer.read(&mut body);
                        let body = String::from_utf8_lossy(&body).into_owned();
                        run_body_parser(client, &table, config.default_handler.as_deref(), &body);
                        to_disconnect.push(i);
                    } else if !is_post {
                        to_disconnect.push(i);
                    }
                    // POST still awaiting its full body: wait for more reads.
                }
                Ok(Some(len)) => {
                    let mut line = &scratch[..len];
                    if line.last() == Some(&b'\r') {
                        line = &line[..line.len() - 1];
                    }
                    let line_str = String::from_utf8_lossy(line).into_owned();
                    let first_line = {
                        let mut state = client.state.lock().unwrap();
                        let first = state.line_counter == 0;
                        state.line_counter += 1;
                        first
                    };
                    let non_raw_blank = {
                        let state = client.state.lock().unwrap();
                        line_str.is_empty() && !state.mode.is_raw()
                    };
                    if non_raw_blank {
                        client.state.lock().unwrap().blank_line_seen = true;
                        continue;
                    }
                    if first_line {
                        let mode = protocol::detect_method(&line_str);
                        client.state.lock().unwrap().mode = mode;
                        if mode != ProtocolMode::Raw {
                            if mode == ProtocolMode::Get {
                                if let Some(query) = protocol::extract_get_query(&line_str) {
                                    let query = query.to_string();
                                    run_body_parser(client, &table, config.default_handler.as_deref(), &query);
                                }
                                to_disconnect.push(i);
                            }
                            continue;
                        }
                        // fall through to the raw command parser below
                    } else if !client.is_raw() {
                        if let Some(n) = protocol::parse_content_length(&line_str) {
                            client.state.lock().unwrap().content_length = Some(n);
                        }
                        continue;
                    }
                    let outcome = parse_key_value(&line_str);
                    if let ParseOutcome::NoKey = outcome {
                        continue;
                    }
                    let (key, value) = match &outcome {
                        ParseOutcome::KeyOnly(k) => (k.as_str(), None),
                        ParseOutcome::KeyValue(k, v) => (k.as_str(), Some(v.as_str())),
                        ParseOutcome::NoKey => unreachable!(),
                    };
                    let result = table.dispatch(
                        client.as_ref(),
                        key,
                        value,
                        config.default_handler.as_deref(),
                    );
                    lines_processed.fetch_add(1, Ordering::Relaxed);
                    if let Some(text) = result.reply_text() {
                        client.send_str(text);
                    }
                }
            }
        }

        // Disconnect phase: compact by swap-removal, highest index first
        // so earlier indices in `to_disconnect` stay valid. `flush_http_response`
        // and the rest of the per-client teardown only touch that client's own
        // mutex, so they run before re-locking the table for the swap-removal
        // itself; nothing here re-enters a handler, so holding the table guard
        // for this part is safe.
        to_disconnect.sort_unstable();
        to_disconnect.dedup();
        for &idx in to_disconnect.iter().rev() {
            let client = &clients[idx];
            client.mark_disconnected();
            if !client.is_raw() {
                client.flush_http_response();
            }
            {
                let _guard = client.stream.lock().unwrap();
                unsafe {
                    libc::close(client.fd);
                }
            }
            client.buffer.clear();
            callbacks.on_disconnect(client.ip());
            info!("client {:?} disconnected", client.ip());
        }
        if !to_disconnect.is_empty() {
            let mut table_guard = clients_table.lock().unwrap();
            for &idx in to_disconnect.iter().rev() {
                table_guard.swap_remove(idx);
            }
        }
    }

    for client in clients_table.lock().unwrap().iter() {
        client.mark_disconnected();
        let _guard = client.stream.lock().unwrap();
        unsafe {
            libc::close(client.fd);
        }
    }
    info!(
        "server dispatcher shut down, {} lines processed",
        lines_processed.load(Ordering::Relaxed)
    );
    Ok(())
}

/// URL-decodes each `&`-delimited segment of a GET query or POST body
/// and feeds it through the line parser, skipping the bare
/// `favicon.ico` target a browser tab issues unprompted.
fn run_body_parser(
    client: &Arc<ClientSlot>,
    table: &HandlerTable,
    default: Option<&DefaultHandlerFn>,
    body: &str,
) {
    if body == "favicon.ico" {
        return;
    }
    for segment in protocol::split_segments(body) {
        let decoded = protocol::url_decode(segment);
        let outcome = parse_key_value(&decoded);
        let (key, value) = match &outcome {
            ParseOutcome::NoKey => continue,
            ParseOutcome::KeyOnly(k) => (k.as_str(), None),
            ParseOutcome::KeyValue(k, v) => (k.as_str(), Some(v.as_str())),
        };
        let result = table.dispatch(client.as_ref(), key, value, default);
        if let Some(text) = result.reply_text() {
            client.send_str(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener as StdTcpListener;

    #[test]
    fn noop_callbacks_accept_everything() {
        let cb = NoopCallbacks;
        assert!(cb.on_new_client(Some("127.0.0.1")));
    }

    /// Builds one connected `ClientSlot` backed by a real loopback
    /// socket pair, so `Broadcaster::send_all` can be exercised against
    /// a genuine writable fd rather than a mock.
    fn connected_slot() -> (Arc<ClientSlot>, std::net::TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = std::net::TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let slot = Arc::new(ClientSlot::new(Stream::Inet(server_side), 4096));
        (slot, client_side)
    }

    #[test]
    fn send_all_reaches_every_connected_client_and_skips_disconnected_ones() {
        let clients: Arc<Mutex<Vec<Arc<ClientSlot>>>> = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = Broadcaster {
            clients: Arc::clone(&clients),
        };

        let (slot_a, mut reader_a) = connected_slot();
        let (slot_b, mut reader_b) = connected_slot();
        let (slot_c, _reader_c) = connected_slot();
        slot_c.mark_disconnected(); // simulates a client that dropped since the last poll

        clients.lock().unwrap().push(Arc::clone(&slot_a));
        clients.lock().unwrap().push(Arc::clone(&slot_b));
        clients.lock().unwrap().push(Arc::clone(&slot_c));

        let sent = broadcaster.send_all(b"shout=hi\n");
        assert_eq!(sent, 2); // the disconnected slot is skipped

        let mut buf = [0u8; 16];
        let n = reader_a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"shout=hi\n");
        let n = reader_b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"shout=hi\n");
    }
}
