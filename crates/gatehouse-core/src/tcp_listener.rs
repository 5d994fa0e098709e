//! TCP Listener (component A): accept, frame, parse, admission-check, and
//! dispatch inbound TCP traffic onto the two matching shards; write queued
//! outbound replies back out on the same sockets.
//!
//! Readiness multiplexing uses `epoll` on Linux (level-triggered for the
//! listen fd, edge-triggered for client fds) with a portable non-blocking
//! poll loop as the fallback on other Unixes, mirroring this codebase's
//! existing `#[cfg(target_os = "linux")]` / fallback split in the UDP
//! receiver.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener as StdTcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::codec::{self, Protocol};
use crate::framing::{FrameResult, ReadState, WriteState};
use crate::queue::{Consumer, Producer};
use crate::registry::TcpRegistry;
use crate::router::{self, Route};
use crate::stats::GatewayStats;
use crate::types::{InputEnvelope, OutputMessage, TransportAddr};

/// Per-connection output handle stashed in the TCP registry: the output
/// router enqueues onto this from its own thread, the listener thread
/// dequeues it to drive the socket write side.
pub type TcpSlotHandle = Producer<OutputMessage>;

/// Bound configuration for the TCP listener (spec §4.3 / §6).
pub struct TcpListenerConfig {
    pub port: u16,
    pub backlog: i32,
    pub quickack: bool,
    pub busy_poll_us: u32,
    pub max_clients: usize,
    pub bufsz: usize,
    pub max_payload: usize,
    pub output_queue_capacity: usize,
    pub outbound_protocol: Protocol,
}

/// Up to 64 `extract` calls per readable client per readiness iteration
/// (spec §4.3), bounding how much work one client's backlog can monopolize.
const MAX_FRAMES_PER_ITER: usize = 64;
/// Readiness wait timeout, matching the UDP receiver's `SO_RCVTIMEO` (spec §4.3/§4.5).
const READINESS_TIMEOUT: Duration = Duration::from_millis(100);

struct Connection {
    stream: TcpStream,
    id: u32,
    read_state: ReadState,
    write_state: WriteState,
    out_consumer: Consumer<OutputMessage>,
    encode_buf: Vec<u8>,
}

pub struct TcpListenerComponent {
    listener: StdTcpListener,
    registry: Arc<TcpRegistry<TcpSlotHandle>>,
    input: [Producer<InputEnvelope>; 2],
    stats: Arc<GatewayStats>,
    shutdown: Arc<AtomicBool>,
    config: TcpListenerConfig,
    connections: HashMap<RawFd, Connection>,
    next_sequence: u64,
    #[cfg(target_os = "linux")]
    epoll_fd: RawFd,
}

impl TcpListenerComponent {
    /// Bind and listen, applying the socket options named in spec §4.3.
    /// State machine: `Idle -> Listening` happens here; `new` returning `Ok`
    /// means the listener is already `Listening`.
    pub fn bind(
        config: TcpListenerConfig,
        input: [Producer<InputEnvelope>; 2],
        stats: Arc<GatewayStats>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.set_reuse_port(true) {
            tracing::warn!(error = %e, "SO_REUSEPORT unavailable, continuing without it");
        }
        let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        socket.set_nonblocking(true)?;
        let listener: StdTcpListener = socket.into();

        let registry = Arc::new(TcpRegistry::new(config.max_clients));
        tracing::info!(port = config.port, max_clients = config.max_clients, "tcp listener bound");

        Ok(Self {
            listener,
            registry,
            input,
            stats,
            shutdown,
            config,
            connections: HashMap::new(),
            next_sequence: 0,
            #[cfg(target_os = "linux")]
            epoll_fd: -1,
        })
    }

    pub fn registry(&self) -> Arc<TcpRegistry<TcpSlotHandle>> {
        self.registry.clone()
    }

    /// `Listening -> Running -> Draining -> Stopped`. Runs until the shared
    /// shutdown flag is observed, then disconnects every client and returns.
    pub fn run(&mut self) {
        #[cfg(target_os = "linux")]
        self.run_epoll();
        #[cfg(not(target_os = "linux"))]
        self.run_fallback();

        self.registry.disconnect_all();
        self.connections.clear();
        tracing::info!("tcp listener stopped");
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.on_accept(stream, addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "tcp accept failed");
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: std::net::SocketAddr) {
        let std::net::SocketAddr::V4(addr_v4) = addr else {
            tracing::warn!("rejecting non-IPv4 peer {addr}");
            return;
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(error = %e, "failed to set nonblocking on accepted socket");
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "failed to set TCP_NODELAY");
        }
        if self.config.quickack {
            set_quickack_best_effort(&stream);
        }
        if self.config.busy_poll_us > 0 {
            set_busy_poll_best_effort(&stream, self.config.busy_poll_us);
        }

        let (out_producer, out_consumer) = crate::queue::SpscRing::new(
            self.config.output_queue_capacity.next_power_of_two().max(2),
        )
        .split();
        let transport_addr = TransportAddr::from_socket_addr(addr_v4);
        let Some(id) = self.registry.add(transport_addr, out_producer) else {
            tracing::warn!(peer = %addr, "tcp client table full, rejecting connection");
            return;
        };

        let fd = stream.as_raw_fd();
        #[cfg(target_os = "linux")]
        self.epoll_register(fd);

        self.connections.insert(
            fd,
            Connection {
                stream,
                id,
                read_state: ReadState::new(self.config.bufsz, self.config.max_payload),
                write_state: WriteState::new(self.config.bufsz),
                out_consumer,
                encode_buf: Vec::with_capacity(256),
            },
        );
        self.stats.active_clients.store(self.registry.active_count(), Relaxed);
        tracing::debug!(peer = %addr, client_id = id, "tcp client connected");
    }

    fn disconnect(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            #[cfg(target_os = "linux")]
            self.epoll_deregister(fd);
            self.registry.remove(conn.id);
            self.stats.active_clients.store(self.registry.active_count(), Relaxed);
            tracing::debug!(client_id = conn.id, "tcp client disconnected");
        }
    }

    /// Drain readable bytes and any complete frames for one connection.
    /// Returns `true` if the connection should be disconnected.
    fn service_readable(&mut self, fd: RawFd) -> bool {
        let Some(conn) = self.connections.get_mut(&fd) else { return false };
        let mut buf = [0u8; 4096];
        loop {
            match conn.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => {
                    self.stats.rx_packets.fetch_add(1, Relaxed);
                    self.stats.rx_bytes.fetch_add(n as u64, Relaxed);
                    let accepted = conn.read_state.append(&buf[..n]);
                    if accepted < n {
                        tracing::warn!(client_id = conn.id, "tcp read buffer full, disconnecting");
                        return true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(client_id = conn.id, error = %e, "tcp read error");
                    return true;
                }
            }
        }

        let client_id = conn.id;
        let mut parsed_batch = Vec::new();
        let mut frame_error = false;
        for _ in 0..MAX_FRAMES_PER_ITER {
            match conn.read_state.extract() {
                FrameResult::Ready(payload) => {
                    let (parsed, _) = codec::parse_one(payload);
                    parsed_batch.push(parsed);
                }
                FrameResult::NeedMore => break,
                FrameResult::Error(e) => {
                    tracing::debug!(client_id, error = %e, "frame error, disconnecting");
                    frame_error = true;
                    break;
                }
            }
        }
        for parsed in parsed_batch {
            self.handle_parsed(client_id, parsed);
        }
        frame_error
    }

    fn handle_parsed(&mut self, client_id: u32, parsed: Result<crate::types::InputMessage, crate::error::ParseError>) {
        let msg = match parsed {
            Ok(msg) => msg,
            Err(_) => {
                self.stats.parse_errors.fetch_add(1, Relaxed);
                return;
            }
        };
        if let Some(declared) = msg.declared_user_id() {
            if declared != client_id {
                let err = crate::error::AdmissionError { declared, client_id };
                self.stats.admission_rejects.fetch_add(1, Relaxed);
                tracing::debug!(client_id, %err, "tcp admission check failed, dropping");
                return;
            }
        }

        self.next_sequence += 1;
        let envelope = InputEnvelope::new(msg, client_id, TransportAddr::ZERO, self.next_sequence);
        match router::route(&envelope.msg) {
            Route::Shard0 => self.dispatch(0, envelope),
            Route::Shard1 => self.dispatch(1, envelope),
            Route::Both => {
                let dup = envelope.clone();
                self.dispatch(0, envelope);
                self.dispatch(1, dup);
            }
        }
    }

    fn dispatch(&self, shard: usize, envelope: InputEnvelope) {
        match self.input[shard].enqueue(envelope) {
            Ok(()) => self.stats.record_dispatch(shard),
            Err(_) => {
                self.stats.queue_full_drops.fetch_add(1, Relaxed);
            }
        }
    }

    /// Drain pending outbound messages for one connection and write as much
    /// as the socket accepts. Returns `true` if the connection should be
    /// disconnected.
    fn service_writable(&mut self, fd: RawFd) -> bool {
        let Some(conn) = self.connections.get_mut(&fd) else { return false };
        loop {
            if !conn.write_state.is_pending() {
                match conn.out_consumer.dequeue() {
                    Some(msg) => {
                        codec::encode_output(&msg, self.config.outbound_protocol, &mut conn.encode_buf);
                        if !conn.write_state.queue(&conn.encode_buf) {
                            tracing::warn!(client_id = conn.id, "outbound message too large to frame, dropping");
                            continue;
                        }
                    }
                    None => return false,
                }
            }
            match conn.stream.write(conn.write_state.remaining()) {
                Ok(0) => return true,
                Ok(n) => {
                    conn.write_state.advance(n);
                    self.stats.tx_packets.fetch_add(1, Relaxed);
                    self.stats.tx_bytes.fetch_add(n as u64, Relaxed);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    tracing::debug!(client_id = conn.id, error = %e, "tcp write error");
                    return true;
                }
            }
        }
    }

    /// Flush any ready output toward every connected socket (spec §4.3 step
    /// 1). Output can arrive on a slot's queue from the output router's
    /// thread at any time, not just in response to a read event on that
    /// fd, so this must run once per loop iteration before blocking on
    /// readiness rather than only reactively off an `EPOLLOUT` event.
    fn process_output_queues(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            if self.service_writable(fd) {
                self.disconnect(fd);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn run_fallback(&mut self) {
        self.listener
            .set_nonblocking(true)
            .expect("listener already nonblocking at bind time");
        while !self.shutdown.load(Relaxed) {
            self.process_output_queues();
            self.accept_pending();
            let fds: Vec<RawFd> = self.connections.keys().copied().collect();
            let mut idle = true;
            for fd in fds {
                if self.service_readable(fd) {
                    self.disconnect(fd);
                    idle = false;
                    continue;
                }
                if self.service_writable(fd) {
                    self.disconnect(fd);
                }
                idle = false;
            }
            if idle {
                std::thread::sleep(READINESS_TIMEOUT);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn run_epoll(&mut self) {
        let epfd = unsafe { libc::epoll_create1(0) };
        assert!(epfd >= 0, "epoll_create1 failed");
        self.epoll_fd = epfd;
        let listen_fd = self.listener.as_raw_fd();
        let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: listen_fd as u64 };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, listen_fd, &mut ev) };
        assert!(rc == 0, "epoll_ctl(ADD, listen_fd) failed");

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 256];
        while !self.shutdown.load(Relaxed) {
            self.process_output_queues();
            let n = unsafe {
                libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, READINESS_TIMEOUT.as_millis() as i32)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %err, "epoll_wait failed");
                break;
            }
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == listen_fd {
                    self.accept_pending();
                    continue;
                }
                let flags = ev.events;
                let mut drop_conn = false;
                if flags & (libc::EPOLLIN as u32) != 0 {
                    drop_conn |= self.service_readable(fd);
                }
                if !drop_conn && flags & (libc::EPOLLOUT as u32) != 0 {
                    drop_conn |= self.service_writable(fd);
                }
                if flags & (libc::EPOLLRDHUP as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
                    drop_conn = true;
                }
                if drop_conn {
                    self.disconnect(fd);
                } else {
                    // Edge-triggered: keep draining any remaining output queued
                    // since the last writable notification.
                    self.service_writable(fd);
                }
            }
        }
        unsafe { libc::close(epfd) };
        self.epoll_fd = -1;
    }

    #[cfg(target_os = "linux")]
    fn epoll_register(&self, fd: RawFd) {
        if self.epoll_fd < 0 {
            return;
        }
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc != 0 {
            tracing::warn!(error = %std::io::Error::last_os_error(), "epoll_ctl(ADD, client_fd) failed");
        }
    }

    #[cfg(target_os = "linux")]
    fn epoll_deregister(&self, fd: RawFd) {
        if self.epoll_fd < 0 {
            return;
        }
        unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    }
}

#[cfg(target_os = "linux")]
fn set_quickack_best_effort(stream: &TcpStream) {
    let fd = stream.as_raw_fd();
    let val: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "TCP_QUICKACK unavailable");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_quickack_best_effort(_stream: &TcpStream) {}

#[cfg(target_os = "linux")]
fn set_busy_poll_best_effort(stream: &TcpStream, busy_poll_us: u32) {
    let fd = stream.as_raw_fd();
    let val = busy_poll_us as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BUSY_POLL,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(error = %std::io::Error::last_os_error(), "SO_BUSY_POLL unavailable");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_busy_poll_best_effort(_stream: &TcpStream, _busy_poll_us: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SpscRing;
    use crate::types::{InputMessage, Side, Symbol};
    use std::net::TcpStream;

    fn test_config(port: u16) -> TcpListenerConfig {
        TcpListenerConfig {
            port,
            backlog: 16,
            quickack: false,
            busy_poll_us: 0,
            max_clients: 16,
            bufsz: crate::framing::DEFAULT_BUFSZ,
            max_payload: 2 * 1024 * 1024,
            output_queue_capacity: 64,
            outbound_protocol: Protocol::Csv,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn accepts_frames_and_routes_a_new_order_end_to_end() {
        let port = free_port();
        let (p0, c0) = SpscRing::<InputEnvelope>::new(64).split();
        let (_p1, _c1) = SpscRing::<InputEnvelope>::new(64).split();
        let stats = GatewayStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut listener = TcpListenerComponent::bind(test_config(port), [p0, _p1], stats.clone(), shutdown.clone()).unwrap();

        let handle = std::thread::spawn(move || {
            listener.accept_pending();
            // Run a few short fallback-style service iterations directly,
            // avoiding a dependency on the platform's readiness backend in tests.
            for _ in 0..200 {
                let fds: Vec<RawFd> = listener.connections.keys().copied().collect();
                if fds.is_empty() {
                    listener.accept_pending();
                }
                for fd in fds {
                    listener.service_readable(fd);
                }
                if listener.next_sequence > 0 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            listener
        });

        std::thread::sleep(Duration::from_millis(20));
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let line = b"N,1,IBM,100,50,B,1\n";
        let mut frame = (line.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(line);
        stream.write_all(&frame).unwrap();

        let listener = handle.join().unwrap();
        assert_eq!(listener.next_sequence, 1);
        let env = c0.dequeue().expect("envelope enqueued onto shard 0");
        assert_eq!(
            env.msg,
            InputMessage::NewOrder {
                user_id: 1,
                symbol: Symbol::from_str_padded("IBM"),
                price: 100,
                quantity: 50,
                side: Side::Buy,
                user_order_id: 1,
            }
        );
        drop(stream);
    }

    #[test]
    fn admission_mismatch_is_dropped_not_disconnected() {
        let port = free_port();
        let (p0, c0) = SpscRing::<InputEnvelope>::new(64).split();
        let (p1, _c1) = SpscRing::<InputEnvelope>::new(64).split();
        let stats = GatewayStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut listener = TcpListenerComponent::bind(test_config(port), [p0, p1], stats.clone(), shutdown).unwrap();
        listener.handle_parsed(1, Ok(InputMessage::NewOrder {
            user_id: 2,
            symbol: Symbol::from_str_padded("IBM"),
            price: 100,
            quantity: 1,
            side: Side::Buy,
            user_order_id: 1,
        }));
        assert_eq!(stats.snapshot().admission_rejects, 1);
        assert!(c0.dequeue().is_none());
    }
}
