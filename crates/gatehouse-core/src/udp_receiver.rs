//! UDP Receiver (component B): one bound unicast socket, identifying
//! clients by source address, parsing possibly-multi-message datagrams, and
//! dispatching onto the two matching shards.
//!
//! Socket setup reuses this codebase's `socket2`-based construction idiom
//! (bind, best-effort `SO_RCVBUFFORCE` with a warning-logged fallback to
//! plain `SO_RCVBUF`) adapted from multicast ingest to a unicast inbound
//! socket; no multicast join happens here (multicast is outbound-only, see
//! the output router).

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use socket2::{Domain, Socket, Type};

use crate::codec::{self, detect_protocol};
use crate::queue::Producer;
use crate::registry::UdpRegistry;
use crate::router::{self, Route};
use crate::stats::GatewayStats;
use crate::types::{InputEnvelope, TransportAddr};

/// `SO_RCVTIMEO`, matching the TCP listener's readiness wait (spec §4.5).
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Retry-with-yield bound before a full input queue is counted as a drop (spec §4.5).
const ENQUEUE_RETRY_ITERS: u32 = 1000;
const RECV_BUF_WANTED: usize = 4 * 1024 * 1024;
/// Datagram scratch buffer; UDP payloads here are order messages, not MTU-sized shreds.
const DATAGRAM_CAP: usize = 65_536;

pub struct UdpReceiverConfig {
    pub port: u16,
    pub max_clients: usize,
    pub client_timeout_secs: i64,
    /// How often (in received datagrams) to sweep `evict_inactive`. The UDP
    /// registry is single-writer (this thread); folding the periodic sweep
    /// into the same loop avoids handing a second thread write access.
    pub eviction_sweep_every: u64,
}

pub struct UdpReceiverComponent {
    socket: Socket,
    registry: Arc<Mutex<UdpRegistry>>,
    input: [Producer<InputEnvelope>; 2],
    stats: Arc<GatewayStats>,
    shutdown: Arc<AtomicBool>,
    config: UdpReceiverConfig,
    next_sequence: u64,
    datagrams_since_sweep: u64,
}

impl UdpReceiverComponent {
    pub fn bind(
        config: UdpReceiverConfig,
        input: [Producer<InputEnvelope>; 2],
        stats: Arc<GatewayStats>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        #[cfg(target_os = "linux")]
        {
            use std::mem::size_of;
            use std::os::unix::io::AsRawFd;
            let fd = socket.as_raw_fd();
            let buf_val = RECV_BUF_WANTED as libc::c_int;
            let force_ok = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUFFORCE,
                    &buf_val as *const _ as *const libc::c_void,
                    size_of::<libc::c_int>() as libc::socklen_t,
                ) == 0
            };
            if !force_ok {
                socket.set_recv_buffer_size(RECV_BUF_WANTED).ok();
                if let Ok(actual) = socket.recv_buffer_size() {
                    if actual < RECV_BUF_WANTED / 2 {
                        tracing::warn!(
                            actual_kb = actual / 1024,
                            wanted_kb = RECV_BUF_WANTED / 1024,
                            "udp recv buffer smaller than requested; run as root or raise net.core.rmem_max",
                        );
                    }
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        socket.set_recv_buffer_size(RECV_BUF_WANTED).ok();

        tracing::info!(port = config.port, max_clients = config.max_clients, "udp receiver bound");
        let registry = Arc::new(Mutex::new(UdpRegistry::new(config.max_clients)));
        Ok(Self { socket, registry, input, stats, shutdown, config, next_sequence: 0, datagrams_since_sweep: 0 })
    }

    /// Shared with the output router, which needs short critical sections to
    /// resolve a UDP client id back to a `TransportAddr` for replies.
    pub fn registry(&self) -> Arc<Mutex<UdpRegistry>> {
        self.registry.clone()
    }

    /// A second handle onto the same bound socket, for the output router to
    /// `send_to` direct per-client UDP replies without taking this
    /// receiver's `recv_from` loop off its own thread.
    pub fn try_clone_socket(&self) -> std::io::Result<Socket> {
        self.socket.try_clone()
    }

    pub fn run(&mut self) {
        let mut buf = [0u8; DATAGRAM_CAP];
        while !self.shutdown.load(Relaxed) {
            let (n, addr) = match self.socket.recv_from(unsafe {
                std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len())
            }) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv_from failed");
                    continue;
                }
            };
            let Some(addr_v4) = addr.as_socket_ipv4() else {
                tracing::warn!("dropping datagram from non-IPv4 peer {addr:?}");
                continue;
            };
            self.stats.rx_packets.fetch_add(1, Relaxed);
            self.stats.rx_bytes.fetch_add(n as u64, Relaxed);
            self.handle_datagram(&buf[..n], TransportAddr::from_socket_addr(addr_v4));
            self.maybe_sweep_inactive();
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8], addr: TransportAddr) {
        if datagram.is_empty() {
            return;
        }
        let protocol = detect_protocol(datagram[0]);
        let now = now_secs();
        let client_id = self.registry.lock().unwrap().lookup_or_insert(addr, protocol, now);
        self.stats.active_clients.store(self.registry.lock().unwrap().active_count(), Relaxed);

        let mut cursor = 0usize;
        while cursor < datagram.len() {
            let (parsed, consumed) = codec::parse_one(&datagram[cursor..]);
            cursor += consumed.max(1);
            let msg = match parsed {
                Ok(msg) => msg,
                Err(_) => {
                    self.stats.parse_errors.fetch_add(1, Relaxed);
                    continue;
                }
            };
            // UDP clients have no separate login step; the client id the
            // registry just assigned from the source address *is* the
            // admission identity, so there is no admission check to perform
            // here (unlike TCP's declared-user-id check, spec §4.5).
            self.next_sequence += 1;
            let envelope = InputEnvelope::new(msg, client_id, addr, self.next_sequence);
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
    }

    fn dispatch(&self, shard: usize, envelope: InputEnvelope) {
        match self.input[shard].enqueue_retrying(envelope, ENQUEUE_RETRY_ITERS) {
            Ok(()) => self.stats.record_dispatch(shard),
            Err(_) => {
                self.stats.queue_full_drops.fetch_add(1, Relaxed);
            }
        }
    }

    fn maybe_sweep_inactive(&mut self) {
        self.datagrams_since_sweep += 1;
        if self.datagrams_since_sweep < self.config.eviction_sweep_every {
            return;
        }
        self.datagrams_since_sweep = 0;
        let now = now_secs();
        let evicted = self.registry.lock().unwrap().evict_inactive(self.config.client_timeout_secs, now);
        if evicted > 0 {
            tracing::debug!(evicted, "udp registry eviction sweep");
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
