//! Wires the seven hot-path components (TCP listener, UDP receiver, two
//! processors, output router) together against one shared [`GatewayStats`]
//! and one shared shutdown flag, in the dependency order SPEC_FULL.md §2
//! gives: queues first, then the two ingress components, then the
//! processors, then the output router.
//!
//! Each ingress component is the sole producer for its own pair of input
//! rings (spec §3's SPSC invariant forbids sharing a producer side between
//! the TCP listener and the UDP receiver), so each shard's processor reads
//! two independent input queues — one TCP-fed, one UDP-fed — round-robin.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use gatehouse_core::engine::{MatchingEngine, StubEngine};
use gatehouse_core::output_router::{MulticastConfig, OutputRouterComponent, OutputRouterConfig};
use gatehouse_core::processor::ProcessorComponent;
use gatehouse_core::queue::SpscRing;
use gatehouse_core::stats::GatewayStats;
use gatehouse_core::tcp_listener::{TcpListenerComponent, TcpListenerConfig};
use gatehouse_core::types::{InputEnvelope, OutputEnvelope};
use gatehouse_core::udp_receiver::{UdpReceiverComponent, UdpReceiverConfig};

use crate::config::GatewayConfig;

/// Datagrams between eviction sweeps of the UDP client registry. Not
/// exposed in `gatehouse.toml` — the sweep is an internal maintenance
/// detail, not a tunable the spec names.
const UDP_EVICTION_SWEEP_EVERY: u64 = 4096;
/// Inbound TCP frame cap (spec §6 `MAX_PAYLOAD`).
const MAX_TCP_PAYLOAD: usize = 2 * 1024 * 1024;

/// A fully wired, running pipeline. Dropping this does not stop the
/// threads — call [`GatewayHandle::shutdown`] and then [`GatewayHandle::join`].
pub struct GatewayHandle {
    pub stats: Arc<GatewayStats>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn join(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

/// Construct and launch the full pipeline on background threads, using
/// `engine_factory` to build one [`MatchingEngine`] per shard (tests and
/// `gatehouse bench` use [`StubEngine`]; the real matching engine is out of
/// scope, spec §1).
pub fn spawn(
    config: &GatewayConfig,
    engine_factory: impl Fn() -> Box<dyn MatchingEngine>,
) -> anyhow::Result<GatewayHandle> {
    let stats = GatewayStats::new();
    let shutdown = Arc::new(AtomicBool::new(false));
    let outbound_protocol = config.dispatch.outbound_protocol()?;

    let (tcp_p0, tcp_c0) = SpscRing::<InputEnvelope>::new(config.dispatch.input_queue_capacity).split();
    let (tcp_p1, tcp_c1) = SpscRing::<InputEnvelope>::new(config.dispatch.input_queue_capacity).split();
    let (udp_p0, udp_c0) = SpscRing::<InputEnvelope>::new(config.dispatch.input_queue_capacity).split();
    let (udp_p1, udp_c1) = SpscRing::<InputEnvelope>::new(config.dispatch.input_queue_capacity).split();
    let (out_p0, out_c0) = SpscRing::<OutputEnvelope>::new(config.dispatch.output_queue_capacity).split();
    let (out_p1, out_c1) = SpscRing::<OutputEnvelope>::new(config.dispatch.output_queue_capacity).split();

    let mut tcp_listener = TcpListenerComponent::bind(
        TcpListenerConfig {
            port: config.tcp.port,
            backlog: config.tcp.backlog,
            quickack: config.tcp.quickack,
            busy_poll_us: config.tcp.busy_poll_us,
            max_clients: config.tcp.max_clients,
            bufsz: config.tcp.bufsz,
            max_payload: MAX_TCP_PAYLOAD,
            output_queue_capacity: config.dispatch.output_queue_capacity,
            outbound_protocol,
        },
        [tcp_p0, tcp_p1],
        stats.clone(),
        shutdown.clone(),
    )?;
    let tcp_registry = tcp_listener.registry();

    let mut udp_receiver = UdpReceiverComponent::bind(
        UdpReceiverConfig {
            port: config.udp.port,
            max_clients: config.udp.max_clients,
            client_timeout_secs: config.udp.client_timeout_secs,
            eviction_sweep_every: UDP_EVICTION_SWEEP_EVERY,
        },
        [udp_p0, udp_p1],
        stats.clone(),
        shutdown.clone(),
    )?;
    let udp_registry = udp_receiver.registry();
    let udp_reply_socket = udp_receiver.try_clone_socket()?;

    let multicast = config.multicast.enabled.then_some(MulticastConfig {
        group: config.multicast.group,
        port: config.multicast.port,
        ttl: config.multicast.ttl,
        loopback: config.multicast.loopback,
        interface: config.multicast.interface,
    });

    let mut output_router = OutputRouterComponent::new(
        [out_c0, out_c1],
        tcp_registry,
        udp_registry,
        udp_reply_socket,
        OutputRouterConfig { outbound_protocol, multicast, batch_size: config.dispatch.output_batch_size },
        stats.clone(),
        shutdown.clone(),
    )?;

    let mut processor0 = ProcessorComponent::with_batch_size(
        0,
        [tcp_c0, udp_c0],
        out_p0,
        engine_factory(),
        stats.clone(),
        shutdown.clone(),
        config.dispatch.processor_batch_size,
    );
    let mut processor1 = ProcessorComponent::with_batch_size(
        1,
        [tcp_c1, udp_c1],
        out_p1,
        engine_factory(),
        stats.clone(),
        shutdown.clone(),
        config.dispatch.processor_batch_size,
    );

    let threads = vec![
        std::thread::Builder::new().name("tcp-listener".into()).spawn(move || tcp_listener.run())?,
        std::thread::Builder::new().name("udp-receiver".into()).spawn(move || udp_receiver.run())?,
        std::thread::Builder::new().name("processor-0".into()).spawn(move || processor0.run())?,
        std::thread::Builder::new().name("processor-1".into()).spawn(move || processor1.run())?,
        std::thread::Builder::new().name("output-router".into()).spawn(move || output_router.run())?,
    ];

    Ok(GatewayHandle { stats, shutdown, threads })
}

/// Builds the `StubEngine` collaborator `gatehouse run`/`gatehouse bench` use
/// (the real matching engine is out of scope, spec §1).
pub fn stub_engine_factory() -> Box<dyn MatchingEngine> {
    Box::new(StubEngine::new())
}
