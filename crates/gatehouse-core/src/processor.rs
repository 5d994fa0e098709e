//! Processor (component E): one thread per matching shard, pulling batches
//! of `InputEnvelope` off its input queues, calling the matching-engine
//! collaborator serially, and pushing the resulting `OutputEnvelope`s onto
//! its output queue.
//!
//! Each `InputQueue` is a true single-producer ring (§3), and a shard has
//! two independent ingress feeders — the TCP listener and the UDP receiver —
//! so a shard's processor owns *two* input consumers, not one: `inputs[0]`
//! is fed exclusively by the TCP listener, `inputs[1]` exclusively by the
//! UDP receiver. It drains them in round-robin, one full batch each per
//! iteration, the same two-source round-robin the output router (component
//! G) already uses for its own pair of queues. Ordering is only guaranteed
//! within a single source (spec §8: "if envelopes with sequences s1 < s2 are
//! enqueued by the ingress thread, the processor consumes them in that
//! order"); TCP/UDP interleaving is not ordered relative to each other.
//!
//! Nothing is shared between the two shard threads at this level — each
//! owns its queue handles and its own `MatchingEngine` instance outright
//! (§4.6, §9 "dual-thread processors sharing nothing").

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;

use crate::engine::MatchingEngine;
use crate::queue::{Consumer, Producer};
use crate::stats::GatewayStats;
use crate::types::{InputEnvelope, OutputEnvelope, OutputMessage, BROADCAST};

/// Per-client responses (`Ack`/`CancelAck`) are addressed to the envelope's
/// originating client; `Trade`/`TopOfBook` are the broadcast market-data
/// stream (spec §1: "per-client responses plus a broadcast market-data
/// stream") and are addressed to [`BROADCAST`] so the output router fans
/// them to every connected client and to multicast, not just the order's
/// submitter.
fn route_client_id(msg: &OutputMessage, originating_client: u32) -> u32 {
    match msg {
        OutputMessage::Ack { .. } | OutputMessage::CancelAck { .. } => originating_client,
        OutputMessage::Trade { .. } | OutputMessage::TopOfBook { .. } => BROADCAST,
    }
}

/// Up to this many envelopes are pulled off the input queue per loop
/// iteration before the engine is given a chance to run (spec §4.6).
pub const PROCESSOR_BATCH_SIZE: usize = 64;
/// Empty-dequeue iterations to busy/spin through before falling back to a
/// periodic sleep (spec §4.6's "short spin ... then longer sleep").
const IDLE_THRESHOLD: u32 = 1_000;
const IDLE_SLEEP: std::time::Duration = std::time::Duration::from_micros(100);
/// Retry-with-yield bound for a full output queue before logging and
/// dropping (spec §4.6).
const OUTPUT_RETRY_ITERS: u32 = 1_000;

pub struct ProcessorComponent {
    shard: usize,
    /// `[0]` = fed by the TCP listener, `[1]` = fed by the UDP receiver.
    inputs: [Consumer<InputEnvelope>; 2],
    output: Producer<OutputEnvelope>,
    engine: Box<dyn MatchingEngine>,
    stats: Arc<GatewayStats>,
    shutdown: Arc<AtomicBool>,
    next_sequence: u64,
    idle_iters: u32,
    /// Envelopes pulled off an input queue per source, per loop iteration
    /// (spec §4.6); defaults to [`PROCESSOR_BATCH_SIZE`] but can be
    /// overridden by `dispatch.processor_batch_size` in `gatehouse.toml`.
    batch_size: usize,
}

impl ProcessorComponent {
    pub fn new(
        shard: usize,
        inputs: [Consumer<InputEnvelope>; 2],
        output: Producer<OutputEnvelope>,
        engine: Box<dyn MatchingEngine>,
        stats: Arc<GatewayStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self::with_batch_size(shard, inputs, output, engine, stats, shutdown, PROCESSOR_BATCH_SIZE)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_batch_size(
        shard: usize,
        inputs: [Consumer<InputEnvelope>; 2],
        output: Producer<OutputEnvelope>,
        engine: Box<dyn MatchingEngine>,
        stats: Arc<GatewayStats>,
        shutdown: Arc<AtomicBool>,
        batch_size: usize,
    ) -> Self {
        Self { shard, inputs, output, engine, stats, shutdown, next_sequence: 0, idle_iters: 0, batch_size }
    }

    /// Runs until `shutdown` is observed, then drains the input queue once
    /// more (processing whatever arrived before the flag was set) before
    /// returning (spec §4.6).
    pub fn run(&mut self) {
        tracing::info!(shard = self.shard, "processor started");
        while !self.shutdown.load(Relaxed) {
            self.run_one_iteration();
        }
        self.drain_once();
        tracing::info!(shard = self.shard, "processor stopped");
    }

    fn run_one_iteration(&mut self) {
        let mut any = false;
        for source in 0..2 {
            let mut batch = Vec::with_capacity(self.batch_size);
            let n = self.inputs[source].dequeue_batch(&mut batch, self.batch_size);
            if n == 0 {
                continue;
            }
            any = true;
            self.stats.poll_full.fetch_add(1, Relaxed);
            self.process_batch(batch);
        }
        if any {
            self.idle_iters = 0;
        } else {
            self.stats.poll_empty.fetch_add(1, Relaxed);
            self.idle_backoff();
        }
    }

    fn idle_backoff(&mut self) {
        if self.idle_iters < IDLE_THRESHOLD {
            self.idle_iters += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    fn process_batch(&mut self, batch: Vec<InputEnvelope>) {
        for env in batch {
            let outs = self.engine.process(&env.msg);
            for msg in outs {
                self.next_sequence += 1;
                let target = route_client_id(&msg, env.client_id);
                let out_env = OutputEnvelope::new(msg, target, self.next_sequence);
                match self.output.enqueue_retrying(out_env, OUTPUT_RETRY_ITERS) {
                    Ok(()) => {}
                    Err(_) => {
                        tracing::warn!(shard = self.shard, "output queue persistently full, dropping");
                        self.stats.messages_dropped_queue_full.fetch_add(1, Relaxed);
                    }
                }
            }
        }
    }

    /// Bounded final drain on shutdown: process whatever is already queued,
    /// once, then return. Mirrors the output router's bounded drain (§4.7)
    /// rather than looping until empty, since under sustained load the
    /// input queue could otherwise never go empty.
    fn drain_once(&mut self) {
        for source in 0..2 {
            loop {
                let mut batch = Vec::with_capacity(self.batch_size);
                let n = self.inputs[source].dequeue_batch(&mut batch, self.batch_size);
                if n == 0 {
                    break;
                }
                self.process_batch(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SpscRing;
    use crate::types::{InputMessage, Side, Symbol};
    use std::sync::atomic::AtomicBool;

    fn new_order(symbol: &str) -> InputEnvelope {
        InputEnvelope::new(
            InputMessage::NewOrder {
                user_id: 1,
                symbol: Symbol::from_str_padded(symbol),
                price: 100,
                quantity: 50,
                side: Side::Buy,
                user_order_id: 1,
            },
            1,
            crate::types::TransportAddr::ZERO,
            1,
        )
    }

    #[test]
    fn ordering_within_shard_is_preserved_into_output_queue() {
        let (in_p, in_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (_udp_p, udp_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (out_p, out_c) = SpscRing::<OutputEnvelope>::new(16).split();
        let stats = GatewayStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut proc = ProcessorComponent::new(
            0,
            [in_c, udp_c],
            out_p,
            Box::new(crate::engine::StubEngine::new()),
            stats,
            shutdown,
        );

        in_p.enqueue(new_order("IBM")).unwrap();
        let mut e2 = new_order("IBM");
        e2.msg = InputMessage::NewOrder {
            user_id: 1,
            symbol: Symbol::from_str_padded("IBM"),
            price: 100,
            quantity: 50,
            side: Side::Sell,
            user_order_id: 2,
        };
        in_p.enqueue(e2).unwrap();

        proc.run_one_iteration();

        // Ack, Ack, Trade, TOB x2, TOB x2 — first output must be the Ack for order 1.
        let first = out_c.dequeue().unwrap();
        assert!(matches!(first.msg, crate::types::OutputMessage::Ack { user_order_id: 1, .. }));
        assert_eq!(first.client_id, 1);
        assert_eq!(first.sequence, 1);

        let trade = std::iter::from_fn(|| out_c.dequeue())
            .find(|e| matches!(e.msg, crate::types::OutputMessage::Trade { .. }))
            .expect("a trade was produced");
        assert_eq!(trade.client_id, crate::types::BROADCAST, "trades are market data, not a per-client reply");
    }

    #[test]
    fn with_batch_size_caps_envelopes_drained_per_iteration() {
        let (in_p, in_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (_udp_p, udp_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (out_p, _out_c) = SpscRing::<OutputEnvelope>::new(64).split();
        let stats = GatewayStats::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut proc = ProcessorComponent::with_batch_size(
            0,
            [in_c, udp_c],
            out_p,
            Box::new(crate::engine::StubEngine::new()),
            stats,
            shutdown,
            2,
        );
        for i in 0..5u32 {
            let mut env = new_order("IBM");
            env.msg = InputMessage::NewOrder {
                user_id: 1,
                symbol: Symbol::from_str_padded("IBM"),
                price: 100,
                quantity: 50,
                side: Side::Buy,
                user_order_id: i + 1,
            };
            in_p.enqueue(env).unwrap();
        }

        proc.run_one_iteration();
        assert_eq!(in_p.len(), 3, "only the configured batch size of 2 should drain in one iteration");
    }

    #[test]
    fn drain_once_processes_queued_input_after_shutdown_is_set() {
        let (in_p, in_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (_udp_p, udp_c) = SpscRing::<InputEnvelope>::new(16).split();
        let (out_p, out_c) = SpscRing::<OutputEnvelope>::new(16).split();
        let stats = GatewayStats::new();
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut proc = ProcessorComponent::new(
            0,
            [in_c, udp_c],
            out_p,
            Box::new(crate::engine::StubEngine::new()),
            stats,
            shutdown,
        );
        in_p.enqueue(new_order("IBM")).unwrap();
        proc.run();
        assert!(out_c.dequeue().is_some());
    }
}
