//! Ingress/egress networking and dispatch core for the gatehouse matching
//! gateway: wire types, lock-free queues, TCP framing, the binary/CSV
//! codecs, the symbol router, and the TCP/UDP client registries.
//!
//! The matching engine itself is out of scope (see [`engine::MatchingEngine`]);
//! this crate only ships a deterministic stub used by tests and `gatehouse bench`.

pub mod codec;
pub mod engine;
pub mod error;
pub mod framing;
pub mod output_router;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod router;
pub mod stats;
pub mod tcp_listener;
pub mod types;
pub mod udp_receiver;
