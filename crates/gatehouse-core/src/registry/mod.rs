//! Client registries (component H): a fixed-size TCP slot array and a UDP
//! open-addressing hash table. Both hand out [`ClientId`]s; the two kinds
//! occupy disjoint ranges (`1..=0x7FFF_FFFF` for TCP, `>0x8000_0000` for
//! UDP) so a bare `ClientId` is always unambiguous.

pub mod tcp;
pub mod udp;

pub use tcp::TcpRegistry;
pub use udp::UdpRegistry;
