// SHOAL — CRATE ROOT (LIBRARY)
// Shared-nothing per-core IPv4 stack with a poll-mode NIC driver adapter.
//
// Module hierarchy:
//   packet/  — multi-fragment zero-copy packet, release hooks, offload info
//   driver/  — mbuf pool, poll-mode port surface, per-core RX/TX queue adapter
//   engine/  — monotonic clock, one-shot timer, cross-core message passing
//   net/     — wire formats, Toeplitz RSS, L4 registry, ARP contract,
//              packet filter, reassembly, the IPv4 engine, ICMP and UDP
//
// One core owns one of everything: pool, queue, engine, reassembly table.
// The only cross-core traffic is an explicit inbox submit, and any packet
// that crosses has its release hook re-homed to the origin core first.

pub mod driver;
pub mod engine;
pub mod net;
pub mod packet;
