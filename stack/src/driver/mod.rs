// SHOAL — POLL-MODE NIC DRIVER ADAPTER
// Per-core RX/TX queues over a poll-mode driver surface. Bridges driver
// buffers (mbufs) and packet buffers in both directions: polled RX wraps a
// driver buffer zero-copy with a release hook returning it to the pool;
// TX copies packet fragments into a driver-buffer cluster.
//
// Submodules:
//   mbuf   — fixed per-core buffer pool, index handles, chain metadata
//   port   — NicPort trait (the PMD surface), port configure, loopback port
//   queue  — the per-core adapter: poll_rx_once / send

pub mod mbuf;
pub mod port;
pub mod queue;

// ============================================================================
// DRIVER CONSTANTS
// ============================================================================

/// Usable bytes per driver buffer.
pub const MBUF_DATA_SIZE: usize = 2048;
/// Buffers backing one queue's RX ring; the pool holds twice this so TX has
/// the same amount to draw from.
pub const MBUFS_PER_QUEUE: usize = 1536;
/// Per-core cache depth a real mempool would use. Kept for configuration
/// parity with the PMD.
pub const MBUF_CACHE_SIZE: usize = 512;

pub const RX_RING_SIZE: u16 = 512;
pub const TX_RING_SIZE: u16 = 512;

/// Scatter limit: 2 KiB × 32 = 64 KiB, the max TSO/LRO frame. Packets with
/// more fragments are linearized before TX.
pub const MAX_FRAGS: usize = 32;
/// RX burst drained per poll.
pub const RX_BURST_SIZE: usize = 32;

// ============================================================================
// OFFLOAD FLAG BITS (mbuf.ol_flags)
// ============================================================================

pub const PKT_RX_VLAN: u64 = 1 << 0;
pub const PKT_RX_IP_CKSUM_BAD: u64 = 1 << 1;
pub const PKT_RX_L4_CKSUM_BAD: u64 = 1 << 2;

pub const PKT_TX_IP_CKSUM: u64 = 1 << 8;
pub const PKT_TX_TCP_CKSUM: u64 = 1 << 9;
pub const PKT_TX_UDP_CKSUM: u64 = 1 << 10;

// ============================================================================
// DEVICE CAPABILITY BITS
// ============================================================================

pub const DEV_RX_OFFLOAD_VLAN_STRIP: u64 = 1 << 0;
pub const DEV_RX_OFFLOAD_IPV4_CKSUM: u64 = 1 << 1;
pub const DEV_RX_OFFLOAD_UDP_CKSUM: u64 = 1 << 2;
pub const DEV_RX_OFFLOAD_TCP_CKSUM: u64 = 1 << 3;

pub const DEV_TX_OFFLOAD_IPV4_CKSUM: u64 = 1 << 0;
pub const DEV_TX_OFFLOAD_UDP_CKSUM: u64 = 1 << 1;
pub const DEV_TX_OFFLOAD_TCP_CKSUM: u64 = 1 << 2;
pub const DEV_TX_OFFLOAD_TCP_TSO: u64 = 1 << 3;
pub const DEV_TX_OFFLOAD_UDP_TSO: u64 = 1 << 4;

// ============================================================================
// RSS HASH FUNCTION BITS
// ============================================================================

pub const ETH_RSS_IPV4: u64 = 1 << 0;
pub const ETH_RSS_IPV4_TCP: u64 = 1 << 1;
pub const ETH_RSS_IPV4_UDP: u64 = 1 << 2;
