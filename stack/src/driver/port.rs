// SHOAL — NIC PORT SURFACE
// The poll-mode driver contract the queue adapter consumes, plus the boot
// sequence that turns device capabilities into a port configuration and a
// hardware-feature snapshot. The physical control plane (PCI probe, link
// state) lives behind the trait.

use std::collections::VecDeque;
use std::sync::Arc;

use super::mbuf::{MbufIdx, MbufPool};
use super::{
    DEV_RX_OFFLOAD_IPV4_CKSUM, DEV_RX_OFFLOAD_TCP_CKSUM, DEV_RX_OFFLOAD_UDP_CKSUM,
    DEV_RX_OFFLOAD_VLAN_STRIP, DEV_TX_OFFLOAD_IPV4_CKSUM, DEV_TX_OFFLOAD_TCP_CKSUM,
    DEV_TX_OFFLOAD_TCP_TSO, DEV_TX_OFFLOAD_UDP_CKSUM, DEV_TX_OFFLOAD_UDP_TSO, ETH_RSS_IPV4,
    ETH_RSS_IPV4_TCP, ETH_RSS_IPV4_UDP, MBUF_DATA_SIZE,
};
use crate::engine::{fatal, E_PORT_CONFIG};
use crate::net::{EthernetAddress, HwFeatures, NetError};

/// Static device limits and capability masks.
#[derive(Copy, Clone, Debug)]
pub struct PortInfo {
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_offload_capa: u64,
    pub tx_offload_capa: u64,
}

/// Applied port configuration. All features off by default.
#[derive(Copy, Clone, Debug, Default)]
pub struct PortConf {
    pub rss: bool,
    pub rss_hf: u64,
    pub hw_vlan_strip: bool,
    pub hw_ip_checksum: bool,
}

/// Poll-mode driver surface. One port, N queues; the adapter binds queue i
/// to core i.
pub trait NicPort {
    fn info(&self) -> PortInfo;
    fn mac(&self) -> EthernetAddress;
    fn configure(&mut self, num_queues: u16, conf: &PortConf) -> Result<(), NetError>;
    fn setup_queue(&mut self, qid: u16, pool: Arc<MbufPool>) -> Result<(), NetError>;
    /// Drain up to `out.len()` received buffers. Returns the count filled.
    fn rx_burst(&mut self, qid: u16, out: &mut [MbufIdx]) -> usize;
    /// Submit one chain head. Returns the number accepted (0 or 1).
    fn tx_burst(&mut self, qid: u16, head: MbufIdx) -> usize;
}

/// Standard port bring-up: clamp the queue count to device limits, enable
/// RSS (IPv4, IPv4+TCP, IPv4+UDP) iff more than one queue so each flow lands
/// on a deterministic queue, and switch on every RX/TX offload the device
/// advertises. Boot-fatal on driver rejection.
pub fn configure_port(port: &mut dyn NicPort, mut num_queues: u16) -> (u16, PortConf, HwFeatures) {
    let info = port.info();
    num_queues = num_queues.min(info.max_rx_queues).min(info.max_tx_queues).max(1);

    let mut conf = PortConf::default();
    if num_queues > 1 {
        conf.rss = true;
        conf.rss_hf = ETH_RSS_IPV4 | ETH_RSS_IPV4_TCP | ETH_RSS_IPV4_UDP;
    }
    conf.hw_vlan_strip = info.rx_offload_capa & DEV_RX_OFFLOAD_VLAN_STRIP != 0;

    let mut hw = HwFeatures::default();
    let rx_csum_all =
        DEV_RX_OFFLOAD_IPV4_CKSUM | DEV_RX_OFFLOAD_UDP_CKSUM | DEV_RX_OFFLOAD_TCP_CKSUM;
    if info.rx_offload_capa & rx_csum_all == rx_csum_all {
        conf.hw_ip_checksum = true;
        hw.rx_csum_offload = true;
    }
    hw.tx_csum_ip_offload = info.tx_offload_capa & DEV_TX_OFFLOAD_IPV4_CKSUM != 0;
    hw.tx_csum_l4_offload = info.tx_offload_capa
        & (DEV_TX_OFFLOAD_UDP_CKSUM | DEV_TX_OFFLOAD_TCP_CKSUM)
        == (DEV_TX_OFFLOAD_UDP_CKSUM | DEV_TX_OFFLOAD_TCP_CKSUM);
    hw.tx_tso = info.tx_offload_capa & DEV_TX_OFFLOAD_TCP_TSO != 0;
    hw.tx_ufo = info.tx_offload_capa & DEV_TX_OFFLOAD_UDP_TSO != 0;

    if let Err(e) = port.configure(num_queues, &conf) {
        fatal(E_PORT_CONFIG, &format!("cannot configure port: {e}"));
    }
    tracing::info!(
        queues = num_queues,
        rss = conf.rss,
        rx_csum = hw.rx_csum_offload,
        tx_ip_csum = hw.tx_csum_ip_offload,
        tx_l4_csum = hw.tx_csum_l4_offload,
        "port configured"
    );
    (num_queues, conf, hw)
}

// ============================================================================
// LOOPBACK PORT — in-memory device for the demo binary and tests
// ============================================================================

struct LoopQueue {
    pool: Option<Arc<MbufPool>>,
    rx: VecDeque<MbufIdx>,
}

/// A port whose TX wire feeds its own RX ring. Frames are re-homed into a
/// fresh single buffer on "the wire" so RX always observes contiguous
/// clusters, exactly like a store-and-forward link.
pub struct LoopbackPort {
    mac: EthernetAddress,
    info: PortInfo,
    queues: Vec<LoopQueue>,
    pub tx_wire_drops: u64,
}

impl LoopbackPort {
    pub fn new(mac: EthernetAddress, num_queues: u16, capa_rx: u64, capa_tx: u64) -> LoopbackPort {
        LoopbackPort {
            mac,
            info: PortInfo {
                max_rx_queues: num_queues,
                max_tx_queues: num_queues,
                rx_offload_capa: capa_rx,
                tx_offload_capa: capa_tx,
            },
            queues: (0..num_queues).map(|_| LoopQueue { pool: None, rx: VecDeque::new() }).collect(),
            tx_wire_drops: 0,
        }
    }

    /// Place a raw frame on a queue's RX ring, as if the wire delivered it.
    pub fn inject(&mut self, qid: u16, frame: &[u8]) {
        self.inject_with_flags(qid, frame, 0, 0);
    }

    /// Same, with driver result flags (stripped VLAN tag, checksum verdicts).
    pub fn inject_with_flags(&mut self, qid: u16, frame: &[u8], ol_flags: u64, vlan_tci: u16) {
        assert!(frame.len() <= MBUF_DATA_SIZE, "inject: frame exceeds buffer");
        let pool = self.queues[qid as usize].pool.as_ref().expect("queue not set up").clone();
        let Some(idx) = pool.alloc() else {
            self.tx_wire_drops += 1;
            return;
        };
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), pool.data_ptr(idx), frame.len());
            let m = pool.meta(idx);
            m.data_len = frame.len() as u32;
            m.pkt_len = frame.len() as u32;
            m.ol_flags = ol_flags;
            m.vlan_tci = vlan_tci;
        }
        self.queues[qid as usize].rx.push_back(idx);
    }

    pub fn rx_pending(&self, qid: u16) -> usize {
        self.queues[qid as usize].rx.len()
    }
}

impl NicPort for LoopbackPort {
    fn info(&self) -> PortInfo {
        self.info
    }

    fn mac(&self) -> EthernetAddress {
        self.mac
    }

    fn configure(&mut self, num_queues: u16, _conf: &PortConf) -> Result<(), NetError> {
        if num_queues as usize > self.queues.len() {
            return Err(NetError::PortConfig(format!("{num_queues} queues > device max")));
        }
        Ok(())
    }

    fn setup_queue(&mut self, qid: u16, pool: Arc<MbufPool>) -> Result<(), NetError> {
        match self.queues.get_mut(qid as usize) {
            Some(q) => {
                q.pool = Some(pool);
                Ok(())
            }
            None => Err(NetError::QueueNotReady(qid)),
        }
    }

    fn rx_burst(&mut self, qid: u16, out: &mut [MbufIdx]) -> usize {
        let q = &mut self.queues[qid as usize];
        let mut n = 0;
        while n < out.len() {
            match q.rx.pop_front() {
                Some(idx) => {
                    out[n] = idx;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn tx_burst(&mut self, qid: u16, head: MbufIdx) -> usize {
        // Gather the chain into a contiguous frame, free the TX buffers and
        // deliver the copy to RX. Oversize or pool-exhausted frames fall off
        // the wire; the submission itself always succeeds.
        let q = &self.queues[qid as usize];
        let pool = q.pool.as_ref().expect("queue not set up").clone();
        let pkt_len = unsafe { pool.meta(head).pkt_len } as usize;
        let mut frame = Vec::with_capacity(pkt_len);
        let mut cur = Some(head);
        while let Some(idx) = cur {
            unsafe {
                let m = pool.meta(idx);
                let data = std::slice::from_raw_parts(pool.data_ptr(idx), m.data_len as usize);
                frame.extend_from_slice(data);
                cur = m.next;
            }
        }
        pool.free_chain(head);
        if frame.len() == pkt_len && pkt_len <= MBUF_DATA_SIZE {
            self.inject(qid, &frame);
        } else if pkt_len > MBUF_DATA_SIZE {
            self.tx_wire_drops += 1;
        }
        1
    }
}
