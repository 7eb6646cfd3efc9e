// SHOAL — PER-CORE QUEUE ADAPTER
// One RX and one TX queue, owned by exactly one core. Polled RX wraps each
// driver buffer as a single-fragment packet whose release hook returns the
// buffer to this core's pool; TX copies packet fragments into a driver
// buffer cluster and translates offload intent into driver flags.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use super::mbuf::{MbufIdx, MbufPool};
use super::port::NicPort;
use super::{
    MAX_FRAGS, MBUF_DATA_SIZE, PKT_RX_IP_CKSUM_BAD, PKT_RX_L4_CKSUM_BAD, PKT_RX_VLAN,
    PKT_TX_IP_CKSUM, PKT_TX_TCP_CKSUM, PKT_TX_UDP_CKSUM, RX_BURST_SIZE,
};
use crate::engine::{fatal, E_QUEUE_SETUP, E_RX_CLUSTER};
use crate::net::wire::{ETH_HDR_SIZE, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::net::HwFeatures;
use crate::packet::{Deleter, Fragment, Packet};

/// Drop and traffic counters. Malformed input and transient exhaustion are
/// silent on the wire but visible here.
#[derive(Default, Debug, Clone, Copy)]
pub struct QueueStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_csum_drops: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_alloc_drops: u64,
    pub tx_linearized: u64,
}

pub struct NicQueue {
    port: Rc<RefCell<dyn NicPort>>,
    qid: u16,
    pool: Arc<MbufPool>,
    hw: HwFeatures,
    vlan_strip: bool,
    pub stats: QueueStats,
}

impl NicQueue {
    pub fn new(
        port: Rc<RefCell<dyn NicPort>>,
        qid: u16,
        pool: Arc<MbufPool>,
        hw: HwFeatures,
        vlan_strip: bool,
    ) -> NicQueue {
        if let Err(e) = port.borrow_mut().setup_queue(qid, pool.clone()) {
            fatal(E_QUEUE_SETUP, &format!("cannot initialize queue {qid}: {e}"));
        }
        NicQueue { port, qid, pool, hw, vlan_strip, stats: QueueStats::default() }
    }

    pub fn pool(&self) -> &Arc<MbufPool> {
        &self.pool
    }

    // ------------------------------------------------------------------
    // RX
    // ------------------------------------------------------------------

    /// Drain up to one burst from the RX ring. Accepted frames come back as
    /// packets ready for L2 receive; the caller dispatches them after this
    /// borrow ends so delivery may re-enter the queue for TX.
    pub fn poll_rx_once(&mut self) -> Vec<Packet> {
        let mut bufs = [0 as MbufIdx; RX_BURST_SIZE];
        let n = self.port.borrow_mut().rx_burst(self.qid, &mut bufs);
        let mut out = Vec::with_capacity(n);
        for &idx in &bufs[..n] {
            let (flags, vlan_tci, data_len, nb_segs) = unsafe {
                let m = self.pool.meta(idx);
                (m.ol_flags, m.vlan_tci, m.data_len, m.nb_segs)
            };
            if nb_segs != 1 {
                fatal(E_RX_CLUSTER, "RX produced a fragmented buffer cluster");
            }

            let pool = self.pool.clone();
            let base = unsafe { self.pool.data_ptr(idx) };
            let mut p = Packet::from_raw(
                Fragment { base, size: data_len as usize },
                Deleter::from_hook(move || pool.free(idx)),
            );

            let oi = p.offload_info_mut();
            if self.vlan_strip && flags & PKT_RX_VLAN != 0 {
                oi.hw_vlan = true;
                oi.vlan_tci = vlan_tci;
            }
            if self.hw.rx_csum_offload && flags & (PKT_RX_IP_CKSUM_BAD | PKT_RX_L4_CKSUM_BAD) != 0
            {
                // Hardware already verified and failed it. Dropping the
                // packet runs the hook and returns the buffer.
                self.stats.rx_csum_drops += 1;
                continue;
            }
            self.stats.rx_packets += 1;
            self.stats.rx_bytes += data_len as u64;
            out.push(p);
        }
        out
    }

    // ------------------------------------------------------------------
    // TX
    // ------------------------------------------------------------------

    /// Submit a packet. Failure is never surfaced: allocation shortfall
    /// frees the partial cluster and drops silently (end-to-end retransmit
    /// is the upper layers' problem).
    pub fn send(&mut self, mut p: Packet) {
        if p.is_empty() {
            return;
        }
        if p.nr_frags() > MAX_FRAGS {
            p.linearize(0, p.len());
            self.stats.tx_linearized += 1;
        }

        let mut head: Option<MbufIdx> = None;
        let mut prev: Option<MbufIdx> = None;
        let mut nsegs: u16 = 0;
        for i in 0..p.nr_frags() {
            let mut data = p.frag(i);
            debug_assert!(!data.is_empty(), "zero-size fragment on TX");
            while !data.is_empty() {
                let Some(idx) = self.pool.alloc() else {
                    if let Some(h) = head {
                        self.pool.free_chain(h);
                    }
                    self.stats.tx_alloc_drops += 1;
                    return;
                };
                let take = data.len().min(MBUF_DATA_SIZE);
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), self.pool.data_ptr(idx), take);
                    self.pool.meta(idx).data_len = take as u32;
                    if let Some(pv) = prev {
                        self.pool.meta(pv).next = Some(idx);
                    }
                }
                if head.is_none() {
                    head = Some(idx);
                }
                prev = Some(idx);
                nsegs += 1;
                data = &data[take..];
            }
        }
        let head = match head {
            Some(h) => h,
            None => return,
        };

        let oi = p.offload_info();
        unsafe {
            let m = self.pool.meta(head);
            m.pkt_len = p.len() as u32;
            m.nb_segs = nsegs;
            if oi.needs_ip_csum {
                m.ol_flags |= PKT_TX_IP_CKSUM;
                m.l2_len = ETH_HDR_SIZE as u8;
                m.l3_len = oi.ip_hdr_len;
            }
            if self.hw.tx_csum_l4_offload {
                if oi.protocol == IP_PROTO_TCP {
                    m.ol_flags |= PKT_TX_TCP_CKSUM;
                    m.l2_len = ETH_HDR_SIZE as u8;
                    m.l3_len = oi.ip_hdr_len;
                } else if oi.protocol == IP_PROTO_UDP {
                    m.ol_flags |= PKT_TX_UDP_CKSUM;
                    m.l2_len = ETH_HDR_SIZE as u8;
                    m.l3_len = oi.ip_hdr_len;
                }
            }
        }

        self.stats.tx_packets += 1;
        self.stats.tx_bytes += p.len() as u64;
        // Spin until the ring takes it.
        // TODO: replace the spin with a TX completion poller driven from the
        // core loop, so a full ring yields instead of burning the core.
        while self.port.borrow_mut().tx_burst(self.qid, head) < 1 {}
    }
}
