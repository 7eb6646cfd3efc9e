// SHOAL — IPV4 ENGINE
// Per-core receive entry, flow steering, fragment reassembly and the send
// path with software fragmentation. One instance per core; the only way
// state leaves this core is an explicit submit to a peer inbox, and every
// packet that crosses has its release hook re-homed first.
//
// Receive: validate header, steer to the owning core (Toeplitz for atomic
// datagrams, fragment-key hash for fragments), reassemble, deliver to the
// registered L4 plug-in. Transmit: prepend header, fragment when the MTU
// and offloads demand it, resolve the next hop through the ARP contract,
// hand the finished frame to L2.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::engine::clock::ClockFn;
use crate::engine::smp::{CoreTask, Smp};
use crate::engine::timer::Timer;
use crate::net::arp::ArpResolver;
use crate::net::filter::IpPacketFilter;
use crate::net::l4::{IpProtocol, L4Registry};
use crate::net::reassembly::{FragKey, FragTable, FRAG_TIMEOUT_NS};
use crate::net::wire::{
    ip_checksum, EthernetHeader, Ipv4Header, ETH_HDR_SIZE, ETH_PROTO_IPV4, IP_HDR_SIZE,
    IP_PACKET_LEN_MAX, IP_PROTO_TCP, IP_PROTO_UDP,
};
use crate::net::{CpuId, EthernetAddress, HwFeatures, Ipv4Address};
use crate::packet::Packet;

/// Finished L2 frames leave the engine through this sink (the NIC queue's
/// send path, behind a RefCell the ARP continuations can reach later).
pub type L2Sink = Rc<dyn Fn(Packet)>;

/// Interface addressing, fixed before the event loop starts.
#[derive(Copy, Clone, Debug)]
pub struct InetConfig {
    pub host: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
}

/// Drop and delivery counters. Every silent drop lands here.
#[derive(Default, Debug, Clone, Copy)]
pub struct IpStats {
    pub rx_delivered: u64,
    pub rx_forwarded: u64,
    pub rx_non_ip: u64,
    pub rx_truncated: u64,
    pub rx_bad_csum: u64,
    pub rx_bad_len: u64,
    pub rx_oversize: u64,
    pub rx_not_mine: u64,
    pub rx_no_proto: u64,
    pub rx_filtered: u64,
    pub rx_fragments: u64,
    pub reassembled: u64,
    pub tx_packets: u64,
    pub tx_fragments: u64,
}

pub struct Ipv4 {
    cfg: InetConfig,
    hw: HwFeatures,
    hw_addr: EthernetAddress,
    cpu: CpuId,
    smp: Arc<Smp>,
    l4: L4Registry,
    arp: Rc<RefCell<dyn ArpResolver>>,
    filter: Option<Box<dyn IpPacketFilter>>,
    frags: FragTable,
    frag_timer: Timer,
    clock: ClockFn,
    ip_id: u16,
    l2: L2Sink,
    pub stats: IpStats,
}

impl Ipv4 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: InetConfig,
        hw: HwFeatures,
        hw_addr: EthernetAddress,
        cpu: CpuId,
        smp: Arc<Smp>,
        arp: Rc<RefCell<dyn ArpResolver>>,
        clock: ClockFn,
        l2: L2Sink,
    ) -> Ipv4 {
        arp.borrow_mut().set_self(cfg.host);
        let ip_id = rand::random::<u16>();
        Ipv4 {
            cfg,
            hw,
            hw_addr,
            cpu,
            smp,
            l4: L4Registry::new(),
            arp,
            filter: None,
            frags: FragTable::new(),
            frag_timer: Timer::new(),
            clock,
            ip_id,
            l2,
            stats: IpStats::default(),
        }
    }

    pub fn host_address(&self) -> Ipv4Address {
        self.cfg.host
    }

    pub fn gw_address(&self) -> Ipv4Address {
        self.cfg.gateway
    }

    pub fn hw_features(&self) -> HwFeatures {
        self.hw
    }

    pub fn hw_address(&self) -> EthernetAddress {
        self.hw_addr
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn frag_mem(&self) -> usize {
        self.frags.frag_mem
    }

    pub fn register_l4(&mut self, proto: u8, handler: Rc<dyn IpProtocol>) {
        self.l4.register(proto, handler);
    }

    pub fn set_packet_filter(&mut self, f: Box<dyn IpPacketFilter>) {
        self.filter = Some(f);
    }

    fn in_my_netmask(&self, a: Ipv4Address) -> bool {
        (a.0 ^ self.cfg.host.0) & self.cfg.netmask.0 == 0
    }

    // ------------------------------------------------------------------
    // L3 dispatch
    // ------------------------------------------------------------------

    /// Per-core receive entry. `p` starts at the Ethernet header, fresh from
    /// the NIC or a peer core's forward. Frames whose flow belongs to
    /// another core are re-homed and submitted there; everything else flows
    /// into the IPv4 receive path.
    pub fn receive_ethernet(&mut self, mut p: Packet) {
        let Some(eh) = p.get_header_t::<EthernetHeader>(0) else {
            self.stats.rx_truncated += 1;
            return;
        };
        if eh.ethertype() != ETH_PROTO_IPV4 {
            self.stats.rx_non_ip += 1;
            return;
        }
        let from = eh.src_addr();

        let cpu = self.owning_cpu(&mut p, ETH_HDR_SIZE);
        if cpu != self.cpu {
            self.stats.rx_forwarded += 1;
            let p = p.free_on_cpu(self.smp.clone(), self.cpu);
            self.smp.submit_to(cpu, CoreTask::Rx(p));
            return;
        }

        p.trim_front(ETH_HDR_SIZE);
        self.handle_received(p, from);
    }

    /// Which core owns this frame's flow. Atomic datagrams hash through the
    /// registered handler (Toeplitz over its flow fields); fragments hash
    /// the fragment key, so every piece of one datagram reassembles on one
    /// core.
    fn owning_cpu(&mut self, p: &mut Packet, off: usize) -> CpuId {
        let count = self.smp.count();
        let Some(iph) = p.get_header_t::<Ipv4Header>(off) else {
            return self.cpu;
        };
        let iph = *iph;
        let Some(l4) = self.l4.lookup(iph.protocol) else {
            return self.cpu;
        };
        if !iph.mf() && iph.offset() == 0 {
            l4.forward(p, off + iph.hdr_len(), iph.src_addr(), iph.dst_addr()) % count
        } else {
            let key = FragKey {
                src: iph.src_addr(),
                dst: iph.dst_addr(),
                id: iph.ident(),
                proto: iph.protocol,
            };
            key.cpu(count)
        }
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// IPv4 receive proper. `p` starts at the IP header; `from` is the
    /// frame's source MAC (fodder for the ARP cache).
    pub fn handle_received(&mut self, mut p: Packet, from: EthernetAddress) {
        let Some(iph) = p.get_header_t::<Ipv4Header>(0) else {
            self.stats.rx_truncated += 1;
            return;
        };
        let iph = *iph;

        // Reassembled datagrams were verified fragment by fragment.
        if !self.hw.rx_csum_offload && !p.offload_info().reassembled {
            let Some(hdr) = p.get_header(0, iph.hdr_len()) else {
                self.stats.rx_truncated += 1;
                return;
            };
            if ip_checksum(hdr) != 0 {
                self.stats.rx_bad_csum += 1;
                return;
            }
        }

        let ip_len = iph.total_len() as usize;
        let ip_hdr_len = iph.hdr_len();
        let offset = iph.offset();
        if iph.version() != 4 || ip_hdr_len < IP_HDR_SIZE || ip_len < ip_hdr_len {
            self.stats.rx_bad_len += 1;
            return;
        }
        let pkt_len = p.len();
        if pkt_len > ip_len {
            // L2 padding beyond the IP total length.
            p.trim_back(pkt_len - ip_len);
        } else if pkt_len < ip_len {
            self.stats.rx_bad_len += 1;
            return;
        }
        if offset + p.len() > IP_PACKET_LEN_MAX {
            self.stats.rx_oversize += 1;
            return;
        }

        let src = iph.src_addr();
        let dst = iph.dst_addr();
        if self.in_my_netmask(src) && src != self.cfg.host {
            self.arp.borrow_mut().learn(from, src);
        }

        if let Some(mut f) = self.filter.take() {
            let verdict = f.handle(p, &iph, from);
            self.filter = Some(f);
            match verdict {
                None => {
                    self.stats.rx_filtered += 1;
                    return;
                }
                Some(returned) => p = returned,
            }
        }

        if dst != self.cfg.host {
            // Forwarding is out of scope; not ours means not wanted.
            self.stats.rx_not_mine += 1;
            return;
        }

        let mf = iph.mf();
        if mf || offset != 0 {
            self.receive_fragment(iph, offset, mf, p, from);
            return;
        }

        match self.l4.lookup(iph.protocol) {
            Some(l4) => {
                p.trim_front(ip_hdr_len);
                self.stats.rx_delivered += 1;
                l4.received(self, p, src, dst);
            }
            None => self.stats.rx_no_proto += 1,
        }
    }

    fn receive_fragment(
        &mut self,
        iph: Ipv4Header,
        offset: usize,
        mf: bool,
        p: Packet,
        from: EthernetAddress,
    ) {
        self.stats.rx_fragments += 1;
        self.frags.limit_mem();

        let src = iph.src_addr();
        let dst = iph.dst_addr();
        let key = FragKey { src, dst, id: iph.ident(), proto: iph.protocol };
        let now = (self.clock)();
        let complete = self.frags.merge_fragment(key, iph.hdr_len(), offset, mf, p, now);

        if !complete {
            if !self.frag_timer.armed() {
                self.frag_timer.arm(now + FRAG_TIMEOUT_NS);
            }
            return;
        }

        self.stats.reassembled += 1;
        let mut entry = self.frags.remove(key).expect("completed entry present");
        let l4 = self.l4.lookup(iph.protocol);
        let cpu = match &l4 {
            Some(h) => h.forward(entry.data_ref(), 0, src, dst) % self.smp.count(),
            None => self.cpu,
        };
        if cpu == self.cpu {
            match l4 {
                Some(h) => {
                    let data = entry.take_data();
                    self.stats.rx_delivered += 1;
                    h.received(self, data, src, dst);
                }
                None => self.stats.rx_no_proto += 1,
            }
        } else {
            // The flow hash of the whole datagram disagrees with the
            // fragment-key hash that got us here: rebuild an Ethernet frame
            // and let the owning core take it from the top.
            let frame = entry.assembled_frame(from, self.hw_addr);
            let frame = frame.free_on_cpu(self.smp.clone(), self.cpu);
            self.stats.rx_forwarded += 1;
            self.smp.submit_to(cpu, CoreTask::Rx(frame));
        }
    }

    /// Drive the reassembly timer. Called from the core loop every
    /// iteration; cheap when nothing is armed.
    pub fn poll_timers(&mut self) {
        let now = (self.clock)();
        if self.frag_timer.fire(now) && self.frags.timeout_sweep(now) {
            self.frag_timer.arm(now + FRAG_TIMEOUT_NS);
        }
    }

    // ------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------

    fn needs_frag(&self, p: &Packet, proto: u8) -> bool {
        if p.len() + IP_HDR_SIZE <= self.hw.mtu as usize {
            return false;
        }
        if (proto == IP_PROTO_TCP && self.hw.tx_tso) || (proto == IP_PROTO_UDP && self.hw.tx_ufo) {
            return false;
        }
        true
    }

    fn next_ip_id(&mut self) -> u16 {
        let id = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);
        id
    }

    /// Send `p` as the L4 payload of an IPv4 datagram to `to`. Fragments in
    /// MTU-sized pieces unless a segmentation offload covers the protocol.
    pub fn send(&mut self, to: Ipv4Address, proto: u8, mut p: Packet) {
        // Direct neighbor or via the default gateway.
        let next_hop = if self.in_my_netmask(to) { to } else { self.cfg.gateway };
        self.stats.tx_packets += 1;

        if !self.needs_frag(&p, proto) {
            self.send_pkt(p, to, next_hop, proto, 0, false, 0);
            return;
        }

        let id = self.next_ip_id();
        let mtu = self.hw.mtu as usize;
        let mut remaining = p.len();
        let mut offset = 0usize;
        while remaining > 0 {
            let can_send = (mtu - IP_HDR_SIZE).min(remaining);
            remaining -= can_send;
            let piece = p.share(offset, can_send);
            self.stats.tx_fragments += 1;
            self.send_pkt(piece, to, next_hop, proto, id, remaining > 0, (offset / 8) as u16);
            offset += can_send;
        }
    }

    fn send_pkt(
        &mut self,
        mut pkt: Packet,
        to: Ipv4Address,
        next_hop: Ipv4Address,
        proto: u8,
        id: u16,
        mf: bool,
        offset_units: u16,
    ) {
        let total_len = (pkt.len() + IP_HDR_SIZE) as u16;
        let iph = pkt.prepend_header_t::<Ipv4Header>();
        iph.ver_ihl = 0x45;
        iph.dscp_ecn = 0;
        iph.set_total_len(total_len);
        iph.set_ident(id);
        iph.set_frag(offset_units, mf);
        iph.ttl = 64;
        iph.protocol = proto;
        iph.csum = 0;
        iph.set_src_addr(self.cfg.host);
        iph.set_dst_addr(to);

        {
            let oi = pkt.offload_info_mut();
            oi.protocol = proto;
            oi.ip_hdr_len = IP_HDR_SIZE as u8;
        }
        if self.hw.tx_csum_ip_offload {
            pkt.offload_info_mut().needs_ip_csum = true;
        } else {
            let sum = ip_checksum(pkt.get_header(0, IP_HDR_SIZE).unwrap());
            let iph = pkt.get_header_t::<Ipv4Header>(0).unwrap();
            iph.csum = sum.to_be();
        }

        // Suspension point: the continuation fires when the link address is
        // known, on this core, and finishes the frame.
        let l2 = self.l2.clone();
        let src_mac = self.hw_addr;
        self.arp.borrow_mut().lookup(
            next_hop,
            Box::new(move |mac| {
                let mut pkt = pkt;
                let eh = pkt.prepend_header_t::<EthernetHeader>();
                eh.fill(mac, src_mac, ETH_PROTO_IPV4);
                l2(pkt);
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::arp::NeighborCache;
    use crate::net::icmp::{Icmp, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
    use crate::net::reassembly::{FRAG_HIGH_THRESH, FRAG_LOW_THRESH};
    use crate::net::toeplitz::rss_hash_4tuple;
    use crate::net::wire::{Checksummer, IP_PROTO_ICMP};
    use crate::packet::Packet;
    use std::cell::Cell;

    const HOST: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const PEER: Ipv4Address = Ipv4Address::new(10, 0, 0, 5);

    fn host_mac() -> EthernetAddress {
        EthernetAddress([2, 0, 0, 0, 0, 1])
    }

    fn peer_mac() -> EthernetAddress {
        EthernetAddress([2, 0, 0, 0, 0, 5])
    }

    struct Harness {
        ip: Ipv4,
        sent: Rc<RefCell<Vec<Packet>>>,
        now: Rc<Cell<u64>>,
        smp: Arc<Smp>,
    }

    fn harness(cpus: u32, cpu: CpuId, hw: HwFeatures) -> Harness {
        let smp = Smp::new(cpus);
        let sent = Rc::new(RefCell::new(Vec::new()));
        let tx = sent.clone();
        let l2: L2Sink = Rc::new(move |p| tx.borrow_mut().push(p));
        let now = Rc::new(Cell::new(0u64));
        let n = now.clone();
        let clock: ClockFn = Rc::new(move || n.get());
        let arp = Rc::new(RefCell::new(NeighborCache::new()));
        arp.borrow_mut().insert(PEER, peer_mac());
        arp.borrow_mut().insert(Ipv4Address::new(10, 0, 0, 254), EthernetAddress([2, 0, 0, 0, 0, 254]));
        let cfg = InetConfig {
            host: HOST,
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(10, 0, 0, 254),
        };
        let ip = Ipv4::new(cfg, hw, host_mac(), cpu, smp.clone(), arp, clock, l2);
        Harness { ip, sent, now, smp }
    }

    /// Raw Ethernet+IPv4 frame with a valid header checksum.
    fn build_frame(
        src: Ipv4Address,
        dst: Ipv4Address,
        proto: u8,
        id: u16,
        offset_bytes: usize,
        mf: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut f = vec![0u8; ETH_HDR_SIZE + IP_HDR_SIZE + payload.len()];
        f[0..6].copy_from_slice(&host_mac().0);
        f[6..12].copy_from_slice(&peer_mac().0);
        f[12..14].copy_from_slice(&ETH_PROTO_IPV4.to_be_bytes());
        let ip = &mut f[ETH_HDR_SIZE..ETH_HDR_SIZE + IP_HDR_SIZE];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((IP_HDR_SIZE + payload.len()) as u16).to_be_bytes());
        ip[4..6].copy_from_slice(&id.to_be_bytes());
        let frag_word = ((mf as u16) << 13) | ((offset_bytes / 8) as u16);
        ip[6..8].copy_from_slice(&frag_word.to_be_bytes());
        ip[8] = 64;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());
        let sum = ip_checksum(ip);
        ip[10..12].copy_from_slice(&sum.to_be_bytes());
        f[ETH_HDR_SIZE + IP_HDR_SIZE..].copy_from_slice(payload);
        f
    }

    fn parse_ip(frame: &[u8]) -> (Ipv4Header, Vec<u8>) {
        let iph: Ipv4Header =
            *bytemuck::from_bytes(&frame[ETH_HDR_SIZE..ETH_HDR_SIZE + IP_HDR_SIZE]);
        (iph, frame[ETH_HDR_SIZE + iph.hdr_len()..].to_vec())
    }

    // A recording L4 handler with a fixed flow-hash answer.
    struct Recorder {
        target: CpuId,
        got: Rc<RefCell<Vec<(usize, Ipv4Address, Ipv4Address)>>>,
    }

    impl IpProtocol for Recorder {
        fn forward(&self, _p: &Packet, _off: usize, _s: Ipv4Address, _d: Ipv4Address) -> CpuId {
            self.target
        }
        fn received(&self, _ip: &mut Ipv4, p: Packet, s: Ipv4Address, d: Ipv4Address) {
            self.got.borrow_mut().push((p.len(), s, d));
        }
    }

    fn recorder(target: CpuId) -> (Rc<Recorder>, Rc<RefCell<Vec<(usize, Ipv4Address, Ipv4Address)>>>)
    {
        let got = Rc::new(RefCell::new(Vec::new()));
        (Rc::new(Recorder { target, got: got.clone() }), got)
    }

    #[test]
    fn test_atomic_datagram_delivered_locally() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(200, rec);
        let frame = build_frame(PEER, HOST, 200, 1, 0, false, &[9u8; 40]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(got.borrow().len(), 1);
        assert_eq!(got.borrow()[0], (40, PEER, HOST));
        assert_eq!(h.ip.stats.rx_delivered, 1);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(200, rec);
        let mut frame = build_frame(PEER, HOST, 200, 1, 0, false, &[9u8; 40]);
        frame[ETH_HDR_SIZE + 10] ^= 0xFF;
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert!(got.borrow().is_empty());
        assert_eq!(h.ip.stats.rx_bad_csum, 1);
    }

    #[test]
    fn test_length_mismatch_trim_and_drop() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(200, rec);
        // Padded frame: 12 trailing bytes beyond the IP total length.
        let mut frame = build_frame(PEER, HOST, 200, 1, 0, false, &[9u8; 40]);
        frame.extend_from_slice(&[0u8; 12]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(got.borrow()[0].0, 40);
        // Truncated frame: shorter than the IP total length.
        let mut frame = build_frame(PEER, HOST, 200, 2, 0, false, &[9u8; 40]);
        frame.truncate(frame.len() - 10);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(got.borrow().len(), 1);
        assert_eq!(h.ip.stats.rx_bad_len, 1);
    }

    #[test]
    fn test_unknown_protocol_and_foreign_dst_dropped() {
        let mut h = harness(1, 0, HwFeatures::default());
        let frame = build_frame(PEER, HOST, 111, 1, 0, false, &[0u8; 8]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(h.ip.stats.rx_no_proto, 1);
        let frame = build_frame(PEER, Ipv4Address::new(10, 0, 0, 77), 111, 1, 0, false, &[0u8; 8]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(h.ip.stats.rx_not_mine, 1);
    }

    #[test]
    fn test_rx_learns_neighbor_from_local_subnet() {
        let mut h = harness(1, 0, HwFeatures::default());
        let arp = Rc::new(RefCell::new(NeighborCache::new()));
        // Rebuild with an empty cache we can inspect.
        let sent = h.sent.clone();
        let l2: L2Sink = Rc::new(move |p| sent.borrow_mut().push(p));
        let cfg = InetConfig {
            host: HOST,
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(10, 0, 0, 254),
        };
        let mut ip = Ipv4::new(
            cfg,
            HwFeatures::default(),
            host_mac(),
            0,
            h.smp.clone(),
            arp.clone(),
            Rc::new(|| 0),
            l2,
        );
        let frame = build_frame(PEER, HOST, 111, 1, 0, false, &[0u8; 8]);
        ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(arp.borrow().get(PEER), Some(peer_mac()));
    }

    // ------------------------------------------------------------------
    // Scenario S5: cross-core steering
    // ------------------------------------------------------------------

    #[test]
    fn test_atomic_datagram_forwarded_to_owning_core() {
        let mut h = harness(4, 0, HwFeatures::default());
        let (rec, got) = recorder(2);
        h.ip.register_l4(IP_PROTO_TCP, rec);
        let frame = build_frame(PEER, HOST, IP_PROTO_TCP, 7, 0, false, &[0u8; 20]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        // Exactly one cross-core submission, zero local deliveries.
        assert_eq!(h.smp.pending(2), 1);
        assert!(got.borrow().is_empty());
        assert_eq!(h.ip.stats.rx_forwarded, 1);
        assert_eq!(h.ip.stats.rx_delivered, 0);
    }

    #[test]
    fn test_fragment_steered_by_fragment_key() {
        let mut h = harness(4, 0, HwFeatures::default());
        let (rec, _got) = recorder(0);
        h.ip.register_l4(IP_PROTO_UDP, rec);
        // Find an id whose fragment key lands on a peer core.
        let mut id = 0u16;
        let target = loop {
            let key = FragKey { src: PEER, dst: HOST, id, proto: IP_PROTO_UDP };
            let cpu = key.cpu(4);
            if cpu != 0 {
                break cpu;
            }
            id += 1;
        };
        let frame = build_frame(PEER, HOST, IP_PROTO_UDP, id, 0, true, &[0u8; 64]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert_eq!(h.smp.pending(target), 1);
        assert_eq!(h.ip.stats.rx_forwarded, 1);
        // Determinism: the steering answer never changes for the flow.
        let key = FragKey { src: PEER, dst: HOST, id, proto: IP_PROTO_UDP };
        assert_eq!(key.cpu(4), target);
    }

    // ------------------------------------------------------------------
    // Reassembly scenarios S2/S3/S4
    // ------------------------------------------------------------------

    #[test]
    fn test_three_fragment_reassembly_delivers_once() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(IP_PROTO_UDP, rec);
        let payload: Vec<u8> = (0..4200u32).map(|i| i as u8).collect();
        let id = 0x1234;
        for (off, mf) in [(0usize, true), (1480, true), (2960, false)] {
            let end = (off + 1480).min(payload.len());
            let frame = build_frame(PEER, HOST, IP_PROTO_UDP, id, off, mf, &payload[off..end]);
            h.ip.receive_ethernet(Packet::from_vec(frame));
        }
        let got = got.borrow();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (4200, PEER, HOST));
        assert_eq!(h.ip.frag_mem(), 0);
        assert_eq!(h.ip.stats.reassembled, 1);
    }

    #[test]
    fn test_reassembled_payload_matches_original() {
        let mut h = harness(1, 0, HwFeatures::default());
        let payload_store = Rc::new(RefCell::new(Vec::new()));
        struct Capture(Rc<RefCell<Vec<Vec<u8>>>>);
        impl IpProtocol for Capture {
            fn forward(&self, _p: &Packet, _o: usize, _s: Ipv4Address, _d: Ipv4Address) -> CpuId {
                0
            }
            fn received(&self, _ip: &mut Ipv4, p: Packet, _s: Ipv4Address, _d: Ipv4Address) {
                self.0.borrow_mut().push(p.to_vec());
            }
        }
        h.ip.register_l4(IP_PROTO_UDP, Rc::new(Capture(payload_store.clone())));
        let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7) as u8).collect();
        // Out of order, with a duplicate.
        for (off, mf) in [(1480usize, true), (0, true), (1480, true), (2960, false)] {
            let end = (off + 1480).min(payload.len());
            let frame = build_frame(PEER, HOST, IP_PROTO_UDP, 9, off, mf, &payload[off..end]);
            h.ip.receive_ethernet(Packet::from_vec(frame));
        }
        assert_eq!(payload_store.borrow().len(), 1);
        assert_eq!(payload_store.borrow()[0], payload);
    }

    #[test]
    fn test_reassembly_timeout_clears_table() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(IP_PROTO_UDP, rec);
        let frame = build_frame(PEER, HOST, IP_PROTO_UDP, 1, 0, true, &[0u8; 100]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert!(h.ip.frag_mem() > 0);
        // 31 seconds later the sweep evicts the lone entry.
        h.now.set(31_000_000_000);
        h.ip.poll_timers();
        assert_eq!(h.ip.frag_mem(), 0);
        assert!(got.borrow().is_empty());
        // A late sibling fragment starts a fresh entry, not a delivery.
        let frame = build_frame(PEER, HOST, IP_PROTO_UDP, 1, 100, false, &[0u8; 100]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert!(got.borrow().is_empty());
    }

    #[test]
    fn test_high_water_eviction_drops_oldest_first() {
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, _got) = recorder(0);
        h.ip.register_l4(IP_PROTO_UDP, rec);
        // Many incomplete flows of ~1.5 KiB until past the high-water mark.
        let mut id = 0u16;
        while h.ip.frag_mem() <= FRAG_HIGH_THRESH {
            let frame = build_frame(PEER, HOST, IP_PROTO_UDP, id, 0, true, &[0u8; 1480]);
            h.ip.receive_ethernet(Packet::from_vec(frame));
            id += 1;
        }
        // The next fragment triggers the valve before its own insertion, so
        // the table holds at most low-water plus that one new entry.
        let frame = build_frame(PEER, HOST, IP_PROTO_UDP, id, 0, true, &[0u8; 1480]);
        h.ip.receive_ethernet(Packet::from_vec(frame));
        assert!(h.ip.frag_mem() <= FRAG_LOW_THRESH + 1500 + IP_HDR_SIZE);
        assert!(h.ip.stats.rx_fragments > 0);
    }

    #[test]
    fn test_completed_datagram_rehashes_to_flow_core() {
        // Fragments land here by fragment-key hash; the assembled datagram's
        // flow hash points at core 3, so completion forwards one frame.
        let key_cpu = FragKey { src: PEER, dst: HOST, id: 5, proto: IP_PROTO_UDP }.cpu(4);
        let mut h = harness(4, key_cpu, HwFeatures::default());
        let (rec, got) = recorder(3);
        h.ip.register_l4(IP_PROTO_UDP, rec);
        for (off, mf) in [(0usize, true), (1480, false)] {
            let frame = build_frame(PEER, HOST, IP_PROTO_UDP, 5, off, mf, &[3u8; 1480]);
            h.ip.receive_ethernet(Packet::from_vec(frame));
        }
        if key_cpu == 3 {
            // Degenerate draw: flow core equals fragment core, delivery is local.
            assert_eq!(got.borrow().len(), 1);
        } else {
            assert!(got.borrow().is_empty());
            assert_eq!(h.smp.pending(3), 1);
            // The forwarded frame is a full Ethernet frame marked reassembled.
            for t in h.smp.drain(3) {
                if let CoreTask::Rx(p) = t {
                    assert!(p.offload_info().reassembled);
                    let (iph, payload) = parse_ip(&p.to_vec());
                    assert!(!iph.mf());
                    assert_eq!(iph.offset(), 0);
                    assert_eq!(iph.total_len() as usize, IP_HDR_SIZE + 2960);
                    assert_eq!(payload.len(), 2960);
                }
            }
        }
        assert_eq!(h.ip.frag_mem(), 0);
    }

    // ------------------------------------------------------------------
    // Transmit: invariants 8 and 9
    // ------------------------------------------------------------------

    #[test]
    fn test_tx_small_payload_single_frame() {
        let mut h = harness(1, 0, HwFeatures::default());
        h.ip.send(PEER, IP_PROTO_UDP, Packet::from_vec(vec![5u8; 100]));
        let sent = h.sent.borrow();
        assert_eq!(sent.len(), 1);
        let frame = sent[0].to_vec();
        let (iph, payload) = parse_ip(&frame);
        assert!(!iph.mf());
        assert_eq!(iph.offset(), 0);
        assert_eq!(iph.ident(), 0);
        assert_eq!(iph.total_len(), 120);
        assert_eq!(iph.src_addr(), HOST);
        assert_eq!(iph.dst_addr(), PEER);
        assert_eq!(iph.ttl, 64);
        assert_eq!(payload, vec![5u8; 100]);
        // Software checksum is valid.
        assert_eq!(ip_checksum(&frame[ETH_HDR_SIZE..ETH_HDR_SIZE + IP_HDR_SIZE]), 0);
        // Frame goes out with the resolved neighbor MAC.
        assert_eq!(&frame[0..6], &peer_mac().0);
        assert_eq!(&frame[6..12], &host_mac().0);
    }

    #[test]
    fn test_tx_fragmentation_offsets_and_mf() {
        let mut h = harness(1, 0, HwFeatures::default());
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        h.ip.send(PEER, IP_PROTO_UDP, Packet::from_vec(payload.clone()));
        let sent = h.sent.borrow();
        // ceil(3000 / 1480) frames, offsets strictly increasing in 8-byte
        // units, MF on all but the last.
        assert_eq!(sent.len(), 3);
        let mut reassembled = Vec::new();
        let mut expect_off = 0;
        for (i, f) in sent.iter().enumerate() {
            let (iph, payload) = parse_ip(&f.to_vec());
            assert_eq!(iph.mf(), i + 1 < sent.len());
            assert_eq!(iph.offset(), expect_off);
            assert!(iph.total_len() as usize <= 1500);
            // One id for all pieces of the datagram.
            assert_eq!(iph.ident(), parse_ip(&sent[0].to_vec()).0.ident());
            expect_off += payload.len();
            reassembled.extend(payload);
        }
        let (first, _) = parse_ip(&sent[0].to_vec());
        let (second, _) = parse_ip(&sent[1].to_vec());
        let (third, _) = parse_ip(&sent[2].to_vec());
        assert_eq!(first.total_len(), 1500);
        assert_eq!(second.total_len(), 1500);
        assert_eq!(second.offset(), 1480);
        assert_eq!(third.offset(), 2960);
        assert_eq!(third.total_len(), 60);
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_tx_segmentation_offload_skips_fragmentation() {
        let hw = HwFeatures { tx_ufo: true, ..Default::default() };
        let mut h = harness(1, 0, hw);
        h.ip.send(PEER, IP_PROTO_UDP, Packet::from_vec(vec![0u8; 3000]));
        assert_eq!(h.sent.borrow().len(), 1);
        assert_eq!(h.ip.stats.tx_fragments, 0);
    }

    #[test]
    fn test_tx_offload_checksum_sets_flag_not_sum() {
        let hw = HwFeatures { tx_csum_ip_offload: true, ..Default::default() };
        let mut h = harness(1, 0, hw);
        h.ip.send(PEER, IP_PROTO_UDP, Packet::from_vec(vec![0u8; 64]));
        let sent = h.sent.borrow();
        let oi = sent[0].offload_info();
        assert!(oi.needs_ip_csum);
        assert_eq!(oi.ip_hdr_len, IP_HDR_SIZE as u8);
        assert_eq!(oi.protocol, IP_PROTO_UDP);
        let (iph, _) = parse_ip(&sent[0].to_vec());
        let csum = iph.csum;
        assert_eq!(csum, 0);
    }

    #[test]
    fn test_tx_off_subnet_goes_to_gateway_mac() {
        let mut h = harness(1, 0, HwFeatures::default());
        h.ip.send(Ipv4Address::new(192, 168, 9, 9), IP_PROTO_UDP, Packet::from_vec(vec![0u8; 10]));
        let sent = h.sent.borrow();
        let frame = sent[0].to_vec();
        // Destination IP stays the real target, MAC is the gateway's.
        let (iph, _) = parse_ip(&frame);
        assert_eq!(iph.dst_addr(), Ipv4Address::new(192, 168, 9, 9));
        assert_eq!(&frame[0..6], &[2, 0, 0, 0, 0, 254]);
    }

    // ------------------------------------------------------------------
    // Scenario S1: ICMP echo
    // ------------------------------------------------------------------

    #[test]
    fn test_icmp_echo_request_answered() {
        let mut h = harness(1, 0, HwFeatures::default());
        h.ip.register_l4(IP_PROTO_ICMP, Rc::new(Icmp::new(1)));

        // 98-byte frame: 14 eth + 20 ip + 64 icmp (8 hdr incl id/seq + 56 data).
        let mut icmp = vec![0u8; 64];
        icmp[0] = ICMP_ECHO_REQUEST;
        icmp[4..6].copy_from_slice(&0x0042u16.to_be_bytes()); // id
        icmp[6..8].copy_from_slice(&0x0001u16.to_be_bytes()); // seq
        for (i, b) in icmp[8..].iter_mut().enumerate() {
            *b = i as u8;
        }
        let sum = ip_checksum(&icmp);
        icmp[2..4].copy_from_slice(&sum.to_be_bytes());

        let frame = build_frame(PEER, HOST, IP_PROTO_ICMP, 0, 0, false, &icmp);
        assert_eq!(frame.len(), 98);
        h.ip.receive_ethernet(Packet::from_vec(frame));

        let sent = h.sent.borrow();
        assert_eq!(sent.len(), 1);
        let reply = sent[0].to_vec();
        let (iph, payload) = parse_ip(&reply);
        assert_eq!(iph.protocol, IP_PROTO_ICMP);
        assert_eq!(iph.src_addr(), HOST);
        assert_eq!(iph.dst_addr(), PEER);
        assert_eq!(payload[0], ICMP_ECHO_REPLY);
        assert_eq!(payload[1], 0);
        // Recomputed checksum verifies over the whole ICMP message.
        assert_eq!(ip_checksum(&payload), 0);
        // Identifier, sequence and data echoed back untouched.
        assert_eq!(&payload[4..], &icmp[4..]);
    }

    // ------------------------------------------------------------------
    // Filter hook
    // ------------------------------------------------------------------

    #[test]
    fn test_filter_consumes_before_delivery() {
        struct DropIcmp;
        impl IpPacketFilter for DropIcmp {
            fn handle(
                &mut self,
                p: Packet,
                h: &Ipv4Header,
                _from: EthernetAddress,
            ) -> Option<Packet> {
                if h.protocol == IP_PROTO_ICMP {
                    None
                } else {
                    Some(p)
                }
            }
        }
        let mut h = harness(1, 0, HwFeatures::default());
        let (rec, got) = recorder(0);
        h.ip.register_l4(200, rec);
        h.ip.set_packet_filter(Box::new(DropIcmp));
        h.ip.receive_ethernet(Packet::from_vec(build_frame(
            PEER,
            HOST,
            IP_PROTO_ICMP,
            0,
            0,
            false,
            &[0u8; 8],
        )));
        assert_eq!(h.ip.stats.rx_filtered, 1);
        h.ip.receive_ethernet(Packet::from_vec(build_frame(
            PEER,
            HOST,
            200,
            0,
            0,
            false,
            &[0u8; 8],
        )));
        assert_eq!(got.borrow().len(), 1);
    }

    #[test]
    fn test_flow_hash_agrees_for_repeated_calls() {
        // Invariant 7: both hashes are pure functions of the flow.
        let a = rss_hash_4tuple(PEER.0, HOST.0, 40000, 80) % 8;
        let b = rss_hash_4tuple(PEER.0, HOST.0, 40000, 80) % 8;
        assert_eq!(a, b);
        let k = FragKey { src: PEER, dst: HOST, id: 77, proto: IP_PROTO_TCP };
        assert_eq!(k.cpu(8), k.cpu(8));
    }

    #[test]
    fn test_icmp_csum_helper() {
        // Checksummer and ip_checksum agree on an odd-length message.
        let data = [1u8, 2, 3, 4, 5];
        let mut c = Checksummer::new();
        c.sum(&data);
        assert_eq!(c.get(), ip_checksum(&data));
    }
}
