// SHOAL — MINIMAL UDP
// Datagram plug-in: port-keyed delivery callbacks on RX, a one-shot build
// path on TX. No sockets, no connected state; the demo echo service and the
// reassembly path are the consumers. Checksums follow the offload split:
// software when the device can't, a flag when it can.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::net::ipv4::Ipv4;
use crate::net::l4::IpProtocol;
use crate::net::toeplitz::rss_hash_4tuple;
use crate::net::wire::{Checksummer, IP_PROTO_UDP};
use crate::net::{CpuId, Ipv4Address};
use crate::packet::Packet;

pub const UDP_HDR_SIZE: usize = 8;

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
    pub csum: u16,
}

const _: () = assert!(std::mem::size_of::<UdpHeader>() == UDP_HDR_SIZE);

/// One delivered datagram: payload plus addressing.
pub struct UdpDatagram {
    pub payload: Packet,
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
}

pub type UdpSink = Box<dyn FnMut(&mut Ipv4, UdpDatagram)>;

pub struct Udp {
    cpu_count: u32,
    bindings: RefCell<HashMap<u16, UdpSink>>,
    pub drops: Cell<u64>,
}

impl Udp {
    pub fn new(cpu_count: u32) -> Udp {
        Udp { cpu_count, bindings: RefCell::new(HashMap::new()), drops: Cell::new(0) }
    }

    /// Register a delivery callback for a local port. Last bind wins.
    pub fn bind(&self, port: u16, sink: UdpSink) {
        self.bindings.borrow_mut().insert(port, sink);
    }

    /// Build and transmit one datagram.
    pub fn send(ip: &mut Ipv4, src_port: u16, dst: Ipv4Address, dst_port: u16, mut payload: Packet) {
        let udp_len = (payload.len() + UDP_HDR_SIZE) as u16;
        {
            let h = payload.prepend_header_t::<UdpHeader>();
            h.src_port = src_port.to_be();
            h.dst_port = dst_port.to_be();
            h.len = udp_len.to_be();
            h.csum = 0;
        }
        if !ip.hw_features().tx_csum_l4_offload {
            let mut c = Checksummer::new();
            pseudo_header(&mut c, ip.host_address(), dst, udp_len);
            for i in 0..payload.nr_frags() {
                c.sum(payload.frag(i));
            }
            let sum = match c.get() {
                // RFC 768: a computed zero is transmitted as all-ones.
                0 => 0xFFFF,
                s => s,
            };
            payload.get_header_t::<UdpHeader>(0).unwrap().csum = sum.to_be();
        }
        ip.send(dst, IP_PROTO_UDP, payload);
    }
}

fn pseudo_header(c: &mut Checksummer, src: Ipv4Address, dst: Ipv4Address, udp_len: u16) {
    c.sum(&src.0.to_be_bytes());
    c.sum(&dst.0.to_be_bytes());
    c.sum_u16(IP_PROTO_UDP as u16);
    c.sum_u16(udp_len);
}

impl IpProtocol for Udp {
    fn forward(&self, p: &Packet, l4_off: usize, src: Ipv4Address, dst: Ipv4Address) -> CpuId {
        let mut ports = [0u8; 4];
        if !p.copy_out(l4_off, &mut ports) {
            return 0;
        }
        let sport = u16::from_be_bytes([ports[0], ports[1]]);
        let dport = u16::from_be_bytes([ports[2], ports[3]]);
        rss_hash_4tuple(src.0, dst.0, sport, dport) % self.cpu_count
    }

    fn received(&self, ip: &mut Ipv4, mut p: Packet, src: Ipv4Address, dst: Ipv4Address) {
        let Some(h) = p.get_header_t::<UdpHeader>(0) else {
            self.drops.set(self.drops.get() + 1);
            return;
        };
        let src_port = u16::from_be(h.src_port);
        let dst_port = u16::from_be(h.dst_port);
        let udp_len = u16::from_be(h.len) as usize;
        let csum = u16::from_be(h.csum);
        if udp_len < UDP_HDR_SIZE || p.len() < udp_len {
            self.drops.set(self.drops.get() + 1);
            return;
        }
        if p.len() > udp_len {
            p.trim_back(p.len() - udp_len);
        }
        // csum == 0 means the sender didn't checksum; hardware-verified
        // frames were already screened at the driver.
        if csum != 0 && !ip.hw_features().rx_csum_offload {
            let mut c = Checksummer::new();
            pseudo_header(&mut c, src, dst, udp_len as u16);
            for i in 0..p.nr_frags() {
                c.sum(p.frag(i));
            }
            if c.get() != 0 {
                self.drops.set(self.drops.get() + 1);
                return;
            }
        }
        p.trim_front(UDP_HDR_SIZE);

        let sink = self.bindings.borrow_mut().remove(&dst_port);
        match sink {
            Some(mut sink) => {
                let dgram = UdpDatagram { payload: p, src, dst, src_port, dst_port };
                sink(ip, dgram);
                // Put the binding back unless the callback re-bound the port.
                self.bindings.borrow_mut().entry(dst_port).or_insert(sink);
            }
            None => self.drops.set(self.drops.get() + 1),
        }
    }
}
