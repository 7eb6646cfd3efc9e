// SHOAL — ICMP ECHO RESPONDER
// Minimal ICMP plug-in: answers echo requests in place by rewriting the
// message type and recomputing the checksum over the whole message, then
// sending the same buffer straight back. Everything else ICMP is dropped.

use bytemuck::{Pod, Zeroable};

use crate::net::ipv4::Ipv4;
use crate::net::l4::IpProtocol;
use crate::net::toeplitz::rss_hash_2tuple;
use crate::net::wire::{Checksummer, IP_PROTO_ICMP};
use crate::net::{CpuId, Ipv4Address};
use crate::packet::Packet;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Common ICMP prefix; echo id/seq ride in the payload.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct IcmpHeader {
    pub mtype: u8,
    pub code: u8,
    pub csum: u16,
}

pub struct Icmp {
    cpu_count: u32,
}

impl Icmp {
    pub fn new(cpu_count: u32) -> Icmp {
        Icmp { cpu_count }
    }
}

impl IpProtocol for Icmp {
    fn forward(&self, _p: &Packet, _l4_off: usize, src: Ipv4Address, dst: Ipv4Address) -> CpuId {
        // No ports to hash over; the address pair pins the flow.
        rss_hash_2tuple(src.0, dst.0) % self.cpu_count
    }

    fn received(&self, ip: &mut Ipv4, mut p: Packet, src: Ipv4Address, _dst: Ipv4Address) {
        let Some(hdr) = p.get_header_t::<IcmpHeader>(0) else {
            return;
        };
        if hdr.mtype != ICMP_ECHO_REQUEST {
            return;
        }
        hdr.mtype = ICMP_ECHO_REPLY;
        hdr.code = 0;
        hdr.csum = 0;
        let mut c = Checksummer::new();
        for i in 0..p.nr_frags() {
            c.sum(p.frag(i));
        }
        let sum = c.get();
        p.get_header_t::<IcmpHeader>(0).unwrap().csum = sum.to_be();
        ip.send(src, IP_PROTO_ICMP, p);
    }
}
