// SHOAL — PACKET FILTER HOOK
// Optional per-packet inspection installed on the IP engine, consulted after
// header validation and before the local-delivery check. A filter either
// consumes the packet (taking over its fate entirely) or hands it back for
// normal routing. Returning the packet by value makes the handled/unhandled
// decision and the ownership transfer the same act.

use crate::net::wire::Ipv4Header;
use crate::net::EthernetAddress;
use crate::packet::Packet;

pub trait IpPacketFilter {
    /// Inspect `p` (front = IP header; a parsed copy rides alongside).
    /// `None` means handled: the filter now owns the packet. `Some(p)`
    /// returns it for normal processing.
    fn handle(&mut self, p: Packet, header: &Ipv4Header, from: EthernetAddress) -> Option<Packet>;
}
