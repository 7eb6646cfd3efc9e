// SHOAL — FRAGMENT REASSEMBLY TABLE
// Per-core state for in-flight IPv4 datagram reassembly. Entries are keyed
// by (src, dst, identification, protocol); payload ranges coalesce on insert
// so a complete datagram is exactly one range at offset 0. Memory is bounded
// by oldest-first eviction above the high-water mark and a 30-second
// timeout; arrival order and the age list agree by construction.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Bound::{Excluded, Unbounded};

use crate::engine::clock::NS_PER_SEC;
use crate::net::wire::{EthernetHeader, Ipv4Header, ETH_HDR_SIZE, ETH_PROTO_IPV4};
use crate::net::{CpuId, EthernetAddress, Ipv4Address};
use crate::packet::Packet;

pub const FRAG_TIMEOUT_NS: u64 = 30 * NS_PER_SEC;
pub const FRAG_LOW_THRESH: usize = 3 * 1024 * 1024;
pub const FRAG_HIGH_THRESH: usize = 4 * 1024 * 1024;

// ============================================================================
// FRAGMENT KEY
// ============================================================================

/// Identity of one in-flight datagram.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FragKey {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub id: u16,
    pub proto: u8,
}

impl FragKey {
    /// Owning core for every fragment of this datagram. Deterministic for
    /// the process lifetime, which is what flow pinning needs.
    pub fn cpu(&self, cpu_count: u32) -> CpuId {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        (h.finish() % cpu_count as u64) as CpuId
    }
}

// ============================================================================
// FRAGMENT ENTRY
// ============================================================================

pub struct FragEntry {
    /// IP header bytes captured from the offset-0 fragment.
    header: Packet,
    /// Payload ranges by byte offset. Coalesced on insert.
    data: BTreeMap<usize, Packet>,
    pub last_frag_received: bool,
    pub rx_time_ns: u64,
    pub mem_size: usize,
}

impl FragEntry {
    fn new() -> FragEntry {
        FragEntry {
            header: Packet::new(),
            data: BTreeMap::new(),
            last_frag_received: false,
            rx_time_ns: 0,
            mem_size: 0,
        }
    }

    /// Fold one fragment in. `p` still carries its IP header of `hdr_len`
    /// bytes; `offset` is the fragment's payload offset within the datagram.
    /// Returns the bytes newly retained (the caller maintains the table
    /// total).
    fn merge(&mut self, hdr_len: usize, offset: usize, mut p: Packet) -> usize {
        let old = self.mem_size;
        if offset == 0 {
            self.header = p.share(0, hdr_len);
        }
        p.trim_front(hdr_len);
        self.merge_range(offset, p);
        self.mem_size = self.header.len() + self.data.values().map(Packet::len).sum::<usize>();
        self.mem_size - old
    }

    /// Insert a payload range, coalescing with neighbors. Overlapping bytes
    /// keep the copy that arrived first.
    fn merge_range(&mut self, offset: usize, mut p: Packet) {
        let mut start = offset;
        let pred = self.data.range(..=offset).next_back().map(|(&k, v)| (k, k + v.len()));
        match pred {
            Some((pred_start, pred_end)) if pred_end >= offset => {
                let overlap = pred_end - offset;
                if overlap >= p.len() {
                    return;
                }
                if overlap > 0 {
                    p.trim_front(overlap);
                }
                self.data.get_mut(&pred_start).unwrap().append(p);
                start = pred_start;
            }
            _ => {
                self.data.insert(offset, p);
            }
        }
        // Swallow successors the grown range now reaches.
        loop {
            let end = start + self.data[&start].len();
            let succ = self.data.range((Excluded(start), Unbounded)).next().map(|(&k, _)| k);
            match succ {
                Some(k) if k <= end => {
                    let mut nxt = self.data.remove(&k).unwrap();
                    let overlap = end - k;
                    if overlap >= nxt.len() {
                        continue;
                    }
                    if overlap > 0 {
                        nxt.trim_front(overlap);
                    }
                    self.data.get_mut(&start).unwrap().append(nxt);
                }
                _ => break,
            }
        }
    }

    /// Complete iff the last fragment arrived and coalescing has collapsed
    /// the map to a single range starting at 0.
    pub fn is_complete(&self) -> bool {
        self.last_frag_received
            && self.data.len() == 1
            && self.data.keys().next() == Some(&0)
    }

    /// Borrow the assembled IP payload. Valid only when complete.
    pub fn data_ref(&self) -> &Packet {
        debug_assert!(self.is_complete());
        self.data.get(&0).unwrap()
    }

    /// The assembled IP payload. Valid only when complete.
    pub fn take_data(&mut self) -> Packet {
        debug_assert!(self.is_complete());
        self.data.remove(&0).unwrap()
    }

    /// Rebuild a full Ethernet frame for a cross-core hand-off: the saved IP
    /// header regains an Ethernet header, the assembled payload is appended,
    /// total length and fragment word are rewritten, and the packet is
    /// marked reassembled so the receiving core skips checksum verification.
    pub fn assembled_frame(mut self, from: EthernetAddress, to: EthernetAddress) -> Packet {
        let data = self.take_data();
        let mut pkt = self.header;
        let eh = pkt.prepend_header_t::<EthernetHeader>();
        eh.fill(to, from, ETH_PROTO_IPV4);
        pkt.append(data);
        let total_len = (pkt.len() - ETH_HDR_SIZE) as u16;
        let iph = pkt.get_header_t::<Ipv4Header>(ETH_HDR_SIZE).unwrap();
        iph.set_total_len(total_len);
        iph.set_frag(0, false);
        pkt.offload_info_mut().reassembled = true;
        pkt
    }
}

// ============================================================================
// FRAGMENT TABLE
// ============================================================================

pub struct FragTable {
    frags: HashMap<FragKey, FragEntry>,
    age: VecDeque<FragKey>,
    pub frag_mem: usize,
    pub evicted: u64,
    pub timed_out: u64,
}

impl FragTable {
    pub fn new() -> FragTable {
        FragTable {
            frags: HashMap::new(),
            age: VecDeque::new(),
            frag_mem: 0,
            evicted: 0,
            timed_out: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    /// Fold a fragment into its entry, creating it (and its age-list node)
    /// on first sight. Returns whether the datagram is now complete.
    pub fn merge_fragment(
        &mut self,
        key: FragKey,
        hdr_len: usize,
        offset: usize,
        mf: bool,
        p: Packet,
        now_ns: u64,
    ) -> bool {
        let is_new = !self.frags.contains_key(&key);
        let entry = self.frags.entry(key).or_insert_with(FragEntry::new);
        if !mf {
            entry.last_frag_received = true;
        }
        if is_new {
            entry.rx_time_ns = now_ns;
            self.age.push_back(key);
        }
        let added = entry.merge(hdr_len, offset, p);
        self.frag_mem += added;
        entry.is_complete()
    }

    /// Remove a completed entry from both the table and the age list.
    pub fn remove(&mut self, key: FragKey) -> Option<FragEntry> {
        let entry = self.frags.remove(&key)?;
        self.frag_mem -= entry.mem_size;
        self.age.retain(|k| *k != key);
        Some(entry)
    }

    /// Memory-pressure valve, called before accepting a new fragment. Above
    /// the high-water mark, drop entries oldest-first until `frag_mem` falls
    /// to the low-water mark or nothing is left.
    pub fn limit_mem(&mut self) {
        if self.frag_mem <= FRAG_HIGH_THRESH {
            return;
        }
        let mut drop = self.frag_mem - FRAG_LOW_THRESH;
        while drop > 0 {
            let Some(key) = self.age.pop_front() else {
                return;
            };
            let dropped = self.frags.remove(&key).map(|e| e.mem_size).unwrap_or(0);
            self.frag_mem -= dropped;
            self.evicted += 1;
            drop -= drop.min(dropped);
        }
        tracing::debug!(frag_mem = self.frag_mem, "reassembly memory pressure relieved");
    }

    /// Timeout sweep: drop every entry older than the timeout. The age list
    /// is in arrival order, so the scan stops at the first survivor.
    /// Returns true when entries remain (the timer should re-arm).
    pub fn timeout_sweep(&mut self, now_ns: u64) -> bool {
        while let Some(key) = self.age.front().copied() {
            let expired = self
                .frags
                .get(&key)
                .map(|e| now_ns > e.rx_time_ns + FRAG_TIMEOUT_NS)
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.age.pop_front();
            if let Some(e) = self.frags.remove(&key) {
                self.frag_mem -= e.mem_size;
                self.timed_out += 1;
            }
        }
        if self.frags.is_empty() {
            self.frag_mem = 0;
            false
        } else {
            true
        }
    }
}

impl Default for FragTable {
    fn default() -> Self {
        FragTable::new()
    }
}
