// SHOAL — PACKET BUFFER
// Multi-fragment zero-copy byte container. A packet is an ordered list of
// fragments (raw byte ranges), a release hook that runs exactly once when
// the last reference drops, and an offload-info record that travels with it
// through the protocol layers. Fragments may point into NIC-owned driver
// buffers or owned heap memory; the API makes no distinction.
//
// Ownership model: every byte a fragment references is kept alive by the
// deleter chain. Sharing converts the deleter to a refcounted form; cross-core
// hand-off first wraps the deleter so the real release runs on the origin
// core (a NIC buffer must never be returned to a foreign pool).

use std::mem;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::engine::smp::{CoreTask, Smp};
use crate::net::CpuId;

/// Inline headroom reserved per packet for cheap header prepend.
/// Ethernet(14) + IPv4(20) + largest L4 header leaves slack to spare.
pub const INTERNAL_DATA_SIZE: usize = 128;

// ============================================================================
// FRAGMENT
// ============================================================================

/// One contiguous byte range. The backing memory is owned by the packet's
/// deleter chain, never by the fragment itself.
#[derive(Copy, Clone)]
pub struct Fragment {
    pub base: *mut u8,
    pub size: usize,
}

// ============================================================================
// DELETER — the release hook
// ============================================================================

type Hook = Box<dyn FnOnce() + Send>;

/// Refcounted release state. The hook runs when the last `Arc` drops,
/// whichever core that happens on; `free_on_cpu` re-homes it first.
struct SharedRelease {
    hook: Mutex<Option<Hook>>,
}

impl Drop for SharedRelease {
    fn drop(&mut self) {
        if let Some(f) = self.hook.lock().take() {
            f();
        }
    }
}

enum DeleterKind {
    Empty,
    Unique(Hook),
    Shared(Arc<SharedRelease>),
}

/// Opaque finalizer attached to a packet. Runs exactly once.
pub struct Deleter {
    kind: DeleterKind,
}

impl Deleter {
    pub fn empty() -> Deleter {
        Deleter { kind: DeleterKind::Empty }
    }

    pub fn from_hook(f: impl FnOnce() + Send + 'static) -> Deleter {
        Deleter { kind: DeleterKind::Unique(Box::new(f)) }
    }

    /// Keep `obj` alive until the deleter runs.
    pub fn owning<T: Send + 'static>(obj: T) -> Deleter {
        Deleter::from_hook(move || drop(obj))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, DeleterKind::Empty)
    }

    /// Convert to shared refcounting in place and hand out another reference.
    /// The underlying hook still runs exactly once, at the last drop.
    pub fn share(&mut self) -> Deleter {
        let kind = mem::replace(&mut self.kind, DeleterKind::Empty);
        let arc = match kind {
            DeleterKind::Empty => return Deleter::empty(),
            DeleterKind::Unique(f) => Arc::new(SharedRelease { hook: Mutex::new(Some(f)) }),
            DeleterKind::Shared(a) => a,
        };
        self.kind = DeleterKind::Shared(arc.clone());
        Deleter { kind: DeleterKind::Shared(arc) }
    }

    /// Compose two deleters into one that releases both.
    pub fn chain(self, extra: Deleter) -> Deleter {
        if extra.is_empty() {
            return self;
        }
        if self.is_empty() {
            return extra;
        }
        Deleter::from_hook(move || {
            drop(self);
            drop(extra);
        })
    }
}

impl Drop for Deleter {
    fn drop(&mut self) {
        if let DeleterKind::Unique(f) = mem::replace(&mut self.kind, DeleterKind::Empty) {
            f();
        }
    }
}

impl Default for Deleter {
    fn default() -> Self {
        Deleter::empty()
    }
}

// ============================================================================
// OFFLOAD INFO
// ============================================================================

/// Hardware-offload metadata carried alongside the byte ranges.
#[derive(Copy, Clone, Default, Debug)]
pub struct OffloadInfo {
    pub needs_ip_csum: bool,
    pub protocol: u8,
    pub ip_hdr_len: u8,
    pub hw_vlan: bool,
    pub vlan_tci: u16,
    pub reassembled: bool,
}

// ============================================================================
// PACKET
// ============================================================================

/// Headroom block. Carved downward from the end so successive prepends stay
/// contiguous with the existing front fragment.
struct Internal {
    buf: Box<[u8; INTERNAL_DATA_SIZE]>,
    used: usize,
}

impl Internal {
    fn new() -> Internal {
        Internal { buf: Box::new([0u8; INTERNAL_DATA_SIZE]), used: 0 }
    }

    #[inline(always)]
    fn end(&mut self) -> *mut u8 {
        unsafe { self.buf.as_mut_ptr().add(INTERNAL_DATA_SIZE) }
    }
}

pub struct Packet {
    frags: Vec<Fragment>,
    len: usize,
    internal: Option<Internal>,
    deleter: Deleter,
    offload: OffloadInfo,
}

// SAFETY: all memory referenced by `frags` is owned by the deleter chain or
// the inline headroom, both of which travel inside the packet. A packet is
// moved between cores, never aliased; hooks are Send by construction.
unsafe impl Send for Packet {}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            frags: Vec::new(),
            len: 0,
            internal: None,
            deleter: Deleter::empty(),
            offload: OffloadInfo::default(),
        }
    }

    /// Take ownership of a byte vector as a single fragment.
    pub fn from_vec(v: Vec<u8>) -> Packet {
        let mut boxed = v.into_boxed_slice();
        let size = boxed.len();
        let base = boxed.as_mut_ptr();
        Packet {
            frags: vec![Fragment { base, size }],
            len: size,
            internal: None,
            deleter: Deleter::owning(boxed),
            offload: OffloadInfo::default(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Packet {
        Packet::from_vec(data.to_vec())
    }

    /// Wrap externally owned memory (a driver buffer) without copying.
    /// The deleter is the buffer's way home.
    pub fn from_raw(frag: Fragment, deleter: Deleter) -> Packet {
        Packet {
            len: frag.size,
            frags: vec![frag],
            internal: None,
            deleter,
            offload: OffloadInfo::default(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn nr_frags(&self) -> usize {
        self.frags.len()
    }

    #[inline(always)]
    pub fn frag(&self, i: usize) -> &[u8] {
        let f = &self.frags[i];
        unsafe { std::slice::from_raw_parts(f.base, f.size) }
    }

    #[inline(always)]
    pub fn frag_mut(&mut self, i: usize) -> &mut [u8] {
        let f = &self.frags[i];
        unsafe { std::slice::from_raw_parts_mut(f.base, f.size) }
    }

    #[inline(always)]
    pub fn offload_info(&self) -> OffloadInfo {
        self.offload
    }

    #[inline(always)]
    pub fn offload_info_mut(&mut self) -> &mut OffloadInfo {
        &mut self.offload
    }

    pub fn set_offload_info(&mut self, oi: OffloadInfo) {
        self.offload = oi;
    }

    /// Copy `out.len()` bytes starting at `offset` without mutating the
    /// packet. Returns false if the range is out of bounds. Lets pure
    /// readers (flow hashing) work on fragmented packets without
    /// linearizing.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) -> bool {
        if offset + out.len() > self.len {
            return false;
        }
        let mut skip = offset;
        let mut at = 0;
        for i in 0..self.nr_frags() {
            let f = self.frag(i);
            if skip >= f.len() {
                skip -= f.len();
                continue;
            }
            let take = (f.len() - skip).min(out.len() - at);
            out[at..at + take].copy_from_slice(&f[skip..skip + take]);
            at += take;
            skip = 0;
            if at == out.len() {
                break;
            }
        }
        true
    }

    /// Copy the whole packet out. Cold path (tests, diagnostics).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.nr_frags() {
            out.extend_from_slice(self.frag(i));
        }
        out
    }

    // ------------------------------------------------------------------
    // Header prepend
    // ------------------------------------------------------------------

    /// Carve `size` bytes of header space in front of the packet. Uses the
    /// inline headroom while it lasts, then falls back to an owned fragment
    /// chained into the deleter.
    pub fn prepend_header(&mut self, size: usize) -> &mut [u8] {
        if self.internal.is_none() {
            self.internal = Some(Internal::new());
        }
        let internal = self.internal.as_mut().unwrap();
        if internal.used + size <= INTERNAL_DATA_SIZE {
            let cursor = unsafe { internal.end().sub(internal.used) };
            let base = unsafe { cursor.sub(size) };
            let grow_front = self
                .frags
                .first()
                .map(|f| internal.used > 0 && f.base == cursor)
                .unwrap_or(false);
            if grow_front {
                let f = &mut self.frags[0];
                f.base = base;
                f.size += size;
            } else {
                self.frags.insert(0, Fragment { base, size });
            }
            internal.used += size;
            self.len += size;
            let hdr = unsafe { std::slice::from_raw_parts_mut(base, size) };
            hdr.fill(0);
            return hdr;
        }
        // Headroom exhausted: own a fresh buffer for this header.
        let mut boxed = vec![0u8; size].into_boxed_slice();
        let base = boxed.as_mut_ptr();
        self.frags.insert(0, Fragment { base, size });
        self.len += size;
        self.deleter = mem::take(&mut self.deleter).chain(Deleter::owning(boxed));
        unsafe { std::slice::from_raw_parts_mut(base, size) }
    }

    /// Typed prepend for `#[repr(C, packed)]` wire structs (alignment 1).
    pub fn prepend_header_t<T: Pod>(&mut self) -> &mut T {
        let bytes = self.prepend_header(mem::size_of::<T>());
        bytemuck::from_bytes_mut(bytes)
    }

    // ------------------------------------------------------------------
    // Trim
    // ------------------------------------------------------------------

    pub fn trim_front(&mut self, mut n: usize) {
        debug_assert!(n <= self.len);
        while n > 0 {
            let f = &mut self.frags[0];
            if f.size <= n {
                n -= f.size;
                self.len -= f.size;
                self.frags.remove(0);
            } else {
                f.base = unsafe { f.base.add(n) };
                f.size -= n;
                self.len -= n;
                n = 0;
            }
        }
    }

    pub fn trim_back(&mut self, mut n: usize) {
        debug_assert!(n <= self.len);
        while n > 0 {
            let last = self.frags.len() - 1;
            let f = &mut self.frags[last];
            if f.size <= n {
                n -= f.size;
                self.len -= f.size;
                self.frags.pop();
            } else {
                f.size -= n;
                self.len -= n;
                n = 0;
            }
        }
    }

    // ------------------------------------------------------------------
    // Share / append
    // ------------------------------------------------------------------

    /// Push headroom ownership into the deleter chain so views created by
    /// `share` stay valid after this packet drops.
    fn unuse_internal_data(&mut self) {
        if let Some(internal) = self.internal.take() {
            if internal.used > 0 {
                self.deleter = mem::take(&mut self.deleter).chain(Deleter::owning(internal.buf));
            }
        }
    }

    /// A new packet referencing `self[offset .. offset + size]` without
    /// copying. Both packets hold the (now refcounted) release hook.
    pub fn share(&mut self, offset: usize, size: usize) -> Packet {
        debug_assert!(offset + size <= self.len);
        self.unuse_internal_data();
        let mut frags = Vec::new();
        let mut skip = offset;
        let mut want = size;
        for f in &self.frags {
            if want == 0 {
                break;
            }
            if skip >= f.size {
                skip -= f.size;
                continue;
            }
            let take = (f.size - skip).min(want);
            frags.push(Fragment { base: unsafe { f.base.add(skip) }, size: take });
            skip = 0;
            want -= take;
        }
        Packet {
            frags,
            len: size,
            internal: None,
            deleter: self.deleter.share(),
            offload: self.offload,
        }
    }

    /// Concatenate `other` behind this packet; deleters compose.
    pub fn append(&mut self, mut other: Packet) {
        other.unuse_internal_data();
        self.len += other.len;
        self.frags.append(&mut other.frags);
        self.deleter = mem::take(&mut self.deleter).chain(mem::take(&mut other.deleter));
    }

    // ------------------------------------------------------------------
    // Linearize / header access
    // ------------------------------------------------------------------

    /// Collapse fragments starting at `at_frag` into a single owned fragment
    /// covering at least `desired_size` bytes. The new buffer joins the
    /// deleter chain; prior hooks stay intact.
    pub fn linearize(&mut self, at_frag: usize, desired_size: usize) {
        self.unuse_internal_data();
        let mut nr = 0;
        let mut accum = 0;
        while accum < desired_size {
            accum += self.frags[at_frag + nr].size;
            nr += 1;
        }
        let mut boxed = vec![0u8; accum].into_boxed_slice();
        let mut at = 0;
        for i in 0..nr {
            let f = &self.frags[at_frag + i];
            unsafe { std::ptr::copy_nonoverlapping(f.base, boxed.as_mut_ptr().add(at), f.size) };
            at += f.size;
        }
        let base = boxed.as_mut_ptr();
        self.frags.drain(at_frag..at_frag + nr);
        self.frags.insert(at_frag, Fragment { base, size: accum });
        self.deleter = mem::take(&mut self.deleter).chain(Deleter::owning(boxed));
    }

    /// Contiguous mutable view of `size` bytes at `offset`, linearizing if
    /// the range spans fragments. None if the packet is too short.
    pub fn get_header(&mut self, offset: usize, size: usize) -> Option<&mut [u8]> {
        if offset + size > self.len {
            return None;
        }
        let (mut idx, mut in_off) = (0, offset);
        while in_off >= self.frags[idx].size {
            in_off -= self.frags[idx].size;
            idx += 1;
        }
        if in_off + size > self.frags[idx].size {
            self.linearize(idx, in_off + size);
        }
        let f = &self.frags[idx];
        Some(unsafe { std::slice::from_raw_parts_mut(f.base.add(in_off), size) })
    }

    /// Typed header access for packed wire structs.
    pub fn get_header_t<T: Pod>(&mut self, offset: usize) -> Option<&mut T> {
        self.get_header(offset, mem::size_of::<T>())
            .map(bytemuck::from_bytes_mut)
    }

    // ------------------------------------------------------------------
    // Cross-core release
    // ------------------------------------------------------------------

    /// Retarget the release hook: when the last reference drops (on any
    /// core), the real release is queued back to `cpu`'s task inbox. Never
    /// duplicates the hook.
    pub fn free_on_cpu(mut self, smp: Arc<Smp>, cpu: CpuId) -> Packet {
        let old = mem::take(&mut self.deleter);
        if old.is_empty() {
            return self;
        }
        self.deleter = Deleter::from_hook(move || {
            smp.submit_to(cpu, CoreTask::Run(Box::new(move || drop(old))));
        });
        self
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet {{ len: {}, nr_frags: {} }}", self.len, self.frags.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frag_sum(p: &Packet) -> usize {
        (0..p.nr_frags()).map(|i| p.frag(i).len()).sum()
    }

    #[test]
    fn test_len_matches_fragments() {
        let mut p = Packet::from_vec((0u8..100).collect());
        assert_eq!(p.len(), frag_sum(&p));
        p.prepend_header(20);
        assert_eq!(p.len(), 120);
        assert_eq!(p.len(), frag_sum(&p));
        p.trim_front(30);
        assert_eq!(p.len(), 90);
        assert_eq!(p.len(), frag_sum(&p));
        p.trim_back(10);
        assert_eq!(p.len(), 80);
        assert_eq!(p.len(), frag_sum(&p));
        p.append(Packet::from_vec(vec![7u8; 40]));
        assert_eq!(p.len(), 120);
        assert_eq!(p.len(), frag_sum(&p));
        p.linearize(0, p.len());
        assert_eq!(p.nr_frags(), 1);
        assert_eq!(p.len(), frag_sum(&p));
    }

    #[test]
    fn test_prepend_stays_contiguous() {
        let mut p = Packet::from_vec(vec![0xAA; 10]);
        p.prepend_header(8).fill(0x08);
        p.prepend_header(14).fill(0x0E);
        // Both headers carved from the same headroom block: one front frag.
        assert_eq!(p.nr_frags(), 2);
        let bytes = p.to_vec();
        assert_eq!(&bytes[..14], &[0x0E; 14]);
        assert_eq!(&bytes[14..22], &[0x08; 8]);
        assert_eq!(&bytes[22..], &[0xAA; 10]);
    }

    #[test]
    fn test_release_hook_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut data = vec![1u8; 64].into_boxed_slice();
        let frag = Fragment { base: data.as_mut_ptr(), size: 64 };
        let mut p = Packet::from_raw(
            frag,
            Deleter::from_hook(move || {
                drop(data);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let a = p.share(0, 32);
        let b = p.share(16, 48);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(p);
        drop(a);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_share_references_same_bytes() {
        let mut p = Packet::from_vec((0u8..50).collect());
        p.append(Packet::from_vec((50u8..100).collect()));
        let s = p.share(40, 20);
        assert_eq!(s.len(), 20);
        assert_eq!(s.to_vec(), (40u8..60).collect::<Vec<_>>());
        // Writes through the view are visible in the original.
        let mut s = s;
        s.frag_mut(0)[0] = 0xFF;
        assert_eq!(p.to_vec()[40], 0xFF);
    }

    #[test]
    fn test_get_header_spanning_fragments_linearizes() {
        let mut p = Packet::from_vec(vec![1u8; 10]);
        p.append(Packet::from_vec(vec![2u8; 10]));
        assert_eq!(p.nr_frags(), 2);
        let h = p.get_header(6, 8).unwrap().to_vec();
        assert_eq!(h, [1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(p.nr_frags(), 1);
        assert_eq!(p.len(), 20);
    }

    #[test]
    fn test_linearize_keeps_old_hook_alive() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut data = vec![3u8; 16].into_boxed_slice();
        let frag = Fragment { base: data.as_mut_ptr(), size: 16 };
        let mut p = Packet::from_raw(
            frag,
            Deleter::from_hook(move || {
                drop(data);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        p.append(Packet::from_vec(vec![4u8; 16]));
        p.linearize(0, 32);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(p.to_vec(), [vec![3u8; 16], vec![4u8; 16]].concat());
        drop(p);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_on_cpu_queues_release_home() {
        let smp = Smp::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let p = Packet::from_raw(
            Fragment { base: std::ptr::null_mut(), size: 0 },
            Deleter::from_hook(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let p = p.free_on_cpu(smp.clone(), 0);
        drop(p);
        // Hook did not run inline; it was queued to core 0.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(smp.pending(0), 1);
        for t in smp.drain(0) {
            if let CoreTask::Run(f) = t {
                f();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trim_front_across_fragments() {
        let mut p = Packet::from_vec(vec![1u8; 8]);
        p.append(Packet::from_vec(vec![2u8; 8]));
        p.trim_front(12);
        assert_eq!(p.len(), 4);
        assert_eq!(p.to_vec(), vec![2u8; 4]);
    }
}
