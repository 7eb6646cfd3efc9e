// SHOAL — MBUF POOL
// Fixed-size per-core pool of driver buffers, index-addressed. Metadata
// mirrors the PMD's buffer descriptor: chain link, segment count, offload
// flags, stripped VLAN tag. The free list sits behind a mutex that only
// cross-core release hooks ever contend for; a correctly steered datapath
// frees on the owning core.

use std::cell::UnsafeCell;
use std::sync::Arc;

use parking_lot::Mutex;

use super::MBUF_DATA_SIZE;
use crate::engine::{fatal, E_POOL_CREATE};

pub type MbufIdx = u16;

/// Driver buffer metadata. `pkt_len`/`nb_segs` are meaningful on the head of
/// a chain only.
#[derive(Copy, Clone)]
pub struct Mbuf {
    pub data_len: u32,
    pub pkt_len: u32,
    pub nb_segs: u16,
    pub next: Option<MbufIdx>,
    pub ol_flags: u64,
    pub vlan_tci: u16,
    pub l2_len: u8,
    pub l3_len: u8,
}

impl Mbuf {
    const RESET: Mbuf = Mbuf {
        data_len: 0,
        pkt_len: 0,
        nb_segs: 1,
        next: None,
        ol_flags: 0,
        vlan_tci: 0,
        l2_len: 0,
        l3_len: 0,
    };
}

struct Slot {
    meta: Mbuf,
    data: [u8; MBUF_DATA_SIZE],
}

/// The pool. Created once per core at queue setup; shared with RX release
/// hooks via `Arc`.
pub struct MbufPool {
    slots: Box<[UnsafeCell<Slot>]>,
    free: Mutex<Vec<MbufIdx>>,
}

// SAFETY: an allocated slot is owned exclusively by whoever holds its index
// (the driver until RX, then the packet's release hook, or the TX path until
// the port consumes it). The free list serializes handover.
unsafe impl Send for MbufPool {}
unsafe impl Sync for MbufPool {}

impl MbufPool {
    /// Allocate every slot up front. Boot-fatal if the index space cannot
    /// hold the request.
    pub fn create(n: usize) -> Arc<MbufPool> {
        if n == 0 || n > MbufIdx::MAX as usize {
            fatal(E_POOL_CREATE, &format!("mbuf pool size {n} out of range"));
        }
        let slots: Box<[UnsafeCell<Slot>]> = (0..n)
            .map(|_| UnsafeCell::new(Slot { meta: Mbuf::RESET, data: [0u8; MBUF_DATA_SIZE] }))
            .collect();
        // LIFO free list: recently-freed buffers are cache-warm.
        let free = (0..n as MbufIdx).rev().collect();
        Arc::new(MbufPool { slots, free: Mutex::new(free) })
    }

    /// One buffer with reset metadata, or None when exhausted.
    pub fn alloc(&self) -> Option<MbufIdx> {
        let idx = self.free.lock().pop()?;
        unsafe { (*self.slots[idx as usize].get()).meta = Mbuf::RESET };
        Some(idx)
    }

    /// Return a single buffer. The caller must not touch `idx` afterwards.
    pub fn free(&self, idx: MbufIdx) {
        self.free.lock().push(idx);
    }

    /// Return a whole chain, following `next` links from the head.
    pub fn free_chain(&self, head: MbufIdx) {
        let mut cur = Some(head);
        while let Some(idx) = cur {
            cur = unsafe { (*self.slots[idx as usize].get()).meta.next };
            self.free(idx);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Metadata of an owned buffer.
    ///
    /// SAFETY: caller must hold the index exclusively (allocated, not freed,
    /// not concurrently accessed).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn meta(&self, idx: MbufIdx) -> &mut Mbuf {
        &mut (*self.slots[idx as usize].get()).meta
    }

    /// Data region of an owned buffer. Same contract as `meta`.
    pub unsafe fn data_ptr(&self, idx: MbufIdx) -> *mut u8 {
        (*self.slots[idx as usize].get()).data.as_mut_ptr()
    }
}
