// CLASSIFICATION: COMMUNITY
// Filename: sampling.rs v0.7
// Author: Lukas Bower
// Date Modified: 2027-02-03

//! Overflow sampling buffer.
//!
//! Fixed-layout ring of overflow snapshots shared read-only with user
//! space. Writers claim slots with an atomic fetch-and-increment so
//! two CPUs recording into one shared buffer can never collide on a
//! slot. Storage survives until the fork reference count reaches zero
//! AND the user mapping has been removed; the two events may land in
//! either order.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::config::{self, PAGE_SIZE, PFM_SMPL_VERSION};
use crate::types::{CpuId, PerfmonError, PerfmonResult, TaskId};

/// Outcome of recording one sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Entry stored, space remains.
    NotFull,
    /// Entry stored into the final slot; buffer is now full.
    Full,
    /// Buffer already full, entry discarded.
    Dropped,
}

/// Fixed header exposed at the start of the user-visible image.
#[derive(Clone, Copy, Debug)]
pub struct SamplingHeader {
    pub version: u32,
    pub entry_size: u32,
    /// Which PMD values each entry carries, low-64 mask form.
    pub pmd_mask: u64,
    pub entry_count: u64,
}

impl SamplingHeader {
    /// PMD indices recorded per entry, ascending.
    pub fn pmd_mask_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(move |i| self.pmd_mask & (1 << i) != 0)
    }
}

/// One overflow snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleEntry {
    pub pid: TaskId,
    pub cpu: CpuId,
    pub ip: u64,
    pub ovfl_pmds: u64,
    pub stamp: u64,
    /// Reserved for the sampling period, kept for layout stability.
    pub period: u64,
    pub values: Vec<u64>,
}

const ENTRY_FIXED_BYTES: usize = 4 + 4 + 8 + 8 + 8 + 8;
const HEADER_BYTES: usize = 4 + 4 + 8 + 8;

/// Shared handle to one sampling buffer.
pub type BufferHandle = Arc<SamplingBuffer>;

#[derive(Debug)]
pub struct SamplingBuffer {
    header: SamplingHeader,
    /// Next free slot; claims go through fetch_add only.
    head: AtomicU64,
    slots: Vec<Mutex<SampleEntry>>,
    /// Fork-sharing count, independent of the Arc count.
    refs: AtomicU32,
    mapping_removed: AtomicBool,
    freed: AtomicBool,
    /// Base of the user mapping, recorded so destroy can ask the
    /// mapping collaborator to remove it.
    user_addr: u64,
    mapped_size: usize,
}

impl SamplingBuffer {
    /// Allocate a zeroed buffer of `entry_count` slots recording the
    /// PMDs in `pmd_mask`. Total size is rounded up to the page size
    /// and checked against the caller's locked-memory quota.
    pub fn allocate(
        entry_count: u64,
        pmd_mask: u64,
        quota_bytes: usize,
        user_addr: u64,
    ) -> PerfmonResult<BufferHandle> {
        if entry_count == 0 {
            return Err(PerfmonError::InvalidArgument);
        }
        let d = config::description();
        if pmd_mask & !d.impl_pmds.low_mask() != 0 {
            return Err(PerfmonError::InvalidArgument);
        }
        let nvalues = pmd_mask.count_ones() as usize;
        let entry_size = ENTRY_FIXED_BYTES + nvalues * 8;
        let mapped_size = usize::try_from(entry_count)
            .ok()
            .and_then(|n| n.checked_mul(entry_size))
            .and_then(|b| b.checked_add(HEADER_BYTES + PAGE_SIZE - 1))
            .map(|b| b & !(PAGE_SIZE - 1))
            .unwrap_or(usize::MAX);
        if mapped_size > quota_bytes {
            warn!(
                "sampling: {mapped_size} bytes exceeds locked-memory quota {quota_bytes}"
            );
            return Err(PerfmonError::QuotaExceeded);
        }
        // zero-initialised slots: nothing from a previous life is ever
        // visible through the user mapping
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(entry_count as usize)
            .map_err(|_| PerfmonError::OutOfMemory)?;
        for _ in 0..entry_count {
            slots.push(Mutex::new(SampleEntry {
                values: vec![0; nvalues],
                ..SampleEntry::default()
            }));
        }
        debug!("sampling: allocated {entry_count} entries, {mapped_size} bytes mapped");
        Ok(Arc::new(SamplingBuffer {
            header: SamplingHeader {
                version: PFM_SMPL_VERSION,
                entry_size: entry_size as u32,
                pmd_mask,
                entry_count,
            },
            head: AtomicU64::new(0),
            slots,
            refs: AtomicU32::new(1),
            mapping_removed: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            user_addr,
            mapped_size,
        }))
    }

    pub fn header(&self) -> &SamplingHeader {
        &self.header
    }

    pub fn user_addr(&self) -> u64 {
        self.user_addr
    }

    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Entries recorded so far, capped at capacity.
    pub fn entries_recorded(&self) -> u64 {
        self.head.load(Ordering::Acquire).min(self.header.entry_count)
    }

    pub fn is_full(&self) -> bool {
        self.head.load(Ordering::Acquire) >= self.header.entry_count
    }

    /// Append one snapshot. The slot index comes from a single
    /// fetch-and-increment, so concurrent recorders each own a
    /// distinct slot; a claim past the end is discarded untouched.
    pub fn record_sample(
        &self,
        pid: TaskId,
        cpu: CpuId,
        ip: u64,
        ovfl_pmds: u64,
        stamp: u64,
        values: &[u64],
    ) -> RecordOutcome {
        let pos = self.head.fetch_add(1, Ordering::AcqRel);
        if pos >= self.header.entry_count {
            return RecordOutcome::Dropped;
        }
        if let Ok(mut slot) = self.slots[pos as usize].lock() {
            slot.pid = pid;
            slot.cpu = cpu;
            slot.ip = ip;
            slot.ovfl_pmds = ovfl_pmds;
            slot.stamp = stamp;
            slot.period = 0;
            let n = slot.values.len().min(values.len());
            slot.values[..n].copy_from_slice(&values[..n]);
        }
        if pos + 1 == self.header.entry_count {
            RecordOutcome::Full
        } else {
            RecordOutcome::NotFull
        }
    }

    /// Rewind to empty. Callers guarantee no recording is in flight;
    /// the context state machine only permits recording while enabled
    /// and not frozen.
    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }

    /// Fork-time share.
    pub fn acquire_reference(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one fork reference; storage goes away once the count hits
    /// zero and the mapping is gone. Returns the remaining count.
    pub fn release_reference(&self) -> u32 {
        let left = self.refs.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.try_free();
        left
    }

    /// Mapping collaborator's close callback: the user mapping has been
    /// torn down. Order relative to the last reference drop does not
    /// matter.
    pub fn mapping_removed(&self) {
        self.mapping_removed.store(true, Ordering::Release);
        self.try_free();
    }

    fn try_free(&self) {
        if self.refs.load(Ordering::Acquire) == 0
            && self.mapping_removed.load(Ordering::Acquire)
            && !self.freed.swap(true, Ordering::AcqRel)
        {
            debug!("sampling: buffer storage released");
        }
    }

    /// True once both release conditions were met.
    pub fn storage_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Serialize the user-visible image: header then `entry_count`
    /// fixed-size records, little-endian, bit-exact per the negotiated
    /// format version.
    pub fn view(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.mapped_size);
        out.extend_from_slice(&self.header.version.to_le_bytes());
        out.extend_from_slice(&self.header.entry_size.to_le_bytes());
        out.extend_from_slice(&self.header.pmd_mask.to_le_bytes());
        out.extend_from_slice(&self.header.entry_count.to_le_bytes());
        for slot in &self.slots {
            let e = match slot.lock() {
                Ok(e) => e,
                Err(_) => continue,
            };
            out.extend_from_slice(&e.pid.to_le_bytes());
            out.extend_from_slice(&e.cpu.to_le_bytes());
            out.extend_from_slice(&e.ip.to_le_bytes());
            out.extend_from_slice(&e.ovfl_pmds.to_le_bytes());
            out.extend_from_slice(&e.stamp.to_le_bytes());
            out.extend_from_slice(&e.period.to_le_bytes());
            for v in &e.values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out.resize(self.mapped_size, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTA: usize = 1 << 20;

    #[test]
    fn allocation_size_and_quota() {
        let buf = SamplingBuffer::allocate(4, 0xf0, QUOTA, 0x1000).unwrap();
        assert_eq!(buf.header().entry_size, (ENTRY_FIXED_BYTES + 4 * 8) as u32);
        assert_eq!(buf.mapped_size() % PAGE_SIZE, 0);
        assert_eq!(
            SamplingBuffer::allocate(1 << 20, 0xf0, QUOTA, 0).unwrap_err(),
            PerfmonError::QuotaExceeded
        );
        assert_eq!(
            SamplingBuffer::allocate(0, 0xf0, QUOTA, 0).unwrap_err(),
            PerfmonError::InvalidArgument
        );
    }

    #[test]
    fn unimplemented_pmd_mask_rejected() {
        assert_eq!(
            SamplingBuffer::allocate(4, 1 << 63, QUOTA, 0).unwrap_err(),
            PerfmonError::InvalidArgument
        );
    }

    #[test]
    fn fills_exactly_at_capacity() {
        let buf = SamplingBuffer::allocate(2, 0x10, QUOTA, 0).unwrap();
        assert_eq!(
            buf.record_sample(1, 0, 0x40, 0x10, 1, &[7]),
            RecordOutcome::NotFull
        );
        assert_eq!(
            buf.record_sample(1, 0, 0x44, 0x10, 2, &[8]),
            RecordOutcome::Full
        );
        assert_eq!(
            buf.record_sample(1, 0, 0x48, 0x10, 3, &[9]),
            RecordOutcome::Dropped
        );
        assert!(buf.is_full());
        assert_eq!(buf.entries_recorded(), 2);
        buf.reset();
        assert_eq!(buf.entries_recorded(), 0);
    }

    #[test]
    fn concurrent_recorders_claim_distinct_slots() {
        let n = 16;
        let buf = SamplingBuffer::allocate(n, 0x10, QUOTA, 0).unwrap();
        let mut joins = Vec::new();
        for t in 0..n {
            let b = Arc::clone(&buf);
            joins.push(std::thread::spawn(move || {
                b.record_sample(100 + t as u32, 0, t, 0x10, t, &[t])
            }));
        }
        for j in joins {
            assert_ne!(j.join().unwrap(), RecordOutcome::Dropped);
        }
        // every stamp written exactly once -> all slots distinct
        let mut stamps: Vec<u64> = buf
            .slots
            .iter()
            .map(|s| s.lock().unwrap().stamp)
            .collect();
        stamps.sort_unstable();
        stamps.dedup();
        assert_eq!(stamps.len(), n as usize);
    }

    #[test]
    fn freed_only_after_both_conditions() {
        let buf = SamplingBuffer::allocate(2, 0x10, QUOTA, 0).unwrap();
        assert_eq!(buf.acquire_reference(), 2);
        assert_eq!(buf.release_reference(), 1);
        buf.mapping_removed();
        assert!(!buf.storage_freed());
        assert_eq!(buf.release_reference(), 0);
        assert!(buf.storage_freed());

        // opposite order
        let buf = SamplingBuffer::allocate(2, 0x10, QUOTA, 0).unwrap();
        assert_eq!(buf.release_reference(), 0);
        assert!(!buf.storage_freed());
        buf.mapping_removed();
        assert!(buf.storage_freed());
    }

    #[test]
    fn view_layout_is_fixed() {
        let buf = SamplingBuffer::allocate(1, 0x10, QUOTA, 0).unwrap();
        buf.record_sample(7, 2, 0xdead, 0x10, 99, &[42]);
        let img = buf.view();
        assert_eq!(img.len(), buf.mapped_size());
        assert_eq!(
            u32::from_le_bytes(img[0..4].try_into().unwrap()),
            PFM_SMPL_VERSION
        );
        let entry = &img[HEADER_BYTES..];
        assert_eq!(u32::from_le_bytes(entry[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(entry[4..8].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(entry[8..16].try_into().unwrap()), 0xdead);
        assert_eq!(
            u64::from_le_bytes(entry[40..48].try_into().unwrap()),
            42
        );
    }
}
