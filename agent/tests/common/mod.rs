//! In-memory stand-in for a sampled process

#![allow(dead_code)]

use stat_agent::sampler::{ReadError, RemoteReader, RuntimeLayout, Target};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const HEAP: u64 = 0x10_000;
pub const EG_FRAME: u64 = 0x20_000;

/// Remote memory made of disjoint regions; every read fails once the
/// read budget is spent, as if the process had exited
pub struct FakeProcess {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    reads: AtomicUsize,
    budget: Option<usize>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            reads: AtomicUsize::new(0),
            budget: None,
        }
    }

    pub fn fail_after(reads: usize) -> Self {
        Self {
            budget: Some(reads),
            ..Self::new()
        }
    }

    /// A process idling outside any frame with the given heap counters
    pub fn idle(used: u64, peak: u64) -> Self {
        let process = Self::new();
        process.put_idle(used, peak);
        process
    }

    pub fn put_idle(&self, used: u64, peak: u64) {
        let heap = RuntimeLayout::default().heap;
        let mut bytes = vec![0u8; heap.peak.max(heap.size) + 8];
        bytes[heap.size..heap.size + 8].copy_from_slice(&used.to_ne_bytes());
        bytes[heap.peak..heap.peak + 8].copy_from_slice(&peak.to_ne_bytes());
        self.put(HEAP, bytes);
        self.put(EG_FRAME, 0u64.to_ne_bytes().to_vec());
    }

    pub fn put(&self, address: u64, bytes: Vec<u8>) {
        self.regions.lock().unwrap().insert(address, bytes);
    }
}

impl RemoteReader for FakeProcess {
    fn read(&self, _pid: i32, address: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        let reads = self.reads.fetch_add(1, Ordering::Relaxed);
        if address == 0 || self.budget.is_some_and(|budget| reads >= budget) {
            return Err(ReadError::Null);
        }

        let regions = self.regions.lock().unwrap();
        let (start, bytes) = regions
            .range(..=address)
            .next_back()
            .ok_or(ReadError::Null)?;
        let offset = (address - start) as usize;
        let region = bytes
            .get(offset..offset + buf.len())
            .ok_or(ReadError::Short {
                address,
                read: 0,
                expected: buf.len(),
            })?;
        buf.copy_from_slice(region);
        Ok(())
    }
}

pub fn target(pid: i32) -> Target {
    Target {
        pid,
        heap: HEAP,
        frame: EG_FRAME,
    }
}
