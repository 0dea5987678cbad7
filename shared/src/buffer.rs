//! Lock-free sample ring buffer
//!
//! A fixed number of sample slots in shared memory. Producers (samplers) and
//! consumers (stream and dump readers) each advance their own cursor and
//! claim one slot at a time through a `busy` flag; a second `used` flag
//! records whether the slot holds a sample nobody has consumed yet.
//!
//! The ring is lossy: a producer that laps consumers silently overwrites the
//! oldest unconsumed sample. Nothing on the insert or consume path blocks.

use crate::shm::{align_up, ShmError, SharedMapping};
use crate::strings::Strings;
use crate::types::{Sample, SampleRecord};
use std::cell::UnsafeCell;
use std::io::{self, Write};
use std::mem::size_of;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, trace};

#[repr(C)]
struct BufferHeader {
    position: AtomicUsize,
    it: AtomicUsize,
    used: AtomicUsize,
}

#[repr(C)]
struct Slot {
    busy: AtomicBool,
    used: AtomicBool,
    sample: UnsafeCell<Sample>,
}

impl Slot {
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unclaim(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// How a [`SampleBuffer::consume`] pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The visitor asked to stop
    Stopped,

    /// The buffer was empty or every try was used
    Exhausted,
}

/// Shared memory ring of samples
pub struct SampleBuffer {
    mapping: SharedMapping,
    slots: usize,
    strings: Arc<Strings>,
}

// SAFETY: a slot's sample is only read or written by the thread that won its
// busy flag; everything else in the mapping is atomic.
unsafe impl Send for SampleBuffer {}
unsafe impl Sync for SampleBuffer {}

const SLOTS_OFFSET: usize = align_up(size_of::<BufferHeader>(), 64);

impl SampleBuffer {
    /// Map a ring of `slots` samples
    pub fn startup(slots: usize, strings: Arc<Strings>) -> Result<Self, ShmError> {
        if slots == 0 {
            return Err(ShmError::TooSmall {
                needed: 1,
                available: 0,
            });
        }

        let mapping = SharedMapping::anonymous(SLOTS_OFFSET + slots * size_of::<Slot>())?;

        for index in 0..slots {
            // SAFETY: each slot lies inside the fresh mapping; the sample must
            // hold a valid value before any slot is claimed.
            unsafe {
                let slot = mapping.as_ptr().add(SLOTS_OFFSET + index * size_of::<Slot>());
                slot.cast::<Slot>().write(Slot {
                    busy: AtomicBool::new(false),
                    used: AtomicBool::new(false),
                    sample: UnsafeCell::new(Sample::EMPTY),
                });
            }
        }

        info!(
            "Sample buffer ready: {} slots, {} bytes",
            slots,
            mapping.len()
        );

        Ok(Self {
            mapping,
            slots,
            strings,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Number of slots holding an unconsumed sample
    pub fn occupancy(&self) -> usize {
        self.header().used.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn strings(&self) -> &Arc<Strings> {
        &self.strings
    }

    /// Write `sample` into the next free-to-claim slot
    ///
    /// The buffer takes ownership of the sample's request references. Any
    /// unconsumed sample in the chosen slot is dropped.
    pub fn insert(&self, sample: Sample) {
        let header = self.header();

        let slot = loop {
            let slot = self.slot(advance(&header.position, self.slots));
            if slot.try_claim() {
                break slot;
            }
        };

        // SAFETY: we hold the slot's busy flag.
        let previous = unsafe { std::mem::replace(&mut *slot.sample.get(), sample) };

        if slot
            .used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            header.used.fetch_add(1, Ordering::AcqRel);
        }

        slot.unclaim();

        if !previous.is_unused() {
            previous.request.release(&self.strings);
        }
    }

    /// Hand consumed samples to `visitor` until it breaks or `max_tries` slots were tried
    ///
    /// Each sample is handed out at most once across all consumers.
    pub fn consume<F>(&self, max_tries: usize, mut visitor: F) -> ConsumeOutcome
    where
        F: FnMut(&Sample) -> ControlFlow<()>,
    {
        if self.is_empty() {
            return ConsumeOutcome::Exhausted;
        }

        let header = self.header();

        for _ in 0..max_tries {
            let slot = self.slot(advance(&header.it, self.slots));
            if !slot.try_claim() {
                continue;
            }

            let mut sampled = Sample::EMPTY;
            if slot
                .used
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                header.used.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: we hold the slot's busy flag.
                sampled = unsafe { std::mem::replace(&mut *slot.sample.get(), Sample::EMPTY) };
            }

            slot.unclaim();

            if sampled.is_unused() {
                continue;
            }

            let flow = visitor(&sampled);
            sampled.request.release(&self.strings);

            if flow.is_break() {
                return ConsumeOutcome::Stopped;
            }
        }

        ConsumeOutcome::Exhausted
    }

    /// Drain up to one full lap of samples to `sink` as JSON lines
    ///
    /// Stops at the first write failure and returns it.
    pub fn dump<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        let mut failure = None;
        let mut written = 0usize;

        self.consume(self.slots, |sample| {
            let record = SampleRecord::from_sample(sample, &self.strings);
            let line = serde_json::to_vec(&record)
                .map_err(io::Error::from)
                .and_then(|mut line| {
                    line.push(b'\n');
                    sink.write_all(&line)
                });

            match line {
                Ok(()) => {
                    written += 1;
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            }
        });

        trace!("dumped {} samples", written);

        match failure {
            Some(e) => Err(e),
            None => sink.flush(),
        }
    }

    fn header(&self) -> &BufferHeader {
        // SAFETY: the mapping starts with a zeroed header of atomics.
        unsafe { &*self.mapping.as_ptr().cast::<BufferHeader>() }
    }

    fn slot(&self, index: usize) -> &Slot {
        debug_assert!(index < self.slots);
        // SAFETY: every slot was initialised in `startup`.
        unsafe {
            &*self
                .mapping
                .as_ptr()
                .add(SLOTS_OFFSET + index * size_of::<Slot>())
                .cast::<Slot>()
        }
    }
}

impl Drop for SampleBuffer {
    fn drop(&mut self) {
        for index in 0..self.slots {
            let slot = self.slot(index);
            if slot.used.load(Ordering::Acquire) {
                // SAFETY: drop has exclusive access to the buffer.
                let sample = unsafe { &*slot.sample.get() };
                sample.request.release(&self.strings);
            }
        }
    }
}

/// Fetch-and-advance a cursor, wrapping it to the start of the ring
fn advance(cursor: &AtomicUsize, len: usize) -> usize {
    loop {
        let index = cursor.fetch_add(1, Ordering::AcqRel);
        if index < len {
            return index;
        }

        // first thread past the end rewinds; the rest retry
        if cursor
            .compare_exchange(index + 1, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Memory, Request, SampleKind};

    fn buffer(slots: usize) -> SampleBuffer {
        let strings = Arc::new(Strings::startup(64 * 1024, &[]).unwrap());
        SampleBuffer::startup(slots, strings).unwrap()
    }

    fn memory_sample(marker: u64) -> Sample {
        Sample {
            request: Request::EMPTY,
            elapsed: marker as f64,
            memory: Memory {
                used: marker,
                peak: marker,
            },
            kind: SampleKind::Memory,
        }
    }

    fn drain(buffer: &SampleBuffer) -> Vec<u64> {
        let mut seen = Vec::new();
        buffer.consume(buffer.capacity(), |s| {
            seen.push(s.memory.used);
            ControlFlow::Continue(())
        });
        seen.sort_unstable();
        seen
    }

    #[test]
    fn test_empty_buffer_consumes_nothing() {
        let buffer = buffer(4);
        let mut calls = 0;

        let outcome = buffer.consume(4, |_| {
            calls += 1;
            ControlFlow::Continue(())
        });

        assert_eq!(outcome, ConsumeOutcome::Exhausted);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_insert_then_consume_all() {
        let buffer = buffer(4);
        for marker in 1..=4 {
            buffer.insert(memory_sample(marker));
        }

        assert_eq!(buffer.occupancy(), 4);
        assert_eq!(drain(&buffer), vec![1, 2, 3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(drain(&buffer), Vec::<u64>::new());
    }

    #[test]
    fn test_overwrite_when_full() {
        let buffer = buffer(2);
        for marker in 1..=3 {
            buffer.insert(memory_sample(marker));
        }

        assert_eq!(buffer.occupancy(), 2);
        assert_eq!(drain(&buffer), vec![2, 3]);
    }

    #[test]
    fn test_visitor_stop() {
        let buffer = buffer(4);
        for marker in 1..=4 {
            buffer.insert(memory_sample(marker));
        }

        let mut calls = 0;
        let outcome = buffer.consume(4, |_| {
            calls += 1;
            ControlFlow::Break(())
        });

        assert_eq!(outcome, ConsumeOutcome::Stopped);
        assert_eq!(calls, 1);
        assert_eq!(buffer.occupancy(), 3);
    }

    #[test]
    fn test_overwritten_request_is_released() {
        let buffer = buffer(1);
        let strings = buffer.strings().clone();

        let request = Request::create(&strings, 1, 0.0, Some("/a"), None, None);
        let mut sample = memory_sample(1);
        sample.request = request;
        buffer.insert(sample);
        assert_eq!(strings.temporaries(), 1);

        buffer.insert(memory_sample(2));
        assert_eq!(strings.temporaries(), 0);
    }

    #[test]
    fn test_consumed_request_is_released() {
        let buffer = buffer(2);
        let strings = buffer.strings().clone();

        let mut sample = memory_sample(1);
        sample.request = Request::create(&strings, 1, 0.0, None, Some("GET"), None);
        buffer.insert(sample);

        let mut method = None;
        buffer.consume(2, |s| {
            method = s.request.method.map(|m| m.to_string_lossy().into_owned());
            ControlFlow::Continue(())
        });

        assert_eq!(method.as_deref(), Some("GET"));
        assert_eq!(strings.temporaries(), 0);
    }

    #[test]
    fn test_dump_writes_json_lines() {
        let buffer = buffer(4);
        buffer.insert(memory_sample(10));
        buffer.insert(memory_sample(20));

        let mut out = Vec::new();
        buffer.dump(&mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let record: SampleRecord = serde_json::from_str(line).unwrap();
            assert_eq!(record.kind, "memory");
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_dump_stops_on_write_failure() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = buffer(4);
        buffer.insert(memory_sample(1));
        buffer.insert(memory_sample(2));

        assert!(buffer.dump(&mut Broken).is_err());
        assert_eq!(buffer.occupancy(), 1);
    }

    #[test]
    fn test_advance_wraps() {
        let cursor = AtomicUsize::new(0);
        let seen: Vec<_> = (0..7).map(|_| advance(&cursor, 3)).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}
