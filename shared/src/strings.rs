//! Interned strings in shared memory
//!
//! Two kinds of string live here:
//!
//! - **persistent** strings are de-duplicated through an open addressing
//!   table and live as long as the table. File, class and function names
//!   captured by samplers are interned this way, so a name read a million
//!   times costs one copy.
//! - **temporary** strings are reference counted and allocated from an
//!   [`Arena`]. Request metadata (path, method, uri) uses these since it
//!   goes away when the sampler that owns it is deactivated.
//!
//! Both kinds share the same [`ShmString`] header so a [`StringRef`] can be
//! read without knowing which kind it is.

use crate::arena::Arena;
use crate::shm::{align_up, ShmError, SharedMapping};
use std::borrow::Cow;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StringsError {
    #[error("string table is full")]
    Full,
}

/// How a [`ShmString`] is owned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StringKind {
    Persistent = 1,
    Temporary = 2,
}

/// Header shared by persistent and temporary strings; bytes follow inline
#[repr(C)]
pub struct ShmString {
    kind: AtomicU8,
    refcount: AtomicU32,
    length: usize,
}

const STRING_HEADER: usize = size_of::<ShmString>();

/// Handle to a string in shared memory
///
/// Persistent handles are valid for the life of the [`Strings`] table.
/// Temporary handles are valid while the caller holds a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringRef(NonNull<ShmString>);

// SAFETY: the referenced memory is shared memory whose header fields are
// atomics or immutable after publication.
unsafe impl Send for StringRef {}
unsafe impl Sync for StringRef {}

impl StringRef {
    pub fn kind(&self) -> StringKind {
        // SAFETY: the header is initialised before a handle is created.
        match unsafe { self.0.as_ref() }.kind.load(Ordering::Acquire) {
            1 => StringKind::Persistent,
            _ => StringKind::Temporary,
        }
    }

    pub fn len(&self) -> usize {
        // SAFETY: see `kind`.
        unsafe { self.0.as_ref() }.length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of the string
    ///
    /// The returned slice borrows shared memory owned by the [`Strings`]
    /// table that produced this handle; it must not outlive that table, nor
    /// the last reference of a temporary string.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the bytes are written before the handle is published and
        // never modified afterwards.
        unsafe {
            let data = self.0.as_ptr().cast::<u8>().add(STRING_HEADER);
            std::slice::from_raw_parts(data, self.len())
        }
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    fn refcount(&self) -> &AtomicU32 {
        // SAFETY: see `kind`.
        unsafe { &self.0.as_ref().refcount }
    }
}

#[repr(C)]
struct TableHeader {
    used: AtomicUsize,
    bytes_used: AtomicUsize,
}

#[repr(C)]
struct Slot {
    locked: AtomicBool,
    hash: AtomicU64,
    /// Offset of the string from the start of the mapping, 0 when empty
    value: AtomicUsize,
}

/// Number of opcode names kept in the lookup table
pub const OPCODE_COUNT: usize = 256;

/// The shared string table plus its temporary-string arena
pub struct Strings {
    mapping: SharedMapping,
    slots: usize,
    bytes_offset: usize,
    bytes_size: usize,
    arena: Arena,
    opcodes: Vec<Option<StringRef>>,
}

impl Strings {
    /// Build the table within `budget` bytes and intern the opcode names
    ///
    /// A fifth of the budget holds slots and the rest holds string bytes. The
    /// temporary arena gets a separate mapping of the same size. Names are
    /// indexed by opcode; a leading `ZEND_` is stripped and missing names
    /// become `UNKNOWN`.
    pub fn startup(budget: usize, opcode_names: &[&str]) -> Result<Self, ShmError> {
        let slots_size = budget / 5;
        let slots = slots_size / size_of::<Slot>();
        let bytes_size = slots_size * 4;

        if slots < 2 {
            return Err(ShmError::TooSmall {
                needed: size_of::<Slot>() * 10,
                available: budget,
            });
        }

        let slots_offset = align_up(size_of::<TableHeader>(), 16);
        let bytes_offset = align_up(slots_offset + slots * size_of::<Slot>(), 16);
        let mapping = SharedMapping::anonymous(bytes_offset + bytes_size)?;
        let arena = Arena::create(budget)?;

        let mut strings = Self {
            mapping,
            slots,
            bytes_offset,
            bytes_size,
            arena,
            opcodes: Vec::with_capacity(OPCODE_COUNT),
        };

        for code in 0..OPCODE_COUNT {
            let name = opcode_names
                .get(code)
                .filter(|name| !name.is_empty())
                .map(|name| name.strip_prefix("ZEND_").unwrap_or(name))
                .unwrap_or("UNKNOWN");

            let interned = strings.intern_owned(name.as_bytes()).ok();
            strings.opcodes.push(interned);
        }

        info!(
            "String table ready: {} slots, {} bytes, {} byte arena",
            slots,
            bytes_size,
            strings.arena.capacity()
        );

        Ok(strings)
    }

    /// Intern `bytes`, returning the existing copy when one is already present
    pub fn intern_owned(&self, bytes: &[u8]) -> Result<StringRef, StringsError> {
        let header = self.header();

        if header.used.fetch_add(1, Ordering::AcqRel) + 1 >= self.slots {
            header.used.fetch_sub(1, Ordering::AcqRel);
            return Err(StringsError::Full);
        }

        let hash = hash_bytes(bytes);
        let mut index = (hash % self.slots as u64) as usize;
        let mut probes = 0;

        loop {
            let slot = self.slot(index);
            let value = slot.value.load(Ordering::Acquire);

            if value != 0 {
                if slot.hash.load(Ordering::Relaxed) == hash {
                    let existing = self.string_at(value);
                    if existing.as_bytes() == bytes {
                        header.used.fetch_sub(1, Ordering::AcqRel);
                        return Ok(existing);
                    }
                }

                probes += 1;
                if probes >= self.slots {
                    header.used.fetch_sub(1, Ordering::AcqRel);
                    return Err(StringsError::Full);
                }
                index = (index + 1) % self.slots;
                continue;
            }

            spin_lock(&slot.locked);

            if slot.value.load(Ordering::Acquire) != 0 {
                // lost the race for this slot; re-check what was published
                spin_unlock(&slot.locked);
                continue;
            }

            let size = align_up(STRING_HEADER + bytes.len(), 8);
            let offset = header.bytes_used.fetch_add(size, Ordering::AcqRel);
            if offset + size > self.bytes_size {
                header.bytes_used.fetch_sub(size, Ordering::AcqRel);
                spin_unlock(&slot.locked);
                header.used.fetch_sub(1, Ordering::AcqRel);
                debug!("string table out of bytes ({} requested)", bytes.len());
                return Err(StringsError::Full);
            }

            let value = self.bytes_offset + offset;
            // SAFETY: [offset, offset + size) was exclusively claimed above.
            let string = unsafe {
                let ptr = self.mapping.as_ptr().add(value);
                write_string(ptr, StringKind::Persistent, 0, bytes)
            };

            slot.hash.store(hash, Ordering::Relaxed);
            slot.value.store(value, Ordering::Release);
            spin_unlock(&slot.locked);

            return Ok(string);
        }
    }

    /// Copy `bytes` into a reference counted string owned by the caller
    pub fn make_temporary(&self, bytes: &[u8]) -> Result<StringRef, StringsError> {
        let ptr = self
            .arena
            .alloc(STRING_HEADER + bytes.len())
            .ok_or(StringsError::Full)?;

        // SAFETY: the arena handed out at least header + len bytes.
        Ok(unsafe { write_string(ptr.as_ptr(), StringKind::Temporary, 1, bytes) })
    }

    /// Take another reference to `string`
    pub fn copy(&self, string: StringRef) -> StringRef {
        if string.kind() == StringKind::Temporary {
            string.refcount().fetch_add(1, Ordering::AcqRel);
        }
        string
    }

    /// Drop a reference to `string`, freeing temporaries at zero
    pub fn release(&self, string: StringRef) {
        if string.kind() == StringKind::Persistent {
            return;
        }

        if string.refcount().fetch_sub(1, Ordering::AcqRel) == 1 {
            // SAFETY: temporaries are only created by `make_temporary` and
            // this was the last reference.
            unsafe { self.arena.free(string.0.cast()) };
        }
    }

    /// Interned name for `opcode`
    pub fn lookup_opcode(&self, opcode: u8) -> Option<StringRef> {
        self.opcodes.get(opcode as usize).copied().flatten()
    }

    /// Number of persistent strings in the table
    pub fn len(&self) -> usize {
        self.header().used.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks held by live temporary strings
    pub fn temporaries(&self) -> usize {
        self.arena.used_blocks()
    }

    fn header(&self) -> &TableHeader {
        // SAFETY: the mapping starts with a zero-initialised header.
        unsafe { &*self.mapping.as_ptr().cast::<TableHeader>() }
    }

    fn slot(&self, index: usize) -> &Slot {
        let offset = align_up(size_of::<TableHeader>(), 16) + index * size_of::<Slot>();
        // SAFETY: index < slots, all slot memory is zero-initialised atomics.
        unsafe { &*self.mapping.as_ptr().add(offset).cast::<Slot>() }
    }

    fn string_at(&self, value: usize) -> StringRef {
        // SAFETY: `value` was published by a slot and points at a string.
        StringRef(unsafe { NonNull::new_unchecked(self.mapping.as_ptr().add(value).cast()) })
    }
}

unsafe fn write_string(ptr: *mut u8, kind: StringKind, refcount: u32, bytes: &[u8]) -> StringRef {
    let header = ptr.cast::<ShmString>();
    header.write(ShmString {
        kind: AtomicU8::new(kind as u8),
        refcount: AtomicU32::new(refcount),
        length: bytes.len(),
    });
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(STRING_HEADER), bytes.len());
    StringRef(NonNull::new_unchecked(header))
}

fn spin_lock(lock: &AtomicBool) {
    while lock
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        std::hint::spin_loop();
    }
}

fn spin_unlock(lock: &AtomicBool) {
    lock.store(false, Ordering::Release);
}

/// FNV-1a; stable across processes and builds
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: &[&str] = &["ZEND_NOP", "ZEND_ADD", "", "ZEND_MUL"];

    fn strings() -> Strings {
        Strings::startup(64 * 1024, NAMES).unwrap()
    }

    #[test]
    fn test_intern_roundtrip() {
        let strings = strings();
        let s = strings.intern_owned(b"/var/www/index.php").unwrap();

        assert_eq!(s.as_bytes(), b"/var/www/index.php");
        assert_eq!(s.kind(), StringKind::Persistent);
    }

    #[test]
    fn test_intern_deduplicates() {
        let strings = strings();
        let before = strings.len();

        let a = strings.intern_owned(b"Foo::bar").unwrap();
        let b = strings.intern_owned(b"Foo::bar").unwrap();
        let c = strings.intern_owned(b"Foo::baz").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(strings.len(), before + 2);
    }

    #[test]
    fn test_empty_string_interns() {
        let strings = strings();
        let s = strings.intern_owned(b"").unwrap();
        assert!(s.is_empty());
        assert_eq!(strings.intern_owned(b"").unwrap(), s);
    }

    #[test]
    fn test_intern_until_full() {
        let strings = Strings::startup(4 * 1024, &[]).unwrap();

        let mut last = Ok(strings.lookup_opcode(0).unwrap());
        for i in 0..10_000 {
            last = strings.intern_owned(format!("name-{}", i).as_bytes());
            if last.is_err() {
                break;
            }
        }

        assert_eq!(last, Err(StringsError::Full));
    }

    #[test]
    fn test_opcode_lookup() {
        let strings = strings();

        assert_eq!(strings.lookup_opcode(0).unwrap().as_bytes(), b"NOP");
        assert_eq!(strings.lookup_opcode(1).unwrap().as_bytes(), b"ADD");
        assert_eq!(strings.lookup_opcode(2).unwrap().as_bytes(), b"UNKNOWN");
        assert_eq!(strings.lookup_opcode(3).unwrap().as_bytes(), b"MUL");
        assert_eq!(strings.lookup_opcode(200).unwrap().as_bytes(), b"UNKNOWN");
        assert_eq!(strings.lookup_opcode(2), strings.lookup_opcode(200));
    }

    #[test]
    fn test_temporary_refcount_and_reuse() {
        let strings = strings();

        let t = strings.make_temporary(b"GET").unwrap();
        assert_eq!(t.kind(), StringKind::Temporary);
        assert_eq!(t.to_string_lossy(), "GET");

        let copy = strings.copy(t);
        strings.release(t);
        assert_eq!(copy.as_bytes(), b"GET");
        assert_eq!(strings.temporaries(), 1);

        strings.release(copy);
        assert_eq!(strings.temporaries(), 0);

        let again = strings.make_temporary(b"PUT").unwrap();
        assert_eq!(again, t);
        strings.release(again);
    }

    #[test]
    fn test_persistent_copy_release_are_noops() {
        let strings = strings();
        let s = strings.intern_owned(b"main").unwrap();

        strings.release(strings.copy(s));
        strings.release(s);
        assert_eq!(s.as_bytes(), b"main");
    }

    #[test]
    fn test_concurrent_intern_agrees() {
        use std::sync::Arc;

        let strings = Arc::new(strings());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strings = strings.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| strings.intern_owned(format!("fn{}", i).as_bytes()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
    }

    #[test]
    fn test_hash_is_fnv1a() {
        assert_eq!(hash_bytes(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(hash_bytes(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
