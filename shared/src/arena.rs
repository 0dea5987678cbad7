//! Fixed-size shared memory arena
//!
//! A first-fit allocator over a single shared mapping. Blocks form an
//! intrusive singly linked list ordered by address; each block carries its
//! payload inline. The break pointer only moves forward, so the list is always
//! address ordered and "next" is also the physically adjacent block.
//!
//! All list mutations happen under a process-shared mutex stored at the start
//! of the mapping. The arena never grows: once the break pointer reaches the
//! end of the mapping and no free block fits, allocation fails.

use crate::shm::{align_up, ShmError, ShmMutex, SharedMapping};
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr::NonNull;
use tracing::debug;

/// Alignment of every payload handed out by the arena
pub const ARENA_ALIGN: usize = 16;

#[repr(C)]
struct ArenaHeader {
    mutex: ShmMutex,
    list: UnsafeCell<BlockList>,
}

#[repr(C)]
struct BlockList {
    size: usize,
    brk: usize,
    start: usize,
    end: usize,
}

#[repr(C)]
struct Block {
    size: usize,
    used: usize,
    next: usize,
}

const HEADER_SIZE: usize = align_up(size_of::<ArenaHeader>(), ARENA_ALIGN);
const BLOCK_SIZE: usize = align_up(size_of::<Block>(), ARENA_ALIGN);

/// Splitting leaves a remainder only when it can hold a useful block
const BLOCK_MIN: usize = BLOCK_SIZE * 2;

/// Shared memory arena with a first-fit free list
pub struct Arena {
    mapping: SharedMapping,
}

// SAFETY: every access to the block list happens under the process-shared
// mutex in the arena header.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena backed by `capacity` bytes of shared memory
    pub fn create(capacity: usize) -> Result<Self, ShmError> {
        let needed = HEADER_SIZE + BLOCK_SIZE + ARENA_ALIGN;
        if capacity < needed {
            return Err(ShmError::TooSmall {
                needed,
                available: capacity,
            });
        }

        let mapping = SharedMapping::anonymous(capacity)?;
        let header = mapping.as_ptr().cast::<ArenaHeader>();

        // SAFETY: the mapping is fresh, zeroed and large enough for the header.
        unsafe {
            ShmMutex::init(std::ptr::addr_of_mut!((*header).mutex))?;
            let list = &mut *(*header).list.get();
            list.size = capacity;
            list.brk = HEADER_SIZE;
            list.start = 0;
            list.end = 0;
        }

        Ok(Self { mapping })
    }

    /// Total size of the backing mapping
    pub fn capacity(&self) -> usize {
        self.mapping.len()
    }

    /// Allocate `size` bytes, or `None` when the arena is exhausted
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_up(size.max(1), ARENA_ALIGN);
        let _guard = self.header().mutex.lock();

        // SAFETY: the list is only touched while the mutex is held.
        unsafe {
            let header = self.list();

            let mut cursor = header.start;
            while cursor != 0 {
                let block = self.block(cursor);

                if block.used == 0 {
                    if block.size >= size {
                        self.split(header, cursor, size);
                        block.used = 1;
                        return Some(self.payload(cursor));
                    }

                    if block.next != 0 {
                        let next_offset = block.next;
                        let next = self.block(next_offset);

                        if next.used == 0 && block.size + BLOCK_SIZE + next.size >= size {
                            block.size += BLOCK_SIZE + next.size;
                            block.next = next.next;
                            if header.end == next_offset {
                                header.end = cursor;
                            }

                            self.split(header, cursor, size);
                            block.used = 1;
                            return Some(self.payload(cursor));
                        }
                    }
                }

                cursor = block.next;
            }

            let offset = header.brk;
            if offset + BLOCK_SIZE + size > header.size {
                return None;
            }
            header.brk += BLOCK_SIZE + size;

            let block = self.block(offset);
            block.size = size;
            block.used = 1;
            block.next = 0;

            if header.end != 0 {
                self.block(header.end).next = offset;
            } else {
                header.start = offset;
            }
            header.end = offset;

            Some(self.payload(offset))
        }
    }

    /// Return memory previously handed out by [`Arena::alloc`]
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc` on this arena and not freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        debug_assert!(self.mapping.contains(ptr.as_ptr()));

        let offset = ptr.as_ptr() as usize - self.mapping.as_ptr() as usize - BLOCK_SIZE;
        let _guard = self.header().mutex.lock();
        let header = self.list();
        let block = self.block(offset);

        while block.next != 0 {
            let next_offset = block.next;
            let next = self.block(next_offset);
            if next.used != 0 {
                break;
            }

            block.size += BLOCK_SIZE + next.size;
            block.next = next.next;
            if header.end == next_offset {
                header.end = offset;
            }
        }

        block.used = 0;
    }

    /// Number of blocks currently handed out
    pub fn used_blocks(&self) -> usize {
        let _guard = self.header().mutex.lock();
        let mut count = 0;

        // SAFETY: read under the mutex.
        unsafe {
            let mut cursor = self.list().start;
            while cursor != 0 {
                let block = self.block(cursor);
                if block.used != 0 {
                    count += 1;
                }
                cursor = block.next;
            }
        }

        count
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: the header was initialised in `create`.
        unsafe { &*self.mapping.as_ptr().cast::<ArenaHeader>() }
    }

    /// Caller must hold the arena mutex
    #[allow(clippy::mut_from_ref)]
    unsafe fn list(&self) -> &mut BlockList {
        &mut *self.header().list.get()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn block(&self, offset: usize) -> &mut Block {
        &mut *self.mapping.as_ptr().add(offset).cast::<Block>()
    }

    unsafe fn payload(&self, offset: usize) -> NonNull<u8> {
        NonNull::new_unchecked(self.mapping.as_ptr().add(offset + BLOCK_SIZE))
    }

    /// Carve the tail of a free block into a new free block when it is big enough
    unsafe fn split(&self, header: &mut BlockList, offset: usize, size: usize) {
        let block = self.block(offset);
        if block.size - size <= BLOCK_MIN {
            return;
        }

        let remainder_offset = offset + BLOCK_SIZE + size;
        let remainder = self.block(remainder_offset);
        remainder.size = block.size - size - BLOCK_SIZE;
        remainder.used = 0;
        remainder.next = block.next;

        block.size = size;
        block.next = remainder_offset;

        if header.end == offset {
            header.end = remainder_offset;
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let leaked = self.used_blocks();
        if leaked > 0 {
            debug!("arena destroyed with {} leaked blocks", leaked);
        }

        // SAFETY: we have exclusive access; nothing can be waiting on the mutex.
        unsafe { self.header().mutex.destroy() };
    }
}
