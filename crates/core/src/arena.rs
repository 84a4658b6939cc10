//! Shared bump arenas backing crystal regions
//!
//! A crystal region's memory is a chain of bump-allocated pages
//! (`bumpalo::Bump`). The arena itself is `Arc`-shared: every string or
//! buffer payload cut from it holds the arena alive, so page memory can
//! never be reclaimed while a value still points into it. The region
//! manager dropping its handle only releases accounting; the pages go away
//! with the last payload.
//!
//! Allocation alignment is fixed at 8 bytes. Requests larger than the
//! current page get a dedicated oversize page (bumpalo chains pages
//! internally).

use bumpalo::Bump;
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

/// All arena allocations are 8-byte aligned.
pub const ARENA_ALIGN: usize = 8;

/// Default size of the first page in a fresh region.
pub const ARENA_PAGE_SIZE: usize = 4096;

struct ArenaInner {
    bump: Bump,
}

// Safety: Bump is not Sync because allocation mutates through &self. We
// uphold a stricter protocol instead:
// - All allocation into an arena happens on the thread that is populating
//   the region (a freeze deep-clone), before any value cut from it can be
//   observed by another thread.
// - After population the arena is only ever read (byte slices at fixed
//   addresses) or dropped; neither touches the Bump's allocation cursor.
// - Dropping on a foreign thread is fine: Bump is Send.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// An `Arc`-shared bump arena.
///
/// Cloning is O(1) and shares the underlying pages.
#[derive(Clone)]
pub struct SharedArena {
    inner: Arc<ArenaInner>,
}

impl SharedArena {
    pub fn new() -> Self {
        SharedArena {
            inner: Arc::new(ArenaInner {
                bump: Bump::with_capacity(ARENA_PAGE_SIZE),
            }),
        }
    }

    /// Bump-allocate `size` bytes, 8-byte aligned.
    ///
    /// Never fails except on host OOM, which aborts (bumpalo's policy).
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        let layout = layout_for(size);
        self.inner.bump.alloc_layout(layout)
    }

    /// Bump-allocate `size` zeroed bytes, 8-byte aligned.
    pub fn alloc_zeroed(&self, size: usize) -> NonNull<u8> {
        let ptr = self.alloc(size);
        // Safety: alloc returned a fresh block of at least `size` bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size.max(1));
        }
        ptr
    }

    /// Copy a string into the arena and return a payload that keeps the
    /// arena alive.
    pub fn alloc_str(&self, s: &str) -> ArenaStr {
        let bytes = self.alloc_bytes(s.as_bytes());
        ArenaStr { bytes }
    }

    /// Copy a byte slice into the arena.
    pub fn alloc_bytes(&self, data: &[u8]) -> ArenaBytes {
        let ptr = self.alloc(data.len());
        // Safety: alloc returned at least data.len() writable bytes that
        // nothing else aliases yet.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
        ArenaBytes {
            arena: self.clone(),
            ptr,
            len: data.len(),
        }
    }

    /// Bytes handed out so far, including page-rounding overhead.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.bump.allocated_bytes()
    }

    /// True when both handles share the same pages.
    pub fn ptr_eq(&self, other: &SharedArena) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SharedArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedArena({} bytes)", self.allocated_bytes())
    }
}

fn layout_for(size: usize) -> Layout {
    // Size 0 still yields a distinct aligned address.
    match Layout::from_size_align(size.max(1), ARENA_ALIGN) {
        Ok(layout) => layout,
        // from_size_align only fails when size overflows isize when
        // rounded up; such a request is unsatisfiable anyway.
        Err(_) => Layout::new::<u64>(),
    }
}

/// Byte payload owned by an arena.
///
/// Holds the `SharedArena` alive, so the pointed-to bytes outlive every
/// clone of this payload. Clone is O(1).
#[derive(Clone)]
pub struct ArenaBytes {
    arena: SharedArena,
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the bytes are immutable after construction and the arena keeps
// them alive; see the ArenaInner impls above.
unsafe impl Send for ArenaBytes {}
unsafe impl Sync for ArenaBytes {}

impl ArenaBytes {
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len were produced by alloc_bytes from a live arena
        // that self.arena keeps alive.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }
}

impl PartialEq for ArenaBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl std::fmt::Debug for ArenaBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaBytes({} bytes)", self.len)
    }
}

/// String payload owned by an arena. See [`ArenaBytes`].
#[derive(Clone, PartialEq)]
pub struct ArenaStr {
    bytes: ArenaBytes,
}

impl ArenaStr {
    pub fn as_str(&self) -> &str {
        // Safety: constructed from a &str in alloc_str, so the bytes are
        // valid UTF-8 and immutable.
        unsafe { std::str::from_utf8_unchecked(self.bytes.as_slice()) }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for ArenaStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArenaStr({:?})", self.as_str())
    }
}

impl std::fmt::Display for ArenaStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
