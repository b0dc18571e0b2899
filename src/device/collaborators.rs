//! Traits the on-device loader is built against, rather than a concrete filesystem, flash chip
//! or allocator. A real target implements these against its own drivers; tests implement them
//! against plain in-memory buffers.

pub use crate::reloc::{FlashProgrammer, MemoryWriter};

/// A byte-oriented filesystem the loader reads program and symbol files from. Collapses the
/// original's `cfs_open`/`cfs_read`/`cfs_close` loop into one call: this loader reads a whole
/// file up front rather than streaming it through a fixed-size buffer, trading the embedded
/// target's memory frugality for plain byte slices. The streaming codecs underneath
/// ([`crate::reloc::decode_relocation_stream`], [`crate::symtab::SymbolCursor`]) don't require
/// this — a genuinely memory-constrained caller can still drive them incrementally.
pub trait FileSystem {
    /// The error a failed open or read produces.
    type Error: std::fmt::Display;

    /// Reads the whole contents of the file at `path`.
    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Self::Error>;
}

/// The flash region installed modules live in. Flash is memory-mapped and directly readable;
/// writes must go through [`FlashProgrammer`] (usually wrapped in a
/// [`crate::reloc::FlashWriter`] for batching).
pub trait FlashMemory: FlashProgrammer {
    /// Reads `len` bytes starting at `address`.
    fn read(&self, address: u16, len: usize) -> Vec<u8>;
}

/// The RAM allocator new modules' DATA/BSS/MIG/MIGPTR sections are placed in. Extends
/// [`MemoryWriter`] so the loader can relocate directly into freshly allocated RAM without a
/// separate write path.
pub trait RamAllocator: MemoryWriter {
    /// Allocates `size` contiguous bytes, or `None` if there isn't room.
    fn alloc(&mut self, size: u16) -> Option<u16>;
    /// Releases a region previously returned by [`RamAllocator::alloc`].
    fn free(&mut self, address: u16, size: u16);
}

/// The runtime's live process list, consulted by [`crate::device::loader::LoaderContext`] to
/// refuse reinstalling a module whose process is still running and to decide whether any
/// installed module can be erased.
pub trait ProcessRegistry {
    /// Addresses (process descriptor pointers) of every process currently on the live list.
    fn live_processes(&self) -> Vec<u16>;
}

/// The watchdog timer, tickled periodically while streaming a large file off of flash or
/// filesystem storage so a long load doesn't trigger a reset.
pub trait Watchdog {
    /// Resets the watchdog countdown.
    fn tickle(&mut self);
}
