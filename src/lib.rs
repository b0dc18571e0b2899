//! minilink is a host-side toolchain and device-side loader for a minimalistic dynamic linker
//! format used to ship relocatable application modules onto a resident microcontroller kernel.
//!
//! The crate is split into:
//! * [`reader`] — a lazy ELF reader (header, sections, segments, strings, symbols,
//!   relocations) used to pull sections, symbols and relocations out of compiler output.
//! * [`crc`], [`codec`], [`symtab`], [`reloc`], [`format`] — the on-disk format: a streaming
//!   CRC32-K, a little-endian scalar codec, the delta-compressed symbol table, the escape-byte
//!   relocation stream, and the file headers that tie them together.
//! * [`host`] — the two host-side builders (`mkminimod`'s module builder, `mksymtab`'s
//!   symbol-table builder) that drive the reader and the format modules.
//! * [`device`] — the on-device loader and the collaborator traits (filesystem, flash
//!   programmer, allocator, watchdog, process registry) it is built against.
//!
//! # Examples
//!
//! See [`reader`] and [`host`].

#![warn(missing_docs)]

pub mod codec;
pub mod crc;
pub mod device;
pub mod format;
pub mod host;
pub mod reloc;
pub mod symtab;

mod consts;
pub mod reader;

pub use flagset;

pub use consts::{
    ElfKind, Endianness, MachineKind, OsAbi, SectionFlag, SectionKind, SegmentFlag, SegmentKind,
    SymbolBinding, SymbolKind,
};
#[doc(inline)]
pub use reader::{ElfReader, ParseError};
