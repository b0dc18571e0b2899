//! The escape-byte relocation stream codec: the encoder used by the host-side module builder and
//! the streaming decoder used by the device-side loader.

use std::io::Read;

use thiserror::Error;

use crate::format::{ESCAPE_BYTE, SECTION_COUNT};

/// Errors from encoding or decoding a relocation stream.
#[derive(Debug, Error)]
pub enum RelocError {
    /// A relocation's address falls outside the section content, or relocations overlap.
    #[error("relocation at address {0:#06x} is out of range or overlaps the previous one")]
    BadAddress(u16),
    /// An absolute-section value's low byte equals the escape byte, which cannot be represented.
    #[error("absolute value {0:#06x} collides with the escape byte in its low byte")]
    AbsoluteEscapeCollision(u16),
    /// A computed opcode does not fit in 16 bits.
    #[error("relocation opcode overflowed 16 bits")]
    OpcodeOverflow,
    /// The stream ended in the middle of an opcode or addend.
    #[error("truncated relocation stream")]
    Truncated,
    /// An opcode referenced a local offset outside of any of the five known sections.
    #[error("opcode {0:#06x} does not land in any section")]
    OpcodeOutOfRange(u16),
    /// An opcode referenced a kernel import index that does not exist.
    #[error("opcode {0:#06x} references import {1}, but only {2} imports exist")]
    ImportOutOfRange(u16, u16, u16),
    /// A memory writer rejected a write (out of bounds, non-contiguous flash batch, etc.).
    #[error("memory write failed: {0}")]
    WriteFailed(String),
    /// The underlying stream could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One of the five sections a local (non-import) relocation target can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSection {
    /// See [`crate::format::SECTION_TEXT`].
    Text,
    /// See [`crate::format::SECTION_DATA`].
    Data,
    /// See [`crate::format::SECTION_BSS`].
    Bss,
    /// See [`crate::format::SECTION_MIG`].
    Mig,
    /// See [`crate::format::SECTION_MIGPTR`].
    MigPtr,
}

impl LocalSection {
    /// All five sections, in the order they are concatenated for local-reference base offsets:
    /// TEXT, DATA, BSS, MIG, MIGPTR.
    pub const ORDER: [LocalSection; SECTION_COUNT] = [
        LocalSection::Text,
        LocalSection::Data,
        LocalSection::Bss,
        LocalSection::Mig,
        LocalSection::MigPtr,
    ];

    fn index(self) -> usize {
        match self {
            LocalSection::Text => 0,
            LocalSection::Data => 1,
            LocalSection::Bss => 2,
            LocalSection::Mig => 3,
            LocalSection::MigPtr => 4,
        }
    }
}

/// What a single relocation site resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// The symbol is absolute; its value is written as a raw little-endian `u16` with no escape
    /// processing.
    Absolute(u16),
    /// The symbol is a kernel import, referenced by its index among the sorted, deduplicated
    /// import list.
    KernelImport {
        /// Index into the sorted import list.
        import_index: u16,
        /// Signed addend, usually 0.
        addend: i16,
    },
    /// The symbol lives in one of this module's own sections.
    Local {
        /// Which of the five sections.
        section: LocalSection,
        /// The symbol's offset within that section.
        value_in_section: u16,
        /// Signed addend, usually 0.
        addend: i16,
    },
}

/// A single relocation: where in the section's content to write, and what to write there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset into the section's content of the 2-byte location this relocation rewrites.
    pub address: u16,
    /// What the location resolves to.
    pub target: RelocTarget,
}

fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        if byte == ESCAPE_BYTE {
            out.push(ESCAPE_BYTE);
            out.push(0);
            out.push(0);
        } else {
            out.push(byte);
        }
    }
}

fn write_opcode(out: &mut Vec<u8>, op: u32) -> Result<(), RelocError> {
    let op = u16::try_from(op).map_err(|_| RelocError::OpcodeOverflow)?;
    out.extend_from_slice(&op.to_le_bytes());
    Ok(())
}

fn local_base_offset(section: LocalSection, section_sizes: &[u16; SECTION_COUNT]) -> u32 {
    LocalSection::ORDER
        .iter()
        .take_while(|&&s| s != section)
        .map(|s| u32::from(section_sizes[s.index()]))
        .sum()
}

/// Encodes the relocation stream for one section's content. `num_imports` is `N`, the total count
/// of distinct kernel imports referenced anywhere in the module (shared across all sections'
/// streams). `section_sizes` gives the five sections' final sizes in `SECTION_*` index order, used
/// to compute `base_offset` for local references.
///
/// Each relocation's two-byte placeholder in `content` at `relocation.address` is replaced by the
/// encoded reference; bytes outside any relocation are copied through the escape filter.
pub fn encode_relocation_stream(
    content: &[u8],
    relocations: &[Relocation],
    num_imports: u16,
    section_sizes: &[u16; SECTION_COUNT],
) -> Result<Vec<u8>, RelocError> {
    let mut sorted = relocations.to_vec();
    sorted.sort_by_key(|r| r.address);

    let mut out = Vec::new();
    let mut pos: usize = 0;
    let n = u32::from(num_imports);

    for reloc in &sorted {
        let addr = usize::from(reloc.address);
        if addr < pos || addr + 2 > content.len() {
            return Err(RelocError::BadAddress(reloc.address));
        }

        escape_into(&content[pos..addr], &mut out);

        match reloc.target {
            RelocTarget::Absolute(value) => {
                if value.to_le_bytes()[0] == ESCAPE_BYTE {
                    return Err(RelocError::AbsoluteEscapeCollision(value));
                }
                out.extend_from_slice(&value.to_le_bytes());
            }
            RelocTarget::KernelImport {
                import_index,
                addend,
            } => {
                out.push(ESCAPE_BYTE);
                if addend == 0 {
                    write_opcode(&mut out, u32::from(import_index) + 1)?;
                } else {
                    write_opcode(&mut out, n + u32::from(import_index) + 1)?;
                    out.extend_from_slice(&addend.to_le_bytes());
                }
            }
            RelocTarget::Local {
                section,
                value_in_section,
                addend,
            } => {
                let base = local_base_offset(section, section_sizes);
                let op = i64::from(2 * n as i64 + 1)
                    + i64::from(base)
                    + i64::from(value_in_section)
                    + i64::from(addend);
                let op = u32::try_from(op).map_err(|_| RelocError::OpcodeOverflow)?;
                out.push(ESCAPE_BYTE);
                write_opcode(&mut out, op)?;
            }
        }

        pos = addr + 2;
    }

    escape_into(&content[pos..], &mut out);

    Ok(out)
}

/// Destination for decoded relocation bytes: direct RAM stores for DATA/MIG/MIGPTR, or a
/// batching flash writer for TEXT (see [`FlashWriter`]).
pub trait MemoryWriter {
    /// Writes `bytes` starting at `address`. Implementations may buffer; callers that need the
    /// write committed (e.g. before reading it back) must flush separately.
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), RelocError>;
}

/// A [`MemoryWriter`] that stores directly into a RAM-backed byte slice, used for DATA, MIG and
/// MIGPTR.
pub struct RamWriter<'a> {
    base: u16,
    buf: &'a mut [u8],
}

impl<'a> RamWriter<'a> {
    /// Creates a writer where `buf[0]` corresponds to address `base`.
    pub fn new(base: u16, buf: &'a mut [u8]) -> Self {
        Self { base, buf }
    }
}

impl MemoryWriter for RamWriter<'_> {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), RelocError> {
        let offset = usize::from(address.wrapping_sub(self.base));
        let dest = self
            .buf
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| RelocError::WriteFailed(format!("address {address:#06x} out of range")))?;
        dest.copy_from_slice(bytes);
        Ok(())
    }
}

/// The collaborator that actually programs flash, named in SPEC_FULL.md §6. `write_word`
/// commits a single 16-bit word only once `setup` has been called and before `done`.
pub trait FlashProgrammer {
    /// Prepares flash for a batch of writes (raises the programming voltage, etc.).
    fn setup(&mut self) -> Result<(), RelocError>;
    /// Writes one 16-bit word at `address`. Must only be called between `setup` and `done`.
    fn write_word(&mut self, address: u16, value: u16) -> Result<(), RelocError>;
    /// Finishes a batch of writes (lowers the programming voltage).
    fn done(&mut self) -> Result<(), RelocError>;
    /// Erases the single erase unit starting at `address`, resetting it to all-`0xFF`. `address`
    /// must be aligned to [`FlashProgrammer::erase_unit_size`].
    fn erase_unit(&mut self, address: u16) -> Result<(), RelocError>;
    /// The size in bytes of one erase unit.
    fn erase_unit_size(&self) -> u16;
}

/// A [`MemoryWriter`] over a [`FlashProgrammer`] that batches 16 bytes (8 words) per
/// `setup`/`done` bracket, so the programming voltage is only applied for bounded durations.
pub struct FlashWriter<'a, F: FlashProgrammer> {
    programmer: &'a mut F,
    pending_addr: u16,
    pending: Vec<u8>,
}

const FLASH_BATCH_BYTES: usize = 16;

impl<'a, F: FlashProgrammer> FlashWriter<'a, F> {
    /// Creates a flash writer over `programmer`.
    pub fn new(programmer: &'a mut F) -> Self {
        Self {
            programmer,
            pending_addr: 0,
            pending: Vec::with_capacity(FLASH_BATCH_BYTES),
        }
    }

    /// Commits any buffered bytes shorter than a full batch. Must be called once writing is done;
    /// a loader that forgets this will leave up to 15 bytes unprogrammed.
    pub fn flush(&mut self) -> Result<(), RelocError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.programmer.setup()?;
        for (i, chunk) in self.pending.chunks(2).enumerate() {
            let word = if chunk.len() == 2 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                u16::from_le_bytes([chunk[0], 0])
            };
            self.programmer
                .write_word(self.pending_addr + u16::try_from(i * 2).unwrap(), word)?;
        }
        self.programmer.done()?;
        self.pending.clear();
        Ok(())
    }
}

impl<F: FlashProgrammer> MemoryWriter for FlashWriter<'_, F> {
    fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), RelocError> {
        if self.pending.is_empty() {
            self.pending_addr = address;
        } else {
            let expected = self.pending_addr + u16::try_from(self.pending.len()).unwrap();
            if expected != address {
                // A new, non-contiguous write starts: flush what we have first.
                self.flush()?;
                self.pending_addr = address;
            }
        }

        self.pending.extend_from_slice(bytes);

        while self.pending.len() >= FLASH_BATCH_BYTES {
            let batch_addr = self.pending_addr;
            self.programmer.setup()?;
            for (i, chunk) in self.pending[..FLASH_BATCH_BYTES].chunks(2).enumerate() {
                let word = u16::from_le_bytes([chunk[0], chunk[1]]);
                self.programmer
                    .write_word(batch_addr + u16::try_from(i * 2).unwrap(), word)?;
            }
            self.programmer.done()?;
            self.pending.drain(..FLASH_BATCH_BYTES);
            self.pending_addr = batch_addr + u16::try_from(FLASH_BATCH_BYTES).unwrap();
        }

        Ok(())
    }
}

fn locate_local(
    offset_within_concat: u32,
    section_sizes: &[u16; SECTION_COUNT],
) -> Option<(LocalSection, u16)> {
    let mut base = 0u32;
    for section in LocalSection::ORDER {
        let size = u32::from(section_sizes[section.index()]);
        if offset_within_concat < base + size {
            return Some((
                section,
                u16::try_from(offset_within_concat - base).unwrap(),
            ));
        }
        base += size;
    }
    None
}

/// Decodes one section's relocation stream, writing the resolved bytes through `writer`, and
/// stopping once exactly `target_output_len` bytes have been produced rather than at end of
/// input: sections are laid out back-to-back in the same file with no per-section length
/// delimiter, so `reader` is typically a cursor shared across consecutive calls, one per section,
/// each left positioned at the start of the next section's stream. `out_base` is the final
/// in-memory address corresponding to the start of this section's content. `section_bases` gives
/// the five sections' final in-memory addresses (flash for TEXT, RAM otherwise), in `SECTION_*`
/// index order, used to resolve local references. `symbol_values` holds the resolved kernel
/// import addresses, indexed the same way they were assigned at build time.
pub fn decode_relocation_stream<R: Read>(
    mut reader: R,
    target_output_len: u16,
    section_sizes: &[u16; SECTION_COUNT],
    section_bases: &[u16; SECTION_COUNT],
    symbol_values: &[u16],
    out_base: u16,
    writer: &mut dyn MemoryWriter,
) -> Result<(), RelocError> {
    let n = u16::try_from(symbol_values.len()).unwrap();
    let mut out_pos: u16 = 0;

    while out_pos < target_output_len {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(|_| RelocError::Truncated)?;

        if byte[0] != ESCAPE_BYTE {
            writer.write(out_base + out_pos, &byte)?;
            out_pos += 1;
            continue;
        }

        let mut op_bytes = [0u8; 2];
        reader.read_exact(&mut op_bytes).map_err(|_| RelocError::Truncated)?;
        let op = u16::from_le_bytes(op_bytes);

        if op == 0 {
            writer.write(out_base + out_pos, &[ESCAPE_BYTE])?;
            out_pos += 1;
            continue;
        }

        if op <= n {
            let idx = op - 1;
            let value = *symbol_values
                .get(usize::from(idx))
                .ok_or(RelocError::ImportOutOfRange(op, idx, n))?;
            writer.write(out_base + out_pos, &value.to_le_bytes())?;
            out_pos += 2;
            continue;
        }

        if op <= 2 * n {
            let idx = op - n - 1;
            let base_value = *symbol_values
                .get(usize::from(idx))
                .ok_or(RelocError::ImportOutOfRange(op, idx, n))?;
            let mut addend_bytes = [0u8; 2];
            reader
                .read_exact(&mut addend_bytes)
                .map_err(|_| RelocError::Truncated)?;
            let addend = i16::from_le_bytes(addend_bytes);
            let value = base_value.wrapping_add_signed(addend);
            writer.write(out_base + out_pos, &value.to_le_bytes())?;
            out_pos += 2;
            continue;
        }

        let offset_within_concat = u32::from(op) - u32::from(2 * n) - 1;
        let (section, offset_in_section) =
            locate_local(offset_within_concat, section_sizes).ok_or(RelocError::OpcodeOutOfRange(op))?;
        let value = section_bases[section.index()] + offset_in_section;
        writer.write(out_base + out_pos, &value.to_le_bytes())?;
        out_pos += 2;
    }

    if out_pos != target_output_len {
        return Err(RelocError::Truncated);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{SECTION_BSS, SECTION_DATA, SECTION_MIG, SECTION_MIGPTR, SECTION_TEXT};

    struct VecWriter {
        base: u16,
        buf: Vec<u8>,
    }

    impl MemoryWriter for VecWriter {
        fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), RelocError> {
            let offset = usize::from(address - self.base);
            if offset + bytes.len() > self.buf.len() {
                self.buf.resize(offset + bytes.len(), 0);
            }
            self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn s2_escape_literal() {
        let content = [0xF5u8];
        let sizes = [1, 0, 0, 0, 0];
        let encoded = encode_relocation_stream(&content, &[], 0, &sizes).unwrap();
        assert_eq!(encoded, vec![0xF5, 0x00, 0x00]);
    }

    #[test]
    fn s3_kernel_import_no_addend() {
        let content = [0u8; 2];
        let relocations = [Relocation {
            address: 0,
            target: RelocTarget::KernelImport {
                import_index: 2,
                addend: 0,
            },
        }];
        let sizes = [2, 0, 0, 0, 0];
        let encoded = encode_relocation_stream(&content, &relocations, 3, &sizes).unwrap();
        assert_eq!(encoded, vec![0xF5, 0x03, 0x00]);
    }

    #[test]
    fn s4_kernel_import_with_addend() {
        let content = [0u8; 2];
        let relocations = [Relocation {
            address: 0,
            target: RelocTarget::KernelImport {
                import_index: 0,
                addend: 7,
            },
        }];
        let sizes = [2, 0, 0, 0, 0];
        let encoded = encode_relocation_stream(&content, &relocations, 3, &sizes).unwrap();
        assert_eq!(encoded, vec![0xF5, 0x04, 0x00, 0x07, 0x00]);
    }

    #[test]
    fn s5_local_data_reference() {
        // text=0x40, data=0x20; relocation in DATA's own content at byte 4.
        let content = [0u8; 0x20];
        let relocations = [Relocation {
            address: 4,
            target: RelocTarget::Local {
                section: LocalSection::Data,
                value_in_section: 4,
                addend: 0,
            },
        }];
        let sizes = [0x40, 0x20, 0, 0, 0];
        let encoded = encode_relocation_stream(&content, &relocations, 3, &sizes).unwrap();
        assert_eq!(encoded[..4], [0, 0, 0, 0]);
        assert_eq!(&encoded[4..], &[0xF5, 0x4B, 0x00]);
    }

    #[test]
    fn round_trip_with_escape_and_relocations() {
        let mut content = vec![0xF5, 1, 2, 3, 0, 0, 4, 0xF5, 5, 0, 0];
        let relocations = [
            Relocation {
                address: 4,
                target: RelocTarget::KernelImport {
                    import_index: 0,
                    addend: 0,
                },
            },
            Relocation {
                address: 9,
                target: RelocTarget::Local {
                    section: LocalSection::Text,
                    value_in_section: 0x10,
                    addend: 0,
                },
            },
        ];
        let sizes = [0x20, 0, 0, 0, 0];
        let imports = [0x9999u16];

        let encoded = encode_relocation_stream(&content, &relocations, 1, &sizes).unwrap();

        let mut out = VecWriter {
            base: 0x1000,
            buf: vec![0; content.len()],
        };
        decode_relocation_stream(
            &encoded[..],
            u16::try_from(content.len()).unwrap(),
            &sizes,
            &[0x1000, 0, 0, 0, 0],
            &imports,
            0x1000,
            &mut out,
        )
        .unwrap();

        content[4] = 0x99;
        content[5] = 0x99;
        content[9] = 0x10;
        content[10] = 0x10;
        assert_eq!(out.buf, content);
    }

    #[test]
    fn rejects_absolute_escape_collision() {
        let content = [0u8; 2];
        let relocations = [Relocation {
            address: 0,
            target: RelocTarget::Absolute(0x12F5),
        }];
        let sizes = [2, 0, 0, 0, 0];
        let err = encode_relocation_stream(&content, &relocations, 0, &sizes).unwrap_err();
        assert!(matches!(err, RelocError::AbsoluteEscapeCollision(_)));
    }

    #[test]
    fn flash_writer_batches_sixteen_bytes() {
        struct CountingFlash {
            setups: u32,
            writes: Vec<(u16, u16)>,
        }
        impl FlashProgrammer for CountingFlash {
            fn setup(&mut self) -> Result<(), RelocError> {
                self.setups += 1;
                Ok(())
            }
            fn write_word(&mut self, address: u16, value: u16) -> Result<(), RelocError> {
                self.writes.push((address, value));
                Ok(())
            }
            fn done(&mut self) -> Result<(), RelocError> {
                Ok(())
            }
            fn erase_unit(&mut self, _address: u16) -> Result<(), RelocError> {
                Ok(())
            }
            fn erase_unit_size(&self) -> u16 {
                512
            }
        }

        let mut flash = CountingFlash {
            setups: 0,
            writes: Vec::new(),
        };
        {
            let mut writer = FlashWriter::new(&mut flash);
            for i in 0..20u16 {
                writer.write(i, &[i as u8]).unwrap();
            }
            writer.flush().unwrap();
        }
        assert_eq!(flash.writes.len(), 10);
        assert_eq!(flash.setups, 2); // one batch of 16 bytes, one flush of the trailing 4
    }

    #[test]
    fn unused_section_indices_present() {
        // Sanity check the constants line up with SECTION_* in crate::format.
        assert_eq!(LocalSection::Text.index(), SECTION_TEXT);
        assert_eq!(LocalSection::Data.index(), SECTION_DATA);
        assert_eq!(LocalSection::Bss.index(), SECTION_BSS);
        assert_eq!(LocalSection::Mig.index(), SECTION_MIG);
        assert_eq!(LocalSection::MigPtr.index(), SECTION_MIGPTR);
    }
}
