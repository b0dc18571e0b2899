//! File headers and magic constants shared by every file this crate reads or writes.

use thiserror::Error;

use crate::codec::{read_u16, read_u32, CodecError, WriteLeExt};
use crate::crc::crc32k;

/// Tag at the start of a program module file.
pub const MAGIC_PROGRAM: u16 = 0x4D4C;
/// Tag at the start of a kernel symbol table file.
pub const MAGIC_SYMBOL: u16 = 0x5359;
/// Tag at the start of an installed program's info header in flash.
pub const MAGIC_INSTALLED: u16 = 0x7887;
/// Signature at the start of a kernel image.
pub const MAGIC_KERNEL_IMAGE: u16 = 0x2A6B;
/// Signature at the start of an application image.
pub const MAGIC_APPLICATION_IMAGE: u16 = 0x2A6C;
/// The relocation stream escape byte.
pub const ESCAPE_BYTE: u8 = 0xF5;
/// The sentinel byte every managed file ends with.
pub const EOF_SENTINEL: u8 = 0xFF;

/// Section indices, fixed by the format.
pub const SECTION_TEXT: usize = 0;
/// See [`SECTION_TEXT`].
pub const SECTION_DATA: usize = 1;
/// See [`SECTION_TEXT`].
pub const SECTION_BSS: usize = 2;
/// See [`SECTION_TEXT`].
pub const SECTION_MIG: usize = 3;
/// See [`SECTION_TEXT`].
pub const SECTION_MIGPTR: usize = 4;
/// Number of sections tracked by an installed program's info header.
pub const SECTION_COUNT: usize = 5;

/// Maximum length of an on-disk symbol name (not counting the NUL terminator), matching the
/// on-device fixed-size name buffer.
pub const MAX_SYMBOL_LEN: usize = 32;

/// Maximum length of a module's recorded source filename, NUL included.
pub const MAX_FILENAME_LEN: usize = 16;

/// Errors common to parsing any of the file headers in this module.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The codec underneath failed (short buffer).
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The magic tag did not match what was expected for this file kind.
    #[error("bad magic: expected {expected:#06x}, found {found:#06x}")]
    BadMagic {
        /// The value required for this file type.
        expected: u16,
        /// The value actually present.
        found: u16,
    },
    /// The stored CRC did not match the CRC recomputed over the file.
    #[error("CRC mismatch: file declares {declared:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// The value stored in the header.
        declared: u32,
        /// The value recomputed from the file's bytes.
        computed: u32,
    },
    /// The file is shorter than its header, or is missing the trailing EOF sentinel.
    #[error("truncated file")]
    Truncated,
}

/// The header shared by every managed file: a magic tag and a CRC32-K of the whole file (with
/// this field read as zero while hashing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// The file-type tag.
    pub magic: u16,
    /// CRC32-K of the entire file, computed with this field zeroed.
    pub crc: u32,
}

/// Size in bytes of [`CommonHeader`] on disk.
pub const COMMON_HEADER_SIZE: usize = 6;

impl CommonHeader {
    /// Parses a [`CommonHeader`] from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        Ok(Self {
            magic: read_u16(buf, 0)?,
            crc: read_u32(buf, 2)?,
        })
    }

    /// Writes the header, in the crc-zeroed form used while hashing or before backpatching.
    pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        out.write_u16_le(self.magic)?;
        out.write_u32_le(self.crc)
    }
}

/// Verifies and returns the CRC embedded in a whole file's bytes, without ever mutating the
/// caller's buffer. This sidesteps the aliasing hazard in the original C loader, which read the
/// header, zeroed the CRC field of the live read buffer in place, then re-hashed the same buffer
/// it had just mutated out from under itself.
pub fn verify_file_crc(file: &[u8]) -> Result<(), FormatError> {
    if file.len() < COMMON_HEADER_SIZE {
        return Err(FormatError::Truncated);
    }

    let declared = read_u32(file, 2)?;

    let mut zeroed = file.to_vec();
    zeroed[2..6].copy_from_slice(&0u32.to_le_bytes());
    let computed = crc32k(&zeroed);

    if declared != computed {
        return Err(FormatError::CrcMismatch { declared, computed });
    }

    Ok(())
}

/// Computes the CRC a file should carry, as if its `crc` field were zero, and splices it into
/// `file[2..6]`. Used by the two host-side builders to backpatch the header once the rest of the
/// file has been written.
pub fn backpatch_crc(file: &mut [u8]) {
    debug_assert!(file.len() >= COMMON_HEADER_SIZE);
    file[2..6].copy_from_slice(&0u32.to_le_bytes());
    let crc = crc32k(file);
    file[2..6].copy_from_slice(&crc.to_le_bytes());
}

/// The kernel symbol table file's header: [`CommonHeader`] plus the CRC of the kernel image this
/// table is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolHeader {
    /// The shared file header (`magic` must equal [`MAGIC_SYMBOL`]).
    pub common: CommonHeader,
    /// CRC of the kernel image this table was built for, or 0 if unpinned.
    pub kernel_crc: u32,
}

/// Size in bytes of [`SymbolHeader`] on disk.
pub const SYMBOL_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4;

impl SymbolHeader {
    /// Parses a [`SymbolHeader`], checking the magic tag matches [`MAGIC_SYMBOL`].
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let common = CommonHeader::parse(buf)?;
        if common.magic != MAGIC_SYMBOL {
            return Err(FormatError::BadMagic {
                expected: MAGIC_SYMBOL,
                found: common.magic,
            });
        }

        Ok(Self {
            common,
            kernel_crc: read_u32(buf, COMMON_HEADER_SIZE)?,
        })
    }

    /// Serializes the header.
    pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        self.common.write(out)?;
        out.write_u32_le(self.kernel_crc)
    }
}

/// A program module's header: [`CommonHeader`] plus the section sizes and import count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// The shared file header (`magic` must equal [`MAGIC_PROGRAM`]).
    pub common: CommonHeader,
    /// Offset inside `.text` of the autostart process list.
    pub process_offset: u16,
    /// Size in bytes of the TEXT section.
    pub text_size: u16,
    /// Size in bytes of the DATA section.
    pub data_size: u16,
    /// Size in bytes of the BSS section.
    pub bss_size: u16,
    /// Size in bytes of the MIG section.
    pub mig_size: u16,
    /// Size in bytes of the MIGPTR section.
    pub migptr_size: u16,
    /// Number of distinct kernel-imported symbols referenced by this module's relocations.
    pub sym_entries: u16,
}

/// Size in bytes of [`ProgramHeader`] on disk.
pub const PROGRAM_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 2 * 7;

impl ProgramHeader {
    /// Parses a [`ProgramHeader`], checking the magic tag matches [`MAGIC_PROGRAM`].
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let common = CommonHeader::parse(buf)?;
        if common.magic != MAGIC_PROGRAM {
            return Err(FormatError::BadMagic {
                expected: MAGIC_PROGRAM,
                found: common.magic,
            });
        }

        let mut offset = COMMON_HEADER_SIZE;
        let mut next_u16 = || {
            let value = read_u16(buf, offset)?;
            offset += 2;
            Ok::<u16, FormatError>(value)
        };

        Ok(Self {
            common,
            process_offset: next_u16()?,
            text_size: next_u16()?,
            data_size: next_u16()?,
            bss_size: next_u16()?,
            mig_size: next_u16()?,
            migptr_size: next_u16()?,
            sym_entries: next_u16()?,
        })
    }

    /// Serializes the header.
    pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        self.common.write(out)?;
        out.write_u16_le(self.process_offset)?;
        out.write_u16_le(self.text_size)?;
        out.write_u16_le(self.data_size)?;
        out.write_u16_le(self.bss_size)?;
        out.write_u16_le(self.mig_size)?;
        out.write_u16_le(self.migptr_size)?;
        out.write_u16_le(self.sym_entries)
    }

    /// The sizes of the five sections, in section-index order (TEXT, DATA, BSS, MIG, MIGPTR).
    pub fn section_sizes(&self) -> [u16; SECTION_COUNT] {
        [
            self.text_size,
            self.data_size,
            self.bss_size,
            self.mig_size,
            self.migptr_size,
        ]
    }
}

/// One (pointer, size) pair in an installed module's info header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRange {
    /// Address of the section in its final home (flash for TEXT, RAM otherwise).
    pub ptr: u16,
    /// Size in bytes.
    pub size: u16,
}

/// The header written to flash immediately before an installed module's text, so the
/// installed-program chain can be walked without re-reading the original module file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfoHeader {
    /// Always [`MAGIC_INSTALLED`] once written; used by [`crate::device::loader`] to detect the
    /// end of the installed-program chain.
    pub magic: u16,
    /// Copied from the source module's CRC, used for deduplication.
    pub crc: u32,
    /// The five sections' final addresses and sizes, indexed by `SECTION_*`.
    pub mem: [MemRange; SECTION_COUNT],
    /// Address of the module's autostart process list, inside `mem[SECTION_TEXT]`.
    pub process: u16,
    /// The module's original filename, NUL-padded to [`MAX_FILENAME_LEN`].
    pub source_file: [u8; MAX_FILENAME_LEN],
}

/// Size in bytes of [`ProgramInfoHeader`] on disk.
pub const PROGRAM_INFO_HEADER_SIZE: usize =
    2 + 4 + SECTION_COUNT * 4 + 2 + MAX_FILENAME_LEN;

impl ProgramInfoHeader {
    /// Serializes the header.
    pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        out.write_u16_le(self.magic)?;
        out.write_u32_le(self.crc)?;
        for range in &self.mem {
            out.write_u16_le(range.ptr)?;
            out.write_u16_le(range.size)?;
        }
        out.write_u16_le(self.process)?;
        out.write_all(&self.source_file)
    }

    /// Parses a [`ProgramInfoHeader`] from flash bytes. Does not check the magic; callers walking
    /// the installed-program chain use a magic mismatch as the chain terminator rather than an
    /// error.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < PROGRAM_INFO_HEADER_SIZE {
            return Err(FormatError::Truncated);
        }

        let magic = read_u16(buf, 0)?;
        let crc = read_u32(buf, 2)?;

        let mut mem = [MemRange::default(); SECTION_COUNT];
        let mut offset = 6;
        for range in &mut mem {
            range.ptr = read_u16(buf, offset)?;
            range.size = read_u16(buf, offset + 2)?;
            offset += 4;
        }

        let process = read_u16(buf, offset)?;
        offset += 2;

        let mut source_file = [0u8; MAX_FILENAME_LEN];
        source_file.copy_from_slice(&buf[offset..offset + MAX_FILENAME_LEN]);

        Ok(Self {
            magic,
            crc,
            mem,
            process,
            source_file,
        })
    }

    /// The filename with its NUL padding trimmed, if it is valid UTF-8.
    pub fn source_file_str(&self) -> Option<&str> {
        let end = self
            .source_file
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.source_file.len());
        std::str::from_utf8(&self.source_file[..end]).ok()
    }
}

/// The prefix every kernel or application image starts with, used to pin a symbol table to a
/// specific kernel build (`mksymtab <elf> <out> [kernel_image]`) and, on the device side, to
/// locate the non-initialized-RAM window used by [`crate::device::loader::LoaderContext::is_loaded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsImageInfo {
    /// [`MAGIC_KERNEL_IMAGE`] or [`MAGIC_APPLICATION_IMAGE`].
    pub signature: u16,
    /// Size of the image in bytes.
    pub image_size: u16,
    /// CRC32-K of the image.
    pub image_crc: u32,
    /// The image's entry point address.
    pub entry_point: u16,
    /// Start address of the non-initialized RAM window.
    pub nmem_start: u16,
    /// Size of the non-initialized RAM window.
    pub nmem_size: u16,
}

/// Size in bytes of [`OsImageInfo`] on disk.
pub const OS_IMAGE_INFO_SIZE: usize = 2 + 2 + 4 + 2 + 2 + 2;

impl OsImageInfo {
    /// Parses an [`OsImageInfo`] from the start of an image file's bytes, checking that the
    /// signature is one of the two recognized values.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let signature = read_u16(buf, 0)?;
        if signature != MAGIC_KERNEL_IMAGE && signature != MAGIC_APPLICATION_IMAGE {
            return Err(FormatError::BadMagic {
                expected: MAGIC_KERNEL_IMAGE,
                found: signature,
            });
        }

        Ok(Self {
            signature,
            image_size: read_u16(buf, 2)?,
            image_crc: read_u32(buf, 4)?,
            entry_point: read_u16(buf, 8)?,
            nmem_start: read_u16(buf, 10)?,
            nmem_size: read_u16(buf, 12)?,
        })
    }

    /// Serializes the header.
    pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        out.write_u16_le(self.signature)?;
        out.write_u16_le(self.image_size)?;
        out.write_u32_le(self.image_crc)?;
        out.write_u16_le(self.entry_point)?;
        out.write_u16_le(self.nmem_start)?;
        out.write_u16_le(self.nmem_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_round_trip() {
        let header = CommonHeader {
            magic: MAGIC_PROGRAM,
            crc: 0xDEADBEEF,
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(CommonHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn program_header_round_trip() {
        let header = ProgramHeader {
            common: CommonHeader {
                magic: MAGIC_PROGRAM,
                crc: 0,
            },
            process_offset: 4,
            text_size: 0x40,
            data_size: 0x20,
            bss_size: 0,
            mig_size: 0,
            migptr_size: 0,
            sym_entries: 3,
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), PROGRAM_HEADER_SIZE);
        assert_eq!(ProgramHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn backpatch_matches_verify() {
        let mut file = vec![0u8; COMMON_HEADER_SIZE + 4];
        file[0..2].copy_from_slice(&MAGIC_PROGRAM.to_le_bytes());
        file[COMMON_HEADER_SIZE..].copy_from_slice(&[1, 2, 3, 4]);

        backpatch_crc(&mut file);
        verify_file_crc(&file).unwrap();

        file[COMMON_HEADER_SIZE] ^= 1;
        assert!(verify_file_crc(&file).is_err());
    }

    #[test]
    fn program_info_header_round_trip() {
        let mut source_file = [0u8; MAX_FILENAME_LEN];
        source_file[..5].copy_from_slice(b"a.mlk");

        let header = ProgramInfoHeader {
            magic: MAGIC_INSTALLED,
            crc: 0x1234_5678,
            mem: [
                MemRange { ptr: 0x1000, size: 0x40 },
                MemRange { ptr: 0x2000, size: 0x20 },
                MemRange { ptr: 0x2020, size: 0x10 },
                MemRange { ptr: 0, size: 0 },
                MemRange { ptr: 0, size: 0 },
            ],
            process: 0x1004,
            source_file,
        };

        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), PROGRAM_INFO_HEADER_SIZE);

        let parsed = ProgramInfoHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.source_file_str(), Some("a.mlk"));
    }
}
