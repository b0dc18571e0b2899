//! Builds a kernel symbol table file from a linked kernel ELF image: the `mksymtab` half of the
//! toolchain.
//!
//! Grounded on the original symbol-table builder's exported-symbol filter, sort and CRC
//! backpatch; see `DESIGN.md`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::format::{
    backpatch_crc, CommonHeader, FormatError, OsImageInfo, SymbolHeader, EOF_SENTINEL,
    MAGIC_SYMBOL,
};
use crate::reader::{ElfReader, ParseError};
use crate::symtab::{encode_symbol_table, SymbolEntry, SymtabError};

/// Errors building a kernel symbol table.
#[derive(Debug, Error)]
pub enum SymtabBuildError {
    /// The kernel ELF object could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The kernel image bytes could not be parsed as an [`OsImageInfo`] prefix.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The symbol table failed to encode (a name too long, or exported symbols not sorted).
    #[error(transparent)]
    Symtab(#[from] SymtabError),
}

/// Builds a kernel symbol table file from the bytes of a linked kernel ELF object. `kernel_image`
/// is the optional flashable kernel image this table should be pinned to (its CRC is recorded in
/// the header so the device loader can refuse a symbol table built for the wrong kernel); pass
/// `None` to leave the table unpinned.
pub fn build_symbol_table(
    kernel_elf_bytes: &[u8],
    kernel_image: Option<&[u8]>,
) -> Result<Vec<u8>, SymtabBuildError> {
    let reader = ElfReader::new(kernel_elf_bytes)?;
    let symtab = reader.symbols_in(".symtab")?;

    // A BTreeMap both sorts by name and dedupes, matching the format's requirement that the
    // encoded list be strictly ascending.
    let mut exported: BTreeMap<String, u16> = BTreeMap::new();
    for symbol in &symtab {
        if symbol.binding() != crate::reader::ElfValue::Known(crate::SymbolBinding::Global) {
            continue;
        }
        if symbol.is_import() {
            continue;
        }
        let Some(Ok(name)) = symbol.name() else {
            continue;
        };
        exported.insert(name.to_string(), u16::try_from(symbol.value()).unwrap());
    }

    let entries: Vec<SymbolEntry> = exported
        .into_iter()
        .map(|(name, value)| SymbolEntry { name, value })
        .collect();

    let kernel_crc = match kernel_image {
        Some(image) => OsImageInfo::parse(image)?.image_crc,
        None => 0,
    };

    let header = SymbolHeader {
        common: CommonHeader {
            magic: MAGIC_SYMBOL,
            crc: 0,
        },
        kernel_crc,
    };

    let mut out = Vec::new();
    header.write(&mut out).unwrap();
    out.extend(encode_symbol_table(&entries)?);
    out.push(EOF_SENTINEL);

    backpatch_crc(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{verify_file_crc, MAGIC_KERNEL_IMAGE};

    #[test]
    fn assembles_header_symbols_and_sentinel() {
        let entries = vec![
            SymbolEntry {
                name: "process_start".to_string(),
                value: 0x4000,
            },
            SymbolEntry {
                name: "process_stop".to_string(),
                value: 0x4010,
            },
        ];

        let header = SymbolHeader {
            common: CommonHeader {
                magic: MAGIC_SYMBOL,
                crc: 0,
            },
            kernel_crc: 0xCAFEBABE,
        };

        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        out.extend(encode_symbol_table(&entries).unwrap());
        out.push(EOF_SENTINEL);
        backpatch_crc(&mut out);

        verify_file_crc(&out).unwrap();
        assert_eq!(out.last(), Some(&EOF_SENTINEL));

        let parsed = SymbolHeader::parse(&out).unwrap();
        assert_eq!(parsed.kernel_crc, 0xCAFEBABE);
    }

    #[test]
    fn kernel_image_crc_is_pinned_from_os_image_info() {
        let mut image = vec![0u8; 14];
        image[0..2].copy_from_slice(&MAGIC_KERNEL_IMAGE.to_le_bytes());
        image[4..8].copy_from_slice(&0x1122_3344u32.to_le_bytes());

        let info = OsImageInfo::parse(&image).unwrap();
        assert_eq!(info.image_crc, 0x1122_3344);
    }
}
