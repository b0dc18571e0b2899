//! The on-device loader: validates a program module and its kernel symbol table, resolves
//! imports, allocates RAM and flash, relocates every section and chains the result onto the
//! installed-program list in flash.
//!
//! Grounded end-to-end on `minilink_load` and its helpers, with two corrections already adopted
//! as Open Question decisions (see `DESIGN.md`): the free-ROM comparison in [`alloc_text`] runs
//! in the right direction, and the CRC check ([`crate::format::verify_file_crc`]) never mutates
//! the buffer it is hashing.

use thiserror::Error;

use crate::device::collaborators::{FileSystem, FlashMemory, ProcessRegistry, RamAllocator, Watchdog};
use crate::format::{
    FormatError, MemRange, ProgramHeader, ProgramInfoHeader, SymbolHeader, MAGIC_INSTALLED,
    MAX_FILENAME_LEN, PROGRAM_HEADER_SIZE, PROGRAM_INFO_HEADER_SIZE, SECTION_BSS, SECTION_COUNT,
    SECTION_DATA, SECTION_MIG, SECTION_MIGPTR, SECTION_TEXT, SYMBOL_HEADER_SIZE,
};
use crate::reloc::{decode_relocation_stream, FlashWriter, MemoryWriter, RelocError};
use crate::symtab::{resolve_one, ImportCursor, Lookup, SymbolCursor, SymtabError};

/// Errors [`LoaderContext::load`] can return, each mapping to one of the on-device status codes
/// via [`LoadError::status_code`].
#[derive(Debug, Error)]
pub enum LoadError {
    /// The source filename does not fit in [`MAX_FILENAME_LEN`].
    #[error("filename longer than {MAX_FILENAME_LEN} bytes")]
    NameTooLong,
    /// The filesystem collaborator failed to open or read a file.
    #[error("could not read {path}: {reason}")]
    Io {
        /// The file that could not be read.
        path: String,
        /// What the filesystem collaborator reported.
        reason: String,
    },
    /// A file's header or CRC did not check out.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// The module's import list or the kernel symbol table was malformed.
    #[error(transparent)]
    Symtab(#[from] SymtabError),
    /// A relocation stream was malformed or referenced something out of range.
    #[error(transparent)]
    Reloc(#[from] RelocError),
    /// An import could not be found in the kernel symbol table.
    #[error("unresolved symbol {0:?}")]
    UnresolvedSymbol(String),
    /// A section's size was odd; every section must be word-aligned.
    #[error("section size not word-aligned")]
    UnalignedSection,
    /// There was no room in flash or RAM for the module.
    #[error("out of memory")]
    OutOfMemory,
    /// The module is already installed and one of its processes is still on the live list. Carries
    /// the address of the offending process, per SPEC_FULL.md §6's `clean_space() -> nullable
    /// process` contract.
    #[error("program is already installed and still running (process {0:#06x})")]
    Busy(u16),
}

impl LoadError {
    /// The on-device status code this error maps to: 1 = bad file, 2 = out of memory or busy,
    /// 3 = unresolved symbol.
    pub fn status_code(&self) -> u8 {
        match self {
            LoadError::OutOfMemory | LoadError::Busy(_) => 2,
            LoadError::UnresolvedSymbol(_) => 3,
            _ => 1,
        }
    }
}

fn align_prev(x: u16, unit: u16) -> u16 {
    x - (x % unit)
}

fn align_next(x: u16, unit: u16) -> u16 {
    let prev = align_prev(x, unit);
    if x % unit != 0 {
        prev + unit
    } else {
        prev
    }
}

fn align_word_next(x: u16) -> u16 {
    x + (x & 1)
}

/// Owns the free-ROM cursor and the fixed start of the installable area. One instance is created
/// per boot via [`LoaderContext::init`]; there is no way to construct one with stale state.
pub struct LoaderContext {
    /// Fixed start of the area new modules are installed into (`__data_end_rom`, erase-unit
    /// aligned up). Never changes after [`LoaderContext::init`]; the installed-program chain
    /// always starts here regardless of how far `freerom_start` has advanced.
    instprog_first: u16,
    /// Next free byte in the installable area.
    freerom_start: u16,
    /// Fixed end of the installable area (`__vectors_start`, erase-unit aligned down).
    freerom_end: u16,
    /// Start of the non-initialized RAM window; any process descriptor at or above this address
    /// was allocated by this loader rather than compiled into the kernel.
    noinit_end: u16,
}

impl LoaderContext {
    /// Initializes the free-ROM cursor by scanning backward from `vectors_start` for the first
    /// non-erased byte, recovering where a previous boot's installs left off without needing to
    /// persist the cursor anywhere. This backward byte-at-a-time scan is exactly the kind of long
    /// scan SPEC_FULL.md §5 expects to feed a watchdog, so `watchdog` is tickled once per byte
    /// examined.
    pub fn init(
        flash: &impl FlashMemory,
        data_end_rom: u16,
        vectors_start: u16,
        noinit_end: u16,
        watchdog: &mut impl Watchdog,
    ) -> Self {
        let unit = flash.erase_unit_size();
        let instprog_first = align_next(data_end_rom, unit);
        let freerom_end = align_prev(vectors_start, unit);

        let mut last_used = None;
        let mut addr = freerom_end;
        while addr > instprog_first {
            watchdog.tickle();
            addr -= 1;
            let byte = flash.read(addr, 1)[0];
            if byte != 0xFF && byte != 0x00 {
                last_used = Some(addr);
                break;
            }
        }
        let scan_point = last_used.unwrap_or(instprog_first.wrapping_sub(1));
        let freerom_start = align_word_next(scan_point);

        Self {
            instprog_first,
            freerom_start,
            freerom_end,
            noinit_end,
        }
    }

    /// Allocates `size` bytes at the end of the currently used ROM area, or `None` if there is no
    /// room before `freerom_end`. The comparison direction here is the corrected one: the
    /// original compared `freerom_start - freerom_end > size`, which (`freerom_start` always
    /// precedes `freerom_end`) could never be true.
    fn alloc_text(&mut self, size: u16) -> Option<u16> {
        if self.freerom_end - self.freerom_start >= size {
            let ptr = self.freerom_start;
            self.freerom_start += size;
            Some(ptr)
        } else {
            None
        }
    }

    /// True if `process` is a descriptor this loader (or a previous boot's loader) allocated,
    /// as opposed to one statically compiled into the kernel image.
    pub fn is_loaded(&self, process: u16) -> bool {
        process >= self.noinit_end
    }

    /// Walks the installed-program chain in flash, starting from the fixed beginning of the
    /// installable area (not from the current, advanced, `freerom_start`).
    pub fn installed_walk<'f, F: FlashMemory>(&self, flash: &'f F) -> InstalledIter<'f, F> {
        InstalledIter {
            flash,
            next: Some(self.instprog_first),
            freerom_end: self.freerom_end,
        }
    }

    /// Returns the already-installed header matching `crc`/`text_size`/`source_file`, if any.
    fn find_installed<F: FlashMemory>(
        &self,
        flash: &F,
        crc: u32,
        text_size: u16,
        source_file: &[u8; MAX_FILENAME_LEN],
    ) -> Option<(u16, ProgramInfoHeader)> {
        self.installed_walk(flash).find(|(_, header)| {
            header.crc == crc
                && header.mem[SECTION_TEXT].size == text_size
                && &header.source_file == source_file
        })
    }

    /// Returns the source filename of the installed module `process` belongs to, if any.
    pub fn filename_for<F: FlashMemory>(&self, flash: &F, process: u16) -> Option<String> {
        self.installed_walk(flash)
            .find(|(_, header)| {
                let data = header.mem[SECTION_DATA];
                process >= data.ptr && process < data.ptr + data.size
            })
            .and_then(|(_, header)| header.source_file_str().map(str::to_string))
    }

    /// Returns the info header of the installed module `process` belongs to, if any. Finds the
    /// owning module the same way [`LoaderContext::filename_for`] does, but hands back the whole
    /// [`ProgramInfoHeader`] rather than just the filename.
    pub fn info_header_for<F: FlashMemory>(&self, flash: &F, process: u16) -> Option<ProgramInfoHeader> {
        self.installed_walk(flash)
            .find(|(_, header)| {
                let data = header.mem[SECTION_DATA];
                process >= data.ptr && process < data.ptr + data.size
            })
            .map(|(_, header)| header)
    }

    /// Erases the whole installable area and resets the free-ROM cursor to its initial state,
    /// refusing if any process belonging to a currently installed module is still alive.
    pub fn clean_space<F: FlashMemory, R: ProcessRegistry>(
        &mut self,
        flash: &mut F,
        processes: &R,
    ) -> Result<(), LoadError> {
        for addr in processes.live_processes() {
            if self.is_loaded(addr) {
                return Err(LoadError::Busy(addr));
            }
        }

        let unit = flash.erase_unit_size();
        let mut addr = self.instprog_first;
        while addr < self.freerom_end {
            flash.erase_unit(addr).map_err(|_| LoadError::OutOfMemory)?;
            addr += unit;
        }

        self.freerom_start = self.instprog_first;
        Ok(())
    }

    /// Validates `program_path`/`symbol_path`, resolves every import, and installs the module
    /// into RAM and flash, returning the address of its autostart process list. Already-installed
    /// modules (matched by CRC, text size and source filename) are reused rather than reinstalled.
    #[allow(clippy::too_many_arguments)]
    pub fn load<FS, FLASH, RAM, REG, WD>(
        &mut self,
        fs: &mut FS,
        flash: &mut FLASH,
        ram: &mut RAM,
        processes: &REG,
        watchdog: &mut WD,
        program_path: &str,
        symbol_path: &str,
    ) -> Result<u16, LoadError>
    where
        FS: FileSystem,
        FLASH: FlashMemory,
        RAM: RamAllocator,
        REG: ProcessRegistry,
        WD: Watchdog,
    {
        if program_path.len() >= MAX_FILENAME_LEN {
            return Err(LoadError::NameTooLong);
        }

        let program = fs
            .read_file(program_path)
            .map_err(|e| LoadError::Io {
                path: program_path.to_string(),
                reason: e.to_string(),
            })?;
        let symbols = fs
            .read_file(symbol_path)
            .map_err(|e| LoadError::Io {
                path: symbol_path.to_string(),
                reason: e.to_string(),
            })?;

        crate::format::verify_file_crc(&program)?;
        crate::format::verify_file_crc(&symbols)?;

        let header = ProgramHeader::parse(&program)?;
        SymbolHeader::parse(&symbols)?;

        let section_sizes = header.section_sizes();
        if section_sizes[SECTION_TEXT] % 2 != 0
            || section_sizes[SECTION_DATA] % 2 != 0
            || section_sizes[SECTION_BSS] % 2 != 0
        {
            return Err(LoadError::UnalignedSection);
        }

        // Resolve every import against the kernel symbol table. Both cursors only ever move
        // forward, giving O(imports + kernel symbols) total work; still a long enough scan over a
        // file bigger than SRAM to warrant tickling the watchdog once per import.
        let mut import_cursor = ImportCursor::new(&program[PROGRAM_HEADER_SIZE..]);
        let mut symbol_cursor = SymbolCursor::new(&symbols[SYMBOL_HEADER_SIZE..]);
        let mut resolved = Vec::with_capacity(usize::from(header.sym_entries));
        for _ in 0..header.sym_entries {
            watchdog.tickle();
            import_cursor.advance()?;
            let name = import_cursor.current_name().to_string();
            match resolve_one(&mut symbol_cursor, &name)? {
                Lookup::Found(value) => resolved.push(value),
                Lookup::Unresolved => return Err(LoadError::UnresolvedSymbol(name)),
            }
        }

        let import_list_len = (program.len() - PROGRAM_HEADER_SIZE) - import_cursor.remaining().len();
        let reloc_stream_start = PROGRAM_HEADER_SIZE + import_list_len;

        let mut source_file = [0u8; MAX_FILENAME_LEN];
        source_file[..program_path.len()].copy_from_slice(program_path.as_bytes());

        let crc = header.common.crc;

        if let Some((_, existing)) =
            self.find_installed(&*flash, crc, section_sizes[SECTION_TEXT], &source_file)
        {
            let data = existing.mem[SECTION_DATA];
            for addr in processes.live_processes() {
                if addr >= data.ptr && addr < data.ptr + data.size {
                    return Err(LoadError::Busy(addr));
                }
            }
            return Ok(existing.process);
        }

        // Fresh install: allocate TEXT (flash) immediately followed by its info header, then
        // RAM for each of DATA/BSS/MIG/MIGPTR using that section's own declared size (the
        // original allocated every non-TEXT section using `datasize`, which this reimplements
        // correctly; see DESIGN.md).
        let text_alloc_size = section_sizes[SECTION_TEXT]
            .checked_add(u16::try_from(PROGRAM_INFO_HEADER_SIZE).unwrap())
            .ok_or(LoadError::OutOfMemory)?;
        let text_header_ptr = self.alloc_text(text_alloc_size).ok_or(LoadError::OutOfMemory)?;
        let text_ptr = text_header_ptr + u16::try_from(PROGRAM_INFO_HEADER_SIZE).unwrap();

        let mut section_bases = [0u16; SECTION_COUNT];
        section_bases[SECTION_TEXT] = text_ptr;
        let mut allocated: Vec<(usize, u16)> = Vec::new();

        for &section in &[SECTION_DATA, SECTION_BSS, SECTION_MIG, SECTION_MIGPTR] {
            let size = section_sizes[section];
            if size == 0 {
                continue;
            }
            match ram.alloc(size) {
                Some(ptr) => {
                    section_bases[section] = ptr;
                    allocated.push((section, ptr));
                }
                None => {
                    for (sec, ptr) in &allocated {
                        ram.free(*ptr, section_sizes[*sec]);
                    }
                    return Err(LoadError::OutOfMemory);
                }
            }
        }

        let process = text_ptr + header.process_offset;

        let result = self.install_sections(
            &program,
            reloc_stream_start,
            &section_sizes,
            &section_bases,
            &resolved,
            ram,
            flash,
        );

        if let Err(err) = result {
            for (sec, ptr) in &allocated {
                ram.free(*ptr, section_sizes[*sec]);
            }
            return Err(err);
        }

        let info = ProgramInfoHeader {
            magic: MAGIC_INSTALLED,
            crc,
            mem: std::array::from_fn(|i| MemRange {
                ptr: section_bases[i],
                size: section_sizes[i],
            }),
            process,
            source_file,
        };

        let mut header_bytes = Vec::with_capacity(PROGRAM_INFO_HEADER_SIZE);
        info.write(&mut header_bytes).unwrap();
        let mut flash_writer = FlashWriter::new(flash);
        flash_writer
            .write(text_header_ptr, &header_bytes)
            .map_err(LoadError::Reloc)?;
        flash_writer.flush().map_err(LoadError::Reloc)?;

        Ok(process)
    }

    #[allow(clippy::too_many_arguments)]
    fn install_sections<RAM: RamAllocator, FLASH: FlashMemory>(
        &self,
        program: &[u8],
        reloc_stream_start: usize,
        section_sizes: &[u16; SECTION_COUNT],
        section_bases: &[u16; SECTION_COUNT],
        resolved: &[u16],
        ram: &mut RAM,
        flash: &mut FLASH,
    ) -> Result<(), LoadError> {
        let mut cursor = std::io::Cursor::new(&program[reloc_stream_start..]);

        for &section in &[SECTION_DATA, SECTION_MIG, SECTION_MIGPTR] {
            let size = section_sizes[section];
            if size == 0 {
                continue;
            }
            decode_relocation_stream(
                &mut cursor,
                size,
                section_sizes,
                section_bases,
                resolved,
                section_bases[section],
                &mut *ram,
            )?;
        }

        if section_sizes[SECTION_BSS] > 0 {
            let zeros = vec![0u8; usize::from(section_sizes[SECTION_BSS])];
            ram.write(section_bases[SECTION_BSS], &zeros)
                .map_err(LoadError::Reloc)?;
        }

        if section_sizes[SECTION_TEXT] > 0 {
            let mut flash_writer = FlashWriter::new(flash);
            decode_relocation_stream(
                &mut cursor,
                section_sizes[SECTION_TEXT],
                section_sizes,
                section_bases,
                resolved,
                section_bases[SECTION_TEXT],
                &mut flash_writer,
            )?;
            flash_writer.flush().map_err(LoadError::Reloc)?;
        }

        Ok(())
    }
}

/// Iterator over the installed-program chain in flash, yielding `(address, header)` pairs and
/// stopping at the first magic mismatch or at an entry whose declared TEXT size would run past
/// the end of the installable area.
pub struct InstalledIter<'f, F: FlashMemory> {
    flash: &'f F,
    next: Option<u16>,
    freerom_end: u16,
}

impl<'f, F: FlashMemory> Iterator for InstalledIter<'f, F> {
    type Item = (u16, ProgramInfoHeader);

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        let bytes = self.flash.read(addr, PROGRAM_INFO_HEADER_SIZE);
        let header = ProgramInfoHeader::parse(&bytes).ok()?;

        if header.magic != MAGIC_INSTALLED {
            self.next = None;
            return None;
        }

        let text_size = header.mem[SECTION_TEXT].size;
        let end = u32::from(addr) + PROGRAM_INFO_HEADER_SIZE as u32 + u32::from(text_size);
        if end > u32::from(self.freerom_end) {
            self.next = None;
            return None;
        }

        self.next = Some(u16::try_from(end).unwrap());
        Some((addr, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::collaborators::FlashProgrammer;
    use crate::format::{backpatch_crc, CommonHeader, MAGIC_PROGRAM, MAGIC_SYMBOL};
    use crate::reloc::RelocTarget;
    use crate::symtab::{encode_import_names, encode_symbol_table, SymbolEntry};
    use std::collections::HashMap;

    struct MemFs {
        files: HashMap<String, Vec<u8>>,
    }

    impl FileSystem for MemFs {
        type Error = std::io::Error;
        fn read_file(&mut self, path: &str) -> Result<Vec<u8>, Self::Error> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }
    }

    struct MemFlash {
        base: u16,
        data: Vec<u8>,
        unit: u16,
    }

    impl FlashProgrammer for MemFlash {
        fn setup(&mut self) -> Result<(), RelocError> {
            Ok(())
        }
        fn write_word(&mut self, address: u16, value: u16) -> Result<(), RelocError> {
            let offset = usize::from(address - self.base);
            self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
        fn done(&mut self) -> Result<(), RelocError> {
            Ok(())
        }
        fn erase_unit(&mut self, address: u16) -> Result<(), RelocError> {
            let offset = usize::from(address - self.base);
            for byte in &mut self.data[offset..offset + usize::from(self.unit)] {
                *byte = 0xFF;
            }
            Ok(())
        }
        fn erase_unit_size(&self) -> u16 {
            self.unit
        }
    }

    impl FlashMemory for MemFlash {
        fn read(&self, address: u16, len: usize) -> Vec<u8> {
            let offset = usize::from(address - self.base);
            self.data[offset..offset + len].to_vec()
        }
    }

    struct MemRam {
        base: u16,
        data: Vec<u8>,
        next_free: u16,
    }

    impl MemoryWriter for MemRam {
        fn write(&mut self, address: u16, bytes: &[u8]) -> Result<(), RelocError> {
            let offset = usize::from(address - self.base);
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    impl RamAllocator for MemRam {
        fn alloc(&mut self, size: u16) -> Option<u16> {
            let ptr = self.next_free;
            self.next_free += size;
            Some(ptr)
        }
        fn free(&mut self, _address: u16, _size: u16) {}
    }

    struct NoProcesses;
    impl ProcessRegistry for NoProcesses {
        fn live_processes(&self) -> Vec<u16> {
            Vec::new()
        }
    }

    struct LiveProcesses(Vec<u16>);
    impl ProcessRegistry for LiveProcesses {
        fn live_processes(&self) -> Vec<u16> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct CountingWatchdog {
        tickles: u32,
    }
    impl Watchdog for CountingWatchdog {
        fn tickle(&mut self) {
            self.tickles += 1;
        }
    }

    fn erased_flash(base: u16, len: usize) -> MemFlash {
        MemFlash {
            base,
            data: vec![0xFF; len],
            unit: 64,
        }
    }

    fn build_program(
        process_offset: u16,
        text: Vec<u8>,
        data: Vec<u8>,
        imports: &[&str],
        data_relocs: Vec<(u16, RelocTarget)>,
    ) -> Vec<u8> {
        use crate::reloc::encode_relocation_stream;

        let section_sizes = [
            u16::try_from(text.len()).unwrap(),
            u16::try_from(data.len()).unwrap(),
            0,
            0,
            0,
        ];
        let header = ProgramHeader {
            common: CommonHeader {
                magic: MAGIC_PROGRAM,
                crc: 0,
            },
            process_offset,
            text_size: section_sizes[SECTION_TEXT],
            data_size: section_sizes[SECTION_DATA],
            bss_size: 0,
            mig_size: 0,
            migptr_size: 0,
            sym_entries: u16::try_from(imports.len()).unwrap(),
        };

        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        let import_names: Vec<String> = imports.iter().map(|s| s.to_string()).collect();
        out.extend(encode_import_names(&import_names).unwrap());

        let relocs: Vec<_> = data_relocs
            .into_iter()
            .map(|(address, target)| crate::reloc::Relocation { address, target })
            .collect();
        out.extend(
            encode_relocation_stream(&data, &relocs, u16::try_from(imports.len()).unwrap(), &section_sizes)
                .unwrap(),
        );
        out.extend(encode_relocation_stream(&text, &[], u16::try_from(imports.len()).unwrap(), &section_sizes).unwrap());

        out.push(crate::format::EOF_SENTINEL);
        backpatch_crc(&mut out);
        out
    }

    fn build_symtab(entries: &[(&str, u16)]) -> Vec<u8> {
        let header = SymbolHeader {
            common: CommonHeader {
                magic: MAGIC_SYMBOL,
                crc: 0,
            },
            kernel_crc: 0,
        };
        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        let symbols: Vec<SymbolEntry> = entries
            .iter()
            .map(|(n, v)| SymbolEntry {
                name: n.to_string(),
                value: *v,
            })
            .collect();
        out.extend(encode_symbol_table(&symbols).unwrap());
        out.push(crate::format::EOF_SENTINEL);
        backpatch_crc(&mut out);
        out
    }

    #[test]
    fn s6_full_load_installs_and_resolves() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 4], vec![0u8; 2], &["k_entry"], vec![(0, RelocTarget::KernelImport { import_index: 0, addend: 0 })]);
        let symtab = build_symtab(&[("k_entry", 0x5000)]);

        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program);
        files.insert("kernel.mls".to_string(), symtab);
        let mut fs = MemFs { files };

        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };
        let processes = NoProcesses;

        let process = loader
            .load(&mut fs, &mut flash, &mut ram, &processes, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();

        assert_eq!(process, 0x1000 + u16::try_from(PROGRAM_INFO_HEADER_SIZE).unwrap());

        let data_value = u16::from_le_bytes([ram.data[0], ram.data[1]]);
        assert_eq!(data_value, 0x5000);
        assert!(wd.tickles > 0);
    }

    #[test]
    fn dedup_reuses_already_installed_module() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 4], vec![], &[], vec![]);
        let symtab = build_symtab(&[]);

        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program.clone());
        files.insert("kernel.mls".to_string(), symtab.clone());
        let mut fs = MemFs { files };

        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };
        let processes = NoProcesses;

        let first = loader
            .load(&mut fs, &mut flash, &mut ram, &processes, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();
        let second = loader
            .load(&mut fs, &mut flash, &mut ram, &processes, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn unresolved_import_is_rejected() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 2], vec![0u8; 2], &["missing"], vec![(0, RelocTarget::KernelImport { import_index: 0, addend: 0 })]);
        let symtab = build_symtab(&[("present", 1)]);

        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program);
        files.insert("kernel.mls".to_string(), symtab);
        let mut fs = MemFs { files };

        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };
        let processes = NoProcesses;

        let err = loader
            .load(&mut fs, &mut flash, &mut ram, &processes, &mut wd, "a.mlk", "kernel.mls")
            .unwrap_err();
        assert_eq!(err.status_code(), 3);
    }

    #[test]
    fn alloc_text_respects_corrected_comparison() {
        let flash = erased_flash(0x1000, 0x40);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1040, 0x2000, &mut wd);
        assert!(loader.alloc_text(0x30).is_some());
        assert!(loader.alloc_text(0x30).is_none());
    }

    #[test]
    fn s6_reinstall_while_process_live_is_busy() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 4], vec![0u8; 2], &[], vec![]);
        let symtab = build_symtab(&[]);

        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program.clone());
        files.insert("kernel.mls".to_string(), symtab.clone());
        let mut fs = MemFs { files };

        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };

        let first = loader
            .load(&mut fs, &mut flash, &mut ram, &NoProcesses, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();
        let _ = first;

        // DATA for this module lives at 0x2900..0x2902; a live process descriptor inside that
        // range means the already-installed module is still in use.
        let processes = LiveProcesses(vec![0x2900]);
        let err = loader
            .load(&mut fs, &mut flash, &mut ram, &processes, &mut wd, "a.mlk", "kernel.mls")
            .unwrap_err();
        assert_eq!(err.status_code(), 2);
        assert!(matches!(err, LoadError::Busy(0x2900)));
    }

    #[test]
    fn clean_space_refuses_while_owned_process_is_live() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        // A process descriptor above noinit_end (0x2800) is one this loader considers "owned".
        let processes = LiveProcesses(vec![0x2900]);
        let err = loader.clean_space(&mut flash, &processes).unwrap_err();
        assert!(matches!(err, LoadError::Busy(0x2900)));
    }

    #[test]
    fn clean_space_erases_and_resets_cursor_when_idle() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 4], vec![], &[], vec![]);
        let symtab = build_symtab(&[]);
        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program);
        files.insert("kernel.mls".to_string(), symtab);
        let mut fs = MemFs { files };
        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };

        loader
            .load(&mut fs, &mut flash, &mut ram, &NoProcesses, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();
        assert!(loader.installed_walk(&flash).next().is_some());

        loader.clean_space(&mut flash, &NoProcesses).unwrap();

        assert!(loader.installed_walk(&flash).next().is_none());
        assert_eq!(loader.freerom_start, loader.instprog_first);
        assert!(flash.data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn info_header_for_matches_filename_for() {
        let mut flash = erased_flash(0x1000, 0x800);
        let mut wd = CountingWatchdog::default();
        let mut loader = LoaderContext::init(&flash, 0x1000, 0x1800, 0x2800, &mut wd);

        let program = build_program(0, vec![0u8; 4], vec![0u8; 2], &[], vec![]);
        let symtab = build_symtab(&[]);
        let mut files = HashMap::new();
        files.insert("a.mlk".to_string(), program);
        files.insert("kernel.mls".to_string(), symtab);
        let mut fs = MemFs { files };
        let mut ram = MemRam {
            base: 0x2900,
            data: vec![0u8; 0x100],
            next_free: 0x2900,
        };

        let process = loader
            .load(&mut fs, &mut flash, &mut ram, &NoProcesses, &mut wd, "a.mlk", "kernel.mls")
            .unwrap();

        let header = loader.info_header_for(&flash, process).unwrap();
        assert_eq!(header.source_file_str(), Some("a.mlk"));
        assert_eq!(
            loader.filename_for(&flash, process),
            header.source_file_str().map(str::to_string)
        );

        assert!(loader.info_header_for(&flash, 0xFFFF).is_none());
    }
}
