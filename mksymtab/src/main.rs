//! `mksymtab <input.elf> <output.mls> [kernel_image]`: builds a kernel symbol table, optionally
//! pinned to a flashable kernel image's CRC.

use std::process::ExitCode;

use minilink::host::symtab_builder::build_symbol_table;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let (input, output, kernel_image_path) = match args.as_slice() {
        [_, input, output] => (input, output, None),
        [_, input, output, kernel_image] => (input, output, Some(kernel_image)),
        _ => {
            eprintln!("usage: mksymtab <input.elf> <output.mls> [kernel_image]");
            return ExitCode::FAILURE;
        }
    };

    let elf_bytes = match std::fs::read(input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("mksymtab: could not read {input}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let kernel_image = match kernel_image_path {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                eprintln!("mksymtab: could not read {path}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let symtab = match build_symbol_table(&elf_bytes, kernel_image.as_deref()) {
        Ok(symtab) => symtab,
        Err(e) => {
            eprintln!("mksymtab: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::write(output, symtab) {
        eprintln!("mksymtab: could not write {output}: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
